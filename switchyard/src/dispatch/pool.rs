use crate::dispatch::GeneralProxy;
use crate::provider::ProxySetProvider;
use regex::Regex;
use std::sync::Arc;

/// Name of the placeholder proxy that stands in for an empty pool.
pub const COMPATIBLE: &str = "COMPATIBLE";

/// Concatenate provider snapshots in declaration order, keep the members
/// whose names match `filter`, and fall back to `placeholder` when nothing
/// is left. `touch` marks the providers as used by traffic.
pub fn resolve_pool(
    providers: &[Arc<ProxySetProvider>],
    touch: bool,
    filter: Option<&Regex>,
    placeholder: &GeneralProxy,
) -> Vec<GeneralProxy> {
    let mut pool = Vec::new();
    let mut seen = 0;
    for provider in providers {
        let snapshot = if touch {
            provider.touch()
        } else {
            provider.proxies()
        };
        seen += snapshot.len();
        match filter {
            Some(re) => pool.extend(snapshot.iter().filter(|p| re.is_match(p.name())).cloned()),
            None => pool.extend(snapshot.iter().cloned()),
        }
    }
    if pool.is_empty() {
        if let (Some(re), true) = (filter, seen > 0) {
            tracing::debug!("Filter {} matched none of {} proxies", re, seen);
        }
        pool.push(placeholder.clone());
    }
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Proxy, ProxyImpl};

    fn single(name: &str) -> GeneralProxy {
        GeneralProxy::Single(Arc::new(Proxy::new(name, ProxyImpl::Direct)))
    }

    fn names(pool: &[GeneralProxy]) -> Vec<&str> {
        pool.iter().map(|p| p.name()).collect()
    }

    #[test]
    fn test_resolve_pool() {
        let placeholder = single(COMPATIBLE);
        let providers = vec![
            Arc::new(ProxySetProvider::new_inline("p1", vec![single("a"), single("b")])),
            Arc::new(ProxySetProvider::new_inline("p2", vec![single("c")])),
        ];
        let pool = resolve_pool(&providers, false, None, &placeholder);
        assert_eq!(names(&pool), vec!["a", "b", "c"]);

        let re = Regex::new("^b").unwrap();
        let pool = resolve_pool(&providers, false, Some(&re), &placeholder);
        assert_eq!(names(&pool), vec!["b"]);

        let re = Regex::new("^z").unwrap();
        let pool = resolve_pool(&providers, false, Some(&re), &placeholder);
        assert_eq!(names(&pool), vec![COMPATIBLE]);

        let pool = resolve_pool(&[], true, None, &placeholder);
        assert_eq!(names(&pool), vec![COMPATIBLE]);
    }

    #[test]
    fn test_touch_only_when_asked() {
        let placeholder = single(COMPATIBLE);
        let provider = Arc::new(ProxySetProvider::new_inline("p", vec![single("a")]));
        let since = crate::provider::now_millis();
        resolve_pool(&[provider.clone()], false, None, &placeholder);
        assert!(!provider.touched_since(since));
        resolve_pool(&[provider.clone()], true, None, &placeholder);
        assert!(provider.touched_since(since));
    }
}
