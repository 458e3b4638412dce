use crate::dispatch::pool::resolve_pool;
use crate::dispatch::{ConnInfo, GeneralProxy, Latency, Proxy};
use crate::provider::{now_millis, HealthProber, ProxySetProvider, TaskSet};
use crate::proxy::error::SelectionError;
use arc_swap::ArcSwapOption;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Upper bound on group-to-group hops while resolving one connection.
pub const MAX_RESOLVE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKey {
    Src,
    Dst,
    Both,
}

#[derive(Debug)]
pub enum BalanceStrategy {
    ConsistentHashing(HashKey),
    RoundRobin(AtomicUsize),
}

#[derive(Debug)]
pub enum GroupStrategy {
    Selector,
    UrlTest { tolerance: u32 },
    Fallback,
    LoadBalance(BalanceStrategy),
    Relay,
}

impl GroupStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            GroupStrategy::Selector => "select",
            GroupStrategy::UrlTest { .. } => "url-test",
            GroupStrategy::Fallback => "fallback",
            GroupStrategy::LoadBalance(_) => "load-balance",
            GroupStrategy::Relay => "relay",
        }
    }
}

pub struct GroupProbe {
    pub prober: Arc<HealthProber>,
    pub interval: Duration,
    pub lazy: bool,
}

/// A named outbound that picks one of its members per connection.
pub struct ProxyGroup {
    name: String,
    strategy: GroupStrategy,
    providers: Vec<Arc<ProxySetProvider>>,
    filter: Option<Regex>,
    placeholder: GeneralProxy,
    /// Pinned member for selectors, fastest member for url-test.
    selection: ArcSwapOption<String>,
    probe: Option<GroupProbe>,
    tasks: TaskSet,
}

impl Debug for ProxyGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProxyGroup({}, {})", self.name, self.strategy.name())
    }
}

impl ProxyGroup {
    pub fn new<S: Into<String>>(
        name: S,
        strategy: GroupStrategy,
        providers: Vec<Arc<ProxySetProvider>>,
        filter: Option<Regex>,
        placeholder: GeneralProxy,
        probe: Option<GroupProbe>,
    ) -> Self {
        Self {
            name: name.into(),
            strategy,
            providers,
            filter,
            placeholder,
            selection: ArcSwapOption::empty(),
            probe,
            tasks: TaskSet::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn get_name(&self) -> String {
        self.name.clone()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn is_selector(&self) -> bool {
        matches!(self.strategy, GroupStrategy::Selector)
    }

    pub fn is_relay(&self) -> bool {
        matches!(self.strategy, GroupStrategy::Relay)
    }

    /// Groups never need a resolved destination to pick a member.
    pub fn should_resolve_ip(&self) -> bool {
        false
    }

    pub fn providers(&self) -> &[Arc<ProxySetProvider>] {
        &self.providers
    }

    pub fn prober(&self) -> Option<&Arc<HealthProber>> {
        self.probe.as_ref().map(|p| &p.prober)
    }

    pub fn pool(&self, touch: bool) -> Vec<GeneralProxy> {
        resolve_pool(&self.providers, touch, self.filter.as_ref(), &self.placeholder)
    }

    /// Members as currently visible, without marking the group as used.
    pub fn get_members(&self) -> Vec<GeneralProxy> {
        self.pool(false)
    }

    /// Pick the member for one connection. Never performs I/O.
    pub fn resolve_target(&self, info: &ConnInfo) -> GeneralProxy {
        let pool = self.pool(true);
        self.select(&pool, Some(info))
    }

    /// The member a connection would most likely get right now.
    pub fn current(&self) -> GeneralProxy {
        let pool = self.pool(false);
        self.select(&pool, None)
    }

    pub fn current_name(&self) -> Option<String> {
        Some(self.current().name().to_string())
    }

    fn select(&self, pool: &[GeneralProxy], info: Option<&ConnInfo>) -> GeneralProxy {
        let first = || pool[0].clone();
        match &self.strategy {
            GroupStrategy::Selector => self.selected_in(pool).unwrap_or_else(first),
            GroupStrategy::UrlTest { tolerance } => self
                .selected_in(pool)
                .or_else(|| {
                    let prober = self.prober()?;
                    let name = fastest(pool, prober, None, *tolerance)?;
                    pool.iter().find(|p| p.name() == name).cloned()
                })
                .unwrap_or_else(first),
            GroupStrategy::Fallback => match self.prober() {
                Some(prober) => pool
                    .iter()
                    .find(|p| prober.alive(p.name()))
                    .cloned()
                    .unwrap_or_else(first),
                None => first(),
            },
            GroupStrategy::LoadBalance(strategy) => {
                let alive: Vec<&GeneralProxy> = match self.prober() {
                    Some(prober) => pool.iter().filter(|p| prober.alive(p.name())).collect(),
                    None => pool.iter().collect(),
                };
                let candidates: Vec<&GeneralProxy> = if alive.is_empty() {
                    pool.iter().collect()
                } else {
                    alive
                };
                let idx = match (strategy, info) {
                    (BalanceStrategy::RoundRobin(counter), Some(_)) => {
                        counter.fetch_add(1, Ordering::Relaxed) % candidates.len()
                    }
                    (BalanceStrategy::ConsistentHashing(key), Some(info)) => {
                        jump_hash(hash_key(info, *key), candidates.len())
                    }
                    (_, None) => 0,
                };
                candidates[idx].clone()
            }
            GroupStrategy::Relay => first(),
        }
    }

    fn selected_in(&self, pool: &[GeneralProxy]) -> Option<GeneralProxy> {
        let selected = self.selection.load();
        let name = selected.as_deref()?;
        pool.iter().find(|p| p.name() == name.as_str()).cloned()
    }

    /// The stored selection, if any.
    pub fn selected(&self) -> Option<String> {
        self.selection.load_full().map(|s| s.as_ref().clone())
    }

    /// Pin a member. Only selectors accept this, and only for a name that is
    /// currently a member; otherwise the previous pin stays.
    pub fn set_selection(&self, name: &str) -> Result<(), SelectionError> {
        if !self.is_selector() {
            return Err(SelectionError::NotSelector(self.name.clone()));
        }
        if !self.pool(false).iter().any(|p| p.name() == name) {
            return Err(SelectionError::NotFound {
                group: self.name.clone(),
                proxy: name.to_string(),
            });
        }
        self.selection.store(Some(Arc::new(name.to_string())));
        Ok(())
    }

    pub(crate) fn store_selection(&self, name: &str) {
        self.selection.store(Some(Arc::new(name.to_string())));
    }

    /// Re-pick the fastest member of a url-test group from cached results.
    pub fn update_fastest(&self) {
        let (GroupStrategy::UrlTest { tolerance }, Some(prober)) = (&self.strategy, self.prober())
        else {
            return;
        };
        let pool = self.pool(false);
        let current = self.selected();
        if let Some(best) = fastest(&pool, prober, current.as_deref(), *tolerance) {
            if current.as_deref() != Some(best.as_str()) {
                tracing::info!(
                    "Group {} switched {} => {}",
                    self.name,
                    current.as_deref().unwrap_or("-"),
                    best
                );
                self.store_selection(&best);
            }
        }
    }

    pub(crate) fn probe_targets(&self) -> Vec<(String, Arc<Proxy>)> {
        self.pool(false)
            .iter()
            .filter_map(|member| {
                let chain = member.resolve_chain(None, MAX_RESOLVE_DEPTH)?;
                let head = chain.first()?.clone();
                Some((member.name().to_string(), head))
            })
            .collect()
    }

    /// Probe every member once and refresh the derived selection.
    pub async fn health_check(&self) -> HashMap<String, Latency> {
        let Some(probe) = &self.probe else {
            return HashMap::new();
        };
        let result = probe.prober.probe(self.probe_targets()).await;
        self.update_fastest();
        result
    }

    fn touched_since(&self, since_millis: u64) -> bool {
        self.providers.iter().any(|p| p.touched_since(since_millis))
    }

    /// Spawn the periodic probe; it stops when the group is dropped.
    pub fn start(self: &Arc<Self>) {
        let Some(probe) = &self.probe else {
            return;
        };
        if self.tasks.is_running() || probe.interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.tasks
            .push(tokio::spawn(Self::probe_loop(weak, probe.interval, probe.lazy)));
    }

    pub fn stop(&self) {
        self.tasks.abort_all();
    }

    async fn probe_loop(weak: Weak<Self>, interval: Duration, lazy: bool) {
        let mut last_round = None;
        loop {
            let Some(group) = weak.upgrade() else {
                break;
            };
            let due = match last_round {
                None => true,
                Some(t) => !lazy || group.touched_since(t),
            };
            if due {
                last_round = Some(now_millis());
                group.health_check().await;
            } else {
                tracing::trace!("Group {} idle, skip probing", group.name);
            }
            drop(group);
            tokio::time::sleep(interval).await;
        }
    }
}

/// Name of the member url-test should use. The current member is kept
/// unless another one beats it by more than `tolerance` milliseconds; ties
/// go to the member declared first.
pub fn fastest(
    pool: &[GeneralProxy],
    prober: &HealthProber,
    current: Option<&str>,
    tolerance: u32,
) -> Option<String> {
    let latency_of = |name: &str| match prober.latency(name) {
        Latency::Value(ms) => Some(ms),
        _ => None,
    };
    let current = current.filter(|c| pool.iter().any(|p| p.name() == *c));
    let best = pool
        .iter()
        .filter_map(|p| latency_of(p.name()).map(|ms| (p.name(), ms)))
        .min_by_key(|(_, ms)| *ms);
    let Some((best_name, best_ms)) = best else {
        return current
            .map(|c| c.to_string())
            .or_else(|| pool.first().map(|p| p.name().to_string()));
    };
    if let Some(cur) = current {
        if let Some(cur_ms) = latency_of(cur) {
            if best_ms.saturating_add(tolerance) >= cur_ms {
                return Some(cur.to_string());
            }
        }
    }
    Some(best_name.to_string())
}

fn hash_key(info: &ConnInfo, key: HashKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    let dst_host = || match info.dst.domain_name() {
        Some(dn) => dn.to_ascii_lowercase(),
        None => info.dst_ip().map(|ip| ip.to_string()).unwrap_or_default(),
    };
    match key {
        HashKey::Src => info.src.ip().hash(&mut hasher),
        HashKey::Dst => dst_host().hash(&mut hasher),
        HashKey::Both => {
            info.src.ip().hash(&mut hasher);
            dst_host().hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Jump consistent hash: moving from n to n+1 buckets remaps about 1/(n+1) keys.
fn jump_hash(mut key: u64, buckets: usize) -> usize {
    let (mut b, mut j) = (-1i64, 0i64);
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b.max(0) as usize
}

impl GeneralProxy {
    /// Follow groups down to concrete proxies. A relay expands into its whole
    /// chain. `None` when `budget` hops are not enough.
    pub fn resolve_chain(&self, info: Option<&ConnInfo>, budget: usize) -> Option<Vec<Arc<Proxy>>> {
        if budget == 0 {
            return None;
        }
        match self {
            GeneralProxy::Single(p) => Some(vec![p.clone()]),
            GeneralProxy::Group(g) if g.is_relay() => {
                let mut chain = vec![];
                for member in g.pool(info.is_some()) {
                    chain.extend(member.resolve_chain(info, budget - 1)?);
                }
                Some(chain)
            }
            GeneralProxy::Group(g) => {
                let next = match info {
                    Some(info) => g.resolve_target(info),
                    None => g.current(),
                };
                next.resolve_chain(info, budget - 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CountingConnector, ScriptedConnector};
    use crate::dispatch::pool::COMPATIBLE;
    use crate::dispatch::{NetworkAddr, NetworkType, ProxyImpl};

    fn single(name: &str) -> GeneralProxy {
        GeneralProxy::Single(Arc::new(Proxy::new(name, ProxyImpl::Direct)))
    }

    fn prober() -> Arc<HealthProber> {
        Arc::new(
            HealthProber::new(
                Arc::new(ScriptedConnector(HashMap::new())),
                "http://www.gstatic.com/generate_204",
                Duration::from_millis(100),
                4,
            )
            .unwrap(),
        )
    }

    fn group(strategy: GroupStrategy, members: &[&str], prober: Option<Arc<HealthProber>>) -> Arc<ProxyGroup> {
        let provider = Arc::new(ProxySetProvider::new_inline(
            "test",
            members.iter().map(|m| single(m)).collect(),
        ));
        Arc::new(ProxyGroup::new(
            "test",
            strategy,
            vec![provider],
            None,
            single(COMPATIBLE),
            prober.map(|prober| GroupProbe {
                prober,
                interval: Duration::from_secs(300),
                lazy: true,
            }),
        ))
    }

    fn conn(src: &str, dst: &str) -> ConnInfo {
        ConnInfo::new(src.parse().unwrap(), NetworkAddr::parse(dst).unwrap(), NetworkType::Tcp)
    }

    #[test]
    fn test_url_test_tolerance() {
        for (tolerance, expected) in [(20, "a"), (5, "b")] {
            let prober = prober();
            let g = group(GroupStrategy::UrlTest { tolerance }, &["a", "b"], Some(prober.clone()));
            g.store_selection("a");
            prober.record("a", Latency::Value(100));
            prober.record("b", Latency::Value(90));
            g.update_fastest();
            assert_eq!(g.selected().as_deref(), Some(expected));
            assert_eq!(g.resolve_target(&conn("10.0.0.1:1000", "x.com:443")).name(), expected);
        }
    }

    #[test]
    fn test_url_test_without_results() {
        let prober = prober();
        let g = group(GroupStrategy::UrlTest { tolerance: 0 }, &["a", "b"], Some(prober.clone()));
        assert_eq!(g.current().name(), "a");
        prober.record("a", Latency::Failed);
        prober.record("b", Latency::Value(30));
        assert_eq!(g.current().name(), "b");
        prober.record("a", Latency::Value(30));
        assert_eq!(fastest(&g.pool(false), &prober, None, 0).as_deref(), Some("a"));
    }

    #[test]
    fn test_fallback_first_alive() {
        let prober = prober();
        let g = group(GroupStrategy::Fallback, &["a", "b", "c"], Some(prober.clone()));
        prober.record("a", Latency::Failed);
        prober.record("b", Latency::Value(50));
        prober.record("c", Latency::Value(10));
        assert_eq!(g.resolve_target(&conn("10.0.0.1:1000", "x.com:443")).name(), "b");
        prober.record("b", Latency::Failed);
        prober.record("c", Latency::Failed);
        assert_eq!(g.current().name(), "a");
    }

    #[test]
    fn test_selector() {
        let g = group(GroupStrategy::Selector, &["a", "b"], None);
        assert_eq!(g.current().name(), "a");
        g.set_selection("b").unwrap();
        assert_eq!(g.current().name(), "b");
        assert_eq!(
            g.set_selection("zz"),
            Err(SelectionError::NotFound {
                group: "test".to_string(),
                proxy: "zz".to_string()
            })
        );
        assert_eq!(g.current().name(), "b");
        let fb = group(GroupStrategy::Fallback, &["a"], None);
        assert!(matches!(fb.set_selection("a"), Err(SelectionError::NotSelector(_))));
    }

    #[test]
    fn test_load_balance() {
        let g = group(
            GroupStrategy::LoadBalance(BalanceStrategy::ConsistentHashing(HashKey::Dst)),
            &["a", "b", "c", "d"],
            None,
        );
        let first = g.resolve_target(&conn("10.0.0.1:1000", "video.example.com:443"));
        for port in 1001..1020 {
            let src = format!("10.0.0.{}:{}", port % 7, port);
            let again = g.resolve_target(&conn(&src, "video.example.com:443"));
            assert_eq!(again.name(), first.name());
        }

        let prober = prober();
        let rr = group(
            GroupStrategy::LoadBalance(BalanceStrategy::RoundRobin(AtomicUsize::new(0))),
            &["a", "b", "c"],
            Some(prober.clone()),
        );
        prober.record("b", Latency::Failed);
        let picks: Vec<String> = (0..4)
            .map(|_| rr.resolve_target(&conn("10.0.0.1:1000", "x.com:443")).name().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn test_jump_hash_range() {
        for key in 0..1000u64 {
            assert!(jump_hash(key, 7) < 7);
            assert_eq!(jump_hash(key, 1), 0);
        }
    }

    #[test]
    fn test_relay_chain() {
        let inner = group(GroupStrategy::Selector, &["b1", "b2"], None);
        inner.set_selection("b2").unwrap();
        let provider = Arc::new(ProxySetProvider::new_inline(
            "relay",
            vec![single("a"), GeneralProxy::Group(inner)],
        ));
        let relay = GeneralProxy::Group(Arc::new(ProxyGroup::new(
            "relay",
            GroupStrategy::Relay,
            vec![provider],
            None,
            single(COMPATIBLE),
            None,
        )));
        let chain = relay
            .resolve_chain(Some(&conn("10.0.0.1:1000", "x.com:443")), MAX_RESOLVE_DEPTH)
            .unwrap();
        let names: Vec<_> = chain.iter().map(|p| p.get_name()).collect();
        assert_eq!(names, vec!["a", "b2"]);
    }

    #[test]
    fn test_resolution_depth_bound() {
        let provider = Arc::new(ProxySetProvider::new_inline("loop", vec![]));
        let g = Arc::new(ProxyGroup::new(
            "loop",
            GroupStrategy::Selector,
            vec![provider.clone()],
            None,
            single(COMPATIBLE),
            None,
        ));
        provider.store(vec![GeneralProxy::Group(g.clone())]);
        let target = GeneralProxy::Group(g.clone());
        assert!(target
            .resolve_chain(Some(&conn("10.0.0.1:1000", "x.com:443")), MAX_RESOLVE_DEPTH)
            .is_none());
        // break the cycle so the test does not leak
        provider.store(vec![]);
    }

    #[tokio::test]
    async fn test_group_health_check() {
        let connector = ScriptedConnector(HashMap::from([
            ("a".to_string(), Duration::from_millis(40)),
            ("b".to_string(), Duration::from_millis(5)),
        ]));
        let prober = Arc::new(
            HealthProber::new(
                Arc::new(connector),
                "http://www.gstatic.com/generate_204",
                Duration::from_secs(2),
                2,
            )
            .unwrap(),
        );
        let g = group(GroupStrategy::UrlTest { tolerance: 10 }, &["a", "b", "c"], Some(prober));
        let result = g.health_check().await;
        assert_eq!(result.len(), 3);
        assert_eq!(result["c"], Latency::Failed);
        assert_eq!(g.selected().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_probe_rounds() {
        let connector = Arc::new(CountingConnector::default());
        let prober = Arc::new(
            HealthProber::new(
                connector.clone(),
                "http://www.gstatic.com/generate_204",
                Duration::from_secs(1),
                4,
            )
            .unwrap(),
        );
        let provider = Arc::new(ProxySetProvider::new_inline("auto", vec![single("a"), single("b")]));
        let g = Arc::new(ProxyGroup::new(
            "auto",
            GroupStrategy::UrlTest { tolerance: 0 },
            vec![provider],
            None,
            single(COMPATIBLE),
            Some(GroupProbe {
                prober,
                interval: Duration::from_secs(10),
                lazy: true,
            }),
        ));
        g.start();
        // the first round always runs
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.calls(), 2);
        assert_eq!(g.selected().as_deref(), Some("a"));

        // nothing routed through the group: the next round is skipped
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.calls(), 2);

        g.resolve_target(&conn("10.0.0.1:1000", "x.com:443"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.calls(), 4);

        g.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.calls(), 4);
    }
}
