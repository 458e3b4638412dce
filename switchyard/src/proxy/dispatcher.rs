use crate::config::{Mode, RuleError};
use crate::dispatch::{
    ConnInfo, Dispatching, GeneralProxy, NetworkType, Proxy, ProxyTable, RuleTable, DIRECT,
    GLOBAL, MAX_RESOLVE_DEPTH,
};
use crate::network::HostResolver;
use crate::proxy::error::SelectionError;
use arc_swap::ArcSwap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// The decision for one connection.
#[derive(Debug, Clone)]
pub struct RouteResult {
    /// First hop to dial.
    pub proxy: Arc<Proxy>,
    /// Every hop in order; longer than one only through a relay group.
    pub chain: Vec<Arc<Proxy>>,
    /// Name the rules (or the mode) picked before group resolution.
    pub target: String,
    pub rule: Option<String>,
}

impl Display for RouteResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let chain: Vec<&str> = self.chain.iter().map(|p| p.name()).collect();
        write!(
            f,
            "[{}] {} => {}",
            self.rule.as_deref().unwrap_or("Fallback"),
            self.target,
            chain.join(" -> ")
        )
    }
}

fn mode_to_u8(mode: Mode) -> u8 {
    match mode {
        Mode::Rule => 0,
        Mode::Global => 1,
        Mode::Direct => 2,
    }
}

fn u8_to_mode(v: u8) -> Mode {
    match v {
        1 => Mode::Global,
        2 => Mode::Direct,
        _ => Mode::Rule,
    }
}

pub struct Dispatcher {
    dispatching: ArcSwap<Dispatching>,
    resolver: Arc<dyn HostResolver>,
    mode: AtomicU8,
    /// Serializes every change of the installed generation.
    apply_lock: Mutex<()>,
}

impl Dispatcher {
    /// Take ownership of `dispatching` and start its background tasks.
    pub fn new(dispatching: Dispatching, resolver: Arc<dyn HostResolver>, mode: Mode) -> Self {
        dispatching.start();
        Self {
            dispatching: ArcSwap::new(Arc::new(dispatching)),
            resolver,
            mode: AtomicU8::new(mode_to_u8(mode)),
            apply_lock: Mutex::new(()),
        }
    }

    /// The live generation. Holders keep seeing it in full after a reload.
    pub fn snapshot(&self) -> Arc<Dispatching> {
        self.dispatching.load_full()
    }

    pub fn get_mode(&self) -> Mode {
        u8_to_mode(self.mode.load(Ordering::Relaxed))
    }

    pub fn set_mode(&self, mode: Mode) {
        tracing::info!("Routing mode set to {}", mode);
        self.mode.store(mode_to_u8(mode), Ordering::Relaxed)
    }

    /// Decide the outbound for one connection. Only the resolution a rule asks
    /// for may touch the network.
    pub async fn route(&self, info: &mut ConnInfo) -> RouteResult {
        let dispatching = self.dispatching.load_full();
        let table = dispatching.proxies();
        let (target, rule) = match self.get_mode() {
            Mode::Rule => {
                let m = dispatching
                    .rules()
                    .matches(info, self.resolver.as_ref())
                    .await;
                (m.target, m.rule)
            }
            Mode::Global => (GLOBAL.to_string(), None),
            Mode::Direct => (DIRECT.to_string(), None),
        };
        let outbound = table.get(&target).unwrap_or_else(|| {
            tracing::warn!("Target {} vanished from the proxy table, using DIRECT", target);
            GeneralProxy::Single(table.direct())
        });
        let chain = match outbound.resolve_chain(Some(info), MAX_RESOLVE_DEPTH) {
            Some(chain) if !chain.is_empty() => chain,
            _ => {
                tracing::error!(
                    "Resolving {} for {} exceeded {} hops",
                    target,
                    info.dst,
                    MAX_RESOLVE_DEPTH
                );
                vec![table.placeholder()]
            }
        };
        let chain = if info.connection_type == NetworkType::Udp
            && chain.iter().any(|p| !p.get_impl().support_udp())
        {
            tracing::info!("{} => {} failed: UDP disabled", info.dst, outbound);
            vec![table.reject()]
        } else {
            chain
        };
        let result = RouteResult {
            proxy: chain[0].clone(),
            chain,
            target,
            rule,
        };
        tracing::debug!("{} {}", info.dst, result);
        result
    }

    /// Hold off other reloads while preparing a new generation.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.apply_lock.lock().await
    }

    /// Start `next`, make it live, then stop the previous generation.
    pub fn install(&self, _guard: &MutexGuard<'_, ()>, next: Dispatching) {
        next.start();
        let prev = self.dispatching.swap(Arc::new(next));
        prev.stop();
    }

    /// Replace the whole generation.
    pub async fn apply(&self, next: Dispatching) {
        let guard = self.lock().await;
        self.install(&guard, next);
    }

    /// Replace the proxy table, keeping the rules. Rejected when a rule would
    /// lose its target.
    pub async fn update_proxies(&self, proxies: Arc<ProxyTable>) -> Result<(), RuleError> {
        let _guard = self.apply_lock.lock().await;
        let current = self.dispatching.load_full();
        let next = Dispatching::new(proxies.clone(), current.rules().clone())?;
        proxies.start();
        self.dispatching.store(Arc::new(next));
        current.proxies().stop();
        Ok(())
    }

    /// Replace the rules, keeping the proxy table.
    pub async fn update_rules(&self, rules: Arc<RuleTable>) -> Result<(), RuleError> {
        let _guard = self.apply_lock.lock().await;
        let current = self.dispatching.load_full();
        let next = Dispatching::new(current.proxies().clone(), rules.clone())?;
        rules.start();
        self.dispatching.store(Arc::new(next));
        current.rules().stop();
        Ok(())
    }

    pub fn set_selection(&self, group: &str, proxy: &str) -> Result<(), SelectionError> {
        self.dispatching
            .load()
            .proxies()
            .set_group_selection(group, proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ScriptedConnector;
    use crate::config::{LoadedConfig, RawState};
    use crate::dispatch::{DispatchingBuilder, NetworkAddr, ProxyImpl};
    use crate::proxy::error::DnsError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::path::PathBuf;

    struct StaticResolver(HashMap<String, IpAddr>);

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn resolve_host(&self, domain_name: &str) -> Result<IpAddr, DnsError> {
            self.0
                .get(domain_name)
                .copied()
                .ok_or_else(|| DnsError::NoRecord(domain_name.to_string()))
        }
    }

    async fn build(text: &str) -> Dispatching {
        let loaded = LoadedConfig {
            config: serde_yaml::from_str(text).unwrap(),
            state: RawState::default(),
            config_dir: PathBuf::from("/nonexistent"),
        };
        DispatchingBuilder::new(Arc::new(ScriptedConnector(HashMap::new())))
            .build(&loaded)
            .await
            .unwrap()
    }

    fn dispatcher(dispatching: Dispatching) -> Dispatcher {
        let resolver = StaticResolver(HashMap::from([(
            "nas.home".to_string(),
            "192.168.1.20".parse().unwrap(),
        )]));
        Dispatcher::new(dispatching, Arc::new(resolver), Mode::Rule)
    }

    fn conn(dst: &str, network: NetworkType) -> ConnInfo {
        ConnInfo::new(
            "192.168.1.10:50000".parse().unwrap(),
            NetworkAddr::parse(dst).unwrap(),
            network,
        )
    }

    const CONFIG: &str = r#"
proxy_local:
  hk-01: {type: http, server: 10.0.0.1, port: 3128}
  jp-01: {type: socks5, server: 10.0.0.2, port: 1080}
proxy_group:
  Proxy:
    type: select
    proxies: [hk-01, jp-01]
  Chain:
    type: relay
    proxies: [jp-01, Proxy]
rule_local:
  - DOMAIN-SUFFIX,google.com,Proxy
  - DOMAIN,chain.example,Chain
  - IP-CIDR,192.168.0.0/16,DIRECT
  - MATCH,Proxy
"#;

    #[tokio::test]
    async fn test_route_first_match() {
        let d = dispatcher(build(CONFIG).await);
        let r = d.route(&mut conn("www.google.com:443", NetworkType::Tcp)).await;
        assert_eq!(r.target, "Proxy");
        assert_eq!(r.proxy.name(), "hk-01");
        assert_eq!(r.rule.as_deref(), Some("DOMAIN-SUFFIX,google.com,Proxy"));

        let mut info = conn("nas.home:445", NetworkType::Tcp);
        let r = d.route(&mut info).await;
        assert_eq!(r.target, "DIRECT");
        assert!(info.resolved_dst.is_some());

        let r = d.route(&mut conn("chain.example:443", NetworkType::Tcp)).await;
        let names: Vec<_> = r.chain.iter().map(|p| p.get_name()).collect();
        assert_eq!(names, vec!["jp-01", "hk-01"]);
        assert_eq!(r.to_string(), "[DOMAIN,chain.example,Chain] Chain => jp-01 -> hk-01");
    }

    #[tokio::test]
    async fn test_udp_rejected() {
        let d = dispatcher(build(CONFIG).await);
        let r = d.route(&mut conn("www.google.com:443", NetworkType::Udp)).await;
        assert!(matches!(r.proxy.get_impl().as_ref(), ProxyImpl::Reject));
        d.set_selection("Proxy", "jp-01").unwrap();
        let r = d.route(&mut conn("www.google.com:443", NetworkType::Udp)).await;
        assert_eq!(r.proxy.name(), "jp-01");
    }

    #[tokio::test]
    async fn test_modes() {
        let d = dispatcher(build(CONFIG).await);
        d.set_mode(Mode::Direct);
        let r = d.route(&mut conn("www.google.com:443", NetworkType::Tcp)).await;
        assert_eq!(r.proxy.name(), "DIRECT");
        d.set_mode(Mode::Global);
        assert_eq!(d.get_mode(), Mode::Global);
        let r = d.route(&mut conn("www.google.com:443", NetworkType::Tcp)).await;
        assert_eq!(r.target, GLOBAL);
        assert_eq!(r.proxy.name(), "DIRECT");
        d.set_selection(GLOBAL, "Proxy").unwrap();
        let r = d.route(&mut conn("www.google.com:443", NetworkType::Tcp)).await;
        assert_eq!(r.proxy.name(), "hk-01");
    }

    #[tokio::test]
    async fn test_reload_atomicity() {
        let d = dispatcher(build(CONFIG).await);
        let held = d.snapshot();
        d.apply(build("rule_local: [\"MATCH,REJECT\"]").await).await;
        // the old generation stays complete for whoever still holds it
        assert!(held.proxies().contains("hk-01"));
        assert_eq!(held.rules().len(), 4);
        let mut info = conn("www.google.com:443", NetworkType::Tcp);
        let m = held.rules().matches(&mut info, d.resolver.as_ref()).await;
        assert_eq!(m.target, "Proxy");

        let r = d.route(&mut conn("www.google.com:443", NetworkType::Tcp)).await;
        assert_eq!(r.target, "REJECT");
        assert!(!d.snapshot().proxies().contains("hk-01"));
    }

    #[tokio::test]
    async fn test_partial_updates() {
        let d = dispatcher(build(CONFIG).await);
        let bare = build("mode: rule").await;
        // rules still point at Proxy and Chain
        assert!(d.update_proxies(bare.proxies().clone()).await.is_err());
        assert!(d.snapshot().proxies().contains("Proxy"));

        let other = build(
            "proxy_local:\n  hk-02: {type: http, server: 10.0.0.3, port: 80}\nrule_local: [\"MATCH,hk-02\"]",
        )
        .await;
        assert!(d.update_rules(other.rules().clone()).await.is_err());

        let bare = build("rule_local: [\"MATCH,REJECT\"]").await;
        d.update_rules(bare.rules().clone()).await.unwrap();
        let r = d.route(&mut conn("www.google.com:443", NetworkType::Tcp)).await;
        assert_eq!(r.target, "REJECT");
    }
}
