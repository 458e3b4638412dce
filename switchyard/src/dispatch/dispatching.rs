use crate::adapter::ProbeConnector;
use crate::config::{
    ConfigError, LoadedConfig, ProviderError, ProxyError, RawBalanceStrategy, RawGroupType,
    RawHashKey, RawProbeCfg, RawProxyGroupCfg, RawRootCfg, RawState, RuleError,
};
use crate::dispatch::group::{BalanceStrategy, GroupProbe, GroupStrategy, HashKey};
use crate::dispatch::pool::COMPATIBLE;
use crate::dispatch::rule::{Rule, RuleBuilder};
use crate::dispatch::{build_proxy, ConnInfo, GeneralProxy, Proxy, ProxyGroup, ProxyImpl};
use crate::external::GeoDatabases;
use crate::network::HostResolver;
use crate::provider::{HealthProber, Provider, ProviderHealth, ProxySetProvider, RuleSetProvider};
use crate::proxy::error::SelectionError;
use futures::future::join_all;
use linked_hash_map::LinkedHashMap;
use regex::Regex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";
pub const GLOBAL: &str = "GLOBAL";

const DEFAULT_PROBE_INTERVAL: u64 = 300;

/// Every named outbound of one generation, with the providers feeding them.
pub struct ProxyTable {
    proxies: HashMap<String, GeneralProxy>,
    /// All names in declaration order: built-ins, local proxies, then groups.
    order: Vec<String>,
    groups: Vec<Arc<ProxyGroup>>,
    providers: LinkedHashMap<String, Arc<ProxySetProvider>>,
}

impl ProxyTable {
    pub fn get(&self, name: &str) -> Option<GeneralProxy> {
        self.proxies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.proxies.contains_key(name)
    }

    pub fn group(&self, name: &str) -> Option<Arc<ProxyGroup>> {
        self.groups.iter().find(|g| g.name() == name).cloned()
    }

    /// Groups in declaration order; the built-in `GLOBAL` comes last.
    pub fn get_group_list(&self) -> Vec<Arc<ProxyGroup>> {
        self.groups.clone()
    }

    /// Every named outbound in declaration order.
    pub fn get_all(&self) -> Vec<GeneralProxy> {
        self.order
            .iter()
            .filter_map(|n| self.proxies.get(n).cloned())
            .collect()
    }

    pub fn providers(&self) -> &LinkedHashMap<String, Arc<ProxySetProvider>> {
        &self.providers
    }

    pub fn direct(&self) -> Arc<Proxy> {
        self.builtin(DIRECT, ProxyImpl::Direct)
    }

    pub fn reject(&self) -> Arc<Proxy> {
        self.builtin(REJECT, ProxyImpl::Reject)
    }

    pub fn placeholder(&self) -> Arc<Proxy> {
        self.builtin(COMPATIBLE, ProxyImpl::Direct)
    }

    fn builtin(&self, name: &str, detail: ProxyImpl) -> Arc<Proxy> {
        match self.proxies.get(name) {
            Some(GeneralProxy::Single(p)) => p.clone(),
            _ => Arc::new(Proxy::new(name, detail)),
        }
    }

    pub fn set_group_selection(&self, group: &str, proxy: &str) -> Result<(), SelectionError> {
        match self.group(group) {
            Some(g) => g.set_selection(proxy),
            None => Err(SelectionError::GroupNotFound(group.to_string())),
        }
    }

    /// Re-apply stored selector pins that differ from the live ones.
    pub fn restore_selections(&self, selections: &HashMap<String, String>) {
        for g in self.groups.iter().filter(|g| g.is_selector()) {
            let Some(wanted) = selections.get(g.name()) else {
                continue;
            };
            if g.selected().as_deref() == Some(wanted.as_str()) {
                continue;
            }
            if let Err(e) = g.set_selection(wanted) {
                tracing::debug!("Stored selection of group {} not restored: {}", g.name(), e);
            }
        }
    }

    pub fn start(&self) {
        for p in self.providers.values() {
            p.start();
        }
        for g in &self.groups {
            g.start();
        }
    }

    pub fn stop(&self) {
        for p in self.providers.values() {
            p.stop();
        }
        for g in &self.groups {
            g.stop();
        }
    }
}

/// Outcome of walking the rules for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub target: String,
    /// Rendered rule that matched; `None` for the default target.
    pub rule: Option<String>,
}

/// Ordered rules of one generation, with the rule providers they reference.
pub struct RuleTable {
    rules: Vec<Rule>,
    providers: LinkedHashMap<String, Arc<RuleSetProvider>>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>, providers: LinkedHashMap<String, Arc<RuleSetProvider>>) -> Self {
        Self { rules, providers }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn providers(&self) -> &LinkedHashMap<String, Arc<RuleSetProvider>> {
        &self.providers
    }

    /// First matching rule wins; `DIRECT` when none does. The destination is
    /// resolved at most once, by the first rule that needs an IP. When that
    /// lookup fails, every rule needing an IP is skipped.
    pub async fn matches(&self, info: &mut ConnInfo, resolver: &dyn HostResolver) -> RuleMatch {
        let mut resolve_failed = false;
        for rule in &self.rules {
            if rule.should_resolve_ip() {
                if resolve_failed {
                    continue;
                }
                if info.needs_resolution() {
                    if let Some(domain_name) = info.dst.domain_name() {
                        match resolver.resolve_host(domain_name).await {
                            Ok(ip) => {
                                info.resolved_dst = Some(SocketAddr::new(ip, info.dst.port()))
                            }
                            Err(e) => {
                                tracing::debug!("Rule resolution for {} failed: {}", info.dst, e);
                                resolve_failed = true;
                                continue;
                            }
                        }
                    }
                }
            }
            if rule.matches(info) {
                return RuleMatch {
                    target: rule.target().to_string(),
                    rule: Some(rule.to_string()),
                };
            }
        }
        RuleMatch {
            target: DIRECT.to_string(),
            rule: None,
        }
    }

    /// Every target must name an outbound of `table`.
    pub fn validate_targets(&self, table: &ProxyTable) -> Result<(), RuleError> {
        for rule in &self.rules {
            if !table.contains(rule.target()) {
                return Err(RuleError::UnknownTarget {
                    rule: rule.to_string(),
                    target: rule.target().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn start(&self) {
        for p in self.providers.values() {
            p.start();
        }
    }

    pub fn stop(&self) {
        for p in self.providers.values() {
            p.stop();
        }
    }
}

/// One complete routing generation.
pub struct Dispatching {
    proxies: Arc<ProxyTable>,
    rules: Arc<RuleTable>,
}

impl Dispatching {
    pub fn new(proxies: Arc<ProxyTable>, rules: Arc<RuleTable>) -> Result<Self, RuleError> {
        rules.validate_targets(&proxies)?;
        Ok(Self { proxies, rules })
    }

    pub fn proxies(&self) -> &Arc<ProxyTable> {
        &self.proxies
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }

    pub fn start(&self) {
        self.proxies.start();
        self.rules.start();
    }

    pub fn stop(&self) {
        self.proxies.stop();
        self.rules.stop();
    }
}

/// Builds generations from a loaded configuration.
pub struct DispatchingBuilder {
    connector: Arc<dyn ProbeConnector>,
}

impl DispatchingBuilder {
    pub fn new(connector: Arc<dyn ProbeConnector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> Arc<dyn ProbeConnector> {
        self.connector.clone()
    }

    pub async fn build(&self, loaded: &LoadedConfig) -> Result<Dispatching, ConfigError> {
        let LoadedConfig {
            config,
            state,
            config_dir,
        } = loaded;
        let geo = GeoDatabases::load(
            config_dir,
            config.geoip_db.as_deref(),
            config.geosite_db.as_deref(),
        )?;
        let proxies = Arc::new(self.build_proxy_table(config, state, config_dir).await?);
        let rules = Arc::new(Self::build_rule_table(config, config_dir, &proxies, &geo).await?);
        tracing::info!(
            "Built {} proxies, {} groups and {} rules",
            proxies.order.len(),
            proxies.groups.len(),
            rules.len()
        );
        Ok(Dispatching { proxies, rules })
    }

    pub async fn build_proxy_table(
        &self,
        config: &RawRootCfg,
        state: &RawState,
        config_dir: &Path,
    ) -> Result<ProxyTable, ConfigError> {
        let fetch_timeout = Duration::from_secs(config.probe.fetch_timeout);
        let mut providers = LinkedHashMap::new();
        for (name, cfg) in &config.proxy_provider {
            let health = match &cfg.health_check {
                Some(hc) if hc.enable => Some(ProviderHealth {
                    prober: self.prober(&hc.url, &config.probe).map_err(|e| {
                        ProviderError::Invalid(format!("{}: bad health check url: {}", name, e))
                    })?,
                    interval: Duration::from_secs(hc.interval),
                    lazy: hc.lazy,
                }),
                _ => None,
            };
            let provider =
                ProxySetProvider::from_config(name, cfg, config_dir, fetch_timeout, health)?;
            providers.insert(name.clone(), Arc::new(provider));
        }
        let results = join_all(providers.values().map(|p| p.initial())).await;
        for (name, result) in providers.keys().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Initial proxy provider {} error: {}", name, e);
            }
        }

        let mut builder = ProxyTableBuilder {
            config,
            state,
            connector: &self.connector,
            providers: &providers,
            proxies: HashMap::new(),
            order: vec![],
            groups: HashMap::new(),
            stack: vec![],
        };
        for (name, detail) in [
            (DIRECT, ProxyImpl::Direct),
            (REJECT, ProxyImpl::Reject),
            (COMPATIBLE, ProxyImpl::Direct),
        ] {
            builder.insert(name, GeneralProxy::Single(Arc::new(Proxy::new(name, detail))));
        }
        for (name, cfg) in &config.proxy_local {
            if builder.proxies.contains_key(name) {
                return Err(ProxyError::DuplicateProxy(name.clone()).into());
            }
            builder.insert(name, GeneralProxy::Single(build_proxy(name, cfg)?));
        }
        for name in config.proxy_group.keys() {
            if builder.proxies.contains_key(name) {
                return Err(ProxyError::DuplicateGroup(name.clone()).into());
            }
        }
        for name in config.proxy_group.keys() {
            builder.parse_group(name)?;
        }
        if !builder.proxies.contains_key(GLOBAL) {
            builder.build_global();
        }
        Ok(builder.finish())
    }

    pub async fn build_rule_table(
        config: &RawRootCfg,
        config_dir: &Path,
        table: &ProxyTable,
        geo: &GeoDatabases,
    ) -> Result<RuleTable, ConfigError> {
        let fetch_timeout = Duration::from_secs(config.probe.fetch_timeout);
        let mut providers = LinkedHashMap::new();
        for (name, cfg) in &config.rule_provider {
            let provider =
                RuleSetProvider::from_config(name, cfg, config_dir, fetch_timeout, geo.clone())?;
            providers.insert(name.clone(), Arc::new(provider));
        }
        let results = join_all(providers.values().map(|p| p.initial())).await;
        for (name, result) in providers.keys().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Initial rule provider {} error: {}", name, e);
            }
        }
        let mut builder = RuleBuilder::new(table, &providers, geo);
        for r in &config.rule_local {
            builder.append_literal(r.as_str())?;
        }
        let rules = builder.build();
        Ok(RuleTable::new(rules, providers))
    }

    fn prober(&self, url: &str, probe: &RawProbeCfg) -> Result<Arc<HealthProber>, url::ParseError> {
        Ok(Arc::new(HealthProber::new(
            self.connector.clone(),
            url,
            Duration::from_millis(probe.timeout),
            probe.concurrency,
        )?))
    }
}

struct ProxyTableBuilder<'a> {
    config: &'a RawRootCfg,
    state: &'a RawState,
    connector: &'a Arc<dyn ProbeConnector>,
    providers: &'a LinkedHashMap<String, Arc<ProxySetProvider>>,
    proxies: HashMap<String, GeneralProxy>,
    order: Vec<String>,
    groups: HashMap<String, Arc<ProxyGroup>>,
    /// Groups whose members are being built, for cycle reporting.
    stack: Vec<String>,
}

impl ProxyTableBuilder<'_> {
    fn insert(&mut self, name: &str, proxy: GeneralProxy) {
        self.order.push(name.to_string());
        self.proxies.insert(name.to_string(), proxy);
    }

    // recursion for topological order
    fn parse_group(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.groups.contains_key(name) {
            return Ok(());
        }
        if let Some(pos) = self.stack.iter().position(|n| n == name) {
            let mut cycle = self.stack[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(ProxyError::Cycle(cycle.join(" -> ")).into());
        }
        let config = self.config;
        let Some(cfg) = config.proxy_group.get(name) else {
            return Err(ProxyError::MissingGroup(name.to_string()).into());
        };
        if !cfg.roughly_validate() {
            return Err(ProxyError::EmptyGroup(name.to_string()).into());
        }

        self.stack.push(name.to_string());
        let mut members = vec![];
        for member in cfg.member_names() {
            if config.proxy_group.contains_key(member) {
                self.parse_group(member)?;
            }
            let Some(p) = self.proxies.get(member) else {
                return Err(ProxyError::UnknownProxyInGroup {
                    proxy: member.clone(),
                    group: name.to_string(),
                }
                .into());
            };
            members.push(p.clone());
        }
        self.stack.pop();

        let mut sources = vec![];
        if cfg.proxies.is_some() {
            sources.push(Arc::new(ProxySetProvider::new_inline(name, members)));
        }
        for provider in cfg.providers.iter().flatten() {
            let Some(p) = self.providers.get(provider) else {
                return Err(ProviderError::Missing(provider.clone()).into());
            };
            sources.push(p.clone());
        }
        let filter = cfg
            .filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ProviderError::BadFilter(name.to_string(), e.to_string()))?;
        let probe = self.group_probe(name, cfg)?;
        let group = Arc::new(ProxyGroup::new(
            name,
            Self::strategy(cfg),
            sources,
            filter,
            self.placeholder(),
            probe,
        ));
        if let [only] = group.get_members().as_slice() {
            if only.name() == COMPATIBLE {
                tracing::warn!("Group {} has no usable member, using {}", name, COMPATIBLE);
            }
        }
        self.apply_sticky(&group);
        self.groups.insert(name.to_string(), group.clone());
        self.insert(name, GeneralProxy::Group(group));
        Ok(())
    }

    fn strategy(cfg: &RawProxyGroupCfg) -> GroupStrategy {
        match cfg.group_type {
            RawGroupType::Selector => GroupStrategy::Selector,
            RawGroupType::UrlTest => GroupStrategy::UrlTest {
                tolerance: cfg.tolerance.unwrap_or(0),
            },
            RawGroupType::Fallback => GroupStrategy::Fallback,
            RawGroupType::LoadBalance => {
                GroupStrategy::LoadBalance(match cfg.strategy.unwrap_or_default() {
                    RawBalanceStrategy::ConsistentHashing => {
                        BalanceStrategy::ConsistentHashing(match cfg.hash_key.unwrap_or_default() {
                            RawHashKey::Src => HashKey::Src,
                            RawHashKey::Dst => HashKey::Dst,
                            RawHashKey::Both => HashKey::Both,
                        })
                    }
                    RawBalanceStrategy::RoundRobin => {
                        BalanceStrategy::RoundRobin(AtomicUsize::new(0))
                    }
                })
            }
            RawGroupType::Relay => GroupStrategy::Relay,
        }
    }

    fn group_probe(
        &self,
        name: &str,
        cfg: &RawProxyGroupCfg,
    ) -> Result<Option<GroupProbe>, ConfigError> {
        let Some(url) = &cfg.url else {
            if cfg.requires_url() {
                return Err(ProxyError::MissingUrl(name.to_string()).into());
            }
            return Ok(None);
        };
        if cfg.group_type == RawGroupType::Relay {
            return Ok(None);
        }
        let probe = &self.config.probe;
        let prober = HealthProber::new(
            self.connector.clone(),
            url,
            Duration::from_millis(probe.timeout),
            probe.concurrency,
        )
        .map_err(|e| ProxyError::Invalid(format!("group {} has bad url {}: {}", name, url, e)))?;
        Ok(Some(GroupProbe {
            prober: Arc::new(prober),
            interval: Duration::from_secs(cfg.interval.unwrap_or(DEFAULT_PROBE_INTERVAL)),
            lazy: cfg.lazy.unwrap_or(true),
        }))
    }

    fn placeholder(&self) -> GeneralProxy {
        self.proxies.get(COMPATIBLE).cloned().unwrap_or_else(|| {
            GeneralProxy::Single(Arc::new(Proxy::new(COMPATIBLE, ProxyImpl::Direct)))
        })
    }

    fn apply_sticky(&self, group: &ProxyGroup) {
        if !group.is_selector() {
            return;
        }
        if let Some(selected) = self.state.group_selection.get(group.name()) {
            if let Err(e) = group.set_selection(selected) {
                tracing::warn!("Ignore stored selection of group {}: {}", group.name(), e);
            }
        }
    }

    /// Selector over DIRECT, REJECT, every local proxy and every group.
    fn build_global(&mut self) {
        let mut members = vec![];
        for name in [DIRECT, REJECT] {
            if let Some(p) = self.proxies.get(name) {
                members.push(p.clone());
            }
        }
        for name in self.config.proxy_local.keys().chain(self.config.proxy_group.keys()) {
            if let Some(p) = self.proxies.get(name) {
                members.push(p.clone());
            }
        }
        let group = Arc::new(ProxyGroup::new(
            GLOBAL,
            GroupStrategy::Selector,
            vec![Arc::new(ProxySetProvider::new_inline(GLOBAL, members))],
            None,
            self.placeholder(),
            None,
        ));
        self.apply_sticky(&group);
        self.groups.insert(GLOBAL.to_string(), group.clone());
        self.insert(GLOBAL, GeneralProxy::Group(group));
    }

    fn finish(mut self) -> ProxyTable {
        let mut groups = vec![];
        for name in self.config.proxy_group.keys() {
            if let Some(g) = self.groups.remove(name) {
                groups.push(g);
            }
        }
        groups.extend(self.groups.remove(GLOBAL));
        ProxyTable {
            proxies: self.proxies,
            order: self.order,
            groups,
            providers: self.providers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ScriptedConnector;
    use crate::dispatch::{NetworkAddr, NetworkType};
    use crate::proxy::error::DnsError;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn loaded(text: &str) -> LoadedConfig {
        LoadedConfig {
            config: serde_yaml::from_str(text).unwrap(),
            state: RawState::default(),
            config_dir: PathBuf::from("/nonexistent"),
        }
    }

    fn builder() -> DispatchingBuilder {
        DispatchingBuilder::new(Arc::new(ScriptedConnector(HashMap::new())))
    }

    struct CountingResolver {
        answer: Option<IpAddr>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HostResolver for CountingResolver {
        async fn resolve_host(&self, domain_name: &str) -> Result<IpAddr, DnsError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.answer
                .ok_or_else(|| DnsError::NoRecord(domain_name.to_string()))
        }
    }

    const CONFIG: &str = r#"
proxy_local:
  hk-01: {type: socks5, server: 10.0.0.1, port: 1080}
  jp-01: {type: http, server: 10.0.0.2, port: 3128}
proxy_provider:
  sub:
    vehicle: inline
    proxies:
      - {name: us-01, type: http, server: 10.0.1.1, port: 80}
      - {name: us-02, type: http, server: 10.0.1.2, port: 80}
proxy_group:
  Proxy:
    type: select
    proxies: [auto, hk-01, DIRECT]
  auto:
    type: url-test
    proxies: [jp-01]
    use: [sub]
    url: http://www.gstatic.com/generate_204
  us:
    type: fallback
    use: [sub]
    filter: "^us-"
    url: http://www.gstatic.com/generate_204
rule_provider:
  lan:
    behavior: ipcidr
    vehicle: inline
    payload: [192.168.0.0/16]
rule_local:
  - DOMAIN-SUFFIX,google.com,Proxy
  - RULE-SET,lan,DIRECT
  - IP-CIDR,10.0.0.0/8,REJECT
  - DST-PORT,22,us
  - MATCH,auto
"#;

    fn conn(dst: &str) -> ConnInfo {
        ConnInfo::new(
            "192.168.1.10:50000".parse().unwrap(),
            NetworkAddr::parse(dst).unwrap(),
            NetworkType::Tcp,
        )
    }

    #[tokio::test]
    async fn test_build_table() {
        let dispatching = builder().build(&loaded(CONFIG)).await.unwrap();
        let table = dispatching.proxies();
        let groups: Vec<_> = table.get_group_list().iter().map(|g| g.get_name()).collect();
        assert_eq!(groups, vec!["Proxy", "auto", "us", GLOBAL]);
        let auto = table.group("auto").unwrap();
        let members: Vec<_> = auto.get_members().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(members, vec!["jp-01", "us-01", "us-02"]);
        assert_eq!(table.group("Proxy").unwrap().current().name(), "auto");
        let global: Vec<_> = table
            .group(GLOBAL)
            .unwrap()
            .get_members()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(
            global,
            vec!["DIRECT", "REJECT", "hk-01", "jp-01", "Proxy", "auto", "us"]
        );
        assert!(table.contains(COMPATIBLE));
        assert_eq!(
            table.set_group_selection("nope", "DIRECT"),
            Err(SelectionError::GroupNotFound("nope".to_string()))
        );
        assert_eq!(dispatching.rules().len(), 5);
    }

    #[tokio::test]
    async fn test_rule_walk() {
        let dispatching = builder().build(&loaded(CONFIG)).await.unwrap();
        let rules = dispatching.rules();
        let resolver = CountingResolver {
            answer: Some("10.1.2.3".parse().unwrap()),
            calls: AtomicUsize::new(0),
        };
        let mut info = conn("mail.google.com:443");
        let result = rules.matches(&mut info, &resolver).await;
        assert_eq!(result.target, "Proxy");
        assert_eq!(result.rule.as_deref(), Some("DOMAIN-SUFFIX,google.com,Proxy"));
        assert_eq!(resolver.calls.load(Ordering::Relaxed), 0);

        let mut info = conn("internal.corp:443");
        let result = rules.matches(&mut info, &resolver).await;
        assert_eq!(result.target, "REJECT");
        assert_eq!(resolver.calls.load(Ordering::Relaxed), 1);
        assert_eq!(info.resolved_dst, Some("10.1.2.3:443".parse().unwrap()));

        let mut info = conn("192.168.3.3:443");
        assert_eq!(rules.matches(&mut info, &resolver).await.target, "DIRECT");
        assert_eq!(resolver.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failed_resolution_skips_ip_rules() {
        let dispatching = builder().build(&loaded(CONFIG)).await.unwrap();
        let resolver = CountingResolver {
            answer: None,
            calls: AtomicUsize::new(0),
        };
        let mut info = conn("internal.corp:22");
        let result = dispatching.rules().matches(&mut info, &resolver).await;
        assert_eq!(result.target, "us");
        assert_eq!(resolver.calls.load(Ordering::Relaxed), 1);
        assert!(info.resolved_dst.is_none());
    }

    #[tokio::test]
    async fn test_default_direct() {
        let table = builder()
            .build(&loaded("rule_local: [\"DOMAIN,a.com,REJECT\"]"))
            .await
            .unwrap();
        let resolver = CountingResolver {
            answer: None,
            calls: AtomicUsize::new(0),
        };
        let result = table.rules().matches(&mut conn("b.com:80"), &resolver).await;
        assert_eq!(
            result,
            RuleMatch {
                target: DIRECT.to_string(),
                rule: None
            }
        );
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        let text = r#"
proxy_group:
  a: {type: select, proxies: [b]}
  b: {type: select, proxies: [c, DIRECT]}
  c: {type: select, proxies: [a]}
"#;
        let err = builder().build(&loaded(text)).await.err().unwrap();
        assert!(matches!(&err, ConfigError::Proxy(ProxyError::Cycle(_))));
        assert!(err.to_string().contains("a -> b -> c -> a"));

        let err = builder()
            .build(&loaded("proxy_group:\n  a: {type: select, proxies: [a]}"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Proxy(ProxyError::Cycle(_))));
    }

    #[tokio::test]
    async fn test_invalid_configs() {
        let cases = [
            "rule_local: [\"MATCH,nowhere\"]",
            "proxy_group:\n  a: {type: url-test, proxies: [DIRECT]}",
            "proxy_group:\n  a: {type: select, proxies: [ghost]}",
            "proxy_group:\n  a: {type: select, use: [ghost]}",
            "proxy_group:\n  a: {type: select}",
            "proxy_group:\n  DIRECT: {type: select, proxies: [REJECT]}",
            "proxy_group:\n  a: {type: select, proxies: [DIRECT], filter: \"(\"}",
            "rule_local: [\"RULE-SET,ghost,DIRECT\"]",
            "rule_local: [\"GEOIP,CN,DIRECT\"]",
        ];
        for text in cases {
            assert!(builder().build(&loaded(text)).await.is_err(), "{}", text);
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_filter_and_sticky() {
        let mut config = loaded(
            r#"
proxy_provider:
  sub:
    vehicle: inline
    proxies:
      - {name: us-01, type: http, server: 10.0.1.1, port: 80}
      - {name: hk-01, type: http, server: 10.0.1.2, port: 80}
proxy_group:
  hk:
    type: select
    use: [sub]
    filter: "hk"
  none:
    type: select
    use: [sub]
    filter: "^jp-"
"#,
        );
        config
            .state
            .group_selection
            .insert("hk".to_string(), "us-01".to_string());
        config
            .state
            .group_selection
            .insert(GLOBAL.to_string(), "hk".to_string());
        let dispatching = builder().build(&config).await.unwrap();
        let table = dispatching.proxies();
        // stale selection ignored, filter keeps only hk-01
        assert_eq!(table.group("hk").unwrap().current().name(), "hk-01");
        assert_eq!(table.group("none").unwrap().current().name(), COMPATIBLE);
        assert_eq!(table.group(GLOBAL).unwrap().current().name(), "hk");
        assert!(logs_contain("Ignore stored selection of group hk"));
        assert!(logs_contain("Group none has no usable member"));
    }

    #[tokio::test]
    async fn test_validate_targets() {
        let first = builder().build(&loaded(CONFIG)).await.unwrap();
        let bare = builder().build(&loaded("mode: rule")).await.unwrap();
        assert!(first.rules().validate_targets(bare.proxies()).is_err());
        assert!(Dispatching::new(first.proxies().clone(), bare.rules().clone()).is_ok());
        assert!(Dispatching::new(bare.proxies().clone(), first.rules().clone()).is_err());
    }
}
