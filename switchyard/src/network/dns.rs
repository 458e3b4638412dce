use crate::config::RawDnsCfg;
use crate::proxy::error::DnsError;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Turns a domain into one address. Used by the rule engine when an
/// IP-based rule meets a domain destination.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve_host(&self, domain_name: &str) -> Result<IpAddr, DnsError>;
}

pub struct Dns {
    hosts: ArcSwap<HashMap<String, IpAddr>>,
    resolvers: ArcSwap<Vec<TokioAsyncResolver>>,
    timeout: Duration,
}

impl Dns {
    pub fn with_config(config: &RawDnsCfg) -> Result<Self, DnsError> {
        let resolvers = Self::build_resolvers(&config.nameserver)?;
        Ok(Self {
            hosts: ArcSwap::new(Arc::new(Self::normalize_hosts(&config.hosts))),
            resolvers: ArcSwap::new(Arc::new(resolvers)),
            timeout: Duration::from_millis(config.timeout),
        })
    }

    pub fn replace_config(&self, config: &RawDnsCfg) -> Result<(), DnsError> {
        let resolvers = Self::build_resolvers(&config.nameserver)?;
        self.resolvers.store(Arc::new(resolvers));
        self.hosts
            .store(Arc::new(Self::normalize_hosts(&config.hosts)));
        Ok(())
    }

    fn normalize_hosts(hosts: &HashMap<String, IpAddr>) -> HashMap<String, IpAddr> {
        hosts
            .iter()
            .map(|(k, v)| (k.trim_end_matches('.').to_ascii_lowercase(), *v))
            .collect()
    }

    fn build_resolvers(nameservers: &[SocketAddr]) -> Result<Vec<TokioAsyncResolver>, DnsError> {
        if nameservers.is_empty() {
            let resolver = TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| DnsError::Resolver(e.to_string()))?;
            return Ok(vec![resolver]);
        }
        Ok(nameservers
            .iter()
            .map(|ns| {
                let group = NameServerConfigGroup::from_ips_clear(&[ns.ip()], ns.port(), true);
                let cfg = ResolverConfig::from_parts(None, vec![], group);
                TokioAsyncResolver::tokio(cfg, ResolverOpts::default())
            })
            .collect())
    }

    pub async fn genuine_lookup(&self, domain_name: &str) -> Result<IpAddr, DnsError> {
        for r in self.resolvers.load().iter() {
            match tokio::time::timeout(self.timeout, r.lookup_ip(domain_name)).await {
                Ok(Ok(result)) => {
                    if let Some(ip) = result.iter().next() {
                        return Ok(ip);
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!("DNS lookup for {} failed: {}", domain_name, e);
                }
                Err(_) => {
                    tracing::debug!("DNS lookup for {} timeout", domain_name);
                    return Err(DnsError::Timeout(domain_name.to_string()));
                }
            }
        }
        Err(DnsError::NoRecord(domain_name.to_string()))
    }
}

#[async_trait]
impl HostResolver for Dns {
    async fn resolve_host(&self, domain_name: &str) -> Result<IpAddr, DnsError> {
        if let Ok(ip) = domain_name.parse::<IpAddr>() {
            return Ok(ip);
        }
        let key = domain_name.trim_end_matches('.').to_ascii_lowercase();
        if let Some(ip) = self.hosts.load().get(&key) {
            return Ok(*ip);
        }
        self.genuine_lookup(domain_name).await
    }
}

#[tokio::test]
async fn test_static_hosts() {
    let mut cfg = RawDnsCfg {
        nameserver: vec!["127.0.0.1:53".parse().unwrap()],
        ..Default::default()
    };
    cfg.hosts
        .insert("Router.LAN".to_string(), "192.168.1.1".parse().unwrap());
    let dns = Dns::with_config(&cfg).unwrap();
    assert_eq!(
        dns.resolve_host("router.lan").await.unwrap(),
        "192.168.1.1".parse::<IpAddr>().unwrap()
    );
    assert_eq!(
        dns.resolve_host("10.0.0.1").await.unwrap(),
        "10.0.0.1".parse::<IpAddr>().unwrap()
    );
}
