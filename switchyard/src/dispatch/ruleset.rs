use crate::common::host_matcher::{HostMatcher, HostMatcherBuilder};
use crate::config::{ProviderBehavior, RuleSchema};
use crate::dispatch::rule::{PortRule, RuleImpl};
use crate::dispatch::{ConnInfo, NetworkType};
use crate::external::GeoDatabases;
use aho_corasick::AhoCorasick;
use ipnet::IpNet;
use radix_trie::{Trie, TrieCommon};
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;

const V4_TAG: u8 = 4;
const V6_TAG: u8 = 6;

fn ip_to_vec(ip: IpAddr) -> Vec<u8> {
    let (tag, octets) = match ip {
        IpAddr::V4(v4) => (V4_TAG, v4.octets().to_vec()),
        IpAddr::V6(v6) => (V6_TAG, v6.octets().to_vec()),
    };
    let mut ret = Vec::with_capacity(1 + octets.len() * 8);
    ret.push(tag);
    for oct in octets {
        for i in (0..8).rev() {
            ret.push(u8::from(oct & (1 << i) != 0));
        }
    }
    ret
}

fn ipnet_to_vec(net: IpNet) -> Vec<u8> {
    let mut ret = ip_to_vec(net.network());
    ret.truncate(1 + net.prefix_len() as usize);
    ret
}

fn trie_contains(trie: &Trie<Vec<u8>, ()>, ip: IpAddr) -> bool {
    trie.get_ancestor(ip_to_vec(ip).as_slice())
        .is_some_and(|node| node.key().is_some())
}

/// Matcher for all entries of one rule provider. Never performs DNS lookups:
/// IP entries only see a literal or already-resolved destination.
pub struct RuleSet {
    domain: HostMatcher,
    domain_keyword: Option<AhoCorasick>,
    ip: Trie<Vec<u8>, ()>,
    src_ip: Trie<Vec<u8>, ()>,
    dst_port: Vec<PortRule>,
    src_port: Vec<PortRule>,
    process_name: HashSet<String>,
    network: HashSet<NetworkType>,
    /// Entries without an indexed form, checked one by one.
    others: Vec<RuleImpl>,
    size: usize,
}

impl Debug for RuleSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RULE-SET({})", self.size)
    }
}

impl RuleSet {
    pub fn empty() -> Self {
        RuleSetBuilder::new().build()
    }

    pub fn matches(&self, info: &ConnInfo) -> bool {
        if let Some(domain_name) = info.dst.domain_name() {
            if self.domain.matches(domain_name)
                || self
                    .domain_keyword
                    .as_ref()
                    .is_some_and(|ac| ac.is_match(domain_name.to_ascii_lowercase().as_str()))
            {
                return true;
            }
        }
        if let Some(ip) = info.dst_ip() {
            if trie_contains(&self.ip, ip) {
                return true;
            }
        }
        if trie_contains(&self.src_ip, info.src.ip()) {
            return true;
        }
        let network = info.connection_type;
        if self
            .dst_port
            .iter()
            .any(|p| p.matches(info.dst.port(), network))
            || self
                .src_port
                .iter()
                .any(|p| p.matches(info.src.port(), network))
            || self.network.contains(&network)
        {
            return true;
        }
        if let Some(proc) = &info.process_info {
            if self.process_name.contains(&proc.name) {
                return true;
            }
        }
        self.others.iter().any(|r| r.matches(info))
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Default)]
pub struct RuleSetBuilder {
    domain: HostMatcherBuilder,
    domain_keyword: Vec<String>,
    ip_cidr: Vec<(Vec<u8>, ())>,
    src_ip_cidr: Vec<(Vec<u8>, ())>,
    dst_port: Vec<PortRule>,
    src_port: Vec<PortRule>,
    process_name: HashSet<String>,
    network: HashSet<NetworkType>,
    others: Vec<RuleImpl>,
    size: usize,
}

impl RuleSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret a provider payload. Entries that do not parse are logged and
    /// skipped so that one bad line does not discard a whole refresh.
    pub fn from_schema(name: &str, schema: &RuleSchema, geo: &GeoDatabases) -> Self {
        let mut builder = Self::new();
        for entry in schema.payload.iter().map(|s| s.trim()) {
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            let added = match schema.behavior {
                ProviderBehavior::Domain => builder.add_domain_entry(entry),
                ProviderBehavior::IpCidr => builder.add_cidr_entry(entry),
                ProviderBehavior::Classical => match RuleImpl::parse_classical(entry, geo) {
                    Ok(rule) => {
                        builder.add_rule(rule);
                        true
                    }
                    Err(e) => {
                        tracing::warn!("Rule provider {}: skip {}: {}", name, entry, e);
                        continue;
                    }
                },
            };
            if !added {
                tracing::warn!("Rule provider {}: skip invalid entry {}", name, entry);
            }
        }
        builder
    }

    fn add_domain_entry(&mut self, entry: &str) -> bool {
        if let Some(sfx) = entry.strip_prefix("+.").or_else(|| entry.strip_prefix('.')) {
            self.domain.add_suffix(sfx);
        } else if entry.contains('*') || entry.contains(',') {
            return false;
        } else {
            self.domain.add_exact(entry);
        }
        self.size += 1;
        true
    }

    fn add_cidr_entry(&mut self, entry: &str) -> bool {
        let net = entry
            .parse::<IpNet>()
            .ok()
            .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from));
        match net {
            Some(net) => {
                self.ip_cidr.push((ipnet_to_vec(net), ()));
                self.size += 1;
                true
            }
            None => false,
        }
    }

    pub fn add_rule(&mut self, rule: RuleImpl) {
        self.size += 1;
        match rule {
            RuleImpl::Domain(dn) => self.domain.add_exact(dn.as_str()),
            RuleImpl::DomainSuffix(sfx) => self.domain.add_suffix(sfx.as_str()),
            RuleImpl::DomainKeyword(kw) => self.domain_keyword.push(kw),
            RuleImpl::IpCidr(net) => self.ip_cidr.push((ipnet_to_vec(net), ())),
            RuleImpl::SrcIpCidr(net) => self.src_ip_cidr.push((ipnet_to_vec(net), ())),
            RuleImpl::DstPort(p) => self.dst_port.push(p),
            RuleImpl::SrcPort(p) => self.src_port.push(p),
            RuleImpl::ProcessName(pn) => {
                self.process_name.insert(pn);
            }
            RuleImpl::Network(n) => {
                self.network.insert(n);
            }
            other => self.others.push(other),
        }
    }

    pub fn build(self) -> RuleSet {
        let domain_keyword = if self.domain_keyword.is_empty() {
            None
        } else {
            AhoCorasick::new(self.domain_keyword.as_slice()).ok()
        };
        RuleSet {
            domain: self.domain.build(),
            domain_keyword,
            ip: Trie::from_iter(self.ip_cidr),
            src_ip: Trie::from_iter(self.src_ip_cidr),
            dst_port: self.dst_port,
            src_port: self.src_port,
            process_name: self.process_name,
            network: self.network,
            others: self.others,
            size: self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::NetworkAddr;
    use std::net::SocketAddr;

    fn conn(dst: &str) -> ConnInfo {
        ConnInfo::new(
            "192.168.1.10:50000".parse().unwrap(),
            NetworkAddr::parse(dst).unwrap(),
            NetworkType::Tcp,
        )
    }

    fn build(behavior: ProviderBehavior, payload: &[&str]) -> RuleSet {
        let schema = RuleSchema {
            behavior,
            payload: payload.iter().map(|s| s.to_string()).collect(),
        };
        RuleSetBuilder::from_schema("test", &schema, &GeoDatabases::default()).build()
    }

    #[test]
    fn test_domain_behavior() {
        let rs = build(ProviderBehavior::Domain, &["+.google.com", "github.com", "bad,entry"]);
        assert_eq!(rs.len(), 2);
        assert!(rs.matches(&conn("www.google.com:443")));
        assert!(rs.matches(&conn("github.com:443")));
        assert!(!rs.matches(&conn("api.github.com:443")));

        let rs = build(ProviderBehavior::Domain, &["+.例.com", "ñandú.es"]);
        assert!(rs.matches(&conn("www.例.com:443")));
        assert!(!rs.matches(&conn("x例.com:443")));
        assert!(rs.matches(&conn("ñandú.es:443")));
        assert!(!rs.matches(&conn("xñandú.es:443")));
    }

    #[test]
    fn test_ipcidr_behavior() {
        let rs = build(
            ProviderBehavior::IpCidr,
            &["10.0.0.0/8", "2001:db8::/32", "1.1.1.1"],
        );
        assert!(rs.matches(&conn("10.20.30.40:80")));
        assert!(rs.matches(&conn("[2001:db8::5]:80")));
        assert!(rs.matches(&conn("1.1.1.1:53")));
        assert!(!rs.matches(&conn("1.1.1.2:53")));
        let mut info = conn("internal.example.com:80");
        assert!(!rs.matches(&info));
        info.resolved_dst = Some(SocketAddr::new("10.0.0.1".parse().unwrap(), 80));
        assert!(rs.matches(&info));
    }

    #[test]
    fn test_classical_behavior() {
        let rs = build(
            ProviderBehavior::Classical,
            &[
                "DOMAIN-KEYWORD,tracker",
                "DST-PORT,8080",
                "PROCESS-NAME,telemetryd",
                "AND,[DOMAIN-SUFFIX,example.org],[NETWORK,TCP]",
                "UNKNOWN,payload",
            ],
        );
        assert_eq!(rs.len(), 4);
        assert!(rs.matches(&conn("ad.Tracker.net:443")));
        assert!(rs.matches(&conn("1.2.3.4:8080")));
        assert!(rs.matches(&conn("www.example.org:443")));
        assert!(rs.matches(&conn("foo.com:443").with_process("telemetryd")));
        assert!(!rs.matches(&conn("foo.com:443")));
        assert!(RuleSet::empty().is_empty());
    }
}
