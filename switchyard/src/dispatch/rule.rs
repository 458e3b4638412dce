use crate::config::RuleError;
use crate::dispatch::{ConnInfo, NetworkAddr, NetworkType, ProxyTable};
use crate::external::{is_lan, GeoDatabases, GeoSiteDb, MmdbReader};
use crate::provider::{Provider, RuleSetProvider};
use ipnet::IpNet;
use linked_hash_map::LinkedHashMap;
use std::fmt::{Debug, Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRule {
    Tcp(u16),
    Udp(u16),
    All(u16),
    Range(u16, u16),
    AnyTcp,
    AnyUdp,
}

impl PortRule {
    pub fn matches(&self, port: u16, network: NetworkType) -> bool {
        match self {
            PortRule::Tcp(p) => network == NetworkType::Tcp && port == *p,
            PortRule::Udp(p) => network == NetworkType::Udp && port == *p,
            PortRule::All(p) => port == *p,
            PortRule::Range(lo, hi) => (*lo..=*hi).contains(&port),
            PortRule::AnyTcp => network == NetworkType::Tcp,
            PortRule::AnyUdp => network == NetworkType::Udp,
        }
    }
}

impl FromStr for PortRule {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Self::AnyTcp),
            "udp" => Ok(Self::AnyUdp),
            s => {
                if let Some(p) = s.strip_suffix("/tcp") {
                    p.parse::<u16>().map(Self::Tcp).map_err(|_| ())
                } else if let Some(p) = s.strip_suffix("/udp") {
                    p.parse::<u16>().map(Self::Udp).map_err(|_| ())
                } else if let Some((lo, hi)) = s.split_once('-') {
                    let lo = lo.trim().parse::<u16>().map_err(|_| ())?;
                    let hi = hi.trim().parse::<u16>().map_err(|_| ())?;
                    if lo > hi {
                        return Err(());
                    }
                    Ok(Self::Range(lo, hi))
                } else {
                    s.parse::<u16>().map(Self::All).map_err(|_| ())
                }
            }
        }
    }
}

impl Display for PortRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PortRule::Tcp(p) => write!(f, "{}/tcp", p),
            PortRule::Udp(p) => write!(f, "{}/udp", p),
            PortRule::All(p) => write!(f, "{}", p),
            PortRule::Range(lo, hi) => write!(f, "{}-{}", lo, hi),
            PortRule::AnyTcp => f.write_str("tcp"),
            PortRule::AnyUdp => f.write_str("udp"),
        }
    }
}

#[derive(Clone)]
pub enum RuleImpl {
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    IpCidr(IpNet),
    SrcIpCidr(IpNet),
    SrcPort(PortRule),
    DstPort(PortRule),
    ProcessName(String),
    Network(NetworkType),
    /// Country code as written; `LAN` needs no database.
    GeoIp(Option<Arc<MmdbReader>>, String),
    GeoSite(Arc<GeoSiteDb>, String),
    RuleSet(Arc<RuleSetProvider>),
    Match,
    And(Vec<RuleImpl>),
    Or(Vec<RuleImpl>),
    Not(Box<RuleImpl>),
}

fn domain_suffix_matches(domain_name: &str, suffix: &str) -> bool {
    let domain_name = domain_name.trim_end_matches('.');
    if domain_name.len() == suffix.len() {
        domain_name.eq_ignore_ascii_case(suffix)
    } else {
        domain_name.len() > suffix.len()
            && domain_name.as_bytes()[domain_name.len() - suffix.len() - 1] == b'.'
            && domain_name[domain_name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    }
}

impl RuleImpl {
    pub fn matches(&self, info: &ConnInfo) -> bool {
        match &self {
            RuleImpl::Domain(d) => {
                if let NetworkAddr::DomainName { domain_name, .. } = &info.dst {
                    domain_name.trim_end_matches('.').eq_ignore_ascii_case(d)
                } else {
                    false
                }
            }
            RuleImpl::DomainSuffix(d) => {
                if let NetworkAddr::DomainName { domain_name, .. } = &info.dst {
                    domain_suffix_matches(domain_name, d)
                } else {
                    false
                }
            }
            RuleImpl::DomainKeyword(kw) => {
                if let NetworkAddr::DomainName { domain_name, .. } = &info.dst {
                    domain_name.to_ascii_lowercase().contains(kw.as_str())
                } else {
                    false
                }
            }
            RuleImpl::IpCidr(net) => info.dst_ip().is_some_and(|ip| net.contains(&ip)),
            RuleImpl::SrcIpCidr(net) => net.contains(&info.src.ip()),
            RuleImpl::SrcPort(port) => port.matches(info.src.port(), info.connection_type),
            RuleImpl::DstPort(port) => port.matches(info.dst.port(), info.connection_type),
            RuleImpl::ProcessName(proc) => info
                .process_info
                .as_ref()
                .is_some_and(|proc_info| proc_info.name == *proc),
            RuleImpl::Network(net) => info.connection_type == *net,
            RuleImpl::GeoIp(mmdb, country) => info.dst_ip().is_some_and(|ip| {
                if country == "LAN" {
                    is_lan(ip)
                } else {
                    mmdb.as_ref()
                        .and_then(|m| m.search_country(ip))
                        .is_some_and(|c| c.eq_ignore_ascii_case(country))
                }
            }),
            RuleImpl::GeoSite(db, category) => info
                .dst
                .domain_name()
                .is_some_and(|dn| db.matches(category, dn)),
            RuleImpl::RuleSet(rs) => rs.matches(info),
            RuleImpl::Match => true,
            RuleImpl::And(subs) => subs.iter().all(|r| r.matches(info)),
            RuleImpl::Or(subs) => subs.iter().any(|r| r.matches(info)),
            RuleImpl::Not(r) => !r.matches(info),
        }
    }

    /// Whether matching depends on the destination IP.
    pub fn should_resolve_ip(&self) -> bool {
        match self {
            RuleImpl::IpCidr(_) | RuleImpl::GeoIp(..) => true,
            RuleImpl::RuleSet(rs) => rs.should_resolve_ip(),
            RuleImpl::And(subs) | RuleImpl::Or(subs) => subs.iter().any(|r| r.should_resolve_ip()),
            RuleImpl::Not(r) => r.should_resolve_ip(),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RuleImpl::Domain(_) => "DOMAIN",
            RuleImpl::DomainSuffix(_) => "DOMAIN-SUFFIX",
            RuleImpl::DomainKeyword(_) => "DOMAIN-KEYWORD",
            RuleImpl::IpCidr(IpNet::V4(_)) => "IP-CIDR",
            RuleImpl::IpCidr(IpNet::V6(_)) => "IP-CIDR6",
            RuleImpl::SrcIpCidr(_) => "SRC-IP-CIDR",
            RuleImpl::SrcPort(_) => "SRC-PORT",
            RuleImpl::DstPort(_) => "DST-PORT",
            RuleImpl::ProcessName(_) => "PROCESS-NAME",
            RuleImpl::Network(_) => "NETWORK",
            RuleImpl::GeoIp(..) => "GEOIP",
            RuleImpl::GeoSite(..) => "GEOSITE",
            RuleImpl::RuleSet(_) => "RULE-SET",
            RuleImpl::Match => "MATCH",
            RuleImpl::And(_) => "AND",
            RuleImpl::Or(_) => "OR",
            RuleImpl::Not(_) => "NOT",
        }
    }

    /// Parse a non-logic rule from its kind and payload.
    pub fn parse(
        kind: &str,
        payload: &str,
        geo: &GeoDatabases,
        rulesets: Option<&LinkedHashMap<String, Arc<RuleSetProvider>>>,
    ) -> Result<RuleImpl, RuleError> {
        let payload = payload.trim();
        let kind = kind.trim().to_uppercase();
        let bad = |kind: &'static str, reason: &str| RuleError::BadPayload {
            kind,
            reason: format!("{}: {}", reason, payload),
        };
        Ok(match kind.as_str() {
            "DOMAIN" => RuleImpl::Domain(payload.to_ascii_lowercase()),
            "DOMAIN-SUFFIX" => {
                RuleImpl::DomainSuffix(payload.trim_start_matches('.').to_ascii_lowercase())
            }
            "DOMAIN-KEYWORD" => RuleImpl::DomainKeyword(payload.to_ascii_lowercase()),
            "IP-CIDR" | "IP-CIDR6" => RuleImpl::IpCidr(parse_cidr(payload).ok_or_else(|| {
                bad("IP-CIDR", "not a CIDR")
            })?),
            "SRC-IP-CIDR" => RuleImpl::SrcIpCidr(
                parse_cidr(payload).ok_or_else(|| bad("SRC-IP-CIDR", "not a CIDR"))?,
            ),
            "SRC-PORT" => RuleImpl::SrcPort(
                PortRule::from_str(payload).map_err(|_| bad("SRC-PORT", "not a port"))?,
            ),
            "DST-PORT" => RuleImpl::DstPort(
                PortRule::from_str(payload).map_err(|_| bad("DST-PORT", "not a port"))?,
            ),
            "PROCESS-NAME" => RuleImpl::ProcessName(payload.to_string()),
            "NETWORK" => RuleImpl::Network(NetworkType::from_str(payload).map_err(|_| {
                bad("NETWORK", "unsupported network type, only TCP/UDP")
            })?),
            "GEOIP" => {
                let country = payload.to_uppercase();
                if country == "LAN" {
                    RuleImpl::GeoIp(None, country)
                } else {
                    let mmdb = geo.mmdb.clone().ok_or(RuleError::MissingDatabase("GEOIP"))?;
                    RuleImpl::GeoIp(Some(mmdb), country)
                }
            }
            "GEOSITE" => {
                let db = geo
                    .geosite
                    .clone()
                    .ok_or(RuleError::MissingDatabase("GEOSITE"))?;
                if !db.has_category(payload) {
                    return Err(bad("GEOSITE", "unknown category"));
                }
                RuleImpl::GeoSite(db, payload.to_ascii_lowercase())
            }
            "RULE-SET" => {
                let Some(rulesets) = rulesets else {
                    return Err(RuleError::Invalid(format!(
                        "RULE-SET,{} is not allowed here",
                        payload
                    )));
                };
                RuleImpl::RuleSet(
                    rulesets
                        .get(payload)
                        .cloned()
                        .ok_or_else(|| RuleError::MissingRuleSet(payload.to_string()))?,
                )
            }
            _ => return Err(RuleError::UnknownKind(kind.clone())),
        })
    }

    /// Parse one `KIND,PAYLOAD[,no-resolve]` entry of a classical rule set.
    pub fn parse_classical(line: &str, geo: &GeoDatabases) -> Result<RuleImpl, RuleError> {
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        let parts = match parts.last() {
            Some(&"no-resolve") => &parts[..parts.len() - 1],
            _ => &parts[..],
        };
        if parts.first().is_some_and(|k| is_logic(k)) {
            let list = parse_flow(line)?;
            return parse_sub_rule(&list, geo, None);
        }
        match parts {
            [kind, payload] => RuleImpl::parse(kind, payload, geo, None),
            _ => Err(RuleError::Invalid(line.to_string())),
        }
    }
}

impl Display for RuleImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = self.kind();
        match self {
            RuleImpl::Domain(s)
            | RuleImpl::DomainSuffix(s)
            | RuleImpl::DomainKeyword(s)
            | RuleImpl::ProcessName(s) => write!(f, "{},{}", kind, s),
            RuleImpl::IpCidr(net) | RuleImpl::SrcIpCidr(net) => write!(f, "{},{}", kind, net),
            RuleImpl::SrcPort(p) | RuleImpl::DstPort(p) => write!(f, "{},{}", kind, p),
            RuleImpl::Network(n) => write!(f, "{},{}", kind, n),
            RuleImpl::GeoIp(_, c) => write!(f, "{},{}", kind, c),
            RuleImpl::GeoSite(_, c) => write!(f, "{},{}", kind, c),
            RuleImpl::RuleSet(rs) => write!(f, "{},{}", kind, rs.name()),
            RuleImpl::Match => f.write_str(kind),
            RuleImpl::And(subs) | RuleImpl::Or(subs) => {
                f.write_str(kind)?;
                for sub in subs {
                    write!(f, ",[{}]", sub)?;
                }
                Ok(())
            }
            RuleImpl::Not(sub) => write!(f, "{},[{}]", kind, sub),
        }
    }
}

impl Debug for RuleImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

fn parse_cidr(s: &str) -> Option<IpNet> {
    s.parse::<IpNet>()
        .ok()
        .or_else(|| s.parse::<IpAddr>().ok().map(IpNet::from))
}

fn is_logic(kind: &str) -> bool {
    matches!(kind.to_uppercase().as_str(), "AND" | "OR" | "NOT")
}

fn parse_flow(s: &str) -> Result<serde_yaml::Sequence, RuleError> {
    let processed_str = "[".to_string() + s + "]";
    serde_yaml::from_str(processed_str.as_str())
        .map_err(|e| RuleError::Invalid(format!("{}: {}", s, e)))
}

fn retrive_string(val: &serde_yaml::Value) -> Result<String, RuleError> {
    match val {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(RuleError::Invalid(format!("{:?} is not a valid string", val))),
    }
}

fn parse_sub_rule(
    list: &[serde_yaml::Value],
    geo: &GeoDatabases,
    rulesets: Option<&LinkedHashMap<String, Arc<RuleSetProvider>>>,
) -> Result<RuleImpl, RuleError> {
    let Some(first) = list.first() else {
        return Err(RuleError::Invalid("empty sub-rule".to_string()));
    };
    let prefix = retrive_string(first)?.to_uppercase();
    match prefix.as_str() {
        "AND" | "OR" => {
            if list.len() < 3 {
                return Err(RuleError::Invalid(format!(
                    "{} needs at least two sub-rules",
                    prefix
                )));
            }
            let mut subs = vec![];
            for val in list[1..].iter() {
                let serde_yaml::Value::Sequence(seq) = val else {
                    return Err(RuleError::Invalid(format!("invalid {} operand", prefix)));
                };
                subs.push(parse_sub_rule(seq, geo, rulesets)?);
            }
            if prefix == "AND" {
                Ok(RuleImpl::And(subs))
            } else {
                Ok(RuleImpl::Or(subs))
            }
        }
        "NOT" => match list {
            [_, serde_yaml::Value::Sequence(seq)] => {
                Ok(RuleImpl::Not(Box::new(parse_sub_rule(seq, geo, rulesets)?)))
            }
            _ => Err(RuleError::Invalid("NOT takes exactly one sub-rule".to_string())),
        },
        _ => {
            let list = match list.last().map(retrive_string) {
                Some(Ok(s)) if s == "no-resolve" => &list[..list.len() - 1],
                _ => list,
            };
            match list {
                [_, payload] => RuleImpl::parse(&prefix, &retrive_string(payload)?, geo, rulesets),
                _ => Err(RuleError::Invalid(format!("invalid sub-rule {}", prefix))),
            }
        }
    }
}

/// A rule bound to the name of the outbound it routes to.
#[derive(Debug, Clone)]
pub struct Rule {
    rule: RuleImpl,
    target: String,
    no_resolve: bool,
}

impl Rule {
    pub fn new(rule: RuleImpl, target: String, no_resolve: bool) -> Self {
        Self {
            rule,
            target,
            no_resolve,
        }
    }

    pub fn matches(&self, info: &ConnInfo) -> bool {
        self.rule.matches(info)
    }

    pub fn target(&self) -> &str {
        self.target.as_str()
    }

    pub fn kind(&self) -> &'static str {
        self.rule.kind()
    }

    pub fn should_resolve_ip(&self) -> bool {
        !self.no_resolve && self.rule.should_resolve_ip()
    }

    /// Parse `KIND,PAYLOAD,TARGET[,no-resolve]`, `MATCH,TARGET` or a logic rule.
    /// The target is not checked against any proxy table.
    pub fn parse_literal(
        s: &str,
        geo: &GeoDatabases,
        rulesets: &LinkedHashMap<String, Arc<RuleSetProvider>>,
    ) -> Result<Rule, RuleError> {
        let parts: Vec<&str> = s.split(',').map(|p| p.trim()).collect();
        let Some(kind) = parts.first() else {
            return Err(RuleError::Invalid(s.to_string()));
        };
        if is_logic(kind) {
            let list = parse_flow(s)?;
            let (mut head, mut tail) = list.split_at(list.len().saturating_sub(1));
            let mut no_resolve = false;
            let mut target = tail.first().map(retrive_string).transpose()?;
            if target.as_deref() == Some("no-resolve") {
                no_resolve = true;
                (head, tail) = head.split_at(head.len().saturating_sub(1));
                target = tail.first().map(retrive_string).transpose()?;
            }
            let target = target.ok_or_else(|| RuleError::Invalid(s.to_string()))?;
            let rule = parse_sub_rule(head, geo, Some(rulesets))?;
            return Ok(Rule::new(rule, target, no_resolve));
        }
        let (parts, no_resolve) = match parts.last() {
            Some(&"no-resolve") => (&parts[..parts.len() - 1], true),
            _ => (&parts[..], false),
        };
        match parts {
            [kind, target] if kind.eq_ignore_ascii_case("MATCH") => {
                Ok(Rule::new(RuleImpl::Match, target.to_string(), no_resolve))
            }
            [kind, payload, target] => Ok(Rule::new(
                RuleImpl::parse(kind, payload, geo, Some(rulesets))?,
                target.to_string(),
                no_resolve,
            )),
            _ => Err(RuleError::Invalid(s.to_string())),
        }
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.rule, self.target)?;
        if self.no_resolve {
            f.write_str(",no-resolve")?;
        }
        Ok(())
    }
}

/// Collects rules, checking every target against a proxy table.
pub(crate) struct RuleBuilder<'a> {
    table: &'a ProxyTable,
    rulesets: &'a LinkedHashMap<String, Arc<RuleSetProvider>>,
    geo: &'a GeoDatabases,
    buffer: Vec<Rule>,
}

impl<'a> RuleBuilder<'a> {
    pub fn new(
        table: &'a ProxyTable,
        rulesets: &'a LinkedHashMap<String, Arc<RuleSetProvider>>,
        geo: &'a GeoDatabases,
    ) -> RuleBuilder<'a> {
        RuleBuilder {
            table,
            rulesets,
            geo,
            buffer: vec![],
        }
    }

    pub fn append_literal(&mut self, s: &str) -> Result<(), RuleError> {
        let rule = Rule::parse_literal(s, self.geo, self.rulesets)?;
        if !self.table.contains(rule.target()) {
            return Err(RuleError::UnknownTarget {
                rule: s.to_string(),
                target: rule.target().to_string(),
            });
        }
        self.buffer.push(rule);
        Ok(())
    }

    pub fn build(self) -> Vec<Rule> {
        self.buffer
    }
}
