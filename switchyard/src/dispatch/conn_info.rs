use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Tcp,
    Udp,
}

impl FromStr for NetworkType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            _ => Err(()),
        }
    }
}

impl Display for NetworkType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NetworkType::Tcp => "TCP",
            NetworkType::Udp => "UDP",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkAddr {
    Raw(SocketAddr),
    DomainName { domain_name: String, port: u16 },
}

impl NetworkAddr {
    pub fn port(&self) -> u16 {
        match self {
            NetworkAddr::Raw(addr) => addr.port(),
            NetworkAddr::DomainName { port, .. } => *port,
        }
    }

    pub fn domain_name(&self) -> Option<&str> {
        match self {
            NetworkAddr::Raw(_) => None,
            NetworkAddr::DomainName { domain_name, .. } => Some(domain_name.as_str()),
        }
    }

    /// Parse `host:port`, keeping the host as a domain when it is not an IP literal.
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Some(NetworkAddr::Raw(addr));
        }
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(NetworkAddr::DomainName {
            domain_name: host.to_string(),
            port,
        })
    }
}

impl Display for NetworkAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkAddr::Raw(addr) => write!(f, "{}", addr),
            NetworkAddr::DomainName { domain_name, port } => write!(f, "{}:{}", domain_name, port),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ProcessInfo {
    pub name: String,
    pub path: String,
}

/// Metadata of one connection, as seen by the rule engine.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub src: SocketAddr,
    pub dst: NetworkAddr,
    /// Filled at most once, by the first rule that asks for an IP.
    pub resolved_dst: Option<SocketAddr>,
    pub connection_type: NetworkType,
    pub process_info: Option<ProcessInfo>,
}

impl ConnInfo {
    pub fn new(src: SocketAddr, dst: NetworkAddr, connection_type: NetworkType) -> Self {
        Self {
            src,
            dst,
            resolved_dst: None,
            connection_type,
            process_info: None,
        }
    }

    pub fn with_process(mut self, name: &str) -> Self {
        self.process_info = Some(ProcessInfo {
            name: name.to_string(),
            path: String::new(),
        });
        self
    }

    /// Destination socket address, either literal or resolved.
    pub fn socketaddr(&self) -> Option<SocketAddr> {
        match &self.dst {
            NetworkAddr::Raw(addr) => Some(*addr),
            NetworkAddr::DomainName { .. } => self.resolved_dst,
        }
    }

    pub fn dst_ip(&self) -> Option<IpAddr> {
        self.socketaddr().map(|s| s.ip())
    }

    pub fn needs_resolution(&self) -> bool {
        matches!(self.dst, NetworkAddr::DomainName { .. }) && self.resolved_dst.is_none()
    }
}

#[test]
fn test_parse_network_addr() {
    assert_eq!(
        NetworkAddr::parse("1.1.1.1:53"),
        Some(NetworkAddr::Raw("1.1.1.1:53".parse().unwrap()))
    );
    assert_eq!(
        NetworkAddr::parse("[::1]:443").map(|a| a.port()),
        Some(443)
    );
    assert_eq!(
        NetworkAddr::parse("www.example.com:443"),
        Some(NetworkAddr::DomainName {
            domain_name: "www.example.com".to_string(),
            port: 443
        })
    );
    assert!(NetworkAddr::parse("example.com").is_none());
    assert!(NetworkAddr::parse(":80").is_none());
    assert_eq!("tcp".parse::<NetworkType>(), Ok(NetworkType::Tcp));
    assert!("icmp".parse::<NetworkType>().is_err());
}
