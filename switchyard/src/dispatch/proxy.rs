use crate::adapter::{HttpConfig, ShadowSocksConfig, Socks5Config, TrojanConfig};
use crate::config::{ProxyError, RawProxyLocalCfg, RawServerAddr};
use crate::dispatch::{NetworkAddr, ProxyGroup};
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SHADOWSOCKS_CIPHERS: [&str; 3] = ["chacha20-ietf-poly1305", "aes-256-gcm", "aes-128-gcm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Latency {
    Unknown,
    Value(u32),
    Failed,
}

impl Latency {
    const UNKNOWN_BITS: u64 = u64::MAX;
    const FAILED_BITS: u64 = u64::MAX - 1;

    fn to_bits(self) -> u64 {
        match self {
            Latency::Unknown => Self::UNKNOWN_BITS,
            Latency::Failed => Self::FAILED_BITS,
            Latency::Value(ms) => ms as u64,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits {
            Self::UNKNOWN_BITS => Latency::Unknown,
            Self::FAILED_BITS => Latency::Failed,
            ms => Latency::Value(ms as u32),
        }
    }
}

impl Display for Latency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Latency::Unknown => f.write_str("-"),
            Latency::Value(ms) => write!(f, "{}ms", ms),
            Latency::Failed => f.write_str("failed"),
        }
    }
}

/// Single proxy configuation.
#[derive(Debug)]
pub struct Proxy {
    name: String,
    detail: Arc<ProxyImpl>,
    /// Mirror of the last probe result, for display only.
    latency: AtomicU64,
}

impl Proxy {
    pub fn new<S: Into<String>>(name: S, detail: ProxyImpl) -> Self {
        Self {
            name: name.into(),
            detail: Arc::new(detail),
            latency: AtomicU64::new(Latency::Unknown.to_bits()),
        }
    }

    pub fn get_name(&self) -> String {
        self.name.clone()
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn get_impl(&self) -> Arc<ProxyImpl> {
        self.detail.clone()
    }

    pub fn get_latency(&self) -> Latency {
        Latency::from_bits(self.latency.load(Ordering::Relaxed))
    }

    pub fn set_latency(&self, latency: Latency) {
        self.latency.store(latency.to_bits(), Ordering::Relaxed);
    }
}

/// Descriptor of a concrete outbound; carries no connection logic.
#[derive(Debug, PartialEq, Eq)]
pub enum ProxyImpl {
    Direct,
    Reject,
    Http(HttpConfig),
    Socks5(Socks5Config),
    Shadowsocks(ShadowSocksConfig),
    Trojan(TrojanConfig),
}

impl ProxyImpl {
    pub fn support_udp(&self) -> bool {
        match self {
            ProxyImpl::Direct => true,
            ProxyImpl::Reject => true,
            ProxyImpl::Http(_) => false,
            ProxyImpl::Socks5(c) => c.udp,
            ProxyImpl::Shadowsocks(c) => c.udp,
            ProxyImpl::Trojan(c) => c.udp,
        }
    }

    pub fn simple_description(&self) -> String {
        match self {
            ProxyImpl::Direct => "direct",
            ProxyImpl::Reject => "reject",
            ProxyImpl::Http(_) => "http",
            ProxyImpl::Socks5(_) => "socks5",
            ProxyImpl::Shadowsocks(_) => "shadowsocks",
            ProxyImpl::Trojan(_) => "trojan",
        }
        .to_string()
    }
}

fn server_addr(server: &RawServerAddr, port: u16) -> NetworkAddr {
    match server {
        RawServerAddr::IpAddr(ip) => NetworkAddr::Raw(SocketAddr::new(*ip, port)),
        RawServerAddr::DomainName(dn) => NetworkAddr::DomainName {
            domain_name: dn.clone(),
            port,
        },
    }
}

fn auth(
    name: &str,
    username: &Option<String>,
    password: &Option<String>,
) -> Result<Option<(String, String)>, ProxyError> {
    match (username, password) {
        (Some(u), Some(p)) => Ok(Some((u.clone(), p.clone()))),
        (None, None) => Ok(None),
        _ => Err(ProxyError::ProxyFieldError(
            name.to_string(),
            "username and password must be set together",
        )),
    }
}

/// Validate one proxy definition and turn it into a descriptor.
pub fn build_proxy(name: &str, cfg: &RawProxyLocalCfg) -> Result<Arc<Proxy>, ProxyError> {
    let detail = match cfg {
        RawProxyLocalCfg::Http {
            server,
            port,
            username,
            password,
        } => ProxyImpl::Http(HttpConfig {
            server_addr: server_addr(server, *port),
            auth: auth(name, username, password)?,
        }),
        RawProxyLocalCfg::Socks5 {
            server,
            port,
            username,
            password,
            udp,
        } => ProxyImpl::Socks5(Socks5Config {
            server_addr: server_addr(server, *port),
            auth: auth(name, username, password)?,
            udp: *udp,
        }),
        RawProxyLocalCfg::Shadowsocks {
            server,
            port,
            password,
            cipher,
            udp,
        } => {
            let cipher = cipher.to_lowercase();
            if !SHADOWSOCKS_CIPHERS.contains(&cipher.as_str()) {
                return Err(ProxyError::ShadowsocksCipher(cipher, name.to_string()));
            }
            ProxyImpl::Shadowsocks(ShadowSocksConfig {
                server_addr: server_addr(server, *port),
                password: password.clone(),
                cipher,
                udp: *udp,
            })
        }
        RawProxyLocalCfg::Trojan {
            server,
            port,
            password,
            sni,
            skip_cert_verify,
            udp,
        } => {
            let sni = match (sni, server) {
                (Some(sni), _) => sni.clone(),
                (None, RawServerAddr::DomainName(dn)) => dn.clone(),
                (None, RawServerAddr::IpAddr(_)) => {
                    return Err(ProxyError::ProxyFieldError(
                        name.to_string(),
                        "sni is required when server is an IP address",
                    ))
                }
            };
            ProxyImpl::Trojan(TrojanConfig {
                server_addr: server_addr(server, *port),
                password: password.clone(),
                sni,
                skip_cert_verify: *skip_cert_verify,
                udp: *udp,
            })
        }
    };
    Ok(Arc::new(Proxy::new(name, detail)))
}

#[derive(Debug, Clone)]
pub enum GeneralProxy {
    Single(Arc<Proxy>),
    Group(Arc<ProxyGroup>),
}

impl GeneralProxy {
    pub fn name(&self) -> &str {
        match self {
            GeneralProxy::Single(p) => p.name(),
            GeneralProxy::Group(g) => g.name(),
        }
    }

    pub fn proto(&self) -> String {
        match self {
            GeneralProxy::Single(p) => p.get_impl().simple_description(),
            GeneralProxy::Group(g) => g.strategy_name().to_string(),
        }
    }
}

impl Display for GeneralProxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneralProxy::Single(s) => f.write_str(s.name.as_str()),
            GeneralProxy::Group(g) => match g.current_name() {
                Some(sel) => write!(f, "{}<{}>", g.name(), sel),
                None => f.write_str(g.name()),
            },
        }
    }
}

impl PartialEq for GeneralProxy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (GeneralProxy::Single(s), GeneralProxy::Single(rhs)) => s.name == rhs.name,
            (GeneralProxy::Group(g), GeneralProxy::Group(rhs)) => g.name() == rhs.name(),
            _ => false,
        }
    }
}

#[test]
fn test_build_proxy() {
    let cfg: RawProxyLocalCfg = serde_yaml::from_str(
        "type: ss\nserver: 1.2.3.4\nport: 8388\npassword: pw\ncipher: AES-256-GCM",
    )
    .unwrap();
    let proxy = build_proxy("ss-01", &cfg).unwrap();
    assert_eq!(proxy.get_impl().simple_description(), "shadowsocks");
    assert!(proxy.get_impl().support_udp());

    let cfg: RawProxyLocalCfg = serde_yaml::from_str(
        "type: ss\nserver: 1.2.3.4\nport: 8388\npassword: pw\ncipher: rc4-md5",
    )
    .unwrap();
    assert!(matches!(
        build_proxy("ss-02", &cfg),
        Err(ProxyError::ShadowsocksCipher(..))
    ));

    let cfg: RawProxyLocalCfg =
        serde_yaml::from_str("type: http\nserver: proxy.lan\nport: 3128\nusername: u").unwrap();
    assert!(build_proxy("http-01", &cfg).is_err());

    let cfg: RawProxyLocalCfg =
        serde_yaml::from_str("type: trojan\nserver: 1.2.3.4\nport: 443\npassword: pw").unwrap();
    assert!(build_proxy("trojan-01", &cfg).is_err());
}

#[test]
fn test_latency_mirror() {
    let proxy = Proxy::new("DIRECT", ProxyImpl::Direct);
    assert_eq!(proxy.get_latency(), Latency::Unknown);
    proxy.set_latency(Latency::Value(42));
    assert_eq!(proxy.get_latency(), Latency::Value(42));
    proxy.set_latency(Latency::Failed);
    assert_eq!(proxy.get_latency(), Latency::Failed);
    assert_eq!(Latency::Value(42).to_string(), "42ms");
}
