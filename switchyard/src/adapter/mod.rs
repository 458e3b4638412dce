mod http_probe;

use crate::dispatch::{NetworkAddr, Proxy};
use crate::proxy::error::TransportError;
use async_trait::async_trait;
pub use http_probe::*;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub(crate) server_addr: NetworkAddr,
    pub(crate) auth: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Config {
    pub(crate) server_addr: NetworkAddr,
    pub(crate) auth: Option<(String, String)>,
    pub(crate) udp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowSocksConfig {
    pub(crate) server_addr: NetworkAddr,
    pub(crate) password: String,
    pub(crate) cipher: String,
    pub(crate) udp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanConfig {
    pub(crate) server_addr: NetworkAddr,
    pub(crate) password: String,
    pub(crate) sni: String,
    pub(crate) skip_cert_verify: bool,
    pub(crate) udp: bool,
}

/// Measures the round trip of one request to `url` through `proxy`.
///
/// The health prober owns timeouts; implementations only report what the
/// transport did.
#[async_trait]
pub trait ProbeConnector: Send + Sync {
    async fn url_test(&self, proxy: &Proxy, url: &Url) -> Result<Duration, TransportError>;
}

/// Answers after a per-name delay; names absent from the table fail.
#[cfg(test)]
pub(crate) struct ScriptedConnector(pub std::collections::HashMap<String, Duration>);

#[cfg(test)]
#[async_trait]
impl ProbeConnector for ScriptedConnector {
    async fn url_test(&self, proxy: &Proxy, _url: &Url) -> Result<Duration, TransportError> {
        match self.0.get(proxy.name()) {
            Some(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(*delay)
            }
            None => Err(TransportError::Internal("unreachable")),
        }
    }
}

/// Answers every probe after 7ms and counts the calls.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CountingConnector(pub std::sync::atomic::AtomicUsize);

#[cfg(test)]
impl CountingConnector {
    pub fn calls(&self) -> usize {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
#[async_trait]
impl ProbeConnector for CountingConnector {
    async fn url_test(&self, _proxy: &Proxy, _url: &Url) -> Result<Duration, TransportError> {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(7)).await;
        Ok(Duration::from_millis(7))
    }
}
