use crate::adapter::ProbeConnector;
use crate::dispatch::{NetworkAddr, Proxy, ProxyImpl};
use crate::proxy::error::TransportError;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use url::Url;

/// Probes by issuing a HEAD request with reqwest, tunnelled through HTTP and
/// SOCKS5 proxies. Any HTTP response counts as reachable.
#[derive(Debug, Clone, Default)]
pub struct HttpProbeConnector;

impl HttpProbeConnector {
    pub fn new() -> Self {
        Self
    }

    fn client_for(&self, proxy: &ProxyImpl) -> Result<reqwest::Client, TransportError> {
        let builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();
        let builder = match proxy {
            ProxyImpl::Direct => builder,
            ProxyImpl::Reject => return Err(TransportError::Rejected),
            ProxyImpl::Http(cfg) => builder.proxy(reqwest::Proxy::all(proxy_url(
                "http",
                &cfg.server_addr,
                cfg.auth.as_ref(),
            )?)?),
            ProxyImpl::Socks5(cfg) => builder.proxy(reqwest::Proxy::all(proxy_url(
                "socks5h",
                &cfg.server_addr,
                cfg.auth.as_ref(),
            )?)?),
            ProxyImpl::Shadowsocks(_) => return Err(TransportError::Unsupported("shadowsocks")),
            ProxyImpl::Trojan(_) => return Err(TransportError::Unsupported("trojan")),
        };
        Ok(builder.build()?)
    }
}

fn proxy_url(
    scheme: &str,
    addr: &NetworkAddr,
    auth: Option<&(String, String)>,
) -> Result<Url, TransportError> {
    let host = match addr {
        NetworkAddr::Raw(s) if s.is_ipv6() => format!("[{}]", s.ip()),
        NetworkAddr::Raw(s) => s.ip().to_string(),
        NetworkAddr::DomainName { domain_name, .. } => domain_name.clone(),
    };
    let mut url = Url::parse(&format!("{}://{}:{}", scheme, host, addr.port()))
        .map_err(|_| TransportError::Internal("Invalid proxy address"))?;
    if let Some((user, pass)) = auth {
        url.set_username(user)
            .and_then(|_| url.set_password(Some(pass)))
            .map_err(|_| TransportError::Internal("Invalid proxy credentials"))?;
    }
    Ok(url)
}

#[async_trait]
impl ProbeConnector for HttpProbeConnector {
    async fn url_test(&self, proxy: &Proxy, url: &Url) -> Result<Duration, TransportError> {
        let client = self.client_for(proxy.get_impl().as_ref())?;
        let start = Instant::now();
        let resp = client.head(url.clone()).send().await?;
        let elapsed = start.elapsed();
        tracing::trace!(
            "Probe {} via {}: {} in {}ms",
            url,
            proxy.get_name(),
            resp.status(),
            elapsed.as_millis()
        );
        Ok(elapsed)
    }
}

#[test]
fn test_proxy_url() {
    let addr = NetworkAddr::DomainName {
        domain_name: "proxy.example.com".to_string(),
        port: 1080,
    };
    let auth = ("user".to_string(), "p@ss".to_string());
    let url = proxy_url("socks5h", &addr, Some(&auth)).unwrap();
    assert_eq!(url.scheme(), "socks5h");
    assert_eq!(url.username(), "user");
    assert_eq!(url.port(), Some(1080));
    let v6 = NetworkAddr::Raw("[2001:db8::1]:3128".parse().unwrap());
    let url = proxy_url("http", &v6, None).unwrap();
    assert_eq!(url.host_str(), Some("[2001:db8::1]"));
}

#[tokio::test]
async fn test_reject_never_probes() {
    let proxy = Proxy::new("REJECT", ProxyImpl::Reject);
    let url = Url::parse("http://127.0.0.1:9/").unwrap();
    let result = HttpProbeConnector::new().url_test(&proxy, &url).await;
    assert!(matches!(result, Err(TransportError::Rejected)));
}
