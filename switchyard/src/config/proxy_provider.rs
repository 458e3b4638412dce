use crate::config::RawProxyLocalCfg;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "vehicle")]
// not deny_unknown_fields, in order to achieve compatibility
pub enum ProxyLocation {
    #[serde(alias = "file")]
    File {
        path: String,
        #[serde(default)]
        interval: u64,
    },
    #[serde(alias = "http")]
    Http {
        url: String,
        path: String,
        #[serde(default)]
        interval: u64,
    },
    #[serde(alias = "inline")]
    Inline { proxies: Vec<RawProxyProviderCfg> },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxyProvider {
    #[serde(flatten)]
    pub location: ProxyLocation,
    pub health_check: Option<RawHealthCheckCfg>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawHealthCheckCfg {
    #[serde(default)]
    pub enable: bool,
    pub url: String,
    /// Seconds between two probe rounds
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_lazy")]
    pub lazy: bool,
}

fn default_health_interval() -> u64 {
    300
}

fn default_lazy() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RawProxyProviderCfg {
    pub name: String,
    #[serde(flatten)]
    pub cfg: RawProxyLocalCfg,
}

impl RawProxyProviderCfg {
    pub fn get_name(&self) -> &String {
        &self.name
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProxySchema {
    pub proxies: Vec<RawProxyProviderCfg>,
}

#[test]
fn test_proxy_provider_config() {
    let text = "
vehicle: http
url: https://example.com/sub
path: cache/sub.yml
interval: 600
health_check:
  enable: true
  url: http://www.gstatic.com/generate_204
";
    let provider: ProxyProvider = serde_yaml::from_str(text).unwrap();
    assert!(matches!(
        provider.location,
        ProxyLocation::Http { interval: 600, .. }
    ));
    let hc = provider.health_check.unwrap();
    assert!(hc.enable && hc.lazy);
    assert_eq!(hc.interval, 300);

    let schema = "
proxies:
  - name: us-01
    type: http
    server: 1.2.3.4
    port: 3128
";
    let schema: ProxySchema = serde_yaml::from_str(schema).unwrap();
    assert_eq!(schema.proxies[0].get_name(), "us-01");
}
