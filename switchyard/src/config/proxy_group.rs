use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawGroupType {
    #[serde(rename = "select", alias = "selector")]
    Selector,
    #[serde(rename = "url-test")]
    UrlTest,
    #[serde(rename = "fallback")]
    Fallback,
    #[serde(rename = "load-balance")]
    LoadBalance,
    #[serde(rename = "relay")]
    Relay,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RawBalanceStrategy {
    #[default]
    #[serde(rename = "consistent-hashing")]
    ConsistentHashing,
    #[serde(rename = "round-robin")]
    RoundRobin,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RawHashKey {
    Src,
    #[default]
    Dst,
    Both,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RawProxyGroupCfg {
    #[serde(rename = "type")]
    pub group_type: RawGroupType,
    pub proxies: Option<Vec<String>>,
    #[serde(alias = "use")]
    pub providers: Option<Vec<String>>,
    pub url: Option<String>,
    /// Probe interval in seconds
    pub interval: Option<u64>,
    /// Milliseconds; url-test only
    pub tolerance: Option<u32>,
    pub filter: Option<String>,
    pub lazy: Option<bool>,
    pub strategy: Option<RawBalanceStrategy>,
    pub hash_key: Option<RawHashKey>,
}

impl RawProxyGroupCfg {
    pub fn roughly_validate(&self) -> bool {
        !(self.proxies.is_none() && self.providers.is_none())
    }

    pub fn requires_url(&self) -> bool {
        matches!(self.group_type, RawGroupType::UrlTest | RawGroupType::Fallback)
    }

    pub fn member_names(&self) -> impl Iterator<Item = &String> {
        self.proxies.iter().flatten()
    }
}

#[test]
fn test_group_config() {
    let text = "
type: load-balance
use: [sub-a, sub-b]
strategy: round-robin
hash_key: both
";
    let cfg: RawProxyGroupCfg = serde_yaml::from_str(text).unwrap();
    assert_eq!(cfg.group_type, RawGroupType::LoadBalance);
    assert_eq!(cfg.providers.as_ref().unwrap().len(), 2);
    assert_eq!(cfg.strategy, Some(RawBalanceStrategy::RoundRobin));
    assert!(cfg.roughly_validate());
    assert!(!cfg.requires_url());

    let cfg: RawProxyGroupCfg = serde_yaml::from_str("type: selector").unwrap();
    assert_eq!(cfg.group_type, RawGroupType::Selector);
    assert!(!cfg.roughly_validate());
    assert!(serde_yaml::from_str::<RawProxyGroupCfg>("type: best-effort").is_err());
}
