use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "vehicle")]
// not deny_unknown_fields, in order to achieve compatibility
pub enum RuleLocation {
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
    Inline { payload: Vec<String> },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RuleProvider {
    #[serde(default = "default_classical")]
    pub behavior: ProviderBehavior,
    #[serde(flatten)]
    pub location: RuleLocation,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderBehavior {
    #[serde(alias = "domain")]
    Domain,
    #[serde(alias = "ipcidr")]
    IpCidr,
    #[serde(alias = "classical")]
    Classical,
}

fn default_classical() -> ProviderBehavior {
    ProviderBehavior::Classical
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawRuleSchema {
    pub payload: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuleSchema {
    pub behavior: ProviderBehavior,
    pub payload: Vec<String>,
}

#[test]
fn test_rule_provider_config() {
    let text = "
behavior: domain
vehicle: inline
payload:
  - +.google.com
  - github.com
";
    let provider: RuleProvider = serde_yaml::from_str(text).unwrap();
    assert_eq!(provider.behavior, ProviderBehavior::Domain);
    assert!(matches!(provider.location, RuleLocation::Inline { ref payload } if payload.len() == 2));

    let provider: RuleProvider = serde_yaml::from_str("vehicle: file\npath: rules/ads.yml").unwrap();
    assert_eq!(provider.behavior, ProviderBehavior::Classical);
}
