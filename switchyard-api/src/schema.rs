use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProxyData {
    pub name: String,
    pub proto: String,
    pub latency: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct GetGroupRespSchema {
    pub name: String,
    pub strategy: String,
    pub selected: String,
    pub list: Vec<ProxyData>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SetGroupReqSchema {
    pub group: String,
    pub selected: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProviderSchema {
    pub name: String,
    pub kind: String,
    pub vehicle: String,
    pub size: usize,
    /// Unix timestamp in seconds; None if never refreshed successfully.
    pub updated_at: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModeSchema {
    Rule,
    Global,
    Direct,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RouteRespSchema {
    pub proxy: String,
    pub chain: Vec<String>,
    pub target: String,
    pub rule: String,
}
