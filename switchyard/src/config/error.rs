use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File error: {0}")]
    File(#[from] FileError),
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

#[derive(Error, Debug)]
pub enum FileError {
    #[error("{0} io error: {1}")]
    Io(String, std::io::Error),
    #[error("{0} deserialization error: {1}")]
    Serde(String, serde_yaml::Error),
    #[error("{0} http error: {1}")]
    Http(String, reqwest::Error),
    #[error("{0} escapes the configuration directory")]
    OutOfScope(String),
    #[error("Env variable error: {0}")]
    Env(#[from] std::env::VarError),
}

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Invalid rule: {0}")]
    Invalid(String),
    #[error("Unsupported rule kind: {0}")]
    UnknownKind(String),
    #[error("Invalid payload for {kind}: {reason}")]
    BadPayload { kind: &'static str, reason: String },
    #[error("Rule {rule} points to unknown target {target}")]
    UnknownTarget { rule: String, target: String },
    #[error("Rule provider not found: {0}")]
    MissingRuleSet(String),
    #[error("{0} rules require a database, but none is configured")]
    MissingDatabase(&'static str),
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Missing provider: {0}")]
    Missing(String),
    #[error("Invalid provider: {0}")]
    Invalid(String),
    #[error("Group {0} has bad filter: {1}")]
    BadFilter(String, String),
    #[error("Provider {0} fetch failed: {1}")]
    Fetch(String, FileError),
    #[error("Provider {0} fetch timed out")]
    Timeout(String),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Duplicate group name: {0}")]
    DuplicateGroup(String),
    #[error("Duplicate proxy name: {0}")]
    DuplicateProxy(String),
    #[error("Missing group: {0}")]
    MissingGroup(String),
    #[error("Invalid proxy: {0}")]
    Invalid(String),
    #[error("Invalid Shadowsocks cipher {0} in proxy {1}")]
    ShadowsocksCipher(String, String),
    #[error("Proxy {0} error: {1}")]
    ProxyFieldError(String, &'static str),
    #[error("Unknown proxy {proxy} in group {group}")]
    UnknownProxyInGroup { proxy: String, group: String },
    #[error("Group {0} requires a probe url")]
    MissingUrl(String),
    #[error("Group {0} has neither proxies nor providers")]
    EmptyGroup(String),
    #[error("Groups form a cycle: {0}")]
    Cycle(String),
}
