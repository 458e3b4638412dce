use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Connection rejected by policy")]
    Rejected,
    #[error("Probing through {0} proxies is not supported")]
    Unsupported(&'static str),
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,
    #[error("Probe failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug, Clone)]
pub enum DnsError {
    #[error("No record found for {0}")]
    NoRecord(String),
    #[error("Lookup for {0} timed out")]
    Timeout(String),
    #[error("Resolver error: {0}")]
    Resolver(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Group {0} not found")]
    GroupNotFound(String),
    #[error("Group {0} does not accept manual selection")]
    NotSelector(String),
    #[error("Proxy {proxy} is not a member of group {group}")]
    NotFound { group: String, proxy: String },
}
