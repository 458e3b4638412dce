use crate::config::{
    ConfigError, FileError, ProxyProvider, RawProxyGroupCfg, RawState, RuleProvider,
};
use linked_hash_map::LinkedHashMap;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Rule,
    Global,
    Direct,
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Rule => "rule",
            Mode::Global => "global",
            Mode::Direct => "direct",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawRootCfg {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub probe: RawProbeCfg,
    #[serde(default)]
    pub dns: RawDnsCfg,
    pub geoip_db: Option<String>,
    pub geosite_db: Option<String>,
    #[serde(default)]
    pub proxy_local: LinkedHashMap<String, RawProxyLocalCfg>,
    #[serde(default)]
    pub proxy_provider: LinkedHashMap<String, ProxyProvider>,
    #[serde(default)]
    pub proxy_group: LinkedHashMap<String, RawProxyGroupCfg>,
    #[serde(default)]
    pub rule_provider: LinkedHashMap<String, RuleProvider>,
    #[serde(default)]
    pub rule_local: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawProbeCfg {
    /// Per-probe timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,
    /// Timeout of a single provider fetch in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    /// Used for on-demand latency tests of groups without their own url
    #[serde(default = "default_probe_url")]
    pub url: String,
}

impl Default for RawProbeCfg {
    fn default() -> Self {
        Self {
            timeout: default_probe_timeout(),
            concurrency: default_probe_concurrency(),
            fetch_timeout: default_fetch_timeout(),
            url: default_probe_url(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_probe_concurrency() -> usize {
    10
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_probe_url() -> String {
    "http://www.gstatic.com/generate_204".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawDnsCfg {
    /// Empty means the system resolver configuration
    #[serde(default)]
    pub nameserver: Vec<SocketAddr>,
    #[serde(default)]
    pub hosts: HashMap<String, IpAddr>,
    /// Per-lookup timeout in milliseconds
    #[serde(default = "default_dns_timeout")]
    pub timeout: u64,
}

impl Default for RawDnsCfg {
    fn default() -> Self {
        Self {
            nameserver: vec![],
            hosts: HashMap::new(),
            timeout: default_dns_timeout(),
        }
    }
}

fn default_dns_timeout() -> u64 {
    3000
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum RawServerAddr {
    IpAddr(IpAddr),
    DomainName(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum RawProxyLocalCfg {
    #[serde(alias = "http")]
    Http {
        server: RawServerAddr,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
    #[serde(alias = "socks5")]
    Socks5 {
        server: RawServerAddr,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        #[serde(default = "default_true")]
        udp: bool,
    },
    #[serde(alias = "ss")]
    Shadowsocks {
        server: RawServerAddr,
        port: u16,
        password: String,
        cipher: String,
        #[serde(default = "default_true")]
        udp: bool,
    },
    #[serde(alias = "trojan")]
    Trojan {
        server: RawServerAddr,
        port: u16,
        password: String,
        sni: Option<String>,
        #[serde(default = "default_false")]
        skip_cert_verify: bool,
        #[serde(default = "default_true")]
        udp: bool,
    },
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

/// Everything needed to build one routing generation.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: RawRootCfg,
    pub state: RawState,
    pub config_dir: PathBuf,
}

impl LoadedConfig {
    pub fn config_file(config_dir: &Path) -> PathBuf {
        config_dir.join("config.yml")
    }

    pub fn state_path(data_dir: &Path) -> PathBuf {
        data_dir.join("state.yml")
    }

    pub fn load_config(config_dir: &Path, data_dir: &Path) -> Result<Self, ConfigError> {
        let config = Self::load_root(config_dir)?;
        let state_path = Self::state_path(data_dir);
        let state = if state_path.try_exists().is_ok_and(|x| x) {
            let text = read_to_string(&state_path)?;
            serde_yaml::from_str(text.as_str())
                .map_err(|e| FileError::Serde(state_path.to_string_lossy().to_string(), e))?
        } else {
            tracing::debug!("No state file at {}, using empty state", state_path.display());
            RawState::default()
        };
        Ok(Self {
            config,
            state,
            config_dir: config_dir.to_path_buf(),
        })
    }

    pub fn load_root(config_dir: &Path) -> Result<RawRootCfg, ConfigError> {
        let path = Self::config_file(config_dir);
        let text = read_to_string(&path)?;
        if text.trim().is_empty() {
            return Err(ConfigError::Internal("configuration file is empty"));
        }
        let config: RawRootCfg = serde_yaml::from_str(text.as_str())
            .map_err(|e| FileError::Serde(path.to_string_lossy().to_string(), e))?;
        Ok(config)
    }
}

fn read_to_string(path: &Path) -> Result<String, FileError> {
    std::fs::read_to_string(path).map_err(|e| FileError::Io(path.to_string_lossy().to_string(), e))
}

#[test]
fn test_root_config() {
    let config = r#"
mode: rule
probe:
  timeout: 3000
dns:
  nameserver: [1.1.1.1:53]
  hosts:
    router.lan: 192.168.1.1
proxy_local:
  hk-01:
    type: socks5
    server: 10.0.0.1
    port: 1080
  jp-01:
    type: ss
    server: jp.example.com
    port: 8388
    password: secret
    cipher: aes-256-gcm
proxy_provider:
  sub:
    vehicle: http
    url: https://example.com/sub.yml
    path: providers/sub.yml
    interval: 3600
proxy_group:
  auto:
    type: url-test
    proxies: [hk-01, jp-01]
    providers: [sub]
    url: http://www.gstatic.com/generate_204
    interval: 300
    tolerance: 50
rule_local:
  - DOMAIN-SUFFIX,google.com,auto
  - MATCH,DIRECT
"#;
    let cfg: RawRootCfg = serde_yaml::from_str(config).unwrap();
    assert_eq!(cfg.mode, Mode::Rule);
    assert_eq!(cfg.probe.timeout, 3000);
    assert_eq!(cfg.probe.concurrency, 10);
    assert_eq!(cfg.dns.nameserver.len(), 1);
    assert_eq!(cfg.dns.timeout, 3000);
    assert_eq!(cfg.proxy_local.keys().next().unwrap(), "hk-01");
    assert!(matches!(
        cfg.proxy_local.get("jp-01").unwrap(),
        RawProxyLocalCfg::Shadowsocks { server: RawServerAddr::DomainName(_), .. }
    ));
    assert_eq!(cfg.rule_local.len(), 2);
    assert!(serde_yaml::from_str::<RawRootCfg>("unknown_field: 1").is_err());
}
