use crate::config::{
    ConfigError, ProviderBehavior, ProviderError, RawRuleSchema, RuleLocation, RuleProvider,
    RuleSchema,
};
use crate::dispatch::ruleset::{RuleSet, RuleSetBuilder};
use crate::dispatch::ConnInfo;
use crate::external::GeoDatabases;
use crate::provider::{spawn_refresh, Provider, ProviderKind, TaskSet, Vehicle, VehicleFetcher};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct RuleSetProvider {
    name: String,
    behavior: ProviderBehavior,
    fetcher: VehicleFetcher,
    interval: Duration,
    ruleset: ArcSwap<RuleSet>,
    geo: GeoDatabases,
    tasks: TaskSet,
}

impl Debug for RuleSetProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RuleSetProvider({})", self.name)
    }
}

impl RuleSetProvider {
    pub fn from_config(
        name: &str,
        cfg: &RuleProvider,
        config_dir: &Path,
        fetch_timeout: Duration,
        geo: GeoDatabases,
    ) -> Result<Self, ConfigError> {
        let (vehicle, interval, ruleset) = match &cfg.location {
            RuleLocation::File { path, interval } => {
                (Vehicle::file(config_dir, path)?, *interval, RuleSet::empty())
            }
            RuleLocation::Http {
                url,
                path,
                interval,
            } => (Vehicle::http(config_dir, url, path)?, *interval, RuleSet::empty()),
            RuleLocation::Inline { payload } => {
                let schema = RuleSchema {
                    behavior: cfg.behavior,
                    payload: payload.clone(),
                };
                let ruleset = RuleSetBuilder::from_schema(name, &schema, &geo).build();
                (Vehicle::Inline, 0, ruleset)
            }
        };
        let fetcher = VehicleFetcher::new(name, vehicle, fetch_timeout);
        if matches!(fetcher.vehicle(), Vehicle::Inline) {
            fetcher.mark_updated();
        }
        Ok(Self {
            name: name.to_string(),
            behavior: cfg.behavior,
            fetcher,
            interval: Duration::from_secs(interval),
            ruleset: ArcSwap::new(Arc::new(ruleset)),
            geo,
            tasks: TaskSet::default(),
        })
    }

    pub fn matches(&self, info: &ConnInfo) -> bool {
        self.ruleset.load().matches(info)
    }

    /// Fixed by behavior so that a refresh never changes resolution needs.
    pub fn should_resolve_ip(&self) -> bool {
        self.behavior != ProviderBehavior::Domain
    }

    fn parse(&self, text: &str) -> Result<RuleSet, ProviderError> {
        let raw: RawRuleSchema = serde_yaml::from_str(text)
            .map_err(|e| ProviderError::Invalid(format!("{}: {}", self.name, e)))?;
        let schema = RuleSchema {
            behavior: self.behavior,
            payload: raw.payload,
        };
        Ok(RuleSetBuilder::from_schema(&self.name, &schema, &self.geo).build())
    }

    pub fn start(self: &Arc<Self>) {
        if self.tasks.is_running() {
            return;
        }
        if !self.interval.is_zero() && !matches!(self.fetcher.vehicle(), Vehicle::Inline) {
            self.tasks.push(spawn_refresh(self, self.interval));
        }
    }

    pub fn stop(&self) {
        self.tasks.abort_all();
    }
}

#[async_trait]
impl Provider for RuleSetProvider {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Rule
    }

    fn vehicle_type(&self) -> &'static str {
        self.fetcher.vehicle().type_name()
    }

    fn size(&self) -> usize {
        self.ruleset.load().len()
    }

    fn updated_at(&self) -> Option<u64> {
        self.fetcher.updated_at()
    }

    async fn initial(&self) -> Result<(), ProviderError> {
        if matches!(self.fetcher.vehicle(), Vehicle::Inline) {
            return Ok(());
        }
        let fetched = match self.fetcher.fetch().await {
            Ok(text) => self.parse(&text).map(|ruleset| (text, ruleset)),
            Err(e) => Err(e),
        };
        let (text, ruleset) = match fetched {
            Ok((text, ruleset)) => {
                self.fetcher.save_cache(&text).await;
                (text, ruleset)
            }
            Err(e) => {
                let Some(cached) = self.fetcher.read_cache().await else {
                    return Err(e);
                };
                tracing::warn!("Provider {} fetch failed, using cache: {}", self.name, e);
                let ruleset = self.parse(&cached)?;
                (cached, ruleset)
            }
        };
        self.ruleset.store(Arc::new(ruleset));
        self.fetcher.commit(&text);
        Ok(())
    }

    async fn update(&self) -> Result<bool, ProviderError> {
        if matches!(self.fetcher.vehicle(), Vehicle::Inline) {
            return Ok(false);
        }
        let text = self.fetcher.fetch().await?;
        if !self.fetcher.is_changed(&text) {
            return Ok(false);
        }
        let ruleset = self.parse(&text)?;
        self.fetcher.save_cache(&text).await;
        self.ruleset.store(Arc::new(ruleset));
        self.fetcher.commit(&text);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{NetworkAddr, NetworkType};

    #[tokio::test]
    async fn test_rule_provider_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rules").join("ads.yml");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "payload:\n  - +.ads.example\n").unwrap();
        let cfg: RuleProvider =
            serde_yaml::from_str("behavior: domain\nvehicle: file\npath: rules/ads.yml").unwrap();
        let provider = RuleSetProvider::from_config(
            "ads",
            &cfg,
            dir.path(),
            Duration::from_secs(5),
            GeoDatabases::default(),
        )
        .unwrap();
        let info = ConnInfo::new(
            "127.0.0.1:1234".parse().unwrap(),
            NetworkAddr::parse("x.ads.example:443").unwrap(),
            NetworkType::Tcp,
        );
        assert!(!provider.matches(&info));
        provider.initial().await.unwrap();
        assert!(provider.matches(&info));
        assert!(!provider.should_resolve_ip());

        std::fs::write(&file, "payload:\n  - +.tracker.example\n").unwrap();
        assert!(provider.update().await.unwrap());
        assert!(!provider.matches(&info));

        std::fs::write(&file, "not: [valid").unwrap();
        assert!(provider.update().await.is_err());
        assert_eq!(provider.size(), 1);
    }

    #[tokio::test]
    async fn test_rule_cache_written_after_parse() {
        use crate::provider::testing::serve_body;
        use std::sync::Mutex;

        let dir = tempfile::tempdir().unwrap();
        let good = "payload:\n  - +.ads.example\n";
        let body = Arc::new(Mutex::new(good.to_string()));
        let url = serve_body(body.clone()).await;
        let cfg: RuleProvider = serde_yaml::from_str(&format!(
            "behavior: domain\nvehicle: http\nurl: {url}\npath: ads.yml"
        ))
        .unwrap();
        let provider = RuleSetProvider::from_config(
            "ads",
            &cfg,
            dir.path(),
            Duration::from_secs(5),
            GeoDatabases::default(),
        )
        .unwrap();
        provider.initial().await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("ads.yml")).unwrap(), good);

        *body.lock().unwrap() = "not: [valid".to_string();
        assert!(provider.update().await.is_err());
        assert_eq!(provider.size(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("ads.yml")).unwrap(), good);
    }
}
