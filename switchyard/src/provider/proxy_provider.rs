use crate::config::{ConfigError, ProviderError, ProxyLocation, ProxyProvider, ProxySchema, RawProxyProviderCfg};
use crate::dispatch::{build_proxy, GeneralProxy};
use crate::provider::{
    now_millis, spawn_refresh, HealthProber, Provider, ProviderKind, TaskSet, Vehicle,
    VehicleFetcher,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Periodic probing of every proxy a provider carries.
pub struct ProviderHealth {
    pub prober: Arc<HealthProber>,
    pub interval: Duration,
    pub lazy: bool,
}

/// A named, refreshable list of proxies. Readers always see one complete
/// snapshot; a refresh replaces it in a single store.
pub struct ProxySetProvider {
    name: String,
    fetcher: VehicleFetcher,
    interval: Duration,
    proxies: ArcSwap<Vec<GeneralProxy>>,
    last_touched: AtomicU64,
    health: Option<ProviderHealth>,
    tasks: TaskSet,
}

impl ProxySetProvider {
    /// A fixed list, used for the members a group declares by name.
    pub fn new_inline(name: &str, proxies: Vec<GeneralProxy>) -> Self {
        Self {
            name: name.to_string(),
            fetcher: VehicleFetcher::new(name, Vehicle::Inline, Duration::ZERO),
            interval: Duration::ZERO,
            proxies: ArcSwap::new(Arc::new(proxies)),
            last_touched: AtomicU64::new(0),
            health: None,
            tasks: TaskSet::default(),
        }
    }

    pub fn from_config(
        name: &str,
        cfg: &ProxyProvider,
        config_dir: &Path,
        fetch_timeout: Duration,
        health: Option<ProviderHealth>,
    ) -> Result<Self, ConfigError> {
        let (vehicle, interval) = match &cfg.location {
            ProxyLocation::File { path, interval } => (Vehicle::file(config_dir, path)?, *interval),
            ProxyLocation::Http {
                url,
                path,
                interval,
            } => (Vehicle::http(config_dir, url, path)?, *interval),
            ProxyLocation::Inline { proxies } => {
                let mut provider = Self::new_inline(name, Self::build_list(name, proxies));
                provider.fetcher.mark_updated();
                provider.health = health;
                return Ok(provider);
            }
        };
        Ok(Self {
            name: name.to_string(),
            fetcher: VehicleFetcher::new(name, vehicle, fetch_timeout),
            interval: Duration::from_secs(interval),
            proxies: ArcSwap::new(Arc::new(vec![])),
            last_touched: AtomicU64::new(0),
            health,
            tasks: TaskSet::default(),
        })
    }

    fn build_list(name: &str, list: &[RawProxyProviderCfg]) -> Vec<GeneralProxy> {
        let mut seen = HashSet::new();
        let mut proxies = Vec::with_capacity(list.len());
        for entry in list {
            if !seen.insert(entry.get_name().clone()) {
                tracing::warn!("Provider {}: duplicate proxy {} ignored", name, entry.name);
                continue;
            }
            match build_proxy(entry.get_name(), &entry.cfg) {
                Ok(p) => proxies.push(GeneralProxy::Single(p)),
                Err(e) => tracing::warn!("Provider {}: skip proxy {}: {}", name, entry.name, e),
            }
        }
        proxies
    }

    fn parse(&self, text: &str) -> Result<Vec<GeneralProxy>, ProviderError> {
        let schema: ProxySchema = serde_yaml::from_str(text)
            .map_err(|e| ProviderError::Invalid(format!("{}: {}", self.name, e)))?;
        Ok(Self::build_list(&self.name, &schema.proxies))
    }

    pub(crate) fn store(&self, proxies: Vec<GeneralProxy>) {
        self.proxies.store(Arc::new(proxies));
    }

    /// The current snapshot.
    pub fn proxies(&self) -> Arc<Vec<GeneralProxy>> {
        self.proxies.load_full()
    }

    /// The current snapshot, recording that traffic used this provider.
    pub fn touch(&self) -> Arc<Vec<GeneralProxy>> {
        self.last_touched.store(now_millis(), Ordering::Relaxed);
        self.proxies.load_full()
    }

    pub fn touched_since(&self, since_millis: u64) -> bool {
        self.last_touched.load(Ordering::Relaxed) >= since_millis
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.fetcher.vehicle(), Vehicle::Inline)
    }

    /// Spawn refresh and health tasks; they stop when the provider is dropped.
    pub fn start(self: &Arc<Self>) {
        if self.tasks.is_running() {
            return;
        }
        if !self.interval.is_zero() && !self.is_inline() {
            self.tasks.push(spawn_refresh(self, self.interval));
        }
        if let Some(health) = &self.health {
            let weak = Arc::downgrade(self);
            self.tasks
                .push(tokio::spawn(Self::health_loop(weak, health.interval, health.lazy)));
        }
    }

    pub fn stop(&self) {
        self.tasks.abort_all();
    }

    async fn health_loop(weak: Weak<Self>, interval: Duration, lazy: bool) {
        let mut last_round = None;
        loop {
            let Some(provider) = weak.upgrade() else {
                break;
            };
            let due = match last_round {
                None => true,
                Some(t) => !lazy || provider.touched_since(t),
            };
            if due {
                last_round = Some(now_millis());
                provider.health_check().await;
            }
            drop(provider);
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn health_check(&self) {
        let Some(health) = &self.health else {
            return;
        };
        let targets = self
            .proxies()
            .iter()
            .filter_map(|p| match p {
                GeneralProxy::Single(p) => Some((p.get_name(), p.clone())),
                GeneralProxy::Group(_) => None,
            })
            .collect();
        health.prober.probe(targets).await;
    }
}

#[async_trait]
impl Provider for ProxySetProvider {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Proxy
    }

    fn vehicle_type(&self) -> &'static str {
        self.fetcher.vehicle().type_name()
    }

    fn size(&self) -> usize {
        self.proxies.load().len()
    }

    fn updated_at(&self) -> Option<u64> {
        self.fetcher.updated_at()
    }

    async fn initial(&self) -> Result<(), ProviderError> {
        if self.is_inline() {
            return Ok(());
        }
        let fetched = match self.fetcher.fetch().await {
            Ok(text) => self.parse(&text).map(|proxies| (text, proxies)),
            Err(e) => Err(e),
        };
        let (text, proxies) = match fetched {
            Ok((text, proxies)) => {
                self.fetcher.save_cache(&text).await;
                (text, proxies)
            }
            Err(e) => {
                let Some(cached) = self.fetcher.read_cache().await else {
                    return Err(e);
                };
                tracing::warn!("Provider {} fetch failed, using cache: {}", self.name, e);
                let proxies = self.parse(&cached)?;
                (cached, proxies)
            }
        };
        self.store(proxies);
        self.fetcher.commit(&text);
        Ok(())
    }

    async fn update(&self) -> Result<bool, ProviderError> {
        if self.is_inline() {
            return Ok(false);
        }
        let text = self.fetcher.fetch().await?;
        if !self.fetcher.is_changed(&text) {
            return Ok(false);
        }
        let proxies = self.parse(&text)?;
        self.fetcher.save_cache(&text).await;
        self.store(proxies);
        self.fetcher.commit(&text);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::CountingConnector;
    use crate::dispatch::Latency;
    use crate::provider::testing::{closed_url, serve_body};
    use std::sync::Mutex;

    const SUB: &str = "
proxies:
  - name: hk-01
    type: socks5
    server: 10.0.0.1
    port: 1080
  - name: hk-01
    type: http
    server: 10.0.0.2
    port: 3128
  - name: jp-01
    type: ss
    server: 10.0.0.3
    port: 8388
    password: pw
    cipher: aes-128-gcm
";

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sub.yml");
        std::fs::write(&file, SUB).unwrap();
        let cfg: ProxyProvider = serde_yaml::from_str("vehicle: file\npath: sub.yml").unwrap();
        let provider =
            ProxySetProvider::from_config("sub", &cfg, dir.path(), Duration::from_secs(5), None)
                .unwrap();
        assert_eq!(provider.size(), 0);
        provider.initial().await.unwrap();
        assert_eq!(provider.size(), 2);
        let names: Vec<_> = provider.proxies().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["hk-01", "jp-01"]);
        assert!(!provider.update().await.unwrap());

        std::fs::write(&file, "proxies: [this is not valid").unwrap();
        assert!(provider.update().await.is_err());
        assert_eq!(provider.size(), 2);

        std::fs::remove_file(&file).unwrap();
        assert!(provider.update().await.is_err());
        assert_eq!(provider.size(), 2);
        assert!(provider.updated_at().is_some());
    }

    #[tokio::test]
    async fn test_inline_provider() {
        let cfg: ProxyProvider = serde_yaml::from_str(
            "vehicle: inline\nproxies:\n  - {name: a, type: http, server: 1.1.1.1, port: 80}",
        )
        .unwrap();
        let provider =
            ProxySetProvider::from_config("inline", &cfg, Path::new("/"), Duration::ZERO, None)
                .unwrap();
        provider.initial().await.unwrap();
        assert_eq!(provider.size(), 1);
        assert_eq!(provider.vehicle_type(), "inline");
        assert!(!provider.update().await.unwrap());
        let before = now_millis();
        assert!(!provider.touched_since(before));
        provider.touch();
        assert!(provider.touched_since(before));
    }

    fn http_provider(dir: &Path, url: &str) -> ProxySetProvider {
        let cfg: ProxyProvider =
            serde_yaml::from_str(&format!("vehicle: http\nurl: {url}\npath: cache/sub.yml"))
                .unwrap();
        ProxySetProvider::from_config("sub", &cfg, dir, Duration::from_secs(5), None).unwrap()
    }

    #[tokio::test]
    async fn test_bad_refresh_keeps_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache/sub.yml");
        let body = Arc::new(Mutex::new(SUB.to_string()));
        let url = serve_body(body.clone()).await;
        let provider = http_provider(dir.path(), &url);
        provider.initial().await.unwrap();
        assert_eq!(provider.size(), 2);
        assert_eq!(std::fs::read_to_string(&cache).unwrap(), SUB);

        *body.lock().unwrap() = "proxies: [this is not valid".to_string();
        assert!(provider.update().await.is_err());
        assert_eq!(provider.size(), 2);
        assert_eq!(std::fs::read_to_string(&cache).unwrap(), SUB);

        // a restart while the subscription is still broken starts from the cache
        let restarted = http_provider(dir.path(), &url);
        restarted.initial().await.unwrap();
        assert_eq!(restarted.size(), 2);
    }

    #[tokio::test]
    async fn test_initial_falls_back_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let url = closed_url().await;
        let provider = http_provider(dir.path(), &url);
        assert!(provider.initial().await.is_err());
        assert_eq!(provider.size(), 0);

        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(dir.path().join("cache/sub.yml"), SUB).unwrap();
        let provider = http_provider(dir.path(), &url);
        provider.initial().await.unwrap();
        assert_eq!(provider.size(), 2);
        assert!(provider.updated_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_mirrors_latency() {
        let connector = Arc::new(CountingConnector::default());
        let prober = Arc::new(
            HealthProber::new(
                connector.clone(),
                "http://www.gstatic.com/generate_204",
                Duration::from_secs(1),
                4,
            )
            .unwrap(),
        );
        let cfg: ProxyProvider = serde_yaml::from_str(
            "vehicle: inline\nproxies:\n  - {name: a, type: http, server: 1.1.1.1, port: 80}\n  - {name: b, type: socks5, server: 1.1.1.2, port: 1080}",
        )
        .unwrap();
        let health = ProviderHealth {
            prober: prober.clone(),
            interval: Duration::from_secs(10),
            lazy: true,
        };
        let provider = Arc::new(
            ProxySetProvider::from_config("sub", &cfg, Path::new("/"), Duration::ZERO, Some(health))
                .unwrap(),
        );
        provider.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.calls(), 2);
        for proxy in provider.proxies().iter() {
            let GeneralProxy::Single(p) = proxy else {
                panic!("provider holds only proxies");
            };
            assert_eq!(p.get_latency(), Latency::Value(7));
        }
        assert_eq!(prober.latency("b"), Latency::Value(7));

        // idle provider skips a round
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.calls(), 2);
        provider.touch();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.calls(), 4);
        provider.stop();
    }
}
