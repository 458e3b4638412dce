use crate::adapter::ProbeConnector;
use crate::dispatch::{Latency, Proxy};
use crate::proxy::error::ProbeError;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthRecord {
    pub latency: Latency,
    pub checked_at: Instant,
}

/// Measures members against one URL and caches the outcome per member name.
pub struct HealthProber {
    connector: Arc<dyn ProbeConnector>,
    url: Url,
    timeout: Duration,
    concurrency: usize,
    cache: DashMap<String, HealthRecord>,
}

impl HealthProber {
    pub fn new(
        connector: Arc<dyn ProbeConnector>,
        url: &str,
        timeout: Duration,
        concurrency: usize,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            connector,
            url: Url::parse(url)?,
            timeout,
            concurrency: concurrency.max(1),
            cache: DashMap::new(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn probe_one(&self, proxy: &Proxy) -> Result<Duration, ProbeError> {
        match tokio::time::timeout(self.timeout, self.connector.url_test(proxy, &self.url)).await
        {
            Ok(Ok(rtt)) => Ok(rtt),
            Ok(Err(e)) => Err(ProbeError::Transport(e)),
            Err(_) => Err(ProbeError::Timeout),
        }
    }

    /// Probe every `(name, proxy)` pair at most once, with bounded
    /// concurrency. A slow member never holds up the others beyond the
    /// per-probe timeout.
    pub async fn probe(&self, targets: Vec<(String, Arc<Proxy>)>) -> HashMap<String, Latency> {
        let mut seen = HashSet::new();
        let targets: Vec<_> = targets
            .into_iter()
            .filter(|(name, _)| seen.insert(name.clone()))
            .collect();
        tracing::debug!("Probing {} members against {}", targets.len(), self.url);
        let results: Vec<(String, Arc<Proxy>, Result<Duration, ProbeError>)> =
            futures::stream::iter(targets)
                .map(|(name, proxy)| async move {
                    let result = self.probe_one(proxy.as_ref()).await;
                    (name, proxy, result)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        let mut out = HashMap::with_capacity(results.len());
        for (name, proxy, result) in results {
            let latency = match result {
                Ok(rtt) => Latency::Value(rtt.as_millis().min(u32::MAX as u128) as u32),
                Err(e) => {
                    tracing::debug!("Probe of {} failed: {}", name, e);
                    Latency::Failed
                }
            };
            proxy.set_latency(latency);
            self.record(&name, latency);
            out.insert(name, latency);
        }
        out
    }

    pub fn record(&self, name: &str, latency: Latency) {
        self.cache.insert(
            name.to_string(),
            HealthRecord {
                latency,
                checked_at: Instant::now(),
            },
        );
    }

    pub fn get_record(&self, name: &str) -> Option<HealthRecord> {
        self.cache.get(name).map(|r| *r.value())
    }

    pub fn latency(&self, name: &str) -> Latency {
        self.get_record(name)
            .map(|r| r.latency)
            .unwrap_or(Latency::Unknown)
    }

    /// Unknown members count as alive until a probe says otherwise.
    pub fn alive(&self, name: &str) -> bool {
        self.latency(name) != Latency::Failed
    }
}
