use crate::config::{safe_join_path, FileError, ProviderError};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Where provider content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vehicle {
    File { path: PathBuf },
    /// `path` caches the last successful download.
    Http { url: String, path: PathBuf },
    Inline,
}

impl Vehicle {
    pub fn file(config_dir: &Path, path: &str) -> Result<Self, FileError> {
        Ok(Vehicle::File {
            path: safe_join_path(config_dir, path)?,
        })
    }

    pub fn http(config_dir: &Path, url: &str, path: &str) -> Result<Self, FileError> {
        Ok(Vehicle::Http {
            url: url.to_string(),
            path: safe_join_path(config_dir, path)?,
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Vehicle::File { .. } => "file",
            Vehicle::Http { .. } => "http",
            Vehicle::Inline => "inline",
        }
    }
}

/// Reads a vehicle and remembers the fingerprint of the last accepted content.
#[derive(Debug)]
pub struct VehicleFetcher {
    name: String,
    vehicle: Vehicle,
    timeout: Duration,
    fingerprint: AtomicU64,
    updated_at: AtomicU64,
}

impl VehicleFetcher {
    pub fn new(name: &str, vehicle: Vehicle, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            vehicle,
            timeout,
            fingerprint: AtomicU64::new(0),
            updated_at: AtomicU64::new(0),
        }
    }

    pub fn vehicle(&self) -> &Vehicle {
        &self.vehicle
    }

    pub async fn fetch(&self) -> Result<String, ProviderError> {
        match &self.vehicle {
            Vehicle::File { path } => read_file(&self.name, path).await,
            Vehicle::Http { url, .. } => {
                match tokio::time::timeout(self.timeout, self.download(url)).await {
                    Ok(r) => r,
                    Err(_) => Err(ProviderError::Timeout(self.name.clone())),
                }
            }
            Vehicle::Inline => Err(ProviderError::Invalid(format!(
                "{} has no vehicle to fetch from",
                self.name
            ))),
        }
    }

    async fn download(&self, url: &str) -> Result<String, ProviderError> {
        let http_err = |e| ProviderError::Fetch(self.name.clone(), FileError::Http(url.to_string(), e));
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(http_err)?;
        let resp = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?;
        resp.text().await.map_err(http_err)
    }

    /// Content of the download cache, for remote vehicles only.
    pub async fn read_cache(&self) -> Option<String> {
        match &self.vehicle {
            Vehicle::Http { path, .. } => read_file(&self.name, path).await.ok(),
            _ => None,
        }
    }

    /// Keep accepted remote content for the next start. Call only after the
    /// content parsed.
    pub async fn save_cache(&self, content: &str) {
        if let Vehicle::Http { path, .. } = &self.vehicle {
            if let Err(e) = write_cache(path, content).await {
                tracing::warn!("Provider {} failed to write cache: {}", self.name, e);
            }
        }
    }

    pub fn is_changed(&self, content: &str) -> bool {
        self.updated_at.load(Ordering::Relaxed) == 0
            || self.fingerprint.load(Ordering::Relaxed) != fingerprint(content)
    }

    pub fn commit(&self, content: &str) {
        self.fingerprint.store(fingerprint(content), Ordering::Relaxed);
        self.mark_updated();
    }

    pub fn mark_updated(&self) {
        self.updated_at
            .store(chrono::Utc::now().timestamp().max(1) as u64, Ordering::Relaxed);
    }

    pub fn updated_at(&self) -> Option<u64> {
        match self.updated_at.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        }
    }
}

fn fingerprint(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

async fn read_file(name: &str, path: &Path) -> Result<String, ProviderError> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        ProviderError::Fetch(
            name.to_string(),
            FileError::Io(path.to_string_lossy().to_string(), e),
        )
    })
}

async fn write_cache(path: &Path, text: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, text).await
}

#[tokio::test]
async fn test_file_vehicle() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("list.yml"), "payload: []").unwrap();
    let vehicle = Vehicle::file(dir.path(), "list.yml").unwrap();
    assert_eq!(vehicle.type_name(), "file");
    let fetcher = VehicleFetcher::new("list", vehicle, Duration::from_secs(1));
    let text = fetcher.fetch().await.unwrap();
    assert!(fetcher.is_changed(&text));
    fetcher.commit(&text);
    assert!(!fetcher.is_changed(&text));
    assert!(fetcher.updated_at().is_some());
    assert!(fetcher.read_cache().await.is_none());

    let missing = VehicleFetcher::new(
        "missing",
        Vehicle::file(dir.path(), "nope.yml").unwrap(),
        Duration::from_secs(1),
    );
    assert!(matches!(missing.fetch().await, Err(ProviderError::Fetch(..))));
    assert!(Vehicle::file(dir.path(), "../outside.yml").is_err());
}

#[cfg(test)]
mod http_tests {
    use super::*;
    use crate::provider::testing::{serve_body, serve_silent};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_http_vehicle_cache() {
        let dir = tempfile::tempdir().unwrap();
        let body = Arc::new(Mutex::new("payload: [+.example.com]".to_string()));
        let url = serve_body(body.clone()).await;
        let vehicle = Vehicle::http(dir.path(), &url, "cache/rules.yml").unwrap();
        assert_eq!(vehicle.type_name(), "http");
        let fetcher = VehicleFetcher::new("rules", vehicle, Duration::from_secs(5));

        let text = fetcher.fetch().await.unwrap();
        assert_eq!(text, "payload: [+.example.com]");
        // fetching alone never touches the cache
        assert!(fetcher.read_cache().await.is_none());
        fetcher.save_cache(&text).await;
        assert_eq!(fetcher.read_cache().await.as_deref(), Some(text.as_str()));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cache/rules.yml")).unwrap(),
            text
        );
    }

    #[tokio::test]
    async fn test_http_vehicle_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_silent().await;
        let fetcher = VehicleFetcher::new(
            "slow",
            Vehicle::http(dir.path(), &url, "slow.yml").unwrap(),
            Duration::from_millis(200),
        );
        let result = fetcher.fetch().await;
        assert!(matches!(
            result,
            Err(ProviderError::Timeout(_)) | Err(ProviderError::Fetch(..))
        ));
        assert!(fetcher.read_cache().await.is_none());
    }
}
