mod healthcheck;
mod proxy_provider;
mod rule_provider;
mod vehicle;

pub use healthcheck::*;
pub use proxy_provider::*;
pub use rule_provider::*;
pub use vehicle::*;

use crate::config::ProviderError;
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Proxy,
    Rule,
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProviderKind::Proxy => "proxy",
            ProviderKind::Rule => "rule",
        })
    }
}

/// A named source of proxies or rules whose content is replaced as a whole.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn vehicle_type(&self) -> &'static str;

    fn size(&self) -> usize;

    /// Unix seconds of the last successful load.
    fn updated_at(&self) -> Option<u64>;

    /// First load. A remote provider falls back to its cache file.
    async fn initial(&self) -> Result<(), ProviderError>;

    /// Fetch again; `Ok(true)` when the snapshot was replaced.
    async fn update(&self) -> Result<bool, ProviderError>;
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Periodically refresh `provider` until it is dropped.
pub(crate) fn spawn_refresh<P: Provider + 'static>(
    provider: &Arc<P>,
    interval: Duration,
) -> JoinHandle<()> {
    let weak: Weak<P> = Arc::downgrade(provider);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(provider) = weak.upgrade() else {
                break;
            };
            match provider.update().await {
                Ok(true) => tracing::info!(
                    "{} provider {} updated, {} entries",
                    provider.kind(),
                    provider.name(),
                    provider.size()
                ),
                Ok(false) => tracing::debug!(
                    "{} provider {} unchanged",
                    provider.kind(),
                    provider.name()
                ),
                Err(e) => tracing::warn!(
                    "{} provider {} refresh failed, keeping previous content: {}",
                    provider.kind(),
                    provider.name(),
                    e
                ),
            }
        }
    })
}

/// Background tasks owned by one provider or group; aborted on drop.
#[derive(Debug, Default)]
pub(crate) struct TaskSet(Mutex<Vec<JoinHandle<()>>>);

impl TaskSet {
    pub fn push(&self, handle: JoinHandle<()>) {
        match self.0.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => handle.abort(),
        }
    }

    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.0.lock() {
            for t in tasks.drain(..) {
                t.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.0.lock().map(|t| !t.is_empty()).unwrap_or(false)
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer every HTTP request with the current content of `body`.
    pub(crate) async fn serve_body(body: Arc<Mutex<String>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let body = body.lock().unwrap().clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{}/sub.yml", addr)
    }

    /// Accept connections and never answer.
    pub(crate) async fn serve_silent() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = vec![];
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        format!("http://{}/sub.yml", addr)
    }

    /// An address nothing listens on.
    pub(crate) async fn closed_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/sub.yml", addr)
    }
}
