use crate::adapter::{HttpProbeConnector, ProbeConnector};
use crate::config::{LinkedState, LoadedConfig, RawProbeCfg};
use crate::dispatch::DispatchingBuilder;
use crate::external::Controller;
use crate::network::Dns;
use crate::provider::HealthProber;
use crate::proxy::Dispatcher;
use anyhow::anyhow;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::select;

pub struct App {
    config_path: PathBuf,
    data_path: PathBuf,
    dns: Arc<Dns>,
    dispatcher: Arc<Dispatcher>,
    builder: DispatchingBuilder,
    controller: Arc<Controller>,
    fallback_prober: Arc<ArcSwap<HealthProber>>,
    state: Arc<Mutex<LinkedState>>,
    receiver: tokio::sync::mpsc::Receiver<()>,
}

impl App {
    /// Load the configuration, build the first generation and start it.
    pub async fn create(config_path: PathBuf, data_path: PathBuf) -> anyhow::Result<Self> {
        let connector: Arc<dyn ProbeConnector> = Arc::new(HttpProbeConnector::new());
        Self::create_with_connector(config_path, data_path, connector).await
    }

    pub(crate) async fn create_with_connector(
        config_path: PathBuf,
        data_path: PathBuf,
        connector: Arc<dyn ProbeConnector>,
    ) -> anyhow::Result<Self> {
        // Read initial config
        let loaded_config = LoadedConfig::load_config(&config_path, &data_path)
            .map_err(|e| anyhow!("Load config from {:?} failed: {}", &config_path, e))?;
        let config = &loaded_config.config;

        let dns = Arc::new(
            Dns::with_config(&config.dns).map_err(|e| anyhow!("Parse dns config failed: {e}"))?,
        );

        let builder = DispatchingBuilder::new(connector.clone());
        let dispatching = builder
            .build(&loaded_config)
            .await
            .map_err(|e| anyhow!("Parse routing rules failed: {}", e))?;
        let dispatcher = Arc::new(Dispatcher::new(dispatching, dns.clone(), config.mode));

        let fallback_prober = Arc::new(ArcSwap::new(fallback_prober(
            connector.clone(),
            &config.probe,
        )?));
        let (reload_sender, reload_receiver) = tokio::sync::mpsc::channel::<()>(1);
        let state = Arc::new(Mutex::new(LinkedState {
            state_path: LoadedConfig::state_path(&data_path),
            state: loaded_config.state.clone(),
        }));
        let controller = Arc::new(Controller::new(
            dispatcher.clone(),
            fallback_prober.clone(),
            reload_sender,
            state.clone(),
        ));
        tracing::info!(
            "Switchyard started with config from {}",
            config_path.to_string_lossy()
        );

        Ok(Self {
            config_path,
            data_path,
            dns,
            dispatcher,
            builder,
            controller,
            fallback_prober,
            state,
            receiver: reload_receiver,
        })
    }

    pub fn controller(&self) -> Arc<Controller> {
        self.controller.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Serve Ctrl-C and reload requests from the controller.
    pub async fn serve_command(mut self) {
        'outer: loop {
            select! {
                _ = tokio::signal::ctrl_c() => break 'outer,
                restart = self.receiver.recv() => {
                    if restart.is_some() {
                        self.reload().await;
                    } else {
                        break 'outer;
                    }
                }
            }
        }
        self.dispatcher.snapshot().stop();
        tracing::info!("Switchyard stopped");
    }

    pub async fn reload(&self) {
        let start = Instant::now();
        match self.reload_inner().await {
            Ok(_) => {
                tracing::info!(
                    "Reloaded config successfully in {}ms",
                    start.elapsed().as_millis()
                );
            }
            Err(err) => {
                tracing::error!("Reloading config failed: {}", err);
            }
        }
    }

    async fn reload_inner(&self) -> anyhow::Result<()> {
        // One reload at a time; selections made meanwhile are persisted in `state`.
        let guard = self.dispatcher.lock().await;
        let mut loaded_config = LoadedConfig::load_config(&self.config_path, &self.data_path)?;
        loaded_config.state = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .clone();
        let config = &loaded_config.config;
        let prober = fallback_prober(self.builder.connector(), &config.probe)?;
        let dispatching = self.builder.build(&loaded_config).await?;

        // Nothing below can fail once the new dns configuration is accepted.
        self.dns.replace_config(&config.dns)?;
        {
            // Selections made while building went to the outgoing generation.
            // The state lock keeps new ones out until the swap is done.
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            dispatching
                .proxies()
                .restore_selections(&state.state.group_selection);
            self.dispatcher.install(&guard, dispatching);
        }
        self.dispatcher.set_mode(config.mode);
        self.fallback_prober.store(prober);
        Ok(())
    }
}

fn fallback_prober(
    connector: Arc<dyn ProbeConnector>,
    probe: &RawProbeCfg,
) -> anyhow::Result<Arc<HealthProber>> {
    let prober = HealthProber::new(
        connector,
        probe.url.as_str(),
        Duration::from_millis(probe.timeout),
        probe.concurrency,
    )
    .map_err(|e| anyhow!("Invalid probe url {}: {}", probe.url, e))?;
    Ok(Arc::new(prober))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ScriptedConnector;
    use crate::dispatch::{ConnInfo, NetworkAddr, NetworkType};
    use std::collections::HashMap;

    const FIRST: &str = r#"
mode: rule
dns:
  nameserver: [127.0.0.1:53]
proxy_local:
  hk-01: {type: socks5, server: 10.0.0.1, port: 1080}
  jp-01: {type: socks5, server: 10.0.0.2, port: 1080}
proxy_group:
  Proxy:
    type: select
    proxies: [hk-01, jp-01]
rule_local:
  - "DOMAIN-SUFFIX,example.com,Proxy"
  - "MATCH,DIRECT"
"#;

    const SECOND: &str = r#"
mode: global
dns:
  nameserver: [127.0.0.1:53]
proxy_local:
  hk-01: {type: socks5, server: 10.0.0.1, port: 1080}
  jp-01: {type: socks5, server: 10.0.0.2, port: 1080}
proxy_group:
  Proxy:
    type: select
    proxies: [hk-01, jp-01]
rule_local:
  - "DOMAIN-SUFFIX,example.com,REJECT"
  - "MATCH,Proxy"
"#;

    fn conn(dst: &str) -> ConnInfo {
        ConnInfo::new(
            "192.168.1.10:50000".parse().unwrap(),
            NetworkAddr::parse(dst).unwrap(),
            NetworkType::Tcp,
        )
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_reload_keeps_selection() {
        let config_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let config_file = LoadedConfig::config_file(config_dir.path());
        std::fs::write(&config_file, FIRST).unwrap();
        let app = App::create_with_connector(
            config_dir.path().to_path_buf(),
            data_dir.path().to_path_buf(),
            Arc::new(ScriptedConnector(HashMap::new())),
        )
        .await
        .unwrap();
        let controller = app.controller();
        controller.set_selection("Proxy", "jp-01").unwrap();
        let result = app.dispatcher().route(&mut conn("www.example.com:443")).await;
        assert_eq!(result.proxy.get_name(), "jp-01");

        std::fs::write(&config_file, SECOND).unwrap();
        app.reload().await;
        let result = app.dispatcher().route(&mut conn("www.example.com:443")).await;
        // mode follows the reloaded file
        assert_eq!(result.target, "GLOBAL");
        controller.set_mode(switchyard_api::ModeSchema::Rule);
        let result = app.dispatcher().route(&mut conn("www.example.com:443")).await;
        assert_eq!(result.proxy.get_name(), "REJECT");
        let result = app.dispatcher().route(&mut conn("other.org:443")).await;
        assert_eq!(result.proxy.get_name(), "jp-01");

        // a broken file leaves the running generation alone
        std::fs::write(&config_file, "proxy_group: [").unwrap();
        app.reload().await;
        let result = app.dispatcher().route(&mut conn("other.org:443")).await;
        assert_eq!(result.proxy.get_name(), "jp-01");
        assert!(logs_contain("Reloading config failed"));
    }

    #[tokio::test]
    async fn test_selection_during_slow_reload() {
        let config_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let config_file = LoadedConfig::config_file(config_dir.path());
        std::fs::write(&config_file, FIRST).unwrap();
        let app = App::create_with_connector(
            config_dir.path().to_path_buf(),
            data_dir.path().to_path_buf(),
            Arc::new(ScriptedConnector(HashMap::new())),
        )
        .await
        .unwrap();
        let controller = app.controller();

        // a subscription that never answers keeps the next build busy
        let url = crate::provider::testing::serve_silent().await;
        let slow = format!(
            "{FIRST}probe:\n  fetch_timeout: 1\nproxy_provider:\n  slow:\n    vehicle: http\n    url: {url}\n    path: slow.yml\n"
        );
        std::fs::write(&config_file, slow).unwrap();
        let pin = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            controller.set_selection("Proxy", "jp-01").unwrap();
        };
        tokio::join!(app.reload(), pin);

        let result = app.dispatcher().route(&mut conn("www.example.com:443")).await;
        assert_eq!(result.proxy.get_name(), "jp-01");
        let stored = std::fs::read_to_string(LoadedConfig::state_path(data_dir.path())).unwrap();
        assert!(stored.contains("Proxy: jp-01"));
    }
}
