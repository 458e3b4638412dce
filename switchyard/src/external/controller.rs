use crate::config::{LinkedState, Mode, ProviderError};
use crate::dispatch::{ConnInfo, GeneralProxy, Latency, ProxyGroup};
use crate::provider::{HealthProber, Provider};
use crate::proxy::error::SelectionError;
use crate::proxy::Dispatcher;
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, MutexGuard};
use switchyard_api::{
    GetGroupRespSchema, ModeSchema, ProviderSchema, ProxyData, RouteRespSchema,
};
use tokio::sync::mpsc;

/// Operations offered to whatever orchestrates the routing core.
#[derive(Clone)]
pub struct Controller {
    dispatcher: Arc<Dispatcher>,
    /// Probes groups that carry no prober of their own.
    prober: Arc<ArcSwap<HealthProber>>,
    reload_sender: Arc<mpsc::Sender<()>>,
    state: Arc<Mutex<LinkedState>>,
}

impl Controller {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        prober: Arc<ArcSwap<HealthProber>>,
        reload_sender: mpsc::Sender<()>,
        state: Arc<Mutex<LinkedState>>,
    ) -> Self {
        Self {
            dispatcher,
            prober,
            reload_sender: Arc::new(reload_sender),
            state,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_all_proxies(&self) -> Vec<GetGroupRespSchema> {
        let list = self.dispatcher.snapshot().proxies().get_group_list();
        list.iter().map(|g| self.group_schema(g)).collect()
    }

    pub fn get_proxy_group(&self, group: &str) -> Option<GetGroupRespSchema> {
        let g = self.dispatcher.snapshot().proxies().group(group)?;
        Some(self.group_schema(&g))
    }

    fn group_schema(&self, g: &ProxyGroup) -> GetGroupRespSchema {
        let fallback = self.prober.load_full();
        let prober = match g.prober() {
            Some(p) => p.as_ref(),
            None => fallback.as_ref(),
        };
        GetGroupRespSchema {
            name: g.get_name(),
            strategy: g.strategy_name().to_string(),
            selected: g.current().name().to_string(),
            list: g
                .get_members()
                .iter()
                .map(|p| pretty_proxy(p, prober))
                .collect(),
        }
    }

    /// Pin `selected` in `group` and persist the choice. The stored state is
    /// left alone when the group refuses.
    pub fn set_selection(&self, group: &str, selected: &str) -> Result<(), SelectionError> {
        let mut state = self.lock_state();
        self.dispatcher.set_selection(group, selected)?;
        state
            .state
            .group_selection
            .insert(group.to_string(), selected.to_string());
        if let Err(e) = state.flush() {
            tracing::error!(
                "Write state to {} failed: {}",
                state.state_path.to_string_lossy(),
                e
            );
        }
        Ok(())
    }

    pub fn get_mode(&self) -> ModeSchema {
        match self.dispatcher.get_mode() {
            Mode::Rule => ModeSchema::Rule,
            Mode::Global => ModeSchema::Global,
            Mode::Direct => ModeSchema::Direct,
        }
    }

    pub fn set_mode(&self, mode: ModeSchema) {
        self.dispatcher.set_mode(match mode {
            ModeSchema::Rule => Mode::Rule,
            ModeSchema::Global => Mode::Global,
            ModeSchema::Direct => Mode::Direct,
        })
    }

    pub fn get_providers(&self) -> Vec<ProviderSchema> {
        let dispatching = self.dispatcher.snapshot();
        let proxy_providers = dispatching.proxies().providers().values();
        let rule_providers = dispatching.rules().providers().values();
        proxy_providers
            .map(|p| provider_schema(p.as_ref()))
            .chain(rule_providers.map(|p| provider_schema(p.as_ref())))
            .collect()
    }

    /// Refresh one provider now. `Ok(false)` when its content did not change.
    pub async fn update_provider(&self, name: &str) -> Result<bool, ProviderError> {
        let dispatching = self.dispatcher.snapshot();
        let updated = if let Some(p) = dispatching.proxies().providers().get(name) {
            p.update().await?
        } else if let Some(p) = dispatching.rules().providers().get(name) {
            p.update().await?
        } else {
            return Err(ProviderError::Missing(name.to_string()));
        };
        tracing::info!("Provider {} refreshed on request, changed: {}", name, updated);
        Ok(updated)
    }

    /// Probe every member of `group` once and report the group afterwards.
    pub async fn update_latency(&self, group: &str) -> Result<GetGroupRespSchema, SelectionError> {
        let g = self
            .dispatcher
            .snapshot()
            .proxies()
            .group(group)
            .ok_or_else(|| SelectionError::GroupNotFound(group.to_string()))?;
        tracing::trace!("Start speedtest for group {}", group);
        if g.prober().is_some() {
            g.health_check().await;
        } else {
            let prober = self.prober.load_full();
            prober.probe(g.probe_targets()).await;
        }
        Ok(self.group_schema(&g))
    }

    pub async fn route(&self, mut info: ConnInfo) -> RouteRespSchema {
        let result = self.dispatcher.route(&mut info).await;
        RouteRespSchema {
            proxy: result.proxy.get_name(),
            chain: result.chain.iter().map(|p| p.get_name()).collect(),
            target: result.target,
            rule: result.rule.unwrap_or_else(|| "Fallback".to_string()),
        }
    }

    pub async fn reload(&self) {
        let _ = self.reload_sender.send(()).await;
    }
}

fn provider_schema<P: Provider + ?Sized>(p: &P) -> ProviderSchema {
    ProviderSchema {
        name: p.name().to_string(),
        kind: p.kind().to_string(),
        vehicle: p.vehicle_type().to_string(),
        size: p.size(),
        updated_at: p.updated_at(),
    }
}

fn pretty_proxy(g: &GeneralProxy, prober: &HealthProber) -> ProxyData {
    let latency_to_str = |latency: Latency| match latency {
        Latency::Unknown => None,
        Latency::Value(ms) => Some(format!("{ms} ms")),
        Latency::Failed => Some("Failed".to_string()),
    };
    let recorded = prober.get_record(g.name()).map(|r| r.latency);
    let latency = match g {
        GeneralProxy::Single(p) => recorded.unwrap_or_else(|| p.get_latency()),
        GeneralProxy::Group(_) => recorded.unwrap_or(Latency::Unknown),
    };
    ProxyData {
        name: g.name().to_string(),
        proto: g.proto(),
        latency: latency_to_str(latency),
    }
}
