//! Daemon assembly: store, registry seed, and the background loops.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use skynet_core::ControlPlaneConfig;
use skynet_gateway::{GatewayClient, HttpGatewayClient, IdempotentGateway, MemoryGateway};
use skynet_health::{HealthMonitor, HealthPolicy};
use skynet_placement::{ScoringWeights, Selector};
use skynet_scheduler::{Reaper, ReaperPolicy, Scheduler, SchedulerPolicy};
use skynet_state::{GatewayRegistration, StateStore};

/// Load and validate `path`, or defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ControlPlaneConfig> {
    let Some(path) = path else {
        return Ok(ControlPlaneConfig::default());
    };
    ControlPlaneConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

/// `--db` wins over `[store].path`.
pub fn db_path(config: &ControlPlaneConfig, db: Option<&Path>) -> PathBuf {
    db.map(Path::to_path_buf)
        .unwrap_or_else(|| config.store.path.clone())
}

/// Open the store in shared mode so the daemon and operator commands can
/// use the same file at once.
pub fn open_store(config: &ControlPlaneConfig, db: Option<&Path>) -> anyhow::Result<StateStore> {
    let path = db_path(config, db);
    let state = StateStore::open_shared(&path, config.store.lock_timeout()?)
        .with_context(|| format!("failed to open state store at {}", path.display()))?
        .with_default_max_retries(config.store.default_max_retries);
    info!(path = %path.display(), "state store opened");
    Ok(state)
}

/// HTTP dispatch, or an in-process gateway for `--dry-run`. Both idempotent.
pub fn build_client(config: &ControlPlaneConfig, dry_run: bool) -> anyhow::Result<Arc<dyn GatewayClient>> {
    if dry_run {
        info!("dry run: dispatching to in-memory gateway");
        return Ok(Arc::new(IdempotentGateway::new(MemoryGateway::new())));
    }
    let status_timeout = config.health.probe_timeout()?;
    Ok(Arc::new(IdempotentGateway::new(HttpGatewayClient::new(status_timeout))))
}

/// Upsert every `[[gateways]]` entry. Returns how many were registered.
pub fn register_configured_gateways(state: &StateStore, config: &ControlPlaneConfig) -> anyhow::Result<usize> {
    for gw in &config.gateways {
        state
            .register_gateway(GatewayRegistration {
                gateway_id: gw.gateway_id.clone(),
                endpoint: gw.endpoint.clone(),
                capabilities: gw.capabilities.iter().cloned().collect::<BTreeSet<_>>(),
                capacity: gw.capacity,
            })
            .with_context(|| format!("failed to register gateway {}", gw.gateway_id))?;
        info!(gateway_id = %gw.gateway_id, endpoint = %gw.endpoint, "gateway registered");
    }
    Ok(config.gateways.len())
}

/// Run the scheduler loops, reaper, and health monitor until `shutdown` flips.
pub async fn serve(
    config: &ControlPlaneConfig,
    state: StateStore,
    client: Arc<dyn GatewayClient>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    state.reset_dispatch_counts()?;
    register_configured_gateways(&state, config)?;

    let scheduler_policy = SchedulerPolicy::from_settings(&config.scheduler)?;
    let selector = Selector::new(ScoringWeights::from(&config.scoring));
    let health_policy = HealthPolicy::from_settings(&config.health)?;
    let reaper_policy =
        ReaperPolicy::from_settings(&config.reaper)?.with_probe_timeout(health_policy.probe_timeout);

    let mut handles = Vec::new();

    for _ in 0..config.scheduler.instances {
        let scheduler = Scheduler::new(state.clone(), client.clone(), scheduler_policy.clone())
            .with_selector(selector.clone());
        scheduler.register()?;
        info!(worker_id = %scheduler.worker_id(), "scheduler loop initialized");
        handles.push(tokio::spawn(Arc::new(scheduler).run(shutdown.clone())));
    }

    let mut reaper = Reaper::new(state.clone(), reaper_policy);
    if health_policy.probe {
        reaper = reaper.with_client(client.clone());
    }
    handles.push(tokio::spawn(Arc::new(reaper).run(shutdown.clone())));
    info!("reaper initialized");

    let monitor = HealthMonitor::new(state.clone(), health_policy).with_client(client);
    handles.push(tokio::spawn(Arc::new(monitor).run(shutdown)));
    info!("health monitor initialized");

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background loop panicked");
        }
    }
    info!("all loops stopped");
    Ok(())
}
