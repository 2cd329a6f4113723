//! Health monitor: periodic sweep over the gateway and worker registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use skynet_core::{ConfigError, HealthSettings, epoch_millis};
use skynet_gateway::GatewayClient;
use skynet_state::{HealthStatus, StateResult, StateStore};

use crate::checker::{HealthTracker, ProbeResult, probe_gateway};

/// Thresholds for one monitor.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub heartbeat_timeout: Duration,
    pub degraded_after: Duration,
    pub probe_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub probe: bool,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            degraded_after: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            probe: true,
        }
    }
}

impl HealthPolicy {
    pub fn from_settings(settings: &HealthSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            interval: settings.interval()?,
            heartbeat_timeout: settings.heartbeat_timeout()?,
            degraded_after: settings.degraded_after()?,
            probe_timeout: settings.probe_timeout()?,
            unhealthy_threshold: settings.unhealthy_threshold,
            probe: settings.probe,
        })
    }
}

/// Status implied by heartbeat age alone.
pub fn classify_heartbeat(last_heartbeat: u64, now: u64, policy: &HealthPolicy) -> HealthStatus {
    let age = Duration::from_millis(now.saturating_sub(last_heartbeat));
    if age > policy.heartbeat_timeout {
        HealthStatus::Unhealthy
    } else if age > policy.degraded_after {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Gateway,
    Worker,
}

/// A status change written by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub kind: TargetKind,
    pub id: String,
    pub from: HealthStatus,
    pub to: HealthStatus,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub gateways_checked: usize,
    pub workers_checked: usize,
    pub transitions: Vec<Transition>,
}

enum Check {
    Taken(HealthStatus, ProbeResult),
    BackingOff(HealthStatus),
}

/// Keeps registry health current.
pub struct HealthMonitor {
    state: StateStore,
    client: Option<Arc<dyn GatewayClient>>,
    policy: HealthPolicy,
    trackers: Mutex<HashMap<String, HealthTracker>>,
}

impl HealthMonitor {
    /// A monitor that only ages heartbeats.
    pub fn new(state: StateStore, policy: HealthPolicy) -> Self {
        Self {
            state,
            client: None,
            policy,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Probe gateways through `client` when the policy enables probing.
    pub fn with_client(mut self, client: Arc<dyn GatewayClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Classify every gateway and worker once, writing only changes.
    pub async fn sweep(&self, now: u64) -> StateResult<SweepReport> {
        let mut report = SweepReport::default();

        for gw in self.state.list_gateways()? {
            report.gateways_checked += 1;

            let mut status = classify_heartbeat(gw.last_heartbeat, now, &self.policy);
            match self.probe(&gw.gateway_id, &gw.endpoint, now).await {
                Some(Check::Taken(tracked, ProbeResult::Healthy)) => {
                    self.state.gateway_heartbeat(&gw.gateway_id)?;
                    status = tracked;
                }
                Some(Check::Taken(tracked, _)) | Some(Check::BackingOff(tracked)) => {
                    status = status.max(tracked);
                }
                None => {}
            }

            if status != gw.status {
                self.state.set_gateway_status(&gw.gateway_id, status)?;
                log_transition("gateway", &gw.gateway_id, gw.status, status);
                report.transitions.push(Transition {
                    kind: TargetKind::Gateway,
                    id: gw.gateway_id,
                    from: gw.status,
                    to: status,
                });
            }
        }

        for worker in self.state.list_workers()? {
            report.workers_checked += 1;
            let status = classify_heartbeat(worker.last_heartbeat, now, &self.policy);
            if status != worker.status {
                self.state.set_worker_status(&worker.worker_id, status)?;
                log_transition("worker", &worker.worker_id, worker.status, status);
                report.transitions.push(Transition {
                    kind: TargetKind::Worker,
                    id: worker.worker_id,
                    from: worker.status,
                    to: status,
                });
            }
        }

        Ok(report)
    }

    /// Probe one gateway and fold the result into its tracker. A gateway
    /// still inside its failure backoff keeps its last tracked status.
    async fn probe(&self, gateway_id: &str, endpoint: &str, now: u64) -> Option<Check> {
        if !self.policy.probe {
            return None;
        }
        let client = self.client.as_ref()?;

        {
            let trackers = self.trackers.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(tracker) = trackers.get(gateway_id).filter(|t| !t.due(now)) {
                debug!(%gateway_id, failures = tracker.consecutive_failures(), "gateway backing off, check skipped");
                return Some(Check::BackingOff(tracker.status()));
            }
        }

        let result = probe_gateway(&**client, endpoint, self.policy.probe_timeout).await;

        let mut trackers = self.trackers.lock().unwrap_or_else(|p| p.into_inner());
        let tracker = trackers.entry(gateway_id.to_string()).or_insert_with(|| {
            HealthTracker::new(self.policy.unhealthy_threshold, self.policy.interval)
        });
        Some(Check::Taken(tracker.record_at(result, now), result))
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.policy.interval,
            probe = self.policy.probe && self.client.is_some(),
            "health monitor started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {
                    if let Err(e) = self.sweep(epoch_millis()).await {
                        error!(error = %e, "health sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}

fn log_transition(kind: &str, id: &str, from: HealthStatus, to: HealthStatus) {
    if to == HealthStatus::Unhealthy {
        warn!(%kind, %id, %from, %to, "marked unhealthy");
    } else {
        info!(%kind, %id, %from, %to, "health changed");
    }
}
