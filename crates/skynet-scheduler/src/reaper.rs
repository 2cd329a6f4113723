//! Reaper: recovers claims whose owners stopped making progress.
//!
//! A claim is stale once `locked_at` is older than the TTL. Stale claims of
//! owners that still look alive are left alone until they pass the absolute
//! ceiling. Everything else is expired with the token stored on the task,
//! which returns it to the pool (retry + 1) or ends it as `failed_timeout`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use skynet_core::{ConfigError, ReaperSettings, epoch_millis};
use skynet_gateway::GatewayClient;
use skynet_health::{ProbeResult, probe_worker};
use skynet_state::{HealthStatus, StateResult, StateStore, Task, TaskId, TaskStatus};

#[derive(Debug, Clone)]
pub struct ReaperPolicy {
    pub ttl: Duration,
    /// Staleness past which owner health no longer protects a claim.
    pub ceiling: Duration,
    pub interval: Duration,
    /// Bound on the optional worker probe through the assigned gateway.
    pub probe_timeout: Duration,
}

impl Default for ReaperPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            ceiling: Duration::from_secs(3600),
            interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl ReaperPolicy {
    pub fn from_settings(settings: &ReaperSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            ttl: settings.ttl()?,
            ceiling: settings.ceiling()?,
            interval: settings.interval()?,
            ..Self::default()
        })
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub stale: usize,
    /// Returned to the pool with one more retry consumed.
    pub released: Vec<TaskId>,
    /// Out of retries: now `failed_timeout`.
    pub timed_out: Vec<TaskId>,
    /// Stale but the owner is alive and the ceiling not reached.
    pub spared: Vec<TaskId>,
}

pub struct Reaper {
    state: StateStore,
    client: Option<Arc<dyn GatewayClient>>,
    policy: ReaperPolicy,
}

impl Reaper {
    pub fn new(state: StateStore, policy: ReaperPolicy) -> Self {
        Self {
            state,
            client: None,
            policy,
        }
    }

    /// Confirm owner liveness by probing the worker behind its gateway.
    pub fn with_client(mut self, client: Arc<dyn GatewayClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// One pass over stale claims as of `now` (epoch millis).
    pub async fn reap_at(&self, now: u64) -> StateResult<ReapReport> {
        let mut report = ReapReport::default();
        let ceiling_ms = self.policy.ceiling.as_millis() as u64;

        for task in self.state.list_stale(self.policy.ttl, now)? {
            report.stale += 1;
            let Some(token) = task.claim_token.clone() else {
                continue;
            };
            let age_ms = task.locked_at.map_or(0, |at| now.saturating_sub(at));

            if age_ms <= ceiling_ms && self.owner_alive(&task, now).await? {
                debug!(task_id = %task.task_id, owner = ?task.locked_by, age_ms, "stale claim spared, owner alive");
                report.spared.push(task.task_id);
                continue;
            }

            let reason = if age_ms > ceiling_ms {
                format!("claim exceeded ceiling ({age_ms}ms since lock)")
            } else {
                format!("owner unresponsive ({age_ms}ms since lock)")
            };

            match self.state.expire(&task.task_id, &token, &reason) {
                Ok(expired) if expired.status == TaskStatus::FailedTimeout => {
                    warn!(task_id = %expired.task_id, retries = expired.retry_count, "task timed out permanently");
                    report.timed_out.push(expired.task_id);
                }
                Ok(expired) => report.released.push(expired.task_id),
                // The owner finished between the scan and the expire.
                Err(e) if e.is_stale() => {
                    debug!(task_id = %task.task_id, error = %e, "stale claim already settled");
                }
                Err(e) => return Err(e),
            }
        }

        if report.stale > 0 {
            info!(
                stale = report.stale,
                released = report.released.len(),
                timed_out = report.timed_out.len(),
                spared = report.spared.len(),
                "reaper pass complete"
            );
        }
        Ok(report)
    }

    /// An owner is alive when its worker record is fresh and not unhealthy,
    /// and the gateway running its task (if any) is not unhealthy. Owners
    /// with neither record are presumed dead.
    async fn owner_alive(&self, task: &Task, now: u64) -> StateResult<bool> {
        let ttl_ms = self.policy.ttl.as_millis() as u64;

        let worker = match task.locked_by.as_deref() {
            Some(owner) => self.state.get_worker(owner)?,
            None => None,
        };
        if let Some(worker) = &worker {
            let fresh = now.saturating_sub(worker.last_heartbeat) <= ttl_ms;
            if worker.status == HealthStatus::Unhealthy || !fresh {
                return Ok(false);
            }
        }

        let gateway = match task.assigned_gateway.as_deref() {
            Some(id) => self.state.get_gateway(id)?,
            None => None,
        };
        match gateway {
            Some(gw) if gw.status == HealthStatus::Unhealthy => Ok(false),
            Some(gw) => match &self.client {
                Some(client) => {
                    let probe = probe_worker(&**client, &gw.endpoint, self.policy.probe_timeout).await;
                    Ok(probe == ProbeResult::Healthy)
                }
                None => Ok(true),
            },
            None => Ok(worker.is_some()),
        }
    }

    /// Reap every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            ttl = ?self.policy.ttl,
            ceiling = ?self.policy.ceiling,
            interval = ?self.policy.interval,
            "reaper started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {
                    if let Err(e) = self.reap_at(epoch_millis()).await {
                        error!(error = %e, "reaper pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("reaper shutting down");
                    break;
                }
            }
        }
    }
}
