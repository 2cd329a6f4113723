//! Scheduler loop: claim, place, dispatch, record.
//!
//! Each iteration:
//! - heartbeats this loop's worker record
//! - lists up to `batch_size` ready tasks any registered gateway could run
//! - claims each one, skipping tasks another loop won
//! - selects a gateway, releasing the task when none is viable
//! - starts the task and dispatches it under `dispatch_timeout`, renewing
//!   the claim while the call is in flight
//! - completes or fails the task with the same claim token

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use skynet_core::{ConfigError, SchedulerSettings};
use skynet_gateway::{DispatchError, DispatchRequest, DispatchResponse, GatewayClient};
use skynet_placement::{SelectionRequest, Selector};
use skynet_state::{Claim, Gateway, StateResult, StateStore, Task};

use crate::error::SchedulerResult;

/// Timing and batching for one scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub dispatch_timeout: Duration,
    pub renew_interval: Duration,
    pub renew_extension: Duration,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(1500),
            dispatch_timeout: Duration::from_secs(120),
            renew_interval: Duration::from_secs(30),
            renew_extension: Duration::from_secs(300),
        }
    }
}

impl SchedulerPolicy {
    pub fn from_settings(settings: &SchedulerSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            batch_size: settings.batch_size,
            poll_interval: settings.poll_interval()?,
            dispatch_timeout: settings.dispatch_timeout()?,
            renew_interval: settings.renew_interval()?,
            renew_extension: settings.renew_extension()?,
        })
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Ready tasks considered.
    pub considered: usize,
    /// Lost the claim race or no longer ready.
    pub skipped: usize,
    /// Claimed but not dispatched (no viable gateway); put back.
    pub released: usize,
    pub succeeded: usize,
    /// Failed or sent back for retry after a dispatch failure.
    pub failed: usize,
    /// Claim taken over (typically by the reaper) before we finished.
    pub lost: usize,
    /// Store errors that left a claimed task unsettled.
    pub errors: usize,
}

impl TickReport {
    pub fn dispatched(&self) -> usize {
        self.succeeded + self.failed + self.lost
    }
}

/// How a single claimed task ended for this loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    Released,
    Lost,
}

/// One scheduler loop. Any number may share a store.
pub struct Scheduler {
    worker_id: String,
    state: StateStore,
    client: Arc<dyn GatewayClient>,
    selector: Selector,
    policy: SchedulerPolicy,
}

impl Scheduler {
    pub fn new(state: StateStore, client: Arc<dyn GatewayClient>, policy: SchedulerPolicy) -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self {
            worker_id: format!("scheduler-{}", &hex[..8]),
            state,
            client,
            selector: Selector::default(),
            policy,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    /// Owner id written into every claim this loop makes.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Register this loop as a worker, advertising what the gateways offer.
    pub fn register(&self) -> StateResult<()> {
        let capabilities = self.gateway_capabilities()?;
        self.state.register_worker(&self.worker_id, None, capabilities)?;
        Ok(())
    }

    /// Run one iteration.
    pub async fn run_once(&self) -> SchedulerResult<TickReport> {
        let mut report = TickReport::default();

        if !self.state.worker_heartbeat(&self.worker_id)? {
            self.register()?;
        }

        let gateways = self.state.list_gateways()?;
        if gateways.is_empty() {
            debug!(worker_id = %self.worker_id, "no gateways registered, nothing to schedule");
            return Ok(report);
        }
        let filter: BTreeSet<String> = gateways
            .iter()
            .flat_map(|gw| gw.capabilities.iter().cloned())
            .collect();

        let ready = self.state.list_ready(self.policy.batch_size, Some(&filter))?;
        for task_id in ready {
            report.considered += 1;

            let claim = match self.state.claim(&task_id, &self.worker_id) {
                Ok(claim) => claim,
                Err(e) if e.is_contention() => {
                    debug!(%task_id, reason = %e, "claim skipped");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self.process(claim).await {
                Ok(Outcome::Succeeded) => report.succeeded += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Released) => report.released += 1,
                Ok(Outcome::Lost) => report.lost += 1,
                Err(e) => {
                    error!(%task_id, error = %e, "task left unsettled, the reaper will recover it");
                    report.errors += 1;
                }
            }
        }

        if report.considered > 0 {
            debug!(worker_id = %self.worker_id, ?report, "scheduler tick");
        }
        Ok(report)
    }

    /// Place and dispatch a task this loop owns.
    async fn process(&self, claim: Claim) -> SchedulerResult<Outcome> {
        let gateways = self.state.list_gateways()?;
        self.place(claim, &gateways).await
    }

    /// Select from `gateways`, dispatch, and settle the claim.
    ///
    /// Gateway bookkeeping failures are logged and never keep the task from
    /// reaching `complete` or `fail`.
    async fn place(&self, claim: Claim, gateways: &[Gateway]) -> SchedulerResult<Outcome> {
        let task_id = claim.task.task_id.clone();
        let token = claim.claim_token.clone();

        let gateway_id = match self.selector.select(gateways, &SelectionRequest::from(&claim.task)) {
            Ok(id) => id,
            Err(e) => {
                warn!(%task_id, error = %e, "no viable gateway, releasing");
                return self.settle(&task_id, self.state.release(&task_id, &token), Outcome::Released);
            }
        };
        let endpoint = gateways
            .iter()
            .find(|gw| gw.gateway_id == gateway_id)
            .map(|gw| gw.endpoint.clone())
            .unwrap_or_default();

        if let Err(e) = self.state.begin_dispatch(&gateway_id) {
            error!(%task_id, %gateway_id, error = %e, "could not record dispatch, releasing");
            return self.settle(&task_id, self.state.release(&task_id, &token), Outcome::Released);
        }
        if let Err(e) = self.state.start(&task_id, &token, Some(&gateway_id)) {
            self.end_dispatch(&task_id, &gateway_id);
            return self.settle(&task_id, Err(e), Outcome::Lost);
        }

        info!(%task_id, %gateway_id, "dispatching");
        let started = Instant::now();
        let result = self.dispatch(&claim.task, &token, &endpoint).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        self.end_dispatch(&task_id, &gateway_id);
        let success = matches!(result, Ok(DispatchResponse::Succeeded { .. }));
        if let Err(e) = self.state.record_outcome(&gateway_id, success, latency_ms) {
            error!(%task_id, %gateway_id, error = %e, "could not record dispatch outcome");
        }

        let outcome = match result {
            Ok(DispatchResponse::Succeeded { result }) => {
                info!(%task_id, %gateway_id, latency_ms, "task succeeded");
                self.settle(&task_id, self.state.complete(&task_id, &token, result), Outcome::Succeeded)
            }
            Ok(DispatchResponse::Failed { error }) => {
                warn!(%task_id, %gateway_id, %error, "task failed on gateway");
                self.settle(&task_id, self.state.fail(&task_id, &token, error), Outcome::Failed)
            }
            Err(e) => {
                warn!(%task_id, %gateway_id, error = %e, "dispatch failed");
                let payload = dispatch_error_payload(&e, &gateway_id);
                self.settle(&task_id, self.state.fail(&task_id, &token, payload), Outcome::Failed)
            }
        };
        self.client.forget(&task_id);
        outcome
    }

    fn end_dispatch(&self, task_id: &str, gateway_id: &str) {
        if let Err(e) = self.state.end_dispatch(gateway_id) {
            error!(%task_id, %gateway_id, error = %e, "could not record dispatch end");
        }
    }

    /// Execute on the gateway, renewing the claim until the call returns or
    /// the dispatch timeout fires.
    async fn dispatch(
        &self,
        task: &Task,
        token: &str,
        endpoint: &str,
    ) -> Result<DispatchResponse, DispatchError> {
        let request = DispatchRequest {
            task_id: task.task_id.clone(),
            action: task.action.clone(),
            idempotency_key: token.to_string(),
        };

        let mut call = self.client.execute_task(endpoint, &request);
        let deadline = tokio::time::sleep(self.policy.dispatch_timeout);
        tokio::pin!(deadline);
        let period = self.policy.renew_interval.max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                result = &mut call => return result,
                _ = &mut deadline => return Err(DispatchError::Timeout(self.policy.dispatch_timeout)),
                _ = renew.tick() => {
                    match self.state.renew(&task.task_id, token, self.policy.renew_extension) {
                        Ok(_) => debug!(task_id = %task.task_id, "claim renewed"),
                        Err(e) if e.is_stale() => {
                            warn!(task_id = %task.task_id, "claim lost while dispatching");
                        }
                        Err(e) => error!(task_id = %task.task_id, error = %e, "claim renewal failed"),
                    }
                }
            }
        }
    }

    /// Map a token-checked store call to an outcome. Stale tokens mean the
    /// claim was taken over; the store was not touched.
    fn settle(&self, task_id: &str, result: StateResult<Task>, outcome: Outcome) -> SchedulerResult<Outcome> {
        match result {
            Ok(_) => Ok(outcome),
            Err(e) if e.is_stale() => {
                warn!(%task_id, error = %e, "claim no longer ours, dropping");
                Ok(Outcome::Lost)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn gateway_capabilities(&self) -> StateResult<BTreeSet<String>> {
        Ok(self
            .state
            .list_gateways()?
            .into_iter()
            .flat_map(|gw| gw.capabilities)
            .collect())
    }

    /// Iterate every `poll_interval` until shutdown. In-flight dispatches
    /// finish before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.register() {
            error!(worker_id = %self.worker_id, error = %e, "worker registration failed");
        }
        info!(
            worker_id = %self.worker_id,
            batch_size = self.policy.batch_size,
            poll_interval = ?self.policy.poll_interval,
            "scheduler loop started"
        );

        loop {
            match self.run_once().await {
                Ok(report) if report.considered > 0 => {
                    info!(
                        worker_id = %self.worker_id,
                        succeeded = report.succeeded,
                        failed = report.failed,
                        released = report.released,
                        skipped = report.skipped,
                        "scheduler iteration complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(worker_id = %self.worker_id, error = %e, "scheduler iteration failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.policy.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!(worker_id = %self.worker_id, "scheduler loop shutting down");
                    break;
                }
            }
        }
    }
}

fn dispatch_error_payload(e: &DispatchError, gateway_id: &str) -> serde_json::Value {
    match e {
        DispatchError::Timeout(after) => json!({
            "error": "dispatch_timeout",
            "gateway_id": gateway_id,
            "timeout_ms": after.as_millis() as u64,
        }),
        DispatchError::GatewayUnavailable(detail) => json!({
            "error": "gateway_unavailable",
            "gateway_id": gateway_id,
            "detail": detail,
        }),
        DispatchError::Protocol(detail) => json!({
            "error": "gateway_protocol",
            "gateway_id": gateway_id,
            "detail": detail,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skynet_gateway::{IdempotentGateway, MemoryGateway};
    use skynet_state::{GatewayRegistration, HealthStatus, NewTask, TaskStatus};

    fn register_gateway(state: &StateStore, id: &str, caps: &[&str]) {
        state
            .register_gateway(GatewayRegistration {
                gateway_id: id.to_string(),
                endpoint: format!("mem://{id}"),
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
                capacity: 4,
            })
            .unwrap();
    }

    fn scheduler(state: &StateStore, gateway: &MemoryGateway, policy: SchedulerPolicy) -> Scheduler {
        Scheduler::new(
            state.clone(),
            Arc::new(IdempotentGateway::new(gateway.clone())),
            policy,
        )
        .with_worker_id("sched-test")
    }

    #[tokio::test]
    async fn dispatches_and_completes() {
        let state = StateStore::open_in_memory().unwrap();
        register_gateway(&state, "gw", &["shell"]);
        state.enqueue(NewTask::new(json!({"action": "ls"})).with_id("t1")).unwrap();
        let gateway = MemoryGateway::new();

        let report = scheduler(&state, &gateway, SchedulerPolicy::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        let task = state.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.assigned_gateway.as_deref(), Some("gw"));
        assert!(task.claim_token.is_none());

        let gw = state.get_gateway("gw").unwrap().unwrap();
        assert_eq!(gw.active_jobs, 0);
        assert_eq!(gw.success_count, 1);
        assert!(gw.avg_latency_ms.is_some());

        let (endpoint, request) = &gateway.dispatched()[0];
        assert_eq!(endpoint, "mem://gw");
        assert_eq!(request.task_id, "t1");
        assert!(!request.idempotency_key.is_empty());
    }

    #[tokio::test]
    async fn bookkeeping_errors_do_not_block_completion() {
        let state = StateStore::open_in_memory().unwrap();
        register_gateway(&state, "gw", &[]);
        state.enqueue(NewTask::new(json!({})).with_id("t1")).unwrap();
        let gateway = MemoryGateway::new().with_delay(Duration::from_millis(100));
        let sched = scheduler(&state, &gateway, SchedulerPolicy::default());

        // The gateway record vanishes mid-dispatch, so end_dispatch and
        // record_outcome both fail.
        let (report, _) = tokio::join!(sched.run_once(), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(state.deregister_gateway("gw").unwrap());
        });

        let report = report.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.errors, 0);
        let task = state.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.claim_token.is_none());
    }

    #[tokio::test]
    async fn unrecorded_dispatch_releases_task() {
        let state = StateStore::open_in_memory().unwrap();
        register_gateway(&state, "gw", &[]);
        state.enqueue(NewTask::new(json!({})).with_id("t1")).unwrap();
        let gateway = MemoryGateway::new();
        let sched = scheduler(&state, &gateway, SchedulerPolicy::default());

        let snapshot = state.list_gateways().unwrap();
        state.deregister_gateway("gw").unwrap();
        let claim = state.claim("t1", sched.worker_id()).unwrap();

        let outcome = sched.place(claim, &snapshot).await.unwrap();
        assert_eq!(outcome, Outcome::Released);
        let task = state.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Released);
        assert_eq!(task.retry_count, 0);
        assert_eq!(gateway.total_executions(), 0);
    }

    #[tokio::test]
    async fn no_gateways_means_no_claims() {
        let state = StateStore::open_in_memory().unwrap();
        state.enqueue(NewTask::new(json!({})).with_id("t1")).unwrap();

        let report = scheduler(&state, &MemoryGateway::new(), SchedulerPolicy::default())
            .run_once()
            .await
            .unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(state.get_task("t1").unwrap().unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn unhealthy_only_candidate_releases() {
        let state = StateStore::open_in_memory().unwrap();
        register_gateway(&state, "g1", &["docker"]);
        register_gateway(&state, "g2", &["shell"]);
        state.set_gateway_status("g1", HealthStatus::Unhealthy).unwrap();
        state
            .enqueue(NewTask::new(json!({})).with_id("t1").requires("docker"))
            .unwrap();
        let gateway = MemoryGateway::new();

        let report = scheduler(&state, &gateway, SchedulerPolicy::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.released, 1);
        let task = state.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Released);
        assert_eq!(task.retry_count, 0);
        assert_eq!(gateway.total_executions(), 0);
    }

    #[tokio::test]
    async fn gateway_failure_consumes_retry() {
        let state = StateStore::open_in_memory().unwrap();
        register_gateway(&state, "gw", &[]);
        state
            .enqueue(NewTask::new(json!({})).with_id("t1").with_max_retries(1))
            .unwrap();
        let gateway = MemoryGateway::new();
        gateway.fail_task("t1", json!("exit 1"));
        let sched = scheduler(&state, &gateway, SchedulerPolicy::default());

        sched.run_once().await.unwrap();
        let task = state.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Released);
        assert_eq!(task.retry_count, 1);

        sched.run_once().await.unwrap();
        let task = state.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error, Some(json!("exit 1")));
        assert_eq!(state.get_gateway("gw").unwrap().unwrap().failure_count, 2);
    }

    #[tokio::test]
    async fn dispatch_timeout_fails_task() {
        let state = StateStore::open_in_memory().unwrap();
        register_gateway(&state, "gw", &[]);
        state
            .enqueue(NewTask::new(json!({})).with_id("slow").with_max_retries(0))
            .unwrap();
        let gateway = MemoryGateway::new();
        gateway.hang_task("slow");
        let policy = SchedulerPolicy {
            dispatch_timeout: Duration::from_millis(50),
            renew_interval: Duration::from_millis(10),
            ..SchedulerPolicy::default()
        };

        let report = scheduler(&state, &gateway, policy).run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let task = state.get_task("slow").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap()["error"], "dispatch_timeout");
        assert_eq!(state.get_gateway("gw").unwrap().unwrap().active_jobs, 0);
    }

    #[tokio::test]
    async fn renews_while_dispatch_in_flight() {
        let state = StateStore::open_in_memory().unwrap();
        register_gateway(&state, "gw", &[]);
        state.enqueue(NewTask::new(json!({})).with_id("t1")).unwrap();
        let gateway = MemoryGateway::new().with_delay(Duration::from_millis(80));
        let policy = SchedulerPolicy {
            renew_interval: Duration::from_millis(20),
            ..SchedulerPolicy::default()
        };

        scheduler(&state, &gateway, policy).run_once().await.unwrap();

        let renewals = state
            .task_events("t1")
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == skynet_state::EventType::Renewed)
            .count();
        assert!(renewals >= 1);
        assert_eq!(state.get_task("t1").unwrap().unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn unavailable_gateway_fails_with_payload() {
        let state = StateStore::open_in_memory().unwrap();
        register_gateway(&state, "gw", &[]);
        state.enqueue(NewTask::new(json!({})).with_id("t1")).unwrap();
        let gateway = MemoryGateway::new();
        gateway.set_available(false);

        scheduler(&state, &gateway, SchedulerPolicy::default())
            .run_once()
            .await
            .unwrap();

        let task = state.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Released);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error.unwrap()["error"], "gateway_unavailable");
    }

    #[tokio::test]
    async fn registers_itself_as_worker() {
        let state = StateStore::open_in_memory().unwrap();
        register_gateway(&state, "gw", &["shell", "docker"]);
        let sched = scheduler(&state, &MemoryGateway::new(), SchedulerPolicy::default());

        sched.run_once().await.unwrap();
        let worker = state.get_worker("sched-test").unwrap().unwrap();
        assert!(worker.capabilities.contains("docker"));
    }

    #[test]
    fn policy_from_settings() {
        let policy = SchedulerPolicy::from_settings(&SchedulerSettings::default()).unwrap();
        assert_eq!(policy.poll_interval, Duration::from_millis(1500));
        assert_eq!(policy.dispatch_timeout, Duration::from_secs(120));
    }
}
