//! In-process gateway for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::client::{DispatchError, DispatchRequest, DispatchResponse, GatewayClient, GatewayStatus};

/// Scripted behaviour for one task.
#[derive(Debug, Clone)]
enum Script {
    Fail(Value),
    Hang,
}

#[derive(Debug, Default)]
struct Inner {
    executions: HashMap<String, usize>,
    log: Vec<(String, DispatchRequest)>,
    scripts: HashMap<String, Script>,
    down: HashSet<String>,
    unavailable: bool,
    agent_connected: bool,
}

/// Gateway that runs nothing and records every dispatch it receives.
///
/// Every call counts as an execution; wrap it in
/// [`IdempotentGateway`](crate::IdempotentGateway) for deduplication.
/// Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryGateway {
    inner: Arc<Mutex<Inner>>,
    delay: Duration,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                agent_connected: true,
                ..Default::default()
            })),
            delay: Duration::ZERO,
        }
    }

    /// Delay every dispatch by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make dispatches of `task_id` report failure with `error`.
    pub fn fail_task(&self, task_id: &str, error: Value) {
        self.lock().scripts.insert(task_id.to_string(), Script::Fail(error));
    }

    /// Make dispatches of `task_id` never return.
    pub fn hang_task(&self, task_id: &str) {
        self.lock().scripts.insert(task_id.to_string(), Script::Hang);
    }

    /// Toggle reachability of every endpoint.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Toggle reachability of one endpoint.
    pub fn set_endpoint_available(&self, endpoint: &str, available: bool) {
        let mut inner = self.lock();
        if available {
            inner.down.remove(endpoint);
        } else {
            inner.down.insert(endpoint.to_string());
        }
    }

    pub fn set_agent_connected(&self, connected: bool) {
        self.lock().agent_connected = connected;
    }

    /// Times `task_id` reached the gateway.
    pub fn executions(&self, task_id: &str) -> usize {
        self.lock().executions.get(task_id).copied().unwrap_or(0)
    }

    pub fn total_executions(&self) -> usize {
        self.lock().log.len()
    }

    /// Every dispatch received, as `(endpoint, request)`, oldest first.
    pub fn dispatched(&self) -> Vec<(String, DispatchRequest)> {
        self.lock().log.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self, endpoint: &str) -> Result<(), DispatchError> {
        let inner = self.lock();
        if inner.unavailable || inner.down.contains(endpoint) {
            return Err(DispatchError::GatewayUnavailable(format!(
                "{endpoint}: connection refused"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl GatewayClient for MemoryGateway {
    async fn execute_task(
        &self,
        endpoint: &str,
        request: &DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        self.check_reachable(endpoint)?;

        let script = {
            let mut inner = self.lock();
            *inner.executions.entry(request.task_id.clone()).or_default() += 1;
            inner.log.push((endpoint.to_string(), request.clone()));
            inner.scripts.get(&request.task_id).cloned()
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match script {
            Some(Script::Fail(error)) => Ok(DispatchResponse::Failed { error }),
            Some(Script::Hang) => std::future::pending().await,
            None => Ok(DispatchResponse::Succeeded {
                result: json!({
                    "endpoint": endpoint,
                    "action": request.action,
                }),
            }),
        }
    }

    async fn get_gateway_status(&self, endpoint: &str) -> Result<GatewayStatus, DispatchError> {
        self.check_reachable(endpoint)?;
        let connected = self.lock().agent_connected;
        Ok(GatewayStatus {
            agent_connected: Some(connected),
            body: json!({ "status": "ok", "agent_connected": connected }),
        })
    }
}
