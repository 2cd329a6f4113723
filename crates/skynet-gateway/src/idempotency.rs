//! Idempotent dispatch wrapper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::client::{DispatchError, DispatchRequest, DispatchResponse, GatewayClient, GatewayStatus};

type Key = (String, String);

/// Wraps a client so each `(task_id, idempotency_key)` executes at most once.
///
/// Concurrent callers with the same key wait on the first call. Responses
/// are remembered; transport errors are not, so a retry after
/// `GatewayUnavailable` dispatches again.
pub struct IdempotentGateway<C> {
    inner: C,
    outcomes: Mutex<HashMap<Key, Arc<OnceCell<DispatchResponse>>>>,
}

impl<C: GatewayClient> IdempotentGateway<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn remembered(&self) -> usize {
        self.outcomes
            .lock()
            .map(|o| o.values().filter(|cell| cell.initialized()).count())
            .unwrap_or(0)
    }

    fn cell(&self, key: Key) -> Arc<OnceCell<DispatchResponse>> {
        match self.outcomes.lock() {
            Ok(mut outcomes) => outcomes.entry(key).or_default().clone(),
            // A poisoned map only loses the cache; dispatch still proceeds.
            Err(_) => Arc::new(OnceCell::new()),
        }
    }
}

#[async_trait]
impl<C: GatewayClient> GatewayClient for IdempotentGateway<C> {
    async fn execute_task(
        &self,
        endpoint: &str,
        request: &DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let cell = self.cell((request.task_id.clone(), request.idempotency_key.clone()));
        if let Some(previous) = cell.get() {
            debug!(task_id = %request.task_id, "replaying remembered dispatch outcome");
            return Ok(previous.clone());
        }
        cell.get_or_try_init(|| self.inner.execute_task(endpoint, request))
            .await
            .cloned()
    }

    async fn get_gateway_status(&self, endpoint: &str) -> Result<GatewayStatus, DispatchError> {
        self.inner.get_gateway_status(endpoint).await
    }

    async fn get_worker_status(&self, endpoint: &str) -> Result<GatewayStatus, DispatchError> {
        self.inner.get_worker_status(endpoint).await
    }

    fn forget(&self, task_id: &str) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.retain(|(id, _), _| id != task_id);
        }
        self.inner.forget(task_id);
    }
}
