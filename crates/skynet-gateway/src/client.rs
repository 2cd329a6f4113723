//! Gateway client trait and the dispatch wire types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// One unit of work sent to a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: String,
    /// Opaque payload, passed through untouched.
    pub action: Value,
    /// The claim token of the dispatching owner.
    pub idempotency_key: String,
}

impl DispatchRequest {
    /// JSON body for `POST /action`.
    ///
    /// Object actions are sent as the body itself (so `action`/`params`
    /// fields reach the gateway unchanged); anything else is wrapped as
    /// `{"action": ...}`. `task_id` and `idempotency_key` are always set.
    pub fn to_body(&self) -> Value {
        let mut body = match &self.action {
            Value::Object(map) => Value::Object(map.clone()),
            other => json!({ "action": other }),
        };
        if let Value::Object(map) = &mut body {
            map.entry("params").or_insert_with(|| json!({}));
            map.entry("confirmed").or_insert(Value::Bool(true));
            map.insert("task_id".to_string(), json!(self.task_id));
            map.insert("idempotency_key".to_string(), json!(self.idempotency_key));
        }
        body
    }
}

/// Outcome reported by a gateway for a dispatch it accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResponse {
    Succeeded { result: Value },
    Failed { error: Value },
}

impl DispatchResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchResponse::Succeeded { .. })
    }
}

/// Reported status of a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatus {
    /// Whether a worker/agent is attached behind the gateway, if reported.
    pub agent_connected: Option<bool>,
    /// Raw status document.
    pub body: Value,
}

/// Errors reaching a gateway. None of these mean the work was rejected.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("gateway protocol error: {0}")]
    Protocol(String),
}

/// Execution gateway as seen by the scheduler.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Dispatch `request` to the gateway at `endpoint`.
    async fn execute_task(
        &self,
        endpoint: &str,
        request: &DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError>;

    async fn get_gateway_status(&self, endpoint: &str) -> Result<GatewayStatus, DispatchError>;

    /// Status of the worker behind the gateway.
    async fn get_worker_status(&self, endpoint: &str) -> Result<GatewayStatus, DispatchError> {
        self.get_gateway_status(endpoint).await
    }

    /// Drop anything remembered about `task_id`. Called once its claim
    /// token is dead.
    fn forget(&self, _task_id: &str) {}
}

/// Interpret a gateway's JSON reply.
///
/// `status` of `ok`, `success` or `succeeded` is a success unless
/// `result.returncode` is non-zero. Anything else is a failure carrying
/// the `error` field, or the whole body when there is none.
pub fn evaluate_response(body: Value) -> DispatchResponse {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);
    let ok_status = matches!(status.as_deref(), Some("ok" | "success" | "succeeded"));

    if ok_status {
        let result = body.get("result").cloned().unwrap_or(Value::Null);
        let returncode = result.get("returncode").and_then(Value::as_i64);
        match returncode {
            Some(code) if code != 0 => DispatchResponse::Failed {
                error: json!({ "returncode": code, "result": result }),
            },
            _ => DispatchResponse::Succeeded { result },
        }
    } else {
        let error = match body.get("error") {
            Some(err) if !err.is_null() => err.clone(),
            _ => body,
        };
        DispatchResponse::Failed { error }
    }
}
