//! Domain types for the Skynet task store.
//!
//! These types represent the persisted state of tasks, resource ownership,
//! gateways, workers, and the task event log. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Unique identifier for a task.
pub type TaskId = String;

/// Opaque identifier of whoever holds a claim (scheduler loop, worker, agent).
pub type OwnerId = String;

// ── Task ───────────────────────────────────────────────────────────

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Released,
    FailedTimeout,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Queued,
        TaskStatus::Claimed,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Released,
        TaskStatus::FailedTimeout,
    ];

    /// Waiting for a claim.
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Released)
    }

    /// Held by an owner: lock fields are set.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }

    /// No further transitions possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::FailedTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Released => "released",
            TaskStatus::FailedTimeout => "failed_timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// A unit of work as persisted in the store.
///
/// Mutated only through the claim/transition API on `StateStore`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    /// Opaque payload, interpreted only by the gateway.
    pub action: serde_json::Value,
    /// Every one of these must be advertised by the executing gateway.
    pub required_capabilities: BTreeSet<String>,
    /// Bonus capabilities that raise a gateway's score when matched.
    pub preferred_capabilities: BTreeSet<String>,
    /// Higher runs first.
    pub priority: i32,
    pub status: TaskStatus,
    pub dependencies: BTreeSet<TaskId>,
    /// Reverse edges, maintained by enqueue.
    pub dependents: BTreeSet<TaskId>,
    /// Resource keys held exclusively while the task is claimed or running.
    pub required_files: BTreeSet<String>,
    /// Resource keys currently owned by this task (required plus explicit claims).
    pub held_resources: BTreeSet<String>,
    pub locked_by: Option<OwnerId>,
    pub claim_token: Option<String>,
    /// Epoch millis of the claim or the latest renewal.
    pub locked_at: Option<u64>,
    pub preferred_gateway: Option<String>,
    /// Gateway the current (or last) attempt was dispatched to.
    pub assigned_gateway: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    /// Insertion order, used as the final readiness tie-breaker.
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Task {
    /// True if `token` is the live claim token for this task.
    pub fn holds_token(&self, token: &str) -> bool {
        self.claim_token.as_deref() == Some(token)
    }

    pub(crate) fn clear_lock(&mut self) {
        self.locked_by = None;
        self.claim_token = None;
        self.locked_at = None;
        self.held_resources.clear();
    }
}

/// Request to enqueue a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTask {
    /// Generated as `task-<12 hex>` when absent.
    pub task_id: Option<TaskId>,
    pub action: serde_json::Value,
    pub required_capabilities: BTreeSet<String>,
    pub preferred_capabilities: BTreeSet<String>,
    pub dependencies: BTreeSet<TaskId>,
    pub required_files: BTreeSet<String>,
    pub priority: i32,
    /// Falls back to the store's configured default.
    pub max_retries: Option<u32>,
    pub preferred_gateway: Option<String>,
}

impl NewTask {
    pub fn new(action: serde_json::Value) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.insert(task_id.into());
        self
    }

    pub fn with_file(mut self, key: impl Into<String>) -> Self {
        self.required_files.insert(key.into());
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn prefers(mut self, capability: impl Into<String>) -> Self {
        self.preferred_capabilities.insert(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn on_gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.preferred_gateway = Some(gateway_id.into());
        self
    }
}

/// Result of a successful claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    pub claim_token: String,
    /// Snapshot of the task right after the claim.
    pub task: Task,
}

/// Filter for `StateStore::list_tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub owner: Option<OwnerId>,
}

// ── Resource ownership ─────────────────────────────────────────────

/// Exclusive hold on a resource key by an active task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLock {
    pub resource_key: String,
    pub owner_task_id: TaskId,
    pub claim_token: String,
    pub acquired_at: u64,
}

// ── Readiness diagnostics ──────────────────────────────────────────

/// Why a task is (or is not) claimable right now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnosis {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub ready: bool,
    /// Dependencies that have not succeeded, with their status (`None` if missing).
    pub unmet_dependencies: BTreeMap<TaskId, Option<TaskStatus>>,
    /// Required resources held by other tasks: resource_key → owner task.
    pub busy_resources: BTreeMap<String, TaskId>,
    pub required_capabilities: BTreeSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<serde_json::Value>,
}

// ── Events ─────────────────────────────────────────────────────────

/// Kind of a task event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Enqueued,
    Claimed,
    Started,
    Renewed,
    Succeeded,
    Failed,
    Released,
    TimedOut,
    Cancelled,
    ResourceClaimed,
}

/// One entry in the append-only task event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    /// Global, strictly increasing.
    pub event_id: u64,
    pub task_id: TaskId,
    pub event_type: EventType,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub owner: Option<OwnerId>,
    pub claim_token: Option<String>,
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

/// A page of events returned by `poll`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPage {
    pub events: Vec<TaskEvent>,
    /// Pass back to `poll` to continue after the last returned event.
    pub next_cursor: u64,
}

// ── Gateways and workers ───────────────────────────────────────────

/// Health of a gateway or worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An execution gateway. Never deleted automatically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gateway {
    pub gateway_id: String,
    pub endpoint: String,
    pub capabilities: BTreeSet<String>,
    /// Concurrent jobs the gateway accepts; 0 means no free capacity.
    pub capacity: u32,
    pub status: HealthStatus,
    pub last_heartbeat: u64,
    pub active_jobs: u32,
    pub success_count: u64,
    pub failure_count: u64,
    /// Exponentially weighted moving average of dispatch latency.
    pub avg_latency_ms: Option<f64>,
    pub registered_at: u64,
}

/// Registration payload for a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRegistration {
    pub gateway_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
}

/// A worker (scheduler loop, agent process) that can own claims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub worker_id: String,
    /// Gateway the worker executes through, if any.
    pub gateway_id: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub status: HealthStatus,
    pub last_heartbeat: u64,
    pub registered_at: u64,
}

// ── Aggregate state ────────────────────────────────────────────────

/// Snapshot returned by `StateStore::system_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemState {
    pub timestamp: u64,
    pub tasks: BTreeMap<TaskStatus, usize>,
    pub gateways: BTreeMap<HealthStatus, usize>,
    pub workers: BTreeMap<HealthStatus, usize>,
    pub active_resource_locks: usize,
    pub last_event_id: u64,
}
