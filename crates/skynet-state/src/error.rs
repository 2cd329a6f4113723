//! Error types for the Skynet task store.

use thiserror::Error;

use crate::types::TaskStatus;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    DuplicateTask(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("claim conflict on {task_id}: status is {status}")]
    ClaimConflict { task_id: String, status: TaskStatus },

    #[error("dependency {dependency} of {task_id} has not succeeded")]
    DependencyNotSatisfied { task_id: String, dependency: String },

    #[error("resource {resource} needed by {task_id} is held by {holder}")]
    ResourceConflict {
        task_id: String,
        resource: String,
        holder: String,
    },

    #[error("stale claim token for {task_id}")]
    StaleClaim { task_id: String },

    #[error("illegal transition for {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl StateError {
    /// Expected under concurrent schedulers; skip the task and move on.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StateError::ClaimConflict { .. }
                | StateError::DependencyNotSatisfied { .. }
                | StateError::ResourceConflict { .. }
        )
    }

    /// Caller used an outdated token or state; the store was not mutated.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            StateError::StaleClaim { .. } | StateError::IllegalTransition { .. }
        )
    }
}
