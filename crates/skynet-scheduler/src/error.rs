//! Scheduler error types.

use thiserror::Error;

/// Errors that stop a scheduler or reaper iteration.
///
/// Claim contention and stale tokens never surface here; they are handled
/// inside the loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] skynet_state::StateError),

    #[error(transparent)]
    NoCandidate(#[from] skynet_placement::NoCandidateError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] skynet_gateway::DispatchError),

    #[error("configuration error: {0}")]
    Config(#[from] skynet_core::ConfigError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
