//! skynet-placement: choose the execution gateway for a claimed task.
//!
//! This crate only decides; it never dispatches. The scheduler loop feeds
//! it the registered gateways and the task's capability needs and gets back
//! a gateway id or a `NoCandidateError`.
//!
//! # Components
//!
//! - **`scorer`**: Per-gateway factor scoring (health, load, capability, success, latency)
//! - **`selector`**: Hard filtering, deterministic selection, and `explain`

pub mod scorer;
pub mod selector;

pub use scorer::{GatewayScore, ScoreBreakdown, ScoringWeights, score_gateway};
pub use selector::{Explanation, NoCandidateError, Rejection, SelectionRequest, Selector};
