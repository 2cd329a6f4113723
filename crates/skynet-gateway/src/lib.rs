//! skynet-gateway: the contract between the scheduler and execution gateways.
//!
//! Gateways run the work; the control plane only addresses them by endpoint.
//!
//! # Architecture
//!
//! ```text
//! GatewayClient (trait)
//!   ├── HttpGatewayClient   POST {endpoint}/action, GET {endpoint}/status
//!   ├── MemoryGateway       in-process gateway for tests and dry runs
//!   └── IdempotentGateway   wraps any client, caches by (task_id, idempotency_key)
//! ```
//!
//! A dispatch carries the claim token as its idempotency key. A retried
//! dispatch with the same `(task_id, idempotency_key)` returns the first
//! outcome instead of executing again.

pub mod client;
pub mod http;
pub mod idempotency;
pub mod memory;

pub use client::{
    DispatchError, DispatchRequest, DispatchResponse, GatewayClient, GatewayStatus, evaluate_response,
};
pub use http::HttpGatewayClient;
pub use idempotency::IdempotentGateway;
pub use memory::MemoryGateway;
