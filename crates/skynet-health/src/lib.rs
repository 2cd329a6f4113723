//! skynet-health: liveness of gateways and workers.
//!
//! Status is derived from heartbeat age and, when enabled, from probing
//! each gateway's status endpoint. The reaper consults the result to
//! decide whether a stale claim's owner is still alive.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── sweep(now)
//!   │   ├── classify_heartbeat() → Healthy / Degraded / Unhealthy
//!   │   ├── HealthTracker per gateway (consecutive failures, backoff)
//!   │   └── probe_gateway() via GatewayClient → ProbeResult
//!   └── run(shutdown): periodic sweeps until shutdown
//! ```
//!
//! Only status transitions are written back to the store.

pub mod checker;
pub mod monitor;

pub use checker::{HealthTracker, ProbeResult, probe_gateway, probe_worker};
pub use monitor::{HealthMonitor, HealthPolicy, SweepReport, TargetKind, Transition, classify_heartbeat};
