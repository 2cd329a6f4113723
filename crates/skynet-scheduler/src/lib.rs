//! skynet-scheduler: the active side of the control plane.
//!
//! Scheduler loops pull ready work, claim it, pick a gateway and dispatch
//! with the claim token as idempotency key. The reaper recovers claims
//! whose owners stopped making progress.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (one per loop, any number per store)
//!   ├── StateStore::list_ready → claim (contention → skip)
//!   ├── Selector::select (no candidate → release)
//!   ├── start → GatewayClient::execute_task (renew while in flight)
//!   └── complete | fail
//!
//! Reaper
//!   ├── StateStore::list_stale(ttl)
//!   ├── owner alive? (worker heartbeat, gateway health, optional probe)
//!   └── expire with the stored claim token
//! ```
//!
//! Loops share nothing in memory; every decision goes through a store
//! transaction.

pub mod error;
pub mod reaper;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use reaper::{ReapReport, Reaper, ReaperPolicy};
pub use scheduler::{Scheduler, SchedulerPolicy, TickReport};
