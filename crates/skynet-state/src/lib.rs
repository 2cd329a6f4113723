//! skynet-state: authoritative task store for the Skynet control plane.
//!
//! Backed by [redb](https://docs.rs/redb), holds tasks, resource ownership,
//! the task event log, and the gateway/worker registry.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every state change runs in one write transaction together with its
//! resource locks and its event, so readers never observe a half-applied
//! transition.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is shared by every scheduler loop, the reaper, and the health monitor.

pub mod error;
pub mod events;
pub mod readiness;
pub mod registry;
pub mod store;
pub mod tables;
pub mod tasks;
pub mod types;

pub use error::{StateError, StateResult};
pub use readiness::ReadyTasks;
pub use store::StateStore;
pub use types::*;
