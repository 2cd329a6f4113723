//! redb table definitions for the Skynet task store.
//!
//! String-keyed tables hold JSON-serialized domain types. The event log is
//! keyed by its sequence number so cursor reads are range scans.

use redb::TableDefinition;

/// Tasks keyed by `task_id`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Active resource ownership keyed by `resource_key`.
pub const RESOURCE_LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_locks");

/// Gateways keyed by `gateway_id`.
pub const GATEWAYS: TableDefinition<&str, &[u8]> = TableDefinition::new("gateways");

/// Workers keyed by `worker_id`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Task events keyed by `event_id`.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

/// Monotonic counters (`event_seq`, `task_seq`).
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub(crate) const EVENT_SEQ: &str = "event_seq";
pub(crate) const TASK_SEQ: &str = "task_seq";
