//! StateStore: redb-backed authority for tasks, locks, and the registry.
//!
//! Every mutation runs inside a single redb write transaction, so the state
//! change, its resource locks and its event commit together or not at all.
//! redb serializes write transactions, which makes `claim` linearizable for
//! every clone of the store in the process.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redb::{
    Database, DatabaseError, ReadTransaction, ReadableDatabase, ReadableTable, Table,
    WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// How long a shared store waits for another process to let go of the file.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LOCK_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone)]
enum Backing {
    /// Open for the life of the store. Other processes cannot open the file.
    Resident(Arc<Database>),
    /// Opened per transaction and closed right after.
    Shared(Arc<SharedFile>),
}

struct SharedFile {
    path: PathBuf,
    /// redb allows one open handle per file, this process included.
    gate: Mutex<()>,
    lock_timeout: Duration,
}

impl SharedFile {
    /// Open the file, backing off while another process holds it.
    fn open(&self) -> StateResult<Database> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut backoff = Duration::from_millis(2);
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_LOCK_BACKOFF);
                }
                Err(e) => return Err(StateError::Open(e.to_string())),
            }
        }
    }
}

/// Thread-safe task store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    backing: Backing,
    default_max_retries: u32,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    ///
    /// The file stays locked until the last clone is dropped. Use
    /// [`StateStore::open_shared`] when other processes need the same file.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            backing: Backing::Resident(Arc::new(db)),
            default_max_retries: DEFAULT_MAX_RETRIES,
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Open a persistent store that only holds the file during a transaction.
    ///
    /// Any number of processes may use the same path this way. Each
    /// transaction waits up to `lock_timeout` for the file to be free.
    pub fn open_shared(path: &Path, lock_timeout: Duration) -> StateResult<Self> {
        let store = Self {
            backing: Backing::Shared(Arc::new(SharedFile {
                path: path.to_path_buf(),
                gate: Mutex::new(()),
                lock_timeout,
            })),
            default_max_retries: DEFAULT_MAX_RETRIES,
        };
        store.ensure_tables()?;
        debug!(?path, ?lock_timeout, "shared state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing and dry runs).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            backing: Backing::Resident(Arc::new(db)),
            default_max_retries: DEFAULT_MAX_RETRIES,
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Retry budget for tasks enqueued without an explicit `max_retries`.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Run `f` against an open database handle.
    fn with_db<T>(&self, f: impl FnOnce(&Database) -> StateResult<T>) -> StateResult<T> {
        match &self.backing {
            Backing::Resident(db) => f(db),
            Backing::Shared(file) => {
                let _gate = file.gate.lock().unwrap_or_else(|p| p.into_inner());
                let db = file.open()?;
                f(&db)
            }
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(TASKS).map_err(map_err!(Table))?;
            txn.open_table(RESOURCE_LOCKS).map_err(map_err!(Table))?;
            txn.open_table(GATEWAYS).map_err(map_err!(Table))?;
            txn.open_table(WORKERS).map_err(map_err!(Table))?;
            txn.open_table(EVENTS).map_err(map_err!(Table))?;
            txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `f` in a write transaction; commit on `Ok`, abort on `Err`.
    ///
    /// `f` must not call back into the store.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StateResult<T>,
    ) -> StateResult<T> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            match f(&txn) {
                Ok(value) => {
                    txn.commit().map_err(map_err!(Transaction))?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(abort) = txn.abort() {
                        warn!(error = %abort, "failed to abort write transaction");
                    }
                    Err(e)
                }
            }
        })
    }

    /// Run `f` in a read transaction. `f` must not call back into the store.
    pub(crate) fn read<T>(
        &self,
        f: impl FnOnce(&ReadTransaction) -> StateResult<T>,
    ) -> StateResult<T> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            f(&txn)
        })
    }
}

// ── JSON row helpers ───────────────────────────────────────────────

pub(crate) fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub(crate) fn put_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

pub(crate) fn scan_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

/// Bump and return a named counter. Starts at 1.
pub(crate) fn next_sequence(
    table: &mut Table<'_, &'static str, u64>,
    name: &str,
) -> StateResult<u64> {
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use serde_json::json;

    #[test]
    fn tables_exist_after_open() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .read(|txn| {
                txn.open_table(TASKS).unwrap();
                txn.open_table(EVENTS).unwrap();
                txn.open_table(SEQUENCES).unwrap();
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_write_leaves_no_trace() {
        let store = StateStore::open_in_memory().unwrap();
        let result: StateResult<()> = store.write(|txn| {
            let mut seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            next_sequence(&mut seq, EVENT_SEQ)?;
            Err(StateError::InvalidTask("boom".to_string()))
        });
        assert!(result.is_err());

        let missing = store
            .read(|txn| {
                let seq = txn.open_table(SEQUENCES).unwrap();
                Ok(seq.get(EVENT_SEQ).unwrap().is_none())
            })
            .unwrap();
        assert!(missing);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skynet.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store
                .enqueue(NewTask::new(json!({"cmd": "ls"})).with_id("persisted"))
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let task = store.get_task("persisted").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(store.poll_events(0, 10).unwrap().events.len(), 1);
    }

    #[test]
    fn shared_handles_interleave_on_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skynet.redb");
        let a = StateStore::open_shared(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
        let b = StateStore::open_shared(&path, DEFAULT_LOCK_TIMEOUT).unwrap();

        let writers: Vec<_> = [a.clone(), b.clone()]
            .into_iter()
            .enumerate()
            .map(|(n, store)| {
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store
                            .enqueue(NewTask::new(json!(null)).with_id(format!("t{n}-{i}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(a.all_tasks().unwrap().len(), 20);
        assert_eq!(b.poll_events(0, 100).unwrap().events.len(), 20);
    }

    #[test]
    fn shared_open_waits_for_resident_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skynet.redb");

        let resident = StateStore::open(&path).unwrap();
        let err = StateStore::open_shared(&path, Duration::from_millis(50)).err().unwrap();
        assert!(matches!(err, StateError::Open(_)));

        drop(resident);
        let shared = StateStore::open_shared(&path, Duration::from_millis(50)).unwrap();
        assert!(shared.all_tasks().unwrap().is_empty());
    }

    #[test]
    fn default_max_retries_applies_to_new_tasks() {
        let store = StateStore::open_in_memory()
            .unwrap()
            .with_default_max_retries(7);
        store
            .enqueue(NewTask::new(json!(null)).with_id("t"))
            .unwrap();
        assert_eq!(store.get_task("t").unwrap().unwrap().max_retries, 7);
    }
}
