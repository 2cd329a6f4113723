//! Append-only task event log with cursor-based polling.
//!
//! Events are appended inside the same write transaction as the state
//! change they describe. Consumers poll with the last `event_id` they
//! processed; re-polling with an old cursor replays events, so delivery is
//! at-least-once.

use redb::{ReadableTable, WriteTransaction};
use tracing::trace;

use crate::error::StateResult;
use crate::store::{StateStore, map_err, next_sequence};
use crate::tables::*;
use crate::types::*;

/// Event fields known before the sequence number is assigned.
pub(crate) struct EventDraft {
    task_id: String,
    event_type: EventType,
    from_status: Option<TaskStatus>,
    to_status: TaskStatus,
    owner: Option<String>,
    claim_token: Option<String>,
    timestamp: u64,
    payload: serde_json::Value,
}

impl EventDraft {
    pub(crate) fn new(
        task_id: &str,
        event_type: EventType,
        from_status: Option<TaskStatus>,
        to_status: TaskStatus,
        timestamp: u64,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            event_type,
            from_status,
            to_status,
            owner: None,
            claim_token: None,
            timestamp,
            payload: serde_json::Value::Null,
        }
    }

    pub(crate) fn owner(mut self, owner: &str, claim_token: &str) -> Self {
        self.owner = (!owner.is_empty()).then(|| owner.to_string());
        self.claim_token = Some(claim_token.to_string());
        self
    }

    pub(crate) fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Append one event inside an open write transaction. Returns its id.
pub(crate) fn append_event(txn: &WriteTransaction, draft: EventDraft) -> StateResult<u64> {
    let event_id = {
        let mut seqs = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        next_sequence(&mut seqs, EVENT_SEQ)?
    };

    let event = TaskEvent {
        event_id,
        task_id: draft.task_id,
        event_type: draft.event_type,
        from_status: draft.from_status,
        to_status: draft.to_status,
        owner: draft.owner,
        claim_token: draft.claim_token,
        timestamp: draft.timestamp,
        payload: draft.payload,
    };
    let bytes = serde_json::to_vec(&event).map_err(map_err!(Serialize))?;

    let mut events = txn.open_table(EVENTS).map_err(map_err!(Table))?;
    events
        .insert(event_id, bytes.as_slice())
        .map_err(map_err!(Write))?;
    trace!(event_id, task_id = %event.task_id, event_type = ?event.event_type, "event appended");
    Ok(event_id)
}

impl StateStore {
    /// Events with `event_id > cursor`, oldest first, at most `limit`.
    ///
    /// `next_cursor` is the id of the last returned event, or `cursor`
    /// unchanged when nothing new is available.
    pub fn poll_events(&self, cursor: u64, limit: usize) -> StateResult<EventPage> {
        self.read(|txn| {
            let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;

            let mut events = Vec::new();
            let start = cursor.saturating_add(1);
            for entry in table.range(start..).map_err(map_err!(Read))?.take(limit) {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let event: TaskEvent =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                events.push(event);
            }

            let next_cursor = events.last().map_or(cursor, |e| e.event_id);
            Ok(EventPage {
                events,
                next_cursor,
            })
        })
    }

    /// Full history of a single task, oldest first.
    pub fn task_events(&self, task_id: &str) -> StateResult<Vec<TaskEvent>> {
        self.read(|txn| {
            let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;

            let mut events = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let event: TaskEvent =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if event.task_id == task_id {
                    events.push(event);
                }
            }
            Ok(events)
        })
    }

    /// Id of the newest event, 0 if the log is empty.
    pub fn last_event_id(&self) -> StateResult<u64> {
        self.read(|txn| {
            let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let last = table.last().map_err(map_err!(Read))?;
            Ok(last.map_or(0, |(key, _)| key.value()))
        })
    }
}
