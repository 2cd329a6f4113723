//! Task lifecycle: enqueue, the atomic claim, and token-checked transitions.
//!
//! ```text
//! queued ──claim──▶ claimed ──start──▶ running ──complete──▶ succeeded
//!    ▲                 │                  │
//!    │                 ├──fail/expire─────┼──▶ failed / failed_timeout
//! released ◀──release/cancel/fail/expire──┘
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use redb::{ReadableTable, Table};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use skynet_core::epoch_millis;

use crate::error::{StateError, StateResult};
use crate::events::{EventDraft, append_event};
use crate::store::{StateStore, get_json, map_err, next_sequence, put_json, scan_json};
use crate::tables::*;
use crate::types::*;

impl StateStore {
    // ── Enqueue ────────────────────────────────────────────────────

    /// Insert a new task with status `queued`. Returns the task id.
    pub fn enqueue(&self, new: NewTask) -> StateResult<TaskId> {
        let task_id = match new.task_id {
            Some(id) => id.trim().to_string(),
            None => generate_task_id(),
        };
        if task_id.is_empty() {
            return Err(StateError::InvalidTask("task_id must not be empty".to_string()));
        }
        if new.dependencies.contains(&task_id) {
            return Err(StateError::InvalidTask(format!("{task_id} depends on itself")));
        }

        let now = epoch_millis();
        let max_retries = new.max_retries.unwrap_or(self.default_max_retries());

        self.write(|txn| {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            if tasks.get(task_id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::DuplicateTask(task_id.clone()));
            }

            // Dependencies must already exist, so the graph stays acyclic.
            for dep_id in &new.dependencies {
                let mut dep: Task = get_json(&tasks, dep_id)?.ok_or_else(|| {
                    StateError::InvalidTask(format!("{task_id} depends on unknown task {dep_id}"))
                })?;
                dep.dependents.insert(task_id.clone());
                put_json(&mut tasks, dep_id, &dep)?;
            }

            let seq = {
                let mut seqs = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
                next_sequence(&mut seqs, TASK_SEQ)?
            };

            let task = Task {
                task_id: task_id.clone(),
                action: new.action,
                required_capabilities: new.required_capabilities,
                preferred_capabilities: new.preferred_capabilities,
                priority: new.priority,
                status: TaskStatus::Queued,
                dependencies: new.dependencies,
                dependents: Default::default(),
                required_files: new.required_files,
                held_resources: Default::default(),
                locked_by: None,
                claim_token: None,
                locked_at: None,
                preferred_gateway: new.preferred_gateway,
                assigned_gateway: None,
                retry_count: 0,
                max_retries,
                result: None,
                error: None,
                seq,
                created_at: now,
                updated_at: now,
            };
            put_json(&mut tasks, &task_id, &task)?;

            append_event(
                txn,
                EventDraft::new(&task_id, EventType::Enqueued, None, TaskStatus::Queued, now)
                    .payload(json!({
                        "priority": task.priority,
                        "dependencies": task.dependencies,
                        "required_files": task.required_files,
                    })),
            )?;
            Ok(())
        })?;

        info!(%task_id, "task enqueued");
        Ok(task_id)
    }

    // ── Claim ──────────────────────────────────────────────────────

    /// Atomically claim a task for `owner`.
    ///
    /// Succeeds only if the task is queued or released, every dependency
    /// has succeeded, and no required resource is held by another task.
    pub fn claim(&self, task_id: &str, owner: &str) -> StateResult<Claim> {
        let now = epoch_millis();
        let token = Uuid::new_v4().simple().to_string();

        let claim = self.write(|txn| {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut locks = txn.open_table(RESOURCE_LOCKS).map_err(map_err!(Table))?;

            let mut task: Task = get_json(&tasks, task_id)?
                .ok_or_else(|| StateError::TaskNotFound(task_id.to_string()))?;

            if !task.status.is_claimable() {
                return Err(StateError::ClaimConflict {
                    task_id: task_id.to_string(),
                    status: task.status,
                });
            }

            for dep_id in &task.dependencies {
                let satisfied = get_json::<Task>(&tasks, dep_id)?
                    .is_some_and(|dep| dep.status == TaskStatus::Succeeded);
                if !satisfied {
                    return Err(StateError::DependencyNotSatisfied {
                        task_id: task_id.to_string(),
                        dependency: dep_id.clone(),
                    });
                }
            }

            for key in &task.required_files {
                if let Some(lock) = get_json::<ResourceLock>(&locks, key)? {
                    if lock.owner_task_id != task.task_id {
                        return Err(StateError::ResourceConflict {
                            task_id: task_id.to_string(),
                            resource: key.clone(),
                            holder: lock.owner_task_id,
                        });
                    }
                }
            }

            for key in &task.required_files {
                let lock = ResourceLock {
                    resource_key: key.clone(),
                    owner_task_id: task.task_id.clone(),
                    claim_token: token.clone(),
                    acquired_at: now,
                };
                put_json(&mut locks, key, &lock)?;
            }

            let from = task.status;
            task.status = TaskStatus::Claimed;
            task.locked_by = Some(owner.to_string());
            task.claim_token = Some(token.clone());
            task.locked_at = Some(now);
            task.held_resources = task.required_files.clone();
            task.updated_at = now;
            put_json(&mut tasks, task_id, &task)?;

            append_event(
                txn,
                EventDraft::new(task_id, EventType::Claimed, Some(from), TaskStatus::Claimed, now)
                    .owner(owner, &token)
                    .payload(json!({
                        "retry_count": task.retry_count,
                        "required_files": task.required_files,
                    })),
            )?;

            Ok(Claim {
                claim_token: token.clone(),
                task,
            })
        })?;

        info!(%task_id, %owner, "task claimed");
        Ok(claim)
    }

    // ── Token-checked transitions ──────────────────────────────────

    /// claimed → running. Records the gateway the task was dispatched to.
    pub fn start(&self, task_id: &str, claim_token: &str, gateway_id: Option<&str>) -> StateResult<Task> {
        let gateway = gateway_id.map(str::to_string);
        self.transition(
            task_id,
            claim_token,
            TaskStatus::Running,
            &[TaskStatus::Claimed],
            EventType::Started,
            json!({ "gateway_id": gateway }),
            |task, _| {
                task.status = TaskStatus::Running;
                task.assigned_gateway = gateway.clone();
            },
        )
    }

    /// running → succeeded. Releases ownership and stores the result.
    pub fn complete(
        &self,
        task_id: &str,
        claim_token: &str,
        result: serde_json::Value,
    ) -> StateResult<Task> {
        self.transition(
            task_id,
            claim_token,
            TaskStatus::Succeeded,
            &[TaskStatus::Running],
            EventType::Succeeded,
            json!({ "result": result }),
            |task, _| {
                task.status = TaskStatus::Succeeded;
                task.result = Some(result.clone());
                task.error = None;
            },
        )
    }

    /// claimed/running → released (retry_count + 1) or failed once the
    /// retry budget is spent.
    pub fn fail(
        &self,
        task_id: &str,
        claim_token: &str,
        error: serde_json::Value,
    ) -> StateResult<Task> {
        let task = self.transition(
            task_id,
            claim_token,
            TaskStatus::Failed,
            &[TaskStatus::Claimed, TaskStatus::Running],
            EventType::Failed,
            json!({ "error": error }),
            |task, _| {
                task.error = Some(error.clone());
                retry_or(task, TaskStatus::Failed);
            },
        )?;
        if task.status == TaskStatus::Failed {
            warn!(%task_id, retries = task.retry_count, "task failed permanently");
        }
        Ok(task)
    }

    /// claimed/running → released without consuming a retry.
    pub fn release(&self, task_id: &str, claim_token: &str) -> StateResult<Task> {
        self.transition(
            task_id,
            claim_token,
            TaskStatus::Released,
            &[TaskStatus::Claimed, TaskStatus::Running],
            EventType::Released,
            serde_json::Value::Null,
            |task, _| task.status = TaskStatus::Released,
        )
    }

    /// Push `locked_at` forward so the reaper treats the owner as alive.
    ///
    /// The new `locked_at` is `max(locked_at, now + extension)`; renewals
    /// never move it backwards and do not stack.
    pub fn renew(&self, task_id: &str, claim_token: &str, extension: Duration) -> StateResult<Task> {
        let extension_ms = extension.as_millis() as u64;
        self.transition(
            task_id,
            claim_token,
            TaskStatus::Running,
            &[TaskStatus::Claimed, TaskStatus::Running],
            EventType::Renewed,
            json!({ "extension_ms": extension_ms }),
            |task, now| {
                let target = now.saturating_add(extension_ms);
                task.locked_at = Some(task.locked_at.map_or(target, |at| at.max(target)));
            },
        )
    }

    /// External cancel: claimed/running → released, retry budget untouched.
    pub fn cancel(&self, task_id: &str, claim_token: &str, reason: &str) -> StateResult<Task> {
        self.transition(
            task_id,
            claim_token,
            TaskStatus::Released,
            &[TaskStatus::Claimed, TaskStatus::Running],
            EventType::Cancelled,
            json!({ "reason": reason }),
            |task, _| {
                task.status = TaskStatus::Released;
                task.error = Some(json!({ "cancelled": reason }));
            },
        )
    }

    /// Reaper transition: released with retry_count + 1 while retries
    /// remain, otherwise failed_timeout.
    pub fn expire(&self, task_id: &str, claim_token: &str, reason: &str) -> StateResult<Task> {
        let task = self.transition(
            task_id,
            claim_token,
            TaskStatus::FailedTimeout,
            &[TaskStatus::Claimed, TaskStatus::Running],
            EventType::TimedOut,
            json!({ "reason": reason }),
            |task, _| {
                task.error = Some(json!({ "timeout": reason }));
                retry_or(task, TaskStatus::FailedTimeout);
            },
        )?;
        info!(%task_id, status = %task.status, retries = task.retry_count, "stale claim expired");
        Ok(task)
    }

    /// Take exclusive ownership of an extra resource key for an active task.
    pub fn claim_resource(
        &self,
        task_id: &str,
        claim_token: &str,
        resource_key: &str,
    ) -> StateResult<ResourceLock> {
        let now = epoch_millis();
        let lock = self.write(|txn| {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut locks = txn.open_table(RESOURCE_LOCKS).map_err(map_err!(Table))?;

            let mut task = load_authorized(&tasks, task_id, claim_token)?;
            if !task.status.is_active() {
                return Err(StateError::IllegalTransition {
                    task_id: task_id.to_string(),
                    from: task.status,
                    to: task.status,
                });
            }

            if let Some(existing) = get_json::<ResourceLock>(&locks, resource_key)? {
                if existing.owner_task_id != task.task_id {
                    return Err(StateError::ResourceConflict {
                        task_id: task_id.to_string(),
                        resource: resource_key.to_string(),
                        holder: existing.owner_task_id,
                    });
                }
                return Ok(existing);
            }

            let lock = ResourceLock {
                resource_key: resource_key.to_string(),
                owner_task_id: task.task_id.clone(),
                claim_token: claim_token.to_string(),
                acquired_at: now,
            };
            put_json(&mut locks, resource_key, &lock)?;
            task.held_resources.insert(resource_key.to_string());
            task.updated_at = now;
            put_json(&mut tasks, task_id, &task)?;

            let owner = task.locked_by.clone().unwrap_or_default();
            append_event(
                txn,
                EventDraft::new(task_id, EventType::ResourceClaimed, Some(task.status), task.status, now)
                    .owner(&owner, claim_token)
                    .payload(json!({ "resource_key": resource_key })),
            )?;
            Ok(lock)
        })?;
        debug!(%task_id, %resource_key, "resource claimed");
        Ok(lock)
    }

    /// Shared body of every token-checked transition.
    ///
    /// `intended` only names the target in `IllegalTransition` errors;
    /// `apply` sets the real target status. Leaving the active set releases
    /// all held resources and clears the lock fields.
    #[allow(clippy::too_many_arguments)]
    fn transition(
        &self,
        task_id: &str,
        claim_token: &str,
        intended: TaskStatus,
        allowed_from: &[TaskStatus],
        event: EventType,
        payload: serde_json::Value,
        apply: impl FnOnce(&mut Task, u64),
    ) -> StateResult<Task> {
        let now = epoch_millis();
        let outcome = self.write(|txn| {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut task = load_authorized(&tasks, task_id, claim_token)?;

            let from = task.status;
            if !allowed_from.contains(&from) {
                return Err(StateError::IllegalTransition {
                    task_id: task_id.to_string(),
                    from,
                    to: intended,
                });
            }

            let owner = task.locked_by.clone().unwrap_or_default();
            apply(&mut task, now);
            if !task.status.is_active() {
                let mut locks = txn.open_table(RESOURCE_LOCKS).map_err(map_err!(Table))?;
                release_resources(&mut locks, &task)?;
                task.clear_lock();
            }
            task.updated_at = now;
            put_json(&mut tasks, task_id, &task)?;

            append_event(
                txn,
                EventDraft::new(task_id, event, Some(from), task.status, now)
                    .owner(&owner, claim_token)
                    .payload(payload),
            )?;
            Ok(task)
        });

        match &outcome {
            Ok(task) => debug!(%task_id, ?event, status = %task.status, "task transitioned"),
            Err(e) if e.is_stale() => warn!(%task_id, ?event, error = %e, "rejected stale transition"),
            Err(_) => {}
        }
        outcome
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<Task>> {
        self.read(|txn| {
            let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            get_json(&table, task_id)
        })
    }

    /// All tasks matching the filter, oldest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> StateResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .all_tasks()?
            .into_iter()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                filter
                    .owner
                    .as_deref()
                    .is_none_or(|owner| t.locked_by.as_deref() == Some(owner))
            })
            .collect();
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }

    /// Owner → ids of the tasks it currently holds.
    pub fn agents(&self) -> StateResult<BTreeMap<OwnerId, Vec<TaskId>>> {
        let mut owners: BTreeMap<OwnerId, Vec<TaskId>> = BTreeMap::new();
        for task in self.all_tasks()? {
            if let (true, Some(owner)) = (task.status.is_active(), task.locked_by) {
                owners.entry(owner).or_default().push(task.task_id);
            }
        }
        for ids in owners.values_mut() {
            ids.sort();
        }
        Ok(owners)
    }

    /// Active resource ownership: resource_key → lock.
    pub fn resource_locks(&self) -> StateResult<BTreeMap<String, ResourceLock>> {
        self.read(|txn| {
            let table = txn.open_table(RESOURCE_LOCKS).map_err(map_err!(Table))?;
            let locks: Vec<ResourceLock> = scan_json(&table)?;
            Ok(locks
                .into_iter()
                .map(|lock| (lock.resource_key.clone(), lock))
                .collect())
        })
    }

    /// Claimed or running tasks whose `locked_at` is older than `ttl` at `now`.
    pub fn list_stale(&self, ttl: Duration, now: u64) -> StateResult<Vec<Task>> {
        let ttl_ms = ttl.as_millis() as u64;
        let mut stale: Vec<Task> = self
            .all_tasks()?
            .into_iter()
            .filter(|t| t.status.is_active())
            .filter(|t| t.locked_at.is_some_and(|at| now.saturating_sub(at) > ttl_ms))
            .collect();
        stale.sort_by_key(|t| (t.locked_at, t.seq));
        Ok(stale)
    }

    pub(crate) fn all_tasks(&self) -> StateResult<Vec<Task>> {
        self.read(|txn| {
            let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            scan_json(&table)
        })
    }
}

/// `task-` followed by 12 hex characters.
fn generate_task_id() -> TaskId {
    let hex = Uuid::new_v4().simple().to_string();
    format!("task-{}", &hex[..12])
}

/// Released with one more retry consumed, or `terminal` when out of budget.
fn retry_or(task: &mut Task, terminal: TaskStatus) {
    if task.retry_count >= task.max_retries {
        task.status = terminal;
    } else {
        task.retry_count += 1;
        task.status = TaskStatus::Released;
    }
}

fn load_authorized(
    tasks: &impl ReadableTable<&'static str, &'static [u8]>,
    task_id: &str,
    claim_token: &str,
) -> StateResult<Task> {
    let task: Task =
        get_json(tasks, task_id)?.ok_or_else(|| StateError::TaskNotFound(task_id.to_string()))?;
    if !task.holds_token(claim_token) {
        return Err(StateError::StaleClaim {
            task_id: task_id.to_string(),
        });
    }
    Ok(task)
}

/// Drop every lock this task holds. Locks re-acquired by another task are left alone.
fn release_resources(
    locks: &mut Table<'_, &'static str, &'static [u8]>,
    task: &Task,
) -> StateResult<()> {
    let mut released = 0usize;
    for key in &task.held_resources {
        let owned = get_json::<ResourceLock>(&*locks, key)?
            .is_some_and(|lock| lock.owner_task_id == task.task_id);
        if owned {
            locks.remove(key.as_str()).map_err(map_err!(Write))?;
            released += 1;
        }
    }
    if released > 0 {
        debug!(task_id = %task.task_id, count = released, "resources released");
    }
    Ok(())
}
