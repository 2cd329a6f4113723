//! Readiness selection over a consistent snapshot of tasks and locks.
//!
//! A task is ready when it is queued or released, every dependency has
//! succeeded, and none of its required resources is owned. Ready tasks are
//! ordered by priority (higher first), then age (oldest first), then
//! insertion order.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, get_json, map_err, scan_json};
use crate::tables::*;
use crate::types::*;

/// Lazy, restartable sequence of ready tasks.
///
/// Built from one read transaction, so every task it yields was ready at
/// the same instant. A later `claim` may still lose the race.
#[derive(Debug, Clone)]
pub struct ReadyTasks {
    candidates: Vec<Task>,
    succeeded: HashSet<TaskId>,
    owned_resources: HashSet<String>,
    capability_filter: Option<BTreeSet<String>>,
    pos: usize,
}

impl ReadyTasks {
    fn is_ready(&self, task: &Task) -> bool {
        task.status.is_claimable()
            && task.dependencies.iter().all(|d| self.succeeded.contains(d))
            && !task
                .required_files
                .iter()
                .any(|key| self.owned_resources.contains(key))
            && self
                .capability_filter
                .as_ref()
                .is_none_or(|caps| task.required_capabilities.is_subset(caps))
    }

    /// Rewind to the first candidate of the same snapshot.
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for ReadyTasks {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        while self.pos < self.candidates.len() {
            let idx = self.pos;
            self.pos += 1;
            if self.is_ready(&self.candidates[idx]) {
                return Some(self.candidates[idx].clone());
            }
        }
        None
    }
}

impl StateStore {
    /// Snapshot the ready set.
    ///
    /// With a `capability_filter`, only tasks whose required capabilities are
    /// all contained in the filter are yielded.
    pub fn ready_tasks(
        &self,
        capability_filter: Option<&BTreeSet<String>>,
    ) -> StateResult<ReadyTasks> {
        self.read(|txn| {
            let tasks_table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let locks_table = txn.open_table(RESOURCE_LOCKS).map_err(map_err!(Table))?;

            let tasks: Vec<Task> = scan_json(&tasks_table)?;
            let locks: Vec<ResourceLock> = scan_json(&locks_table)?;

            let succeeded = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Succeeded)
                .map(|t| t.task_id.clone())
                .collect();
            let owned_resources = locks.into_iter().map(|l| l.resource_key).collect();

            let mut candidates: Vec<Task> = tasks
                .into_iter()
                .filter(|t| t.status.is_claimable())
                .collect();
            candidates.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.seq.cmp(&b.seq))
            });

            Ok(ReadyTasks {
                candidates,
                succeeded,
                owned_resources,
                capability_filter: capability_filter.cloned(),
                pos: 0,
            })
        })
    }

    /// Ids of up to `limit` ready tasks, best first. Empty is normal.
    pub fn list_ready(
        &self,
        limit: usize,
        capability_filter: Option<&BTreeSet<String>>,
    ) -> StateResult<Vec<TaskId>> {
        Ok(self
            .ready_tasks(capability_filter)?
            .take(limit)
            .map(|t| t.task_id)
            .collect())
    }

    /// Dry run: the task `agent` would get next, without locking anything.
    ///
    /// A registered worker or gateway only sees tasks it has the
    /// capabilities for; unknown agents see the whole ready set.
    pub fn peek_next(&self, agent: Option<&str>) -> StateResult<Option<Task>> {
        let capabilities = match agent {
            Some(id) => match self.get_worker(id)? {
                Some(worker) => Some(worker.capabilities),
                None => self.get_gateway(id)?.map(|gw| gw.capabilities),
            },
            None => None,
        };
        Ok(self.ready_tasks(capabilities.as_ref())?.next())
    }

    /// Explain why a task is or is not claimable.
    pub fn diagnose(&self, task_id: &str) -> StateResult<Diagnosis> {
        self.read(|txn| {
            let tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let locks = txn.open_table(RESOURCE_LOCKS).map_err(map_err!(Table))?;

            let task: Task = get_json(&tasks, task_id)?
                .ok_or_else(|| StateError::TaskNotFound(task_id.to_string()))?;

            let mut unmet_dependencies = BTreeMap::new();
            for dep_id in &task.dependencies {
                let status = get_json::<Task>(&tasks, dep_id)?.map(|d| d.status);
                if status != Some(TaskStatus::Succeeded) {
                    unmet_dependencies.insert(dep_id.clone(), status);
                }
            }

            let mut busy_resources = BTreeMap::new();
            for key in &task.required_files {
                if let Some(lock) = get_json::<ResourceLock>(&locks, key)? {
                    if lock.owner_task_id != task.task_id {
                        busy_resources.insert(key.clone(), lock.owner_task_id);
                    }
                }
            }

            Ok(Diagnosis {
                task_id: task.task_id,
                status: task.status,
                ready: task.status.is_claimable()
                    && unmet_dependencies.is_empty()
                    && busy_resources.is_empty(),
                unmet_dependencies,
                busy_resources,
                required_capabilities: task.required_capabilities,
                retry_count: task.retry_count,
                max_retries: task.max_retries,
                last_error: task.error,
            })
        })
    }
}
