//! Operator commands. Each returns the JSON document the CLI prints.

use std::collections::BTreeSet;

use anyhow::{Context, bail};
use serde::Serialize;
use serde_json::{Value, json};

use skynet_core::epoch_millis;
use skynet_placement::{SelectionRequest, Selector};
use skynet_state::{GatewayRegistration, NewTask, StateStore, TaskFilter, TaskStatus};

/// Everything `skynetd enqueue` accepts.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub task_id: Option<String>,
    /// JSON text; a non-JSON string is stored as a bare string action.
    pub action: String,
    pub depends_on: Vec<String>,
    pub files: Vec<String>,
    pub requires: Vec<String>,
    pub prefers: Vec<String>,
    pub priority: i32,
    pub max_retries: Option<u32>,
    pub gateway: Option<String>,
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<Value> {
    serde_json::to_value(value).context("failed to serialize output")
}

pub fn parse_action(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn enqueue(state: &StateStore, opts: EnqueueOptions) -> anyhow::Result<Value> {
    let new = NewTask {
        task_id: opts.task_id,
        action: parse_action(&opts.action),
        required_capabilities: opts.requires.into_iter().collect(),
        preferred_capabilities: opts.prefers.into_iter().collect(),
        dependencies: opts.depends_on.into_iter().collect(),
        required_files: opts.files.into_iter().collect(),
        priority: opts.priority,
        max_retries: opts.max_retries,
        preferred_gateway: opts.gateway,
    };
    let task_id = state.enqueue(new)?;
    Ok(json!({ "task_id": task_id }))
}

pub fn tasks(state: &StateStore, status: Option<TaskStatus>, owner: Option<String>) -> anyhow::Result<Value> {
    let tasks = state.list_tasks(&TaskFilter { status, owner })?;
    to_json(&tasks)
}

/// A task with its readiness diagnosis and event history.
pub fn show(state: &StateStore, task_id: &str) -> anyhow::Result<Value> {
    let Some(task) = state.get_task(task_id)? else {
        bail!("task {task_id} not found");
    };
    Ok(json!({
        "task": to_json(&task)?,
        "diagnosis": to_json(&state.diagnose(task_id)?)?,
        "events": to_json(&state.task_events(task_id)?)?,
    }))
}

/// The task `agent` would claim next. Claims nothing.
pub fn next(state: &StateStore, agent: Option<&str>) -> anyhow::Result<Value> {
    let task = state.peek_next(agent)?;
    to_json(&task)
}

pub fn agents(state: &StateStore) -> anyhow::Result<Value> {
    Ok(json!({
        "owners": to_json(&state.agents()?)?,
        "gateways": to_json(&state.list_gateways()?)?,
        "workers": to_json(&state.list_workers()?)?,
    }))
}

pub fn locks(state: &StateStore) -> anyhow::Result<Value> {
    to_json(&state.resource_locks()?)
}

/// One page of the event log, or the full history of a single task.
pub fn events(state: &StateStore, cursor: u64, limit: usize, task_id: Option<&str>) -> anyhow::Result<Value> {
    match task_id {
        Some(id) => to_json(&state.task_events(id)?),
        None => to_json(&state.poll_events(cursor, limit)?),
    }
}

pub fn system_state(state: &StateStore) -> anyhow::Result<Value> {
    to_json(&state.system_state(epoch_millis())?)
}

/// Score every registered gateway for a stored task.
pub fn explain(state: &StateStore, selector: &Selector, task_id: &str) -> anyhow::Result<Value> {
    let Some(task) = state.get_task(task_id)? else {
        bail!("task {task_id} not found");
    };
    let gateways = state.list_gateways()?;
    to_json(&selector.explain(&gateways, &SelectionRequest::from(&task)))
}

pub fn register_gateway(
    state: &StateStore,
    gateway_id: &str,
    endpoint: &str,
    capabilities: Vec<String>,
    capacity: u32,
) -> anyhow::Result<Value> {
    let gateway = state.register_gateway(GatewayRegistration {
        gateway_id: gateway_id.to_string(),
        endpoint: endpoint.to_string(),
        capabilities: capabilities.into_iter().collect(),
        capacity,
    })?;
    to_json(&gateway)
}

pub fn deregister_gateway(state: &StateStore, gateway_id: &str) -> anyhow::Result<Value> {
    if !state.deregister_gateway(gateway_id)? {
        bail!("gateway {gateway_id} not found");
    }
    Ok(json!({ "gateway_id": gateway_id, "deregistered": true }))
}

pub fn register_worker(
    state: &StateStore,
    worker_id: &str,
    gateway_id: Option<&str>,
    capabilities: Vec<String>,
) -> anyhow::Result<Value> {
    let worker = state.register_worker(worker_id, gateway_id, capabilities.into_iter().collect::<BTreeSet<_>>())?;
    to_json(&worker)
}

/// Cancel a claimed or running task on behalf of its current owner.
pub fn cancel(state: &StateStore, task_id: &str, reason: &str) -> anyhow::Result<Value> {
    let Some(task) = state.get_task(task_id)? else {
        bail!("task {task_id} not found");
    };
    let Some(token) = task.claim_token.as_deref() else {
        bail!("task {task_id} is {} and holds no claim", task.status);
    };
    let task = state.cancel(task_id, token, reason)?;
    to_json(&task)
}

/// Lock an extra resource for an active task under its current claim.
pub fn claim_resource(state: &StateStore, task_id: &str, resource_key: &str) -> anyhow::Result<Value> {
    let Some(task) = state.get_task(task_id)? else {
        bail!("task {task_id} not found");
    };
    let Some(token) = task.claim_token.as_deref() else {
        bail!("task {task_id} is {} and holds no claim", task.status);
    };
    let lock = state
        .claim_resource(task_id, token, resource_key)
        .with_context(|| format!("failed to lock {resource_key} for {task_id}"))?;
    to_json(&lock)
}
