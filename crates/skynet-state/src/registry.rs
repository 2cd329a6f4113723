//! Gateway and worker registry.
//!
//! Gateways are registered explicitly and never deleted by the control
//! plane; missed heartbeats only lower their status. Dispatch statistics
//! (active jobs, success/failure counts, latency) feed gateway scoring.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use skynet_core::epoch_millis;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, get_json, map_err, put_json, scan_json};
use crate::tables::*;
use crate::types::*;

/// Weight of the newest sample in the latency moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

impl StateStore {
    // ── Gateways ───────────────────────────────────────────────────

    /// Register or re-register a gateway.
    ///
    /// Success, failure and latency history survive re-registration. The
    /// in-flight count restarts at zero: dispatches from a previous process
    /// are gone and nothing would ever end them.
    pub fn register_gateway(&self, reg: GatewayRegistration) -> StateResult<Gateway> {
        let now = epoch_millis();
        let gateway = self.write(|txn| {
            let mut table = txn.open_table(GATEWAYS).map_err(map_err!(Table))?;
            let gateway = match get_json::<Gateway>(&table, &reg.gateway_id)? {
                Some(mut existing) => {
                    existing.endpoint = reg.endpoint.clone();
                    existing.capabilities = reg.capabilities.clone();
                    existing.capacity = reg.capacity;
                    existing.status = HealthStatus::Healthy;
                    existing.last_heartbeat = now;
                    existing.active_jobs = 0;
                    existing
                }
                None => Gateway {
                    gateway_id: reg.gateway_id.clone(),
                    endpoint: reg.endpoint.clone(),
                    capabilities: reg.capabilities.clone(),
                    capacity: reg.capacity,
                    status: HealthStatus::Healthy,
                    last_heartbeat: now,
                    active_jobs: 0,
                    success_count: 0,
                    failure_count: 0,
                    avg_latency_ms: None,
                    registered_at: now,
                },
            };
            put_json(&mut table, &gateway.gateway_id, &gateway)?;
            Ok(gateway)
        })?;
        info!(gateway_id = %gateway.gateway_id, endpoint = %gateway.endpoint, "gateway registered");
        Ok(gateway)
    }

    pub fn get_gateway(&self, gateway_id: &str) -> StateResult<Option<Gateway>> {
        self.read(|txn| {
            let table = txn.open_table(GATEWAYS).map_err(map_err!(Table))?;
            get_json(&table, gateway_id)
        })
    }

    /// All gateways, sorted by id.
    pub fn list_gateways(&self) -> StateResult<Vec<Gateway>> {
        self.read(|txn| {
            let table = txn.open_table(GATEWAYS).map_err(map_err!(Table))?;
            // Keys iterate in order, so the scan is already sorted.
            scan_json(&table)
        })
    }

    /// Operator removal. Returns false if the gateway was not registered.
    ///
    /// Tasks already assigned to it keep their claims; the reaper judges
    /// them by worker health alone from then on.
    pub fn deregister_gateway(&self, gateway_id: &str) -> StateResult<bool> {
        let removed = self.write(|txn| {
            let mut table = txn.open_table(GATEWAYS).map_err(map_err!(Table))?;
            let removed = table.remove(gateway_id).map_err(map_err!(Write))?.is_some();
            Ok(removed)
        })?;
        if removed {
            info!(%gateway_id, "gateway deregistered");
        }
        Ok(removed)
    }

    /// Record a heartbeat. Returns false for unknown gateways.
    pub fn gateway_heartbeat(&self, gateway_id: &str) -> StateResult<bool> {
        let now = epoch_millis();
        match self.update_gateway(gateway_id, |gw| {
            gw.last_heartbeat = now;
            gw.status = HealthStatus::Healthy;
        }) {
            Ok(_) => {
                debug!(%gateway_id, "gateway heartbeat");
                Ok(true)
            }
            Err(StateError::NotFound(_)) => {
                warn!(%gateway_id, "heartbeat from unknown gateway");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn set_gateway_status(&self, gateway_id: &str, status: HealthStatus) -> StateResult<Gateway> {
        let gateway = self.update_gateway(gateway_id, |gw| gw.status = status)?;
        debug!(%gateway_id, %status, "gateway status set");
        Ok(gateway)
    }

    /// One more job in flight on this gateway.
    pub fn begin_dispatch(&self, gateway_id: &str) -> StateResult<Gateway> {
        self.update_gateway(gateway_id, |gw| gw.active_jobs = gw.active_jobs.saturating_add(1))
    }

    /// A job on this gateway finished (any outcome).
    pub fn end_dispatch(&self, gateway_id: &str) -> StateResult<Gateway> {
        self.update_gateway(gateway_id, |gw| gw.active_jobs = gw.active_jobs.saturating_sub(1))
    }

    /// Zero every gateway's in-flight count. Returns how many were reset.
    ///
    /// Called once when a daemon starts, before any loop dispatches.
    pub fn reset_dispatch_counts(&self) -> StateResult<usize> {
        let reset = self.write(|txn| {
            let mut table = txn.open_table(GATEWAYS).map_err(map_err!(Table))?;
            let gateways: Vec<Gateway> = scan_json(&table)?;
            let mut reset = 0;
            for mut gw in gateways.into_iter().filter(|gw| gw.active_jobs > 0) {
                gw.active_jobs = 0;
                put_json(&mut table, &gw.gateway_id, &gw)?;
                reset += 1;
            }
            Ok(reset)
        })?;
        if reset > 0 {
            warn!(gateways = reset, "cleared in-flight counts left by a previous run");
        }
        Ok(reset)
    }

    /// Fold a dispatch outcome into the gateway's rolling statistics.
    pub fn record_outcome(
        &self,
        gateway_id: &str,
        success: bool,
        latency_ms: u64,
    ) -> StateResult<Gateway> {
        self.update_gateway(gateway_id, |gw| {
            if success {
                gw.success_count += 1;
            } else {
                gw.failure_count += 1;
            }
            let sample = latency_ms as f64;
            gw.avg_latency_ms = Some(match gw.avg_latency_ms {
                Some(avg) => avg + LATENCY_EWMA_ALPHA * (sample - avg),
                None => sample,
            });
        })
    }

    fn update_gateway(
        &self,
        gateway_id: &str,
        f: impl FnOnce(&mut Gateway),
    ) -> StateResult<Gateway> {
        self.write(|txn| {
            let mut table = txn.open_table(GATEWAYS).map_err(map_err!(Table))?;
            let mut gateway: Gateway = get_json(&table, gateway_id)?
                .ok_or_else(|| StateError::NotFound(format!("gateway {gateway_id}")))?;
            f(&mut gateway);
            put_json(&mut table, gateway_id, &gateway)?;
            Ok(gateway)
        })
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Register or re-register a worker.
    pub fn register_worker(
        &self,
        worker_id: &str,
        gateway_id: Option<&str>,
        capabilities: BTreeSet<String>,
    ) -> StateResult<Worker> {
        let now = epoch_millis();
        let worker = self.write(|txn| {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            let registered_at = get_json::<Worker>(&table, worker_id)?
                .map_or(now, |w| w.registered_at);
            let worker = Worker {
                worker_id: worker_id.to_string(),
                gateway_id: gateway_id.map(str::to_string),
                capabilities,
                status: HealthStatus::Healthy,
                last_heartbeat: now,
                registered_at,
            };
            put_json(&mut table, worker_id, &worker)?;
            Ok(worker)
        })?;
        info!(%worker_id, gateway_id = ?worker.gateway_id, "worker registered");
        Ok(worker)
    }

    pub fn get_worker(&self, worker_id: &str) -> StateResult<Option<Worker>> {
        self.read(|txn| {
            let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            get_json(&table, worker_id)
        })
    }

    pub fn list_workers(&self) -> StateResult<Vec<Worker>> {
        self.read(|txn| {
            let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            scan_json(&table)
        })
    }

    /// Record a heartbeat. Returns false for unknown workers.
    pub fn worker_heartbeat(&self, worker_id: &str) -> StateResult<bool> {
        let now = epoch_millis();
        match self.update_worker(worker_id, |w| {
            w.last_heartbeat = now;
            w.status = HealthStatus::Healthy;
        }) {
            Ok(_) => Ok(true),
            Err(StateError::NotFound(_)) => {
                warn!(%worker_id, "heartbeat from unknown worker");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn set_worker_status(&self, worker_id: &str, status: HealthStatus) -> StateResult<Worker> {
        self.update_worker(worker_id, |w| w.status = status)
    }

    fn update_worker(&self, worker_id: &str, f: impl FnOnce(&mut Worker)) -> StateResult<Worker> {
        self.write(|txn| {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            let mut worker: Worker = get_json(&table, worker_id)?
                .ok_or_else(|| StateError::NotFound(format!("worker {worker_id}")))?;
            f(&mut worker);
            put_json(&mut table, worker_id, &worker)?;
            Ok(worker)
        })
    }

    // ── Aggregate ──────────────────────────────────────────────────

    /// Counts by status across tasks, gateways, and workers.
    pub fn system_state(&self, now: u64) -> StateResult<SystemState> {
        let mut tasks: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for task in self.all_tasks()? {
            *tasks.entry(task.status).or_default() += 1;
        }

        let mut gateways: BTreeMap<HealthStatus, usize> = BTreeMap::new();
        for gw in self.list_gateways()? {
            *gateways.entry(gw.status).or_default() += 1;
        }

        let mut workers: BTreeMap<HealthStatus, usize> = BTreeMap::new();
        for w in self.list_workers()? {
            *workers.entry(w.status).or_default() += 1;
        }

        Ok(SystemState {
            timestamp: now,
            tasks,
            gateways,
            workers,
            active_resource_locks: self.resource_locks()?.len(),
            last_event_id: self.last_event_id()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn registration(id: &str, caps: &[&str]) -> GatewayRegistration {
        GatewayRegistration {
            gateway_id: id.to_string(),
            endpoint: format!("http://{id}.local:8080"),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            capacity: 4,
        }
    }

    #[test]
    fn register_and_list_gateways() {
        let store = store();
        store.register_gateway(registration("gw-b", &["shell"])).unwrap();
        store.register_gateway(registration("gw-a", &["docker"])).unwrap();

        let all = store.list_gateways().unwrap();
        let ids: Vec<_> = all.iter().map(|g| g.gateway_id.as_str()).collect();
        assert_eq!(ids, vec!["gw-a", "gw-b"]);
        assert_eq!(all[0].status, HealthStatus::Healthy);
    }

    #[test]
    fn reregistration_keeps_statistics() {
        let store = store();
        store.register_gateway(registration("gw", &["shell"])).unwrap();
        store.record_outcome("gw", true, 100).unwrap();

        let gw = store.register_gateway(registration("gw", &["shell", "docker"])).unwrap();
        assert_eq!(gw.success_count, 1);
        assert!(gw.capabilities.contains("docker"));
    }

    #[test]
    fn reregistration_after_restart_clears_in_flight_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skynet.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.register_gateway(registration("gw", &["shell"])).unwrap();
            for _ in 0..4 {
                store.begin_dispatch("gw").unwrap();
            }
            store.record_outcome("gw", true, 50).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let gw = store.register_gateway(registration("gw", &["shell"])).unwrap();
        assert_eq!(gw.active_jobs, 0);
        assert_eq!(gw.success_count, 1);
    }

    #[test]
    fn reset_dispatch_counts_only_touches_busy_gateways() {
        let store = store();
        store.register_gateway(registration("busy", &[])).unwrap();
        store.register_gateway(registration("idle", &[])).unwrap();
        store.begin_dispatch("busy").unwrap();
        store.begin_dispatch("busy").unwrap();

        assert_eq!(store.reset_dispatch_counts().unwrap(), 1);
        assert_eq!(store.get_gateway("busy").unwrap().unwrap().active_jobs, 0);
        assert_eq!(store.reset_dispatch_counts().unwrap(), 0);
    }

    #[test]
    fn deregistered_gateway_is_gone() {
        let store = store();
        store.register_gateway(registration("gw", &[])).unwrap();
        assert!(store.deregister_gateway("gw").unwrap());
        assert!(store.get_gateway("gw").unwrap().is_none());
        assert!(!store.deregister_gateway("gw").unwrap());
        assert!(matches!(store.begin_dispatch("gw"), Err(StateError::NotFound(_))));
    }

    #[test]
    fn dispatch_counters() {
        let store = store();
        store.register_gateway(registration("gw", &[])).unwrap();
        store.begin_dispatch("gw").unwrap();
        store.begin_dispatch("gw").unwrap();
        assert_eq!(store.end_dispatch("gw").unwrap().active_jobs, 1);
        store.end_dispatch("gw").unwrap();
        // Never underflows.
        assert_eq!(store.end_dispatch("gw").unwrap().active_jobs, 0);
    }

    #[test]
    fn outcomes_update_latency_average() {
        let store = store();
        store.register_gateway(registration("gw", &[])).unwrap();
        store.record_outcome("gw", true, 1000).unwrap();
        let gw = store.record_outcome("gw", false, 2000).unwrap();
        assert_eq!((gw.success_count, gw.failure_count), (1, 1));
        assert!((gw.avg_latency_ms.unwrap() - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn heartbeat_restores_health() {
        let store = store();
        store.register_gateway(registration("gw", &[])).unwrap();
        store.set_gateway_status("gw", HealthStatus::Unhealthy).unwrap();
        assert!(store.gateway_heartbeat("gw").unwrap());
        assert_eq!(store.get_gateway("gw").unwrap().unwrap().status, HealthStatus::Healthy);
        assert!(!store.gateway_heartbeat("ghost").unwrap());
    }

    #[test]
    fn unknown_gateway_update_is_not_found() {
        let store = store();
        assert!(matches!(
            store.set_gateway_status("ghost", HealthStatus::Degraded),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn workers_register_and_heartbeat() {
        let store = store();
        let w = store
            .register_worker("loop-0", Some("gw"), ["shell".to_string()].into())
            .unwrap();
        assert_eq!(w.gateway_id.as_deref(), Some("gw"));

        store.set_worker_status("loop-0", HealthStatus::Unhealthy).unwrap();
        assert!(store.worker_heartbeat("loop-0").unwrap());
        assert_eq!(store.get_worker("loop-0").unwrap().unwrap().status, HealthStatus::Healthy);
        assert!(!store.worker_heartbeat("nobody").unwrap());
        assert_eq!(store.list_workers().unwrap().len(), 1);
    }

    #[test]
    fn system_state_counts() {
        let store = store();
        store.register_gateway(registration("gw", &[])).unwrap();
        store.enqueue(NewTask::new(json!({})).with_id("a").with_file("f")).unwrap();
        store.enqueue(NewTask::new(json!({})).with_id("b")).unwrap();
        store.claim("a", "w").unwrap();

        let state = store.system_state(42).unwrap();
        assert_eq!(state.timestamp, 42);
        assert_eq!(state.tasks[&TaskStatus::Claimed], 1);
        assert_eq!(state.tasks[&TaskStatus::Queued], 1);
        assert_eq!(state.tasks[&TaskStatus::Succeeded], 0);
        assert_eq!(state.gateways[&HealthStatus::Healthy], 1);
        assert_eq!(state.active_resource_locks, 1);
        assert_eq!(state.last_event_id, 3);
    }
}
