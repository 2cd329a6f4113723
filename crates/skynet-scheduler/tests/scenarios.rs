//! End-to-end scheduling scenarios against one shared store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use skynet_core::epoch_millis;
use skynet_gateway::{GatewayClient, IdempotentGateway, MemoryGateway};
use skynet_placement::{SelectionRequest, Selector};
use skynet_scheduler::{Reaper, ReaperPolicy, Scheduler, SchedulerPolicy};
use skynet_state::{
    EventType, GatewayRegistration, HealthStatus, NewTask, StateError, StateStore, TaskStatus,
};

fn register_gateway(state: &StateStore, id: &str, caps: &[&str]) {
    state
        .register_gateway(GatewayRegistration {
            gateway_id: id.to_string(),
            endpoint: format!("mem://{id}"),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            capacity: 8,
        })
        .unwrap();
}

fn schedulers(state: &StateStore, gateway: &MemoryGateway, count: usize) -> Vec<Arc<Scheduler>> {
    let client: Arc<dyn GatewayClient> = Arc::new(IdempotentGateway::new(gateway.clone()));
    (0..count)
        .map(|i| {
            Arc::new(
                Scheduler::new(
                    state.clone(),
                    client.clone(),
                    SchedulerPolicy {
                        batch_size: 4,
                        ..SchedulerPolicy::default()
                    },
                )
                .with_worker_id(format!("sched-{i}")),
            )
        })
        .collect()
}

fn all_terminal(state: &StateStore) -> bool {
    state
        .list_tasks(&Default::default())
        .unwrap()
        .iter()
        .all(|t| t.status.is_terminal())
}

#[tokio::test]
async fn dependency_chain_runs_in_order() {
    let state = StateStore::open_in_memory().unwrap();
    register_gateway(&state, "gw", &[]);
    state.enqueue(NewTask::new(json!({"step": 1})).with_id("T1")).unwrap();
    state
        .enqueue(NewTask::new(json!({"step": 2})).with_id("T2").depends_on("T1"))
        .unwrap();

    assert_eq!(state.list_ready(10, None).unwrap(), vec!["T1"]);
    assert!(matches!(
        state.claim("T2", "eager"),
        Err(StateError::DependencyNotSatisfied { .. })
    ));

    let gateway = MemoryGateway::new();
    let sched = schedulers(&state, &gateway, 1).remove(0);
    sched.run_once().await.unwrap();
    assert_eq!(state.get_task("T1").unwrap().unwrap().status, TaskStatus::Succeeded);
    assert_eq!(state.list_ready(10, None).unwrap(), vec!["T2"]);

    sched.run_once().await.unwrap();
    assert_eq!(state.get_task("T2").unwrap().unwrap().status, TaskStatus::Succeeded);

    let order: Vec<String> = gateway
        .dispatched()
        .into_iter()
        .map(|(_, req)| req.task_id)
        .collect();
    assert_eq!(order, vec!["T1", "T2"]);
}

#[test]
fn concurrent_claim_has_one_winner() {
    let state = StateStore::open_in_memory().unwrap();
    state.enqueue(NewTask::new(json!({})).with_id("X")).unwrap();

    let handles: Vec<_> = ["A", "B"]
        .into_iter()
        .map(|owner| {
            let state = state.clone();
            std::thread::spawn(move || state.claim("X", owner))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, StateError::ClaimConflict { .. }));

    let task = state.get_task("X").unwrap().unwrap();
    assert_eq!(task.claim_token.as_deref(), Some(winners[0].claim_token.as_str()));
}

#[tokio::test]
async fn reaped_claim_returns_to_pool_and_old_token_is_dead() {
    let state = StateStore::open_in_memory().unwrap();
    state.enqueue(NewTask::new(json!({})).with_id("T")).unwrap();
    let claim = state.claim("T", "crashed-worker").unwrap();

    let reaper = Reaper::new(
        state.clone(),
        ReaperPolicy {
            ttl: Duration::from_secs(5),
            ..ReaperPolicy::default()
        },
    );
    let report = reaper.reap_at(epoch_millis() + 6_000).await.unwrap();
    assert_eq!(report.released, vec!["T"]);

    let task = state.get_task("T").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Released);
    assert_eq!(task.retry_count, 1);

    for result in [
        state.start("T", &claim.claim_token, None).map(|_| ()),
        state.complete("T", &claim.claim_token, json!({})).map(|_| ()),
        state.fail("T", &claim.claim_token, json!("late")).map(|_| ()),
        state.renew("T", &claim.claim_token, Duration::from_secs(1)).map(|_| ()),
    ] {
        assert!(matches!(result, Err(StateError::StaleClaim { .. })));
    }
    assert_eq!(state.get_task("T").unwrap().unwrap().status, TaskStatus::Released);

    // Someone else can pick it up again.
    let reclaimed = state.claim("T", "healthy-worker").unwrap();
    assert_ne!(reclaimed.claim_token, claim.claim_token);
}

#[test]
fn missing_capability_has_no_candidate() {
    let state = StateStore::open_in_memory().unwrap();
    register_gateway(&state, "G1", &["docker"]);
    register_gateway(&state, "G2", &["shell"]);
    state.set_gateway_status("G1", HealthStatus::Unhealthy).unwrap();

    let gateways = state.list_gateways().unwrap();
    let err = Selector::default()
        .select(&gateways, &SelectionRequest::requiring(["docker"]))
        .unwrap_err();
    assert_eq!(err.registered, 2);

    let explanation = Selector::default().explain(&gateways, &SelectionRequest::requiring(["docker"]));
    assert!(explanation.chosen.is_none());
    assert_eq!(explanation.rejected.len(), 2);
}

#[tokio::test]
async fn no_candidate_task_stays_visible() {
    let state = StateStore::open_in_memory().unwrap();
    register_gateway(&state, "G1", &["docker"]);
    register_gateway(&state, "G2", &["shell"]);
    state.set_gateway_status("G1", HealthStatus::Unhealthy).unwrap();
    state
        .enqueue(NewTask::new(json!({})).with_id("D").requires("docker"))
        .unwrap();

    let gateway = MemoryGateway::new();
    let sched = schedulers(&state, &gateway, 1).remove(0);
    for _ in 0..3 {
        let report = sched.run_once().await.unwrap();
        assert_eq!(report.released, 1);
    }

    let task = state.get_task("D").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Released);
    assert_eq!(task.retry_count, 0);
    assert_eq!(gateway.total_executions(), 0);

    let diagnosis = state.diagnose("D").unwrap();
    assert!(diagnosis.ready);
    assert!(diagnosis.required_capabilities.contains("docker"));

    // Once the gateway recovers the task runs.
    state.gateway_heartbeat("G1").unwrap();
    sched.run_once().await.unwrap();
    assert_eq!(state.get_task("D").unwrap().unwrap().status, TaskStatus::Succeeded);
}

#[test]
fn shared_resource_is_mutually_exclusive() {
    let state = StateStore::open_in_memory().unwrap();
    for id in ["a", "b", "c", "d"] {
        state
            .enqueue(NewTask::new(json!({})).with_id(id).with_file("repo/Cargo.lock"))
            .unwrap();
    }

    let handles: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|id| {
            let state = state.clone();
            std::thread::spawn(move || state.claim(id, &format!("owner-{id}")))
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|r| r.is_ok())
        .count();
    assert_eq!(winners, 1);

    let locks = state.resource_locks().unwrap();
    assert_eq!(locks.len(), 1);
    let owner = &locks["repo/Cargo.lock"].owner_task_id;
    let claimed: Vec<_> = state
        .list_tasks(&Default::default())
        .unwrap()
        .into_iter()
        .filter(|t| t.status == TaskStatus::Claimed)
        .collect();
    assert_eq!(claimed.len(), 1);
    assert_eq!(&claimed[0].task_id, owner);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_schedulers_execute_each_task_once() {
    let state = StateStore::open_in_memory().unwrap();
    register_gateway(&state, "gw-a", &["shell"]);
    register_gateway(&state, "gw-b", &["shell", "docker"]);

    let mut ids = Vec::new();
    for i in 0..24 {
        let mut task = NewTask::new(json!({"n": i})).with_id(format!("job-{i:02}"));
        if i % 3 == 0 {
            task = task.requires("docker");
        }
        if i % 4 == 0 {
            task = task.with_file("shared.db");
        }
        if i > 0 && i % 5 == 0 {
            task = task.depends_on(format!("job-{:02}", i - 1));
        }
        ids.push(state.enqueue(task).unwrap());
    }

    let gateway = MemoryGateway::new().with_delay(Duration::from_millis(2));
    let loops = schedulers(&state, &gateway, 3);

    for _ in 0..100 {
        if all_terminal(&state) {
            break;
        }
        let handles: Vec<_> = loops
            .iter()
            .cloned()
            .map(|sched| tokio::spawn(async move { sched.run_once().await }))
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    assert!(all_terminal(&state));
    for id in &ids {
        let task = state.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded, "{id}");
        assert_eq!(gateway.executions(id), 1, "{id} executed more than once");
        if task.required_capabilities.contains("docker") {
            assert_eq!(task.assigned_gateway.as_deref(), Some("gw-b"));
        }

        let claims = state
            .task_events(id)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == EventType::Claimed)
            .count();
        assert_eq!(claims, 1, "{id} claimed more than once");
    }
    assert!(state.resource_locks().unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_dispatch_is_absorbed() {
    let gateway = MemoryGateway::new();
    let client = IdempotentGateway::new(gateway.clone());
    let request = skynet_gateway::DispatchRequest {
        task_id: "T".to_string(),
        action: json!({"action": "deploy"}),
        idempotency_key: "claim-token-1".to_string(),
    };

    let first = client.execute_task("mem://gw", &request).await.unwrap();
    // Retry after an apparent network timeout.
    let second = client.execute_task("mem://gw", &request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(gateway.executions("T"), 1);
}

#[tokio::test]
async fn event_stream_replays_full_history() {
    let state = StateStore::open_in_memory().unwrap();
    register_gateway(&state, "gw", &[]);
    state.enqueue(NewTask::new(json!({})).with_id("T")).unwrap();
    let gateway = MemoryGateway::new();
    schedulers(&state, &gateway, 1)[0].run_once().await.unwrap();

    let mut cursor = 0;
    let mut seen = Vec::new();
    loop {
        let page = state.poll_events(cursor, 2).unwrap();
        if page.events.is_empty() {
            assert_eq!(page.next_cursor, cursor);
            break;
        }
        seen.extend(page.events);
        cursor = page.next_cursor;
    }

    let kinds: Vec<EventType> = seen.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::Enqueued,
            EventType::Claimed,
            EventType::Started,
            EventType::Succeeded
        ]
    );
    let ids: Vec<u64> = seen.iter().map(|e| e.event_id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen[3].to_status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn loops_and_reaper_stop_on_shutdown() {
    let state = StateStore::open_in_memory().unwrap();
    register_gateway(&state, "gw", &[]);
    for i in 0..5 {
        state.enqueue(NewTask::new(json!({})).with_id(format!("t{i}"))).unwrap();
    }

    let gateway = MemoryGateway::new();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();
    for i in 0..2 {
        let sched = Arc::new(
            Scheduler::new(
                state.clone(),
                Arc::new(gateway.clone()),
                SchedulerPolicy {
                    poll_interval: Duration::from_millis(10),
                    ..SchedulerPolicy::default()
                },
            )
            .with_worker_id(format!("loop-{i}")),
        );
        handles.push(tokio::spawn(sched.run(rx.clone())));
    }
    let reaper = Arc::new(Reaper::new(
        state.clone(),
        ReaperPolicy {
            interval: Duration::from_millis(10),
            ..ReaperPolicy::default()
        },
    ));
    handles.push(tokio::spawn(reaper.run(rx.clone())));

    for _ in 0..200 {
        if all_terminal(&state) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    assert!(all_terminal(&state));
    let owners: BTreeSet<String> = state
        .list_workers()
        .unwrap()
        .into_iter()
        .map(|w| w.worker_id)
        .collect();
    assert_eq!(owners.len(), 2);

    let per_task: HashMap<String, usize> = (0..5)
        .map(|i| format!("t{i}"))
        .map(|id| {
            let n = gateway.executions(&id);
            (id, n)
        })
        .collect();
    assert!(per_task.values().all(|n| *n == 1));
}
