//! End-to-end flows over the store wire: external producers push raw JSON
//! events onto the global queue, the orchestrator routes them, and
//! assignments come back out on the per-agent queues.

use chrono::Utc;
use hivemind_core::config::HivemindConfig;
use hivemind_core::events::{Event, EventKind};
use hivemind_core::orchestration::probe::StaticProbe;
use hivemind_core::orchestration::types::{SystemSnapshot, SystemState, TaskAssignment};
use hivemind_core::orchestration::workflows::{Vote, WorkflowStep};
use hivemind_core::orchestration::{Orchestrator, OrchestrationService};
use hivemind_core::store::{keys, MemoryStore, SharedStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use uuid::Uuid;

fn build_orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
    Orchestrator::with_probe(
        HivemindConfig::default(),
        store,
        Arc::new(StaticProbe::default()),
    )
}

/// Push a raw wire-shaped event the way an external (non-Rust) producer
/// would, without going through this crate's `Event` constructor.
async fn push_raw_event(store: &MemoryStore, kind: &str, data: Value) {
    let payload = json!({
        "id": Uuid::new_v4(),
        "type": kind,
        "source": "api",
        "data": data,
        "timestamp": Utc::now(),
    })
    .to_string();
    store.push_list(keys::EVENT_QUEUE, &payload).await.unwrap();
}

/// Drain the global queue through the orchestrator's router until it is
/// empty, including events published while routing.
async fn pump(orchestrator: &Orchestrator, store: &MemoryStore) -> Vec<EventKind> {
    let mut routed = Vec::new();
    while let Some(payload) = store.pop_list(keys::EVENT_QUEUE).await.unwrap() {
        let event = Event::from_json(&payload).unwrap();
        routed.push(event.kind.clone());
        orchestrator.route_event(&event).await;
    }
    routed
}

fn healthy_snapshot() -> SystemSnapshot {
    SystemSnapshot {
        timestamp: Utc::now(),
        cpu_usage: 20.0,
        memory_usage: 25.0,
        disk_usage: 30.0,
        network_rx_bytes: 0,
        network_tx_bytes: 0,
        active_agents: 2,
        total_agents: 2,
        tasks_queued: 0,
        tasks_processing: 0,
        error_rate: 0.0,
        response_time_ms: 0.0,
    }
}

#[tokio::test]
async fn task_lifecycle_over_the_wire() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = build_orchestrator(store.clone());

    push_raw_event(
        &store,
        "agent.started",
        json!({"agent_id": "a1", "capabilities": ["analysis"]}),
    )
    .await;
    push_raw_event(
        &store,
        "agent.started",
        json!({"agent_id": "a2", "capabilities": ["analysis"]}),
    )
    .await;
    push_raw_event(
        &store,
        "task.created",
        json!({"task": {"id": "t1", "task_type": "analysis", "capabilities": ["analysis"]}}),
    )
    .await;
    pump(&orchestrator, &store).await;

    let stats = orchestrator.coordinator().stats().await;
    assert_eq!(stats.registered_agents, 2);
    assert_eq!(stats.pending_tasks, 1);

    // Scheduling cycle: the task lands on exactly one agent queue.
    tokio_test::assert_ok!(orchestrator.coordinator().tick().await);
    let mut assignment = None;
    for agent_id in ["a1", "a2"] {
        if let Some(payload) = store.pop_list(&keys::agent_queue(agent_id)).await.unwrap() {
            assignment = Some(serde_json::from_str::<TaskAssignment>(&payload).unwrap());
        }
    }
    let assignment = assignment.expect("task was assigned to an agent");
    assert_eq!(assignment.task_id, "t1");
    let routed = pump(&orchestrator, &store).await;
    assert!(routed.contains(&EventKind::TaskAssigned));

    // The executing agent reports completion the same way it got the work.
    push_raw_event(
        &store,
        "task.completed",
        json!({
            "task_id": "t1",
            "agent_id": assignment.assigned_agent,
            "duration_secs": 2.5,
        }),
    )
    .await;
    pump(&orchestrator, &store).await;

    let stats = orchestrator.coordinator().stats().await;
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.active_tasks, 0);

    // With two healthy agents and calm resources the system is healthy.
    orchestrator.health().process_snapshot(healthy_snapshot()).await;
    assert_eq!(
        orchestrator.evaluate_system_state().await,
        SystemState::Healthy
    );
}

#[tokio::test]
async fn failed_task_is_retried_on_the_surviving_agent() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = build_orchestrator(store.clone());

    push_raw_event(&store, "agent.started", json!({"agent_id": "a1", "capabilities": []})).await;
    push_raw_event(
        &store,
        "task.created",
        json!({"task": {"id": "t1", "task_type": "analysis"}}),
    )
    .await;
    pump(&orchestrator, &store).await;
    tokio_test::assert_ok!(orchestrator.coordinator().tick().await);
    pump(&orchestrator, &store).await;

    push_raw_event(&store, "task.failed", json!({"task_id": "t1", "error": "boom"})).await;
    pump(&orchestrator, &store).await;

    // Failure recycled the task to pending; the next cycle reassigns it.
    assert_eq!(orchestrator.coordinator().pending_task_ids().await, vec!["t1"]);
    store.drain_list(&keys::agent_queue("a1")).await.unwrap();
    tokio_test::assert_ok!(orchestrator.coordinator().tick().await);
    let task = orchestrator
        .coordinator()
        .active_task("t1")
        .await
        .expect("task reassigned");
    assert_eq!(task.retry_count, 1);
}

#[tokio::test]
async fn sequential_workflow_advances_through_wire_events() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = build_orchestrator(store.clone());

    orchestrator
        .workflows()
        .start_sequential(
            "w1",
            vec![
                WorkflowStep {
                    name: "collect".to_string(),
                    agent_id: "a1".to_string(),
                    data: json!({}),
                },
                WorkflowStep {
                    name: "report".to_string(),
                    agent_id: "a2".to_string(),
                    data: json!({}),
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(store.list_len(&keys::agent_queue("a1")).await.unwrap(), 1);

    push_raw_event(&store, "workflow.step_completed", json!({"workflow_id": "w1"})).await;
    pump(&orchestrator, &store).await;
    assert_eq!(store.list_len(&keys::agent_queue("a2")).await.unwrap(), 1);

    push_raw_event(&store, "workflow.step_completed", json!({"workflow_id": "w1"})).await;
    pump(&orchestrator, &store).await;
    assert!(orchestrator.workflows().load("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn consensus_counts_votes_routed_from_the_wire() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = build_orchestrator(store.clone());

    for (voter, approve) in [("a1", true), ("a2", false), ("a3", true)] {
        push_raw_event(
            &store,
            "coordination.vote",
            json!({"proposal_id": "p1", "voter": voter, "approve": approve}),
        )
        .await;
    }
    pump(&orchestrator, &store).await;

    // Votes are already on the list; a zero-length window just tallies.
    let engine = hivemind_core::orchestration::WorkflowEngine::new(store.clone())
        .with_vote_window(Duration::from_millis(1));
    let result = engine.run_consensus("p1", json!({"action": "restart"})).await.unwrap();
    assert!(result.approved);
    assert_eq!(result.approve_votes, 2);
    assert_eq!(result.reject_votes, 1);
}

#[tokio::test]
async fn unknown_and_malformed_events_do_not_stop_routing() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = build_orchestrator(store.clone());

    push_raw_event(&store, "trading.order_filled", json!({"order": 1})).await;
    // task.completed without its task_id is malformed for the coordinator.
    push_raw_event(&store, "task.completed", json!({})).await;
    push_raw_event(&store, "agent.started", json!({"agent_id": "a1", "capabilities": []})).await;
    pump(&orchestrator, &store).await;

    // The good event after the bad ones was still processed.
    assert_eq!(orchestrator.coordinator().agent_ids().await, vec!["a1"]);
}

#[tokio::test]
async fn vote_struct_matches_wire_shape() {
    let vote: Vote =
        serde_json::from_value(json!({"proposal_id": "p1", "voter": "a1", "approve": true}))
            .unwrap();
    assert_eq!(vote.proposal_id, "p1");
    assert!(vote.approve);
}
