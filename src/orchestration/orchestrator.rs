//! # Orchestrator
//!
//! Composition root for the orchestration core. Owns the task coordinator,
//! health monitor, resource manager and workflow engine, routes the global
//! event queue to them, drives the system state machine, and performs agent
//! failover. Everything is injected through the constructor; there are no
//! global singletons.
//!
//! Sub-service runners are started without their own store subscription:
//! the orchestrator's event loop is the single delivery path, so an event
//! is handled exactly once per interested service.

use crate::config::HivemindConfig;
use crate::error::Result;
use crate::events::{Event, EventKind, EventPublisher};
use crate::orchestration::coordinator::TaskCoordinator;
use crate::orchestration::health::HealthMonitor;
use crate::orchestration::probe::{SysinfoProbe, SystemProbe};
use crate::orchestration::resources::ResourceManager;
use crate::orchestration::service::{OrchestrationService, ServiceRunner};
use crate::orchestration::types::{AgentRegistration, SystemState, TaskAssignment};
use crate::orchestration::workflows::{Vote, WorkflowEngine};
use crate::store::{keys, SharedStore};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Event-loop owner and system state machine over the sub-services.
pub struct Orchestrator {
    orchestrator_id: String,
    config: HivemindConfig,
    store: Arc<dyn SharedStore>,
    publisher: EventPublisher,
    coordinator: Arc<TaskCoordinator>,
    health: Arc<HealthMonitor>,
    resources: Arc<ResourceManager>,
    workflows: WorkflowEngine,
    coordinator_runner: ServiceRunner,
    health_runner: ServiceRunner,
    resources_runner: ServiceRunner,
    state: RwLock<SystemState>,
    running: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: HivemindConfig, store: Arc<dyn SharedStore>) -> Self {
        Self::with_probe(config, store, Arc::new(SysinfoProbe::new()))
    }

    /// Construct with an injected probe so tests and simulations control the
    /// resource readings every sub-service sees.
    pub fn with_probe(
        config: HivemindConfig,
        store: Arc<dyn SharedStore>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let orchestrator_id = format!("orchestrator-{}", Uuid::new_v4());
        let publisher = EventPublisher::new(store.clone(), "orchestrator");

        let coordinator = Arc::new(TaskCoordinator::new(
            orchestrator_id.clone(),
            config.coordinator.clone(),
            store.clone(),
        ));
        let health = Arc::new(HealthMonitor::with_probe(
            config.health.clone(),
            store.clone(),
            probe.clone(),
        ));
        let resources = Arc::new(ResourceManager::with_probe(
            config.resources.clone(),
            store.clone(),
            probe,
        ));
        let workflows = WorkflowEngine::new(store.clone());

        let coordinator_runner =
            ServiceRunner::new(coordinator.clone() as Arc<dyn OrchestrationService>, store.clone())
                .without_subscription();
        let health_runner =
            ServiceRunner::new(health.clone() as Arc<dyn OrchestrationService>, store.clone())
                .without_subscription();
        let resources_runner =
            ServiceRunner::new(resources.clone() as Arc<dyn OrchestrationService>, store.clone())
                .without_subscription();

        let (running, _) = watch::channel(false);
        Self {
            orchestrator_id,
            config,
            store,
            publisher,
            coordinator,
            health,
            resources,
            workflows,
            coordinator_runner,
            health_runner,
            resources_runner,
            state: RwLock::new(SystemState::Starting),
            running,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    pub async fn state(&self) -> SystemState {
        *self.state.read().await
    }

    /// Start sub-service runners and the orchestrator's own loops.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.coordinator_runner.start().await?;
        self.health_runner.start().await?;
        self.resources_runner.start().await?;
        self.running.send_replace(true);

        let o = &self.config.orchestrator;
        let mut handles = self.handles.lock();
        handles.push(Self::spawn_event_loop(self.clone()));
        handles.push(Self::spawn_periodic(
            self.clone(),
            "state_machine",
            Duration::from_secs(o.state_eval_interval_secs),
            |this| async move {
                this.evaluate_system_state().await;
                Ok(())
            },
        ));
        handles.push(Self::spawn_periodic(
            self.clone(),
            "coordination",
            Duration::from_secs(o.coordination_interval_secs),
            |this| async move { this.coordinate().await },
        ));
        handles.push(Self::spawn_periodic(
            self.clone(),
            "failover",
            Duration::from_secs(o.failover_interval_secs),
            |this| async move { this.failover_sweep().await },
        ));
        handles.push(Self::spawn_periodic(
            self.clone(),
            "snapshots",
            Duration::from_secs(o.snapshot_interval_secs),
            |this| async move { this.publish_snapshots().await },
        ));
        drop(handles);

        info!(orchestrator_id = %self.orchestrator_id, "Orchestrator started");
        Ok(())
    }

    /// Stop the orchestrator loops, then the sub-services.
    pub async fn stop(&self) {
        self.running.send_replace(false);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in &handles {
            handle.abort();
        }
        let _ = futures::future::join_all(handles).await;
        self.coordinator_runner.stop().await;
        self.health_runner.stop().await;
        self.resources_runner.stop().await;
        info!(orchestrator_id = %self.orchestrator_id, "Orchestrator stopped");
    }

    /// Route one event to every interested sub-service. Handler errors are
    /// logged and absorbed; a malformed event never stops the loop.
    pub async fn route_event(&self, event: &Event) {
        let result: Result<()> = match &event.kind {
            EventKind::TaskCreated | EventKind::TaskCompleted | EventKind::TaskFailed => {
                let coordinator = self.coordinator.handle_event(event).await;
                let health = self.health.handle_event(event).await;
                coordinator.and(health)
            }
            EventKind::AgentStarted | EventKind::AgentStopped => {
                let coordinator = self.coordinator.handle_event(event).await;
                let health = self.health.handle_event(event).await;
                let resources = self.resources.handle_event(event).await;
                coordinator.and(health).and(resources)
            }
            EventKind::AgentHeartbeat | EventKind::AgentMetrics => {
                let coordinator = self.coordinator.handle_event(event).await;
                let health = self.health.handle_event(event).await;
                coordinator.and(health)
            }
            EventKind::SystemAlert => self.resources.handle_event(event).await,
            EventKind::SystemPerformance => self.health.handle_event(event).await,
            EventKind::WorkflowStepCompleted => self.workflows.handle_step_completed(event).await,
            EventKind::Vote => self.cast_vote_from_event(event).await,
            EventKind::TaskAssigned
            | EventKind::TaskFailedPermanently
            | EventKind::TaskTimeout
            | EventKind::SystemStateChanged
            | EventKind::ScaleUpNeeded
            | EventKind::ScaleDownOpportunity
            | EventKind::MemoryLeakDetected
            | EventKind::EmergencyCleanup
            | EventKind::CacheClear
            | EventKind::ResourceCleanup
            | EventKind::Rebalance
            | EventKind::Proposal => {
                debug!(kind = %event.kind, "Informational event, not routed");
                Ok(())
            }
            EventKind::Other(kind) => {
                debug!(kind = %kind, source = %event.source, "Unknown event kind dropped");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(kind = %event.kind, error = %e, "Event handling failed");
        }
    }

    async fn cast_vote_from_event(&self, event: &Event) -> Result<()> {
        let vote: Vote = serde_json::from_value(event.data.clone())?;
        self.workflows.cast_vote(&vote).await
    }

    /// Re-derive the system state from the latest snapshot and coordinator
    /// stats. Operator-set states (maintenance, shutdown) are sticky.
    pub async fn evaluate_system_state(&self) -> SystemState {
        let current = *self.state.read().await;
        if matches!(current, SystemState::Maintenance | SystemState::ShuttingDown) {
            return current;
        }

        let Some(snapshot) = self.health.latest_snapshot().await else {
            return current;
        };
        let stats = self.coordinator.stats().await;
        let h = &self.config.health;
        let o = &self.config.orchestrator;

        let next = if snapshot.cpu_usage >= h.cpu_critical
            || snapshot.memory_usage >= h.memory_critical
            || snapshot.error_rate > o.error_rate_critical
            || stats.healthy_agents == 0
        {
            SystemState::Critical
        } else if snapshot.cpu_usage >= h.cpu_warning
            || snapshot.memory_usage >= h.memory_warning
            || snapshot.error_rate > o.error_rate_warning
            || stats.healthy_agents < o.min_agents
        {
            SystemState::Degraded
        } else {
            SystemState::Healthy
        };

        if next != current {
            self.transition_to(next).await;
        }
        next
    }

    async fn transition_to(&self, next: SystemState) {
        let previous = {
            let mut state = self.state.write().await;
            let previous = *state;
            *state = next;
            previous
        };
        if previous == next {
            return;
        }
        info!(previous = %previous, next = %next, "System state changed");
        self.publisher
            .publish(
                EventKind::SystemStateChanged,
                json!({"previous": previous, "current": next}),
            )
            .await;
    }

    /// Operator entry point: freeze state evaluation for maintenance.
    pub async fn enter_maintenance(&self) {
        self.transition_to(SystemState::Maintenance).await;
    }

    /// Operator entry point: leave maintenance and re-derive the state.
    pub async fn exit_maintenance(&self) {
        self.transition_to(SystemState::Starting).await;
        self.evaluate_system_state().await;
    }

    /// Operator entry point: mark the system shutting down and stop.
    pub async fn shutdown(&self) {
        self.transition_to(SystemState::ShuttingDown).await;
        self.stop().await;
    }

    /// Cross-correlate sub-service stats and raise higher-level alerts that
    /// no single service can see on its own.
    pub async fn coordinate(&self) -> Result<()> {
        let stats = self.coordinator.stats().await;
        self.health
            .set_queue_depths(stats.pending_tasks, stats.active_tasks);

        let capacity = stats.healthy_agents * self.config.orchestrator.backlog_per_agent;
        if stats.pending_tasks > capacity {
            self.health
                .trigger_alert(
                    "task_backlog",
                    json!({"resource": "task_queue"}),
                    json!({
                        "pending": stats.pending_tasks,
                        "capacity": capacity,
                        "healthy_agents": stats.healthy_agents,
                    }),
                )
                .await;
        }

        let score = self.health.health_score().await;
        let memory = self.resources.latest_memory_usage().await.unwrap_or(0.0);
        if score < 50.0 && memory > self.config.resources.memory_optimize {
            self.health
                .trigger_alert(
                    "system_pressure",
                    json!({"resource": "system"}),
                    json!({"health_score": score, "memory_usage": memory}),
                )
                .await;
        }
        Ok(())
    }

    /// Remove agents silent past the heartbeat timeout and re-inject all of
    /// their work as fresh `task.created` events (full re-entry, not resume).
    pub async fn failover_sweep(&self) -> Result<()> {
        let timeout = ChronoDuration::seconds(self.config.orchestrator.heartbeat_timeout_secs);
        let now = Utc::now();

        let silent: Vec<String> = self
            .coordinator
            .agents_last_seen()
            .await
            .into_iter()
            .filter(|(_, last_seen)| now - *last_seen > timeout)
            .map(|(agent_id, _)| agent_id)
            .collect();

        for agent_id in silent {
            warn!(agent_id = %agent_id, "Agent heartbeat timeout, failing over");
            let mut tasks = self.coordinator.fail_agent(&agent_id).await;

            // Assignments still sitting unstarted in the agent's queue are
            // duplicates of the in-flight set; dedupe by task id below.
            for payload in self.store.drain_list(&keys::agent_queue(&agent_id)).await? {
                match serde_json::from_str::<TaskAssignment>(&payload) {
                    Ok(assignment) => {
                        let mut task = assignment.task;
                        task.unassign();
                        tasks.push(task);
                    }
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Undecodable queued assignment dropped");
                    }
                }
            }
            if let Err(e) = self.store.delete(&keys::agent_record(&agent_id)).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to remove agent record");
            }

            let mut seen = HashSet::new();
            let mut reinjected = 0usize;
            for task in tasks {
                if seen.insert(task.id.clone()) {
                    self.publisher
                        .publish(EventKind::TaskCreated, json!({"task": task}))
                        .await;
                    reinjected += 1;
                }
            }
            info!(agent_id = %agent_id, reinjected = reinjected, "Failover complete");
        }
        Ok(())
    }

    /// Agent registry records written by the agents themselves under
    /// `agent:{id}`. Queue and status keys share the prefix and are
    /// filtered out.
    pub async fn registered_agents(&self) -> Result<Vec<AgentRegistration>> {
        let mut agents = Vec::new();
        for key in self.store.scan_keys("agent:").await? {
            if !keys::is_agent_record(&key) {
                continue;
            }
            if let Some(payload) = self.store.get(&key).await? {
                match serde_json::from_str(&payload) {
                    Ok(record) => agents.push(record),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Undecodable agent record skipped");
                    }
                }
            }
        }
        Ok(agents)
    }

    /// Publish the latest health and resource views to well-known keys with
    /// a short TTL so dashboards read them without touching the services.
    pub async fn publish_snapshots(&self) -> Result<()> {
        let ttl = Duration::from_secs(self.config.orchestrator.snapshot_ttl_secs);

        if let Some(snapshot) = self.health.latest_snapshot().await {
            let mut view = serde_json::to_value(&snapshot)?;
            view["health_score"] = json!(self.health.health_score().await);
            view["system_state"] = json!(self.state().await.to_string());
            self.store
                .set_with_ttl(keys::SYSTEM_HEALTH, &view.to_string(), ttl)
                .await?;
        }

        let summary = self.resources.summary().await;
        self.store
            .set_with_ttl(keys::SYSTEM_RESOURCES, &summary.to_string(), ttl)
            .await?;
        Ok(())
    }

    fn spawn_event_loop(this: Arc<Self>) -> JoinHandle<()> {
        let mut running = this.running.subscribe();
        tokio::spawn(async move {
            let timeout =
                Duration::from_secs(this.config.orchestrator.event_poll_timeout_secs);
            loop {
                tokio::select! {
                    popped = this.store.pop_list_timeout(keys::EVENT_QUEUE, timeout) => {
                        match popped {
                            Ok(Some(payload)) => match Event::from_json(&payload) {
                                Ok(event) => this.route_event(&event).await,
                                Err(e) => {
                                    warn!(error = %e, "Undecodable event payload dropped");
                                }
                            },
                            Ok(None) => {}
                            Err(e) => {
                                error!(error = %e, "Event queue pop failed");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                    changed = running.changed() => {
                        if changed.is_err() || !*running.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Event loop exited");
        })
    }

    fn spawn_periodic<F, Fut>(
        this: Arc<Self>,
        loop_name: &'static str,
        interval: Duration,
        iteration: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Orchestrator>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let mut running = this.running.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = iteration(this.clone()).await {
                            error!(loop_name = loop_name, error = %e, "Loop iteration failed, continuing");
                        }
                    }
                    changed = running.changed() => {
                        if changed.is_err() || !*running.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(loop_name = loop_name, "Loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::orchestration::probe::StaticProbe;
    use crate::orchestration::types::SystemSnapshot;
    use crate::store::MemoryStore;
    use serde_json::Value;

    fn orchestrator(store: Arc<MemoryStore>, config: HivemindConfig) -> Orchestrator {
        Orchestrator::with_probe(config, store, Arc::new(StaticProbe::default()))
    }

    fn snapshot(cpu: f64, memory: f64) -> SystemSnapshot {
        SystemSnapshot {
            timestamp: Utc::now(),
            cpu_usage: cpu,
            memory_usage: memory,
            disk_usage: 30.0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            active_agents: 1,
            total_agents: 1,
            tasks_queued: 0,
            tasks_processing: 0,
            error_rate: 0.0,
            response_time_ms: 0.0,
        }
    }

    fn agent_started(agent_id: &str) -> Event {
        Event::new(
            EventKind::AgentStarted,
            "test",
            json!({"agent_id": agent_id, "capabilities": []}),
        )
    }

    fn task_created(task_id: &str) -> Event {
        Event::new(
            EventKind::TaskCreated,
            "test",
            json!({"task": {"id": task_id, "task_type": "analysis"}}),
        )
    }

    async fn drain_events(store: &MemoryStore) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(payload) = store.pop_list(keys::EVENT_QUEUE).await.unwrap() {
            events.push(Event::from_json(&payload).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn state_machine_walks_degraded_then_critical() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone(), HivemindConfig::default());

        // One healthy agent against min_agents = 2.
        orchestrator.route_event(&agent_started("a1")).await;
        orchestrator.health().process_snapshot(snapshot(40.0, 40.0)).await;
        assert_eq!(
            orchestrator.evaluate_system_state().await,
            SystemState::Degraded
        );

        orchestrator.health().process_snapshot(snapshot(95.0, 40.0)).await;
        assert_eq!(
            orchestrator.evaluate_system_state().await,
            SystemState::Critical
        );

        let transitions: Vec<Event> = drain_events(&store)
            .await
            .into_iter()
            .filter(|e| e.kind == EventKind::SystemStateChanged)
            .collect();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].data["previous"], "starting");
        assert_eq!(transitions[0].data["current"], "degraded");
        assert_eq!(transitions[1].data["current"], "critical");
    }

    #[tokio::test]
    async fn zero_agents_is_critical_even_when_resources_are_fine() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store, HivemindConfig::default());
        orchestrator.health().process_snapshot(snapshot(10.0, 10.0)).await;
        assert_eq!(
            orchestrator.evaluate_system_state().await,
            SystemState::Critical
        );
    }

    #[tokio::test]
    async fn maintenance_freezes_state_evaluation() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store, HivemindConfig::default());
        orchestrator.enter_maintenance().await;
        orchestrator.health().process_snapshot(snapshot(95.0, 95.0)).await;
        assert_eq!(
            orchestrator.evaluate_system_state().await,
            SystemState::Maintenance
        );

        orchestrator.exit_maintenance().await;
        // Zero agents: re-evaluation lands in critical, not maintenance.
        assert_eq!(orchestrator.state().await, SystemState::Critical);
    }

    #[tokio::test]
    async fn failover_reinjects_silent_agents_tasks_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let config = HivemindConfig {
            orchestrator: OrchestratorConfig {
                heartbeat_timeout_secs: 0,
                ..OrchestratorConfig::default()
            },
            ..HivemindConfig::default()
        };
        let orchestrator = orchestrator(store.clone(), config);

        orchestrator.route_event(&agent_started("a1")).await;
        orchestrator.route_event(&task_created("t1")).await;
        orchestrator.coordinator().tick().await.unwrap();
        assert!(orchestrator.coordinator().active_task("t1").await.is_some());
        let _ = drain_events(&store).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        orchestrator.failover_sweep().await.unwrap();

        assert!(orchestrator.coordinator().agent_ids().await.is_empty());
        assert_eq!(store.list_len(&keys::agent_queue("a1")).await.unwrap(), 0);

        let recreated: Vec<Event> = drain_events(&store)
            .await
            .into_iter()
            .filter(|e| e.kind == EventKind::TaskCreated)
            .collect();
        assert_eq!(recreated.len(), 1);
        assert_eq!(recreated[0].data["task"]["id"], "t1");
        assert!(recreated[0].data["task"]["assigned_agent"].is_null());
    }

    #[tokio::test]
    async fn coordination_alerts_on_backlog_without_capacity() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store, HivemindConfig::default());
        orchestrator.route_event(&task_created("t1")).await;
        orchestrator.coordinate().await.unwrap();

        let kinds: Vec<String> = orchestrator
            .health()
            .active_alerts()
            .await
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert!(kinds.contains(&"task_backlog".to_string()));
    }

    #[tokio::test]
    async fn snapshots_are_published_with_ttl() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone(), HivemindConfig::default());
        orchestrator.health().process_snapshot(snapshot(20.0, 20.0)).await;
        orchestrator.publish_snapshots().await.unwrap();

        let health: Value = serde_json::from_str(
            &store.get(keys::SYSTEM_HEALTH).await.unwrap().unwrap(),
        )
        .unwrap();
        assert!(health["health_score"].as_f64().is_some());
        assert_eq!(health["system_state"], "starting");
        assert!(store.get(keys::SYSTEM_RESOURCES).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn registry_scan_skips_queue_and_status_keys() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone(), HivemindConfig::default());

        store
            .set(
                &keys::agent_record("a1"),
                &json!({
                    "id": "a1",
                    "agent_type": "analysis",
                    "status": "healthy",
                    "capabilities": ["analysis"],
                })
                .to_string(),
            )
            .await
            .unwrap();
        store.push_list(&keys::agent_queue("a1"), "{}").await.unwrap();
        store.set("agent:a1:status", "busy").await.unwrap();

        let agents = orchestrator.registered_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "a1");
        assert_eq!(agents[0].agent_type, "analysis");
    }

    #[tokio::test]
    async fn vote_events_land_on_the_proposal_list() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone(), HivemindConfig::default());
        orchestrator
            .route_event(&Event::new(
                EventKind::Vote,
                "a1",
                json!({"proposal_id": "p1", "voter": "a1", "approve": true}),
            ))
            .await;
        assert_eq!(
            store
                .list_len(&keys::consensus_votes("p1"))
                .await
                .unwrap(),
            1
        );
    }
}
