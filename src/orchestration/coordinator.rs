//! # Task Coordinator
//!
//! Tracks pending and active tasks plus the agents that can execute them,
//! and assigns work using a load/performance score. Assignment is claimed
//! through the store's atomic `set_nx` so concurrent coordinator replicas
//! cannot double-assign a task.
//!
//! ## Task lifecycle
//!
//! `task.created` puts a task into the pending map. The scheduling loop
//! moves dependency-satisfied tasks to active by pushing an assignment onto
//! the chosen agent's queue. `task.completed` retires the task;
//! `task.failed` recycles it through the bounded retry policy (max 3);
//! a 10-minute timeout or an `agent.stopped` returns it to pending without
//! touching the retry count.

use crate::config::CoordinatorConfig;
use crate::error::{HivemindError, Result};
use crate::events::{Event, EventKind, EventPublisher};
use crate::orchestration::service::{BackgroundJob, OrchestrationService};
use crate::orchestration::types::{AgentMetrics, AgentStatus, Task, TaskAssignment};
use crate::store::{keys, SharedStore};
use crate::utils::RingBuffer;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const COMPLETION_HISTORY: usize = 1000;
const AGENT_PERFORMANCE_HISTORY: usize = 100;

/// Aggregate view of the coordinator for cross-service correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub pending_tasks: usize,
    pub active_tasks: usize,
    pub registered_agents: usize,
    pub healthy_agents: usize,
}

struct CoordinatorState {
    pending_tasks: HashMap<String, Task>,
    active_tasks: HashMap<String, Task>,
    task_dependencies: HashMap<String, Vec<String>>,
    agent_metrics: HashMap<String, AgentMetrics>,
    agent_capabilities: HashMap<String, HashSet<String>>,
    completion_times: RingBuffer<f64>,
    agent_performance: HashMap<String, RingBuffer<f64>>,
}

impl CoordinatorState {
    fn new() -> Self {
        Self {
            pending_tasks: HashMap::new(),
            active_tasks: HashMap::new(),
            task_dependencies: HashMap::new(),
            agent_metrics: HashMap::new(),
            agent_capabilities: HashMap::new(),
            completion_times: RingBuffer::new(COMPLETION_HISTORY),
            agent_performance: HashMap::new(),
        }
    }

    /// A task is schedulable once every prerequisite has left both maps.
    fn dependencies_satisfied(&self, task_id: &str) -> bool {
        match self.task_dependencies.get(task_id) {
            None => true,
            Some(deps) => deps
                .iter()
                .all(|dep| !self.pending_tasks.contains_key(dep) && !self.active_tasks.contains_key(dep)),
        }
    }

    fn avg_completion_secs(&self, agent_id: &str) -> f64 {
        match self.agent_performance.get(agent_id) {
            Some(history) if !history.is_empty() => {
                history.iter().sum::<f64>() / history.len() as f64
            }
            _ => 0.0,
        }
    }

    /// Rank capability-matching agents by load score plus a normalized
    /// completion-time penalty; lowest score wins.
    fn select_best_agent(&self, task: &Task) -> Option<String> {
        self.agent_capabilities
            .iter()
            .filter(|(_, caps)| task.capabilities.is_subset(caps))
            .filter_map(|(agent_id, _)| {
                self.agent_metrics.get(agent_id).map(|metrics| {
                    let penalty = (self.avg_completion_secs(agent_id) / 10.0).min(20.0);
                    (agent_id.clone(), metrics.load_score() + penalty)
                })
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(agent_id, _)| agent_id)
    }

    fn decrement_agent_tasks(&mut self, agent_id: &str) {
        if let Some(metrics) = self.agent_metrics.get_mut(agent_id) {
            metrics.active_tasks = metrics.active_tasks.saturating_sub(1);
        }
    }
}

/// Event-driven task scheduler with claimed assignment and bounded retries.
pub struct TaskCoordinator {
    coordinator_id: String,
    config: CoordinatorConfig,
    store: Arc<dyn SharedStore>,
    publisher: EventPublisher,
    state: RwLock<CoordinatorState>,
}

impl TaskCoordinator {
    pub fn new(
        coordinator_id: impl Into<String>,
        config: CoordinatorConfig,
        store: Arc<dyn SharedStore>,
    ) -> Self {
        let publisher = EventPublisher::new(store.clone(), "task_coordinator");
        Self {
            coordinator_id: coordinator_id.into(),
            config,
            store,
            publisher,
            state: RwLock::new(CoordinatorState::new()),
        }
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let state = self.state.read().await;
        CoordinatorStats {
            pending_tasks: state.pending_tasks.len(),
            active_tasks: state.active_tasks.len(),
            registered_agents: state.agent_metrics.len(),
            healthy_agents: state
                .agent_metrics
                .values()
                .filter(|m| m.status == AgentStatus::Healthy)
                .count(),
        }
    }

    pub async fn pending_task_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.pending_tasks.keys().cloned().collect()
    }

    pub async fn active_task(&self, task_id: &str) -> Option<Task> {
        let state = self.state.read().await;
        state.active_tasks.get(task_id).cloned()
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.agent_metrics.keys().cloned().collect()
    }

    /// Last-seen timestamps for every registered agent, used by the
    /// orchestrator's failover sweep.
    pub async fn agents_last_seen(&self) -> Vec<(String, DateTime<Utc>)> {
        let state = self.state.read().await;
        state
            .agent_metrics
            .iter()
            .map(|(id, m)| (id.clone(), m.last_seen))
            .collect()
    }

    /// Remove a failed agent entirely and hand back its in-flight tasks so
    /// the caller can re-inject them into routing.
    pub async fn fail_agent(&self, agent_id: &str) -> Vec<Task> {
        let mut state = self.state.write().await;
        state.agent_metrics.remove(agent_id);
        state.agent_capabilities.remove(agent_id);
        state.agent_performance.remove(agent_id);

        let orphaned: Vec<String> = state
            .active_tasks
            .iter()
            .filter(|(_, task)| task.assigned_agent.as_deref() == Some(agent_id))
            .map(|(id, _)| id.clone())
            .collect();

        let mut tasks = Vec::with_capacity(orphaned.len());
        for task_id in orphaned {
            if let Some(mut task) = state.active_tasks.remove(&task_id) {
                task.unassign();
                tasks.push(task);
            }
        }
        drop(state);

        for task in &tasks {
            self.release_claim(&task.id).await;
        }
        tasks
    }

    async fn release_claim(&self, task_id: &str) {
        if let Err(e) = self.store.delete(&keys::task_claim(task_id)).await {
            warn!(task_id = task_id, error = %e, "Failed to release task claim");
        }
    }

    async fn handle_task_created(&self, data: &Value) -> Result<()> {
        let task = parse_task(data)?;
        let dependencies: Vec<String> = data
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut state = self.state.write().await;
        if state.pending_tasks.contains_key(&task.id) || state.active_tasks.contains_key(&task.id) {
            debug!(task_id = %task.id, "Duplicate task.created ignored");
            return Ok(());
        }
        if !dependencies.is_empty() {
            state.task_dependencies.insert(task.id.clone(), dependencies);
        }
        info!(task_id = %task.id, task_type = %task.task_type, "Task enqueued");
        state.pending_tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn handle_task_completed(&self, data: &Value) -> Result<()> {
        let task_id = require_str(data, "task_id")?;
        let mut state = self.state.write().await;
        let Some(task) = state.active_tasks.remove(task_id) else {
            debug!(task_id = task_id, "Completion for unknown task ignored");
            return Ok(());
        };

        let duration_secs = data
            .get("duration_secs")
            .and_then(Value::as_f64)
            .or_else(|| {
                task.assigned_at
                    .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0)
            })
            .unwrap_or(0.0);

        state.completion_times.push(duration_secs);
        if let Some(agent_id) = task.assigned_agent.as_deref() {
            state.decrement_agent_tasks(agent_id);
            state
                .agent_performance
                .entry(agent_id.to_string())
                .or_insert_with(|| RingBuffer::new(AGENT_PERFORMANCE_HISTORY))
                .push(duration_secs);
        }
        drop(state);

        self.release_claim(task_id).await;
        debug!(task_id = task_id, duration_secs = duration_secs, "Task completed");
        Ok(())
    }

    async fn handle_task_failed(&self, data: &Value) -> Result<()> {
        let task_id = require_str(data, "task_id")?;
        let mut state = self.state.write().await;
        let Some(mut task) = state.active_tasks.remove(task_id) else {
            debug!(task_id = task_id, "Failure for unknown task ignored");
            return Ok(());
        };

        if let Some(agent_id) = task.assigned_agent.as_deref() {
            state.decrement_agent_tasks(agent_id);
        }

        task.retry_count += 1;
        task.unassign();

        if task.retry_count <= self.config.max_retries {
            info!(
                task_id = task_id,
                retry_count = task.retry_count,
                "Task failed, re-enqueued for retry"
            );
            state.pending_tasks.insert(task.id.clone(), task);
            drop(state);
        } else {
            warn!(
                task_id = task_id,
                retry_count = task.retry_count,
                "Task exceeded retry limit, failing permanently"
            );
            drop(state);
            self.publisher
                .publish(
                    EventKind::TaskFailedPermanently,
                    json!({
                        "task_id": task_id,
                        "retry_count": task.retry_count,
                        "error": data.get("error").cloned().unwrap_or(Value::Null),
                    }),
                )
                .await;
        }

        self.release_claim(task_id).await;
        Ok(())
    }

    async fn handle_agent_started(&self, data: &Value) -> Result<()> {
        let agent_id = require_str(data, "agent_id")?;
        let capabilities: HashSet<String> = data
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| {
                caps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut state = self.state.write().await;
        state
            .agent_metrics
            .insert(agent_id.to_string(), AgentMetrics::zeroed());
        state
            .agent_capabilities
            .insert(agent_id.to_string(), capabilities);
        info!(agent_id = agent_id, "Agent registered");
        Ok(())
    }

    async fn handle_agent_stopped(&self, data: &Value) -> Result<()> {
        let agent_id = require_str(data, "agent_id")?;
        let mut state = self.state.write().await;
        state.agent_metrics.remove(agent_id);
        state.agent_capabilities.remove(agent_id);
        state.agent_performance.remove(agent_id);

        let orphaned: Vec<String> = state
            .active_tasks
            .iter()
            .filter(|(_, task)| task.assigned_agent.as_deref() == Some(agent_id))
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in &orphaned {
            if let Some(mut task) = state.active_tasks.remove(task_id) {
                task.unassign();
                state.pending_tasks.insert(task.id.clone(), task);
            }
        }
        drop(state);

        for task_id in &orphaned {
            self.release_claim(task_id).await;
        }
        info!(
            agent_id = agent_id,
            reassigned = orphaned.len(),
            "Agent stopped, in-flight tasks returned to pending"
        );
        Ok(())
    }

    async fn handle_agent_metrics(&self, data: &Value) -> Result<()> {
        let agent_id = require_str(data, "agent_id")?;
        let mut state = self.state.write().await;
        let Some(metrics) = state.agent_metrics.get_mut(agent_id) else {
            debug!(agent_id = agent_id, "Metrics for unknown agent ignored");
            return Ok(());
        };
        if let Some(cpu) = data.get("cpu_usage").and_then(Value::as_f64) {
            metrics.cpu_usage = cpu;
        }
        if let Some(mem) = data.get("memory_usage").and_then(Value::as_f64) {
            metrics.memory_usage = mem;
        }
        metrics.status = AgentStatus::Healthy;
        metrics.last_seen = Utc::now();
        Ok(())
    }

    async fn handle_agent_heartbeat(&self, data: &Value) -> Result<()> {
        let agent_id = require_str(data, "agent_id")?;
        let mut state = self.state.write().await;
        if let Some(metrics) = state.agent_metrics.get_mut(agent_id) {
            metrics.last_seen = Utc::now();
            metrics.status = AgentStatus::Healthy;
        }
        Ok(())
    }

    /// Assign every dependency-satisfied pending task for which an agent is
    /// available. Tasks with no candidate stay pending.
    async fn schedule_pending(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let candidates: Vec<String> = state
            .pending_tasks
            .keys()
            .filter(|id| state.dependencies_satisfied(id))
            .cloned()
            .collect();

        for task_id in candidates {
            let Some(agent_id) = state
                .pending_tasks
                .get(&task_id)
                .and_then(|task| state.select_best_agent(task))
            else {
                continue;
            };

            // Claim before assignment so a concurrent coordinator replica
            // observing the same pending task backs off.
            let claim_ttl = Duration::from_secs(self.config.claim_ttl_secs);
            match self
                .store
                .set_nx(&keys::task_claim(&task_id), &self.coordinator_id, claim_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    // The claim holder may still be assigning, or may have
                    // died. Either way the task stays pending: the claim TTL
                    // expires and a later cycle picks it up again.
                    debug!(task_id = %task_id, "Task claimed elsewhere, skipping this cycle");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Claim failed, retrying next cycle");
                    continue;
                }
            }

            let Some(mut task) = state.pending_tasks.remove(&task_id) else {
                continue;
            };
            let assigned_at = Utc::now();
            task.assigned_agent = Some(agent_id.clone());
            task.assigned_at = Some(assigned_at);

            let assignment = TaskAssignment {
                task_id: task.id.clone(),
                task: task.clone(),
                assigned_agent: agent_id.clone(),
                assigned_at,
            };
            let payload = serde_json::to_string(&assignment)?;
            if let Err(e) = self
                .store
                .push_list(&keys::agent_queue(&agent_id), &payload)
                .await
            {
                warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Queue push failed");
                task.unassign();
                state.pending_tasks.insert(task.id.clone(), task);
                self.release_claim(&task_id).await;
                continue;
            }

            if let Some(metrics) = state.agent_metrics.get_mut(&agent_id) {
                metrics.active_tasks += 1;
            }
            state.active_tasks.insert(task.id.clone(), task);
            info!(task_id = %task_id, agent_id = %agent_id, "Task assigned");
            self.publisher
                .publish(
                    EventKind::TaskAssigned,
                    json!({"task_id": task_id, "agent_id": agent_id}),
                )
                .await;
        }
        Ok(())
    }

    /// Return active tasks whose assignment exceeded the timeout to pending.
    /// Distinct from the failure path: the retry count is not incremented.
    async fn sweep_timeouts(&self) -> Result<()> {
        let timeout = ChronoDuration::seconds(self.config.task_timeout_secs);
        let now = Utc::now();

        let mut state = self.state.write().await;
        let timed_out: Vec<String> = state
            .active_tasks
            .iter()
            .filter(|(_, task)| task.assigned_at.is_some_and(|at| now - at > timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in timed_out {
            let Some(mut task) = state.active_tasks.remove(&task_id) else {
                continue;
            };
            let agent_id = task.assigned_agent.clone();
            if let Some(agent_id) = agent_id.as_deref() {
                state.decrement_agent_tasks(agent_id);
            }
            task.unassign();
            state.pending_tasks.insert(task.id.clone(), task);

            warn!(task_id = %task_id, agent_id = ?agent_id, "Task timed out, returned to pending");
            self.release_claim(&task_id).await;
            self.publisher
                .publish(
                    EventKind::TaskTimeout,
                    json!({"task_id": task_id, "agent_id": agent_id}),
                )
                .await;
        }
        Ok(())
    }

    /// Emit aggregate completion statistics.
    async fn analyze_performance(&self) -> Result<()> {
        let state = self.state.read().await;
        let times: Vec<f64> = state.completion_times.to_vec();
        let pending = state.pending_tasks.len();
        let active = state.active_tasks.len();
        drop(state);

        let (avg, min, max) = if times.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = times.iter().sum();
            let min = times.iter().copied().fold(f64::INFINITY, f64::min);
            let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (sum / times.len() as f64, min, max)
        };

        self.publisher
            .publish(
                EventKind::SystemPerformance,
                json!({
                    "tasks_completed": times.len(),
                    "avg_completion_secs": avg,
                    "min_completion_secs": min,
                    "max_completion_secs": max,
                    "tasks_pending": pending,
                    "tasks_active": active,
                }),
            )
            .await;
        Ok(())
    }

    /// Migrate queued-but-unstarted work away from overloaded agents.
    ///
    /// Only assignments still sitting in the agent's store queue are moved;
    /// a task the agent already popped keeps running where it is. Returned
    /// tasks go through normal scheduling, which will prefer the
    /// underloaded agents by score.
    async fn rebalance_load(&self) -> Result<()> {
        let state = self.state.read().await;
        let overloaded: Vec<String> = state
            .agent_metrics
            .iter()
            .filter(|(_, m)| {
                m.load_score() > self.config.overload_threshold && m.active_tasks > 2
            })
            .map(|(id, _)| id.clone())
            .collect();
        let underloaded: Vec<String> = state
            .agent_metrics
            .iter()
            .filter(|(_, m)| {
                m.load_score() < self.config.underload_threshold && m.active_tasks < 2
            })
            .map(|(id, _)| id.clone())
            .collect();
        drop(state);

        if overloaded.is_empty() || underloaded.is_empty() {
            return Ok(());
        }

        for agent_id in &overloaded {
            let queued = self.store.drain_list(&keys::agent_queue(agent_id)).await?;
            if queued.is_empty() {
                continue;
            }

            let mut moved = Vec::new();
            let mut unmatched = Vec::new();
            let mut state = self.state.write().await;
            for payload in queued {
                match serde_json::from_str::<TaskAssignment>(&payload) {
                    Ok(assignment) => {
                        if let Some(mut task) = state.active_tasks.remove(&assignment.task_id) {
                            state.decrement_agent_tasks(agent_id);
                            task.unassign();
                            moved.push(task.id.clone());
                            state.pending_tasks.insert(task.id.clone(), task);
                        } else {
                            unmatched.push(payload);
                        }
                    }
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Undecodable queued assignment");
                        unmatched.push(payload);
                    }
                }
            }
            drop(state);

            // Anything this coordinator cannot account for is not ours to
            // drop; put it back where it was.
            for payload in &unmatched {
                if let Err(e) = self
                    .store
                    .push_list(&keys::agent_queue(agent_id), payload)
                    .await
                {
                    warn!(agent_id = %agent_id, error = %e, "Failed to restore queued assignment");
                }
            }

            for task_id in &moved {
                self.release_claim(task_id).await;
            }
            if !moved.is_empty() {
                info!(agent_id = %agent_id, moved = moved.len(), "Rebalanced queued tasks");
                self.publisher
                    .publish(
                        EventKind::Rebalance,
                        json!({
                            "from_agent": agent_id,
                            "moved_tasks": moved,
                            "overloaded": overloaded,
                            "underloaded": underloaded,
                        }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Drop dependency records whose prerequisites have all completed.
    async fn resolve_dependencies(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let resolved: Vec<String> = state
            .task_dependencies
            .keys()
            .filter(|id| state.dependencies_satisfied(id))
            .cloned()
            .collect();
        for task_id in resolved {
            state.task_dependencies.remove(&task_id);
            debug!(task_id = %task_id, "Dependencies satisfied");
        }
        Ok(())
    }
}

#[async_trait]
impl OrchestrationService for TaskCoordinator {
    fn name(&self) -> &'static str {
        "task_coordinator"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::TaskCreated,
            EventKind::TaskCompleted,
            EventKind::TaskFailed,
            EventKind::AgentStarted,
            EventKind::AgentStopped,
            EventKind::AgentMetrics,
            EventKind::AgentHeartbeat,
        ]
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.config.schedule_interval_secs)
    }

    async fn tick(&self) -> Result<()> {
        self.schedule_pending().await?;
        self.sweep_timeouts().await
    }

    fn background_jobs(&self) -> Vec<BackgroundJob> {
        vec![
            BackgroundJob {
                name: "performance_analyzer",
                interval: Duration::from_secs(self.config.performance_interval_secs),
            },
            BackgroundJob {
                name: "load_balancer",
                interval: Duration::from_secs(self.config.rebalance_interval_secs),
            },
            BackgroundJob {
                name: "dependency_resolver",
                interval: Duration::from_secs(self.config.dependency_interval_secs),
            },
        ]
    }

    async fn run_background_job(&self, name: &str) -> Result<()> {
        match name {
            "performance_analyzer" => self.analyze_performance().await,
            "load_balancer" => self.rebalance_load().await,
            "dependency_resolver" => self.resolve_dependencies().await,
            other => Err(HivemindError::OrchestrationError(format!(
                "Unknown background job: {other}"
            ))),
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        match &event.kind {
            EventKind::TaskCreated => self.handle_task_created(&event.data).await,
            EventKind::TaskCompleted => self.handle_task_completed(&event.data).await,
            EventKind::TaskFailed => self.handle_task_failed(&event.data).await,
            EventKind::AgentStarted => self.handle_agent_started(&event.data).await,
            EventKind::AgentStopped => self.handle_agent_stopped(&event.data).await,
            EventKind::AgentMetrics => self.handle_agent_metrics(&event.data).await,
            EventKind::AgentHeartbeat => self.handle_agent_heartbeat(&event.data).await,
            other => {
                debug!(kind = %other, "Event not handled by coordinator");
                Ok(())
            }
        }
    }
}

fn parse_task(data: &Value) -> Result<Task> {
    let raw = data.get("task").unwrap_or(data);
    serde_json::from_value(raw.clone())
        .map_err(|e| HivemindError::EventError(format!("Invalid task payload: {e}")))
}

fn require_str<'a>(data: &'a Value, field: &str) -> Result<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| HivemindError::EventError(format!("Missing field: {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn coordinator() -> TaskCoordinator {
        TaskCoordinator::new(
            "coordinator-test",
            CoordinatorConfig::default(),
            Arc::new(MemoryStore::new()),
        )
    }

    fn created_event(task_id: &str, capabilities: &[&str]) -> Event {
        Event::new(
            EventKind::TaskCreated,
            "test",
            json!({"task": {
                "id": task_id,
                "task_type": "analysis",
                "capabilities": capabilities,
            }}),
        )
    }

    fn agent_started(agent_id: &str, capabilities: &[&str]) -> Event {
        Event::new(
            EventKind::AgentStarted,
            "test",
            json!({"agent_id": agent_id, "capabilities": capabilities}),
        )
    }

    #[tokio::test]
    async fn task_without_agents_stays_pending() {
        let coordinator = coordinator();
        coordinator
            .handle_event(&created_event("t1", &[]))
            .await
            .unwrap();
        coordinator.tick().await.unwrap();

        assert_eq!(coordinator.pending_task_ids().await, vec!["t1"]);
        assert!(coordinator.active_task("t1").await.is_none());
    }

    #[tokio::test]
    async fn capability_match_assigns_within_one_cycle() {
        let coordinator = coordinator();
        coordinator
            .handle_event(&agent_started("a1", &["analysis"]))
            .await
            .unwrap();
        coordinator
            .handle_event(&created_event("t1", &["analysis"]))
            .await
            .unwrap();
        coordinator.tick().await.unwrap();

        let task = coordinator.active_task("t1").await.expect("task is active");
        assert_eq!(task.assigned_agent.as_deref(), Some("a1"));
        assert!(coordinator.pending_task_ids().await.is_empty());
    }

    #[tokio::test]
    async fn capability_mismatch_is_not_assigned() {
        let coordinator = coordinator();
        coordinator
            .handle_event(&agent_started("a1", &["trading"]))
            .await
            .unwrap();
        coordinator
            .handle_event(&created_event("t1", &["analysis"]))
            .await
            .unwrap();
        coordinator.tick().await.unwrap();

        assert_eq!(coordinator.pending_task_ids().await, vec!["t1"]);
    }

    #[tokio::test]
    async fn lowest_load_agent_wins() {
        let coordinator = coordinator();
        coordinator
            .handle_event(&agent_started("busy", &["analysis"]))
            .await
            .unwrap();
        coordinator
            .handle_event(&agent_started("idle", &["analysis"]))
            .await
            .unwrap();
        coordinator
            .handle_event(&Event::new(
                EventKind::AgentMetrics,
                "test",
                json!({"agent_id": "busy", "cpu_usage": 90.0, "memory_usage": 90.0}),
            ))
            .await
            .unwrap();
        coordinator
            .handle_event(&created_event("t1", &["analysis"]))
            .await
            .unwrap();
        coordinator.tick().await.unwrap();

        let task = coordinator.active_task("t1").await.unwrap();
        assert_eq!(task.assigned_agent.as_deref(), Some("idle"));
    }

    #[tokio::test]
    async fn agent_stopped_returns_tasks_to_pending() {
        let coordinator = coordinator();
        coordinator
            .handle_event(&agent_started("a1", &["analysis"]))
            .await
            .unwrap();
        coordinator
            .handle_event(&created_event("t1", &["analysis"]))
            .await
            .unwrap();
        coordinator.tick().await.unwrap();
        assert!(coordinator.active_task("t1").await.is_some());

        coordinator
            .handle_event(&Event::new(
                EventKind::AgentStopped,
                "test",
                json!({"agent_id": "a1"}),
            ))
            .await
            .unwrap();

        assert_eq!(coordinator.pending_task_ids().await, vec!["t1"]);
        assert!(coordinator.active_task("t1").await.is_none());
        assert!(coordinator.agent_ids().await.is_empty());
    }

    #[tokio::test]
    async fn retry_limit_fails_permanently_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = TaskCoordinator::new(
            "coordinator-test",
            CoordinatorConfig::default(),
            store.clone(),
        );
        coordinator
            .handle_event(&agent_started("a1", &[]))
            .await
            .unwrap();
        coordinator
            .handle_event(&created_event("t1", &[]))
            .await
            .unwrap();

        for round in 0..4 {
            coordinator.tick().await.unwrap();
            assert!(
                coordinator.active_task("t1").await.is_some(),
                "round {round}: task should be active"
            );
            coordinator
                .handle_event(&Event::new(
                    EventKind::TaskFailed,
                    "test",
                    json!({"task_id": "t1", "error": "boom"}),
                ))
                .await
                .unwrap();
        }

        // retry_count is now 4 (> 3): dropped, never re-enqueued.
        assert!(coordinator.pending_task_ids().await.is_empty());
        assert!(coordinator.active_task("t1").await.is_none());

        let mut permanent_failures = 0;
        while let Some(payload) = store.pop_list(keys::EVENT_QUEUE).await.unwrap() {
            let event = Event::from_json(&payload).unwrap();
            if event.kind == EventKind::TaskFailedPermanently {
                assert_eq!(event.data["task_id"], "t1");
                permanent_failures += 1;
            }
        }
        assert_eq!(permanent_failures, 1);
    }

    #[tokio::test]
    async fn timeout_recycles_without_retry_increment() {
        let store = Arc::new(MemoryStore::new());
        let config = CoordinatorConfig {
            task_timeout_secs: 0,
            ..CoordinatorConfig::default()
        };
        let coordinator = TaskCoordinator::new("coordinator-test", config, store.clone());
        coordinator
            .handle_event(&agent_started("a1", &[]))
            .await
            .unwrap();
        coordinator
            .handle_event(&created_event("t1", &[]))
            .await
            .unwrap();

        coordinator.schedule_pending().await.unwrap();
        assert!(coordinator.active_task("t1").await.is_some());
        tokio::time::sleep(Duration::from_millis(5)).await;
        coordinator.sweep_timeouts().await.unwrap();

        let pending = coordinator.pending_task_ids().await;
        assert_eq!(pending, vec!["t1"]);

        let mut saw_timeout = false;
        while let Some(payload) = store.pop_list(keys::EVENT_QUEUE).await.unwrap() {
            let event = Event::from_json(&payload).unwrap();
            if event.kind == EventKind::TaskTimeout {
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
    }

    #[tokio::test]
    async fn dependent_task_waits_for_prerequisite() {
        let coordinator = coordinator();
        coordinator
            .handle_event(&agent_started("a1", &[]))
            .await
            .unwrap();
        coordinator
            .handle_event(&created_event("t1", &[]))
            .await
            .unwrap();
        coordinator
            .handle_event(&Event::new(
                EventKind::TaskCreated,
                "test",
                json!({
                    "task": {"id": "t2", "task_type": "analysis"},
                    "dependencies": ["t1"],
                }),
            ))
            .await
            .unwrap();

        coordinator.tick().await.unwrap();
        // t1 assigned, t2 blocked by its dependency.
        assert!(coordinator.active_task("t1").await.is_some());
        assert_eq!(coordinator.pending_task_ids().await, vec!["t2"]);

        coordinator
            .handle_event(&Event::new(
                EventKind::TaskCompleted,
                "test",
                json!({"task_id": "t1", "duration_secs": 1.0}),
            ))
            .await
            .unwrap();
        coordinator.tick().await.unwrap();
        assert!(coordinator.active_task("t2").await.is_some());
    }

    #[tokio::test]
    async fn claimed_task_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = TaskCoordinator::new(
            "coordinator-a",
            CoordinatorConfig::default(),
            store.clone(),
        );
        coordinator
            .handle_event(&agent_started("a1", &[]))
            .await
            .unwrap();
        coordinator
            .handle_event(&created_event("t1", &[]))
            .await
            .unwrap();

        // Another coordinator already holds the claim.
        store
            .set_nx(
                &keys::task_claim("t1"),
                "coordinator-b",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        coordinator.tick().await.unwrap();
        assert!(coordinator.active_task("t1").await.is_none());
        assert_eq!(
            store.list_len(&keys::agent_queue("a1")).await.unwrap(),
            0
        );
        // Losing the claim must not discard the task.
        assert_eq!(coordinator.pending_task_ids().await, vec!["t1"]);
    }

    #[tokio::test]
    async fn stale_claim_is_retried_after_its_ttl_expires() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = TaskCoordinator::new(
            "coordinator-a",
            CoordinatorConfig::default(),
            store.clone(),
        );
        coordinator
            .handle_event(&agent_started("a1", &[]))
            .await
            .unwrap();
        coordinator
            .handle_event(&created_event("t1", &[]))
            .await
            .unwrap();

        // A claim holder that died right after claiming leaves a short-lived
        // stale claim behind.
        store
            .set_nx(
                &keys::task_claim("t1"),
                "coordinator-b",
                Duration::from_millis(20),
            )
            .await
            .unwrap();

        coordinator.tick().await.unwrap();
        assert_eq!(coordinator.pending_task_ids().await, vec!["t1"]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        coordinator.tick().await.unwrap();
        let task = coordinator.active_task("t1").await.expect("task assigned");
        assert_eq!(task.assigned_agent.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn rebalance_restores_assignments_it_cannot_account_for() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = TaskCoordinator::new(
            "coordinator-test",
            CoordinatorConfig::default(),
            store.clone(),
        );
        coordinator
            .handle_event(&agent_started("busy", &[]))
            .await
            .unwrap();
        for task_id in ["t1", "t2", "t3"] {
            coordinator
                .handle_event(&created_event(task_id, &[]))
                .await
                .unwrap();
        }
        coordinator.schedule_pending().await.unwrap();
        coordinator
            .handle_event(&Event::new(
                EventKind::AgentMetrics,
                "test",
                json!({"agent_id": "busy", "cpu_usage": 90.0, "memory_usage": 90.0}),
            ))
            .await
            .unwrap();
        coordinator
            .handle_event(&agent_started("idle", &[]))
            .await
            .unwrap();

        // A payload on the queue that is not one of ours.
        store
            .push_list(&keys::agent_queue("busy"), "not an assignment")
            .await
            .unwrap();

        coordinator.rebalance_load().await.unwrap();

        // The three queued tasks were migrated back to pending; the foreign
        // payload went back onto the agent's queue instead of vanishing.
        let mut pending = coordinator.pending_task_ids().await;
        pending.sort();
        assert_eq!(pending, vec!["t1", "t2", "t3"]);
        assert_eq!(
            store.list_len(&keys::agent_queue("busy")).await.unwrap(),
            1
        );
    }
}
