//! # Health Monitor
//!
//! Tracks agent heartbeats and system resource snapshots, raises and
//! resolves threshold alerts, and computes the aggregate 0-100 health
//! score surfaced to dashboards.
//!
//! Alerts are deduplicated by a content-derived id, so the same condition
//! reported twice never produces two active alerts. An unhealthy-agent
//! transition is latched: repeated staleness checks do not re-alert until
//! the agent recovers.

use crate::config::HealthConfig;
use crate::error::{HivemindError, Result};
use crate::events::{Event, EventKind, EventPublisher};
use crate::orchestration::probe::{SystemProbe, SysinfoProbe};
use crate::orchestration::service::{BackgroundJob, OrchestrationService};
use crate::orchestration::types::{Alert, AlertStatus, AgentHealthRecord, AgentStatus, SystemSnapshot};
use crate::store::SharedStore;
use crate::utils::RingBuffer;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SNAPSHOT_HISTORY: usize = 1000;
const ALERT_HISTORY: usize = 500;
const RESPONSE_TIME_HISTORY: usize = 1000;
const ERROR_RATE_HISTORY: usize = 100;

struct HealthState {
    agent_health: HashMap<String, AgentHealthRecord>,
    history: RingBuffer<SystemSnapshot>,
    active_alerts: HashMap<String, Alert>,
    alert_history: RingBuffer<Alert>,
    response_times: RingBuffer<f64>,
    error_rates: HashMap<String, RingBuffer<f64>>,
}

impl HealthState {
    fn new() -> Self {
        Self {
            agent_health: HashMap::new(),
            history: RingBuffer::new(SNAPSHOT_HISTORY),
            active_alerts: HashMap::new(),
            alert_history: RingBuffer::new(ALERT_HISTORY),
            response_times: RingBuffer::new(RESPONSE_TIME_HISTORY),
            error_rates: HashMap::new(),
        }
    }

    fn agent_counts(&self) -> (usize, usize) {
        let healthy = self
            .agent_health
            .values()
            .filter(|r| r.status == AgentStatus::Healthy)
            .count();
        (healthy, self.agent_health.len())
    }

    /// Mean of all recent per-agent failure samples (1.0 = failed).
    fn aggregate_error_rate(&self) -> f64 {
        let mut total = 0usize;
        let mut failures = 0.0;
        for history in self.error_rates.values() {
            total += history.len();
            failures += history.iter().sum::<f64>();
        }
        if total == 0 {
            0.0
        } else {
            failures / total as f64
        }
    }

    fn avg_response_time_ms(&self) -> f64 {
        if self.response_times.is_empty() {
            0.0
        } else {
            self.response_times.iter().sum::<f64>() / self.response_times.len() as f64
        }
    }
}

/// Agent heartbeat and system threshold monitoring service.
pub struct HealthMonitor {
    config: HealthConfig,
    publisher: EventPublisher,
    probe: Arc<dyn SystemProbe>,
    /// Queue depths fed in by the orchestrator's coordination loop.
    queue_depths: parking_lot::Mutex<(usize, usize)>,
    state: RwLock<HealthState>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, store: Arc<dyn SharedStore>) -> Self {
        Self::with_probe(config, store, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(
        config: HealthConfig,
        store: Arc<dyn SharedStore>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let publisher = EventPublisher::new(store, "health_monitor");
        Self {
            config,
            publisher,
            probe,
            queue_depths: parking_lot::Mutex::new((0, 0)),
            state: RwLock::new(HealthState::new()),
        }
    }

    /// Update the task queue depths reported in snapshots.
    pub fn set_queue_depths(&self, queued: usize, processing: usize) {
        *self.queue_depths.lock() = (queued, processing);
    }

    pub async fn latest_snapshot(&self) -> Option<SystemSnapshot> {
        let state = self.state.read().await;
        state.history.last().cloned()
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        let state = self.state.read().await;
        state.active_alerts.values().cloned().collect()
    }

    pub async fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        let state = self.state.read().await;
        state.agent_health.get(agent_id).map(|r| r.status)
    }

    /// Aggregate health score over the latest snapshot and alert load.
    pub async fn health_score(&self) -> f64 {
        let state = self.state.read().await;
        let (healthy, total) = state.agent_counts();
        let alerts = state.active_alerts.len();
        match state.history.last() {
            Some(snapshot) => Self::compute_score(
                snapshot.cpu_usage,
                snapshot.memory_usage,
                snapshot.disk_usage,
                healthy,
                total,
                alerts,
            ),
            None => 100.0,
        }
    }

    /// Weighted health score, clamped to [0, 100].
    ///
    /// `cpu*0.25 + memory*0.25 + disk*0.20 + agents*0.30 - alert_penalty`
    /// where each component score is `100 - usage%` and the alert penalty is
    /// capped at 50.
    pub fn compute_score(
        cpu_usage: f64,
        memory_usage: f64,
        disk_usage: f64,
        healthy_agents: usize,
        total_agents: usize,
        active_alerts: usize,
    ) -> f64 {
        let cpu_score = (100.0 - cpu_usage).clamp(0.0, 100.0);
        let memory_score = (100.0 - memory_usage).clamp(0.0, 100.0);
        let disk_score = (100.0 - disk_usage).clamp(0.0, 100.0);
        let agent_score = if total_agents == 0 {
            0.0
        } else {
            healthy_agents as f64 / total_agents as f64 * 100.0
        };
        let alert_penalty = (active_alerts as f64 * 10.0).min(50.0);

        let score = cpu_score * 0.25
            + memory_score * 0.25
            + disk_score * 0.20
            + agent_score * 0.30
            - alert_penalty;
        score.clamp(0.0, 100.0)
    }

    /// Record one system snapshot and run threshold checks against it.
    /// Exposed so tests and simulations can feed synthetic readings.
    pub async fn process_snapshot(&self, snapshot: SystemSnapshot) {
        let checks = [
            ("cpu", snapshot.cpu_usage, self.config.cpu_warning, self.config.cpu_critical),
            (
                "memory",
                snapshot.memory_usage,
                self.config.memory_warning,
                self.config.memory_critical,
            ),
            (
                "disk",
                snapshot.disk_usage,
                self.config.disk_warning,
                self.config.disk_critical,
            ),
        ];

        {
            let mut state = self.state.write().await;
            state.history.push(snapshot);
        }

        for (metric, value, warning, critical) in checks {
            if value >= critical {
                self.trigger_alert(
                    &format!("{metric}_critical"),
                    json!({"metric": metric, "threshold": critical}),
                    json!({"value": value}),
                )
                .await;
            } else if value >= warning {
                self.trigger_alert(
                    &format!("{metric}_warning"),
                    json!({"metric": metric, "threshold": warning}),
                    json!({"value": value}),
                )
                .await;
            }
        }
    }

    /// Raise an alert unless an identical condition is already active.
    /// The dedup id hashes kind + condition data, not the instantaneous
    /// reading, so a persisting condition stays a single alert.
    pub async fn trigger_alert(&self, kind: &str, condition: Value, reading: Value) {
        let alert = Alert::new(kind, condition);
        {
            let mut state = self.state.write().await;
            if state.active_alerts.contains_key(&alert.id) {
                debug!(alert_id = %alert.id, kind = kind, "Duplicate alert suppressed");
                return;
            }
            state.active_alerts.insert(alert.id.clone(), alert.clone());
            state.alert_history.push(alert.clone());
        }

        warn!(alert_id = %alert.id, kind = kind, "Alert triggered");
        self.publisher
            .publish(
                EventKind::SystemAlert,
                json!({
                    "alert_id": alert.id,
                    "alert_type": alert.kind,
                    "condition": alert.data,
                    "reading": reading,
                }),
            )
            .await;
    }

    /// Mark agents unseen past the staleness threshold as unhealthy. The
    /// transition is latched so the alert fires once per episode.
    async fn check_agent_staleness(&self) {
        let stale_after = ChronoDuration::seconds(self.config.agent_stale_secs);
        let now = Utc::now();

        let newly_stale: Vec<String> = {
            let mut state = self.state.write().await;
            let stale: Vec<String> = state
                .agent_health
                .iter()
                .filter(|(_, record)| {
                    record.status == AgentStatus::Healthy && now - record.last_seen > stale_after
                })
                .map(|(id, _)| id.clone())
                .collect();
            for agent_id in &stale {
                if let Some(record) = state.agent_health.get_mut(agent_id) {
                    record.status = AgentStatus::Unhealthy;
                }
            }
            stale
        };

        for agent_id in newly_stale {
            self.trigger_alert(
                "agent_unhealthy",
                json!({"agent_id": agent_id}),
                json!({"stale_secs": self.config.agent_stale_secs}),
            )
            .await;
        }
    }

    /// Resolve alerts whose condition cleared; force-resolve leaked alerts
    /// older than the maximum age as a safety valve.
    async fn sweep_alerts(&self) -> Result<()> {
        let max_age = ChronoDuration::seconds(self.config.alert_max_age_secs);
        let now = Utc::now();

        let mut state = self.state.write().await;
        let latest = state.history.last().cloned();
        let resolutions: Vec<(String, AlertStatus)> = state
            .active_alerts
            .values()
            .filter_map(|alert| {
                if self.alert_condition_cleared(alert, latest.as_ref(), &state.agent_health) {
                    Some((alert.id.clone(), AlertStatus::Resolved))
                } else if now - alert.triggered_at > max_age {
                    Some((alert.id.clone(), AlertStatus::AutoResolved))
                } else {
                    None
                }
            })
            .collect();

        for (alert_id, status) in resolutions {
            if let Some(mut alert) = state.active_alerts.remove(&alert_id) {
                alert.status = status;
                info!(alert_id = %alert_id, status = ?status, "Alert resolved");
                state.alert_history.push(alert);
            }
        }
        Ok(())
    }

    fn alert_condition_cleared(
        &self,
        alert: &Alert,
        latest: Option<&SystemSnapshot>,
        agent_health: &HashMap<String, AgentHealthRecord>,
    ) -> bool {
        if alert.kind == "agent_unhealthy" {
            return alert
                .data
                .get("agent_id")
                .and_then(Value::as_str)
                .and_then(|id| agent_health.get(id))
                .is_some_and(|record| record.status == AgentStatus::Healthy);
        }

        let Some(snapshot) = latest else {
            return false;
        };
        let Some(threshold) = alert.data.get("threshold").and_then(Value::as_f64) else {
            return false;
        };
        let value = match alert.data.get("metric").and_then(Value::as_str) {
            Some("cpu") => snapshot.cpu_usage,
            Some("memory") => snapshot.memory_usage,
            Some("disk") => snapshot.disk_usage,
            _ => return false,
        };
        value < threshold * self.config.alert_resolve_factor
    }

    /// Forget agents that have been stopped longer than the retention window.
    async fn cleanup_stopped_agents(&self) -> Result<()> {
        let retention = ChronoDuration::seconds(self.config.stopped_retention_secs);
        let now = Utc::now();
        let mut state = self.state.write().await;
        state
            .agent_health
            .retain(|_, record| record.status != AgentStatus::Stopped || now - record.last_seen <= retention);
        Ok(())
    }

    fn build_snapshot(&self, state: &HealthState) -> SystemSnapshot {
        let sample = self.probe.sample();
        let (healthy, total) = state.agent_counts();
        let (queued, processing) = *self.queue_depths.lock();
        SystemSnapshot {
            timestamp: Utc::now(),
            cpu_usage: sample.cpu_usage,
            memory_usage: sample.memory_usage,
            disk_usage: sample.disk_usage,
            network_rx_bytes: sample.network_rx_bytes,
            network_tx_bytes: sample.network_tx_bytes,
            active_agents: healthy,
            total_agents: total,
            tasks_queued: queued,
            tasks_processing: processing,
            error_rate: state.aggregate_error_rate(),
            response_time_ms: state.avg_response_time_ms(),
        }
    }

    async fn record_response_time(&self, ms: f64) {
        let mut state = self.state.write().await;
        state.response_times.push(ms);
    }

    async fn record_error_sample(&self, agent_id: &str, failed: bool) {
        self.record_error_value(agent_id, if failed { 1.0 } else { 0.0 })
            .await;
    }

    /// Fractional rates reported in bulk (e.g. `system.performance`) enter
    /// the same per-source histories as individual pass/fail samples.
    async fn record_error_value(&self, source: &str, value: f64) {
        let mut state = self.state.write().await;
        state
            .error_rates
            .entry(source.to_string())
            .or_insert_with(|| RingBuffer::new(ERROR_RATE_HISTORY))
            .push(value);
    }

    async fn upsert_agent(&self, agent_id: &str, status: AgentStatus, metrics: Value) {
        let mut state = self.state.write().await;
        state.agent_health.insert(
            agent_id.to_string(),
            AgentHealthRecord {
                status,
                last_seen: Utc::now(),
                metrics,
            },
        );
    }
}

#[async_trait]
impl OrchestrationService for HealthMonitor {
    fn name(&self) -> &'static str {
        "health_monitor"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::AgentHeartbeat,
            EventKind::AgentStarted,
            EventKind::AgentStopped,
            EventKind::TaskCompleted,
            EventKind::TaskFailed,
            EventKind::SystemPerformance,
        ]
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.config.snapshot_interval_secs)
    }

    async fn tick(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.read().await;
            self.build_snapshot(&state)
        };
        self.process_snapshot(snapshot).await;
        self.check_agent_staleness().await;
        Ok(())
    }

    fn background_jobs(&self) -> Vec<BackgroundJob> {
        vec![
            BackgroundJob {
                name: "alert_sweeper",
                interval: Duration::from_secs(self.config.alert_sweep_interval_secs),
            },
            BackgroundJob {
                name: "agent_cleanup",
                interval: Duration::from_secs(self.config.cleanup_interval_secs),
            },
        ]
    }

    async fn run_background_job(&self, name: &str) -> Result<()> {
        match name {
            "alert_sweeper" => self.sweep_alerts().await,
            "agent_cleanup" => self.cleanup_stopped_agents().await,
            other => Err(HivemindError::OrchestrationError(format!(
                "Unknown background job: {other}"
            ))),
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        let data = &event.data;
        match &event.kind {
            EventKind::AgentStarted | EventKind::AgentHeartbeat => {
                if let Some(agent_id) = data.get("agent_id").and_then(Value::as_str) {
                    let metrics = data.get("metrics").cloned().unwrap_or(Value::Null);
                    self.upsert_agent(agent_id, AgentStatus::Healthy, metrics).await;
                }
            }
            EventKind::AgentStopped => {
                if let Some(agent_id) = data.get("agent_id").and_then(Value::as_str) {
                    self.upsert_agent(agent_id, AgentStatus::Stopped, Value::Null)
                        .await;
                }
            }
            EventKind::TaskCompleted => {
                if let Some(secs) = data.get("duration_secs").and_then(Value::as_f64) {
                    self.record_response_time(secs * 1000.0).await;
                }
                if let Some(agent_id) = data.get("agent_id").and_then(Value::as_str) {
                    self.record_error_sample(agent_id, false).await;
                }
            }
            EventKind::TaskFailed => {
                let agent_id = data
                    .get("agent_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                self.record_error_sample(agent_id, true).await;
            }
            EventKind::SystemPerformance => {
                if let Some(secs) = data.get("avg_completion_secs").and_then(Value::as_f64) {
                    self.record_response_time(secs * 1000.0).await;
                }
                if let Some(rate) = data.get("error_rate").and_then(Value::as_f64) {
                    self.record_error_value("system", rate).await;
                }
            }
            other => {
                debug!(kind = %other, "Event not handled by health monitor");
            }
        }
        Ok(())
    }
}
