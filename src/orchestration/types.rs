//! Core data model for the orchestration subsystem.
//!
//! Tasks, agent views, system snapshots, alerts and the system state machine.
//! Everything here serializes to the JSON shapes shared with external
//! producers through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Unit of work routed to agents.
///
/// Authoritative state lives with the coordinator while the task is in
/// flight; the copy pushed onto an agent's queue is for execution only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    #[serde(default)]
    pub data: Value,
    /// Capability tags an agent must declare to receive this task.
    #[serde(default)]
    pub capabilities: HashSet<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            data,
            capabilities: HashSet::new(),
            retry_count: 0,
            assigned_agent: None,
            assigned_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Clear assignment fields when a task returns to pending.
    pub fn unassign(&mut self) {
        self.assigned_agent = None;
        self.assigned_at = None;
    }
}

/// Payload pushed onto `agent:{id}:tasks` when a task is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub task: Task,
    pub assigned_agent: String,
    pub assigned_at: DateTime<Utc>,
}

/// Liveness status shared by both agent views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Healthy,
    Unhealthy,
    Stopped,
}

/// Coordinator-local view of an agent, used for assignment scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub active_tasks: usize,
    pub last_seen: DateTime<Utc>,
    pub status: AgentStatus,
}

impl AgentMetrics {
    pub fn zeroed() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            active_tasks: 0,
            last_seen: Utc::now(),
            status: AgentStatus::Healthy,
        }
    }

    /// Load score used both for ranking assignment candidates and for
    /// overload detection: mean usage plus capped task pressure.
    pub fn load_score(&self) -> f64 {
        let load = (self.cpu_usage + self.memory_usage) / 2.0;
        let pressure = (self.active_tasks as f64 * 10.0).min(50.0);
        load + pressure
    }
}

/// Monitor-local view of an agent, maintained independently of the
/// coordinator's metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthRecord {
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metrics: Value,
}

/// Agent registry record stored under `agent:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: HashSet<String>,
}

/// Point-in-time view of the whole system, kept in a bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub active_agents: usize,
    pub total_agents: usize,
    pub tasks_queued: usize,
    pub tasks_processing: usize,
    pub error_rate: f64,
    pub response_time_ms: f64,
}

/// Alert lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
    AutoResolved,
}

/// Threshold-crossing alert, deduplicated by a content-derived id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: String,
    pub data: Value,
    pub triggered_at: DateTime<Utc>,
    pub status: AlertStatus,
}

impl Alert {
    /// Create an alert with its dedup id derived from kind + content, so the
    /// same condition reported twice produces the same id.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        let kind = kind.into();
        let id = Self::dedup_id(&kind, &data);
        Self {
            id,
            kind,
            data,
            triggered_at: Utc::now(),
            status: AlertStatus::Active,
        }
    }

    pub fn dedup_id(kind: &str, data: &Value) -> String {
        let mut hasher = DefaultHasher::new();
        kind.hash(&mut hasher);
        data.to_string().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// 24/7 system state machine driven by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Starting,
    Healthy,
    Degraded,
    Critical,
    Maintenance,
    ShuttingDown,
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SystemState::Starting => "starting",
            SystemState::Healthy => "healthy",
            SystemState::Degraded => "degraded",
            SystemState::Critical => "critical",
            SystemState::Maintenance => "maintenance",
            SystemState::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

/// Simulated per-agent container limits managed by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainerLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_score_caps_task_pressure() {
        let mut metrics = AgentMetrics::zeroed();
        metrics.cpu_usage = 40.0;
        metrics.memory_usage = 60.0;
        metrics.active_tasks = 2;
        assert_eq!(metrics.load_score(), 70.0);

        metrics.active_tasks = 20;
        // Pressure contribution is capped at 50.
        assert_eq!(metrics.load_score(), 100.0);
    }

    #[test]
    fn alert_dedup_id_is_content_stable() {
        let a = Alert::new("cpu_critical", json!({"cpu": 95.0}));
        let b = Alert::new("cpu_critical", json!({"cpu": 95.0}));
        let c = Alert::new("cpu_critical", json!({"cpu": 91.0}));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn task_deserializes_with_defaults() {
        let task: Task =
            serde_json::from_value(json!({"id": "t1", "task_type": "analysis"})).unwrap();
        assert_eq!(task.retry_count, 0);
        assert!(task.capabilities.is_empty());
        assert!(task.assigned_agent.is_none());
    }
}
