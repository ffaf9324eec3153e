//! # Event System
//!
//! Events are the atomic unit of communication between producers (API layer,
//! agents) and the orchestrator. The wire shape is JSON
//! `{id, type, source, data, timestamp}` with the timestamp as an ISO-8601
//! string, carried over the shared store's global event queue.
//!
//! Event types are dot-namespaced strings on the wire but a closed sum type
//! in process: [`EventKind`] keeps routing exhaustive while `Other` preserves
//! open-for-extension behavior for producers this core does not know about.

pub mod publisher;

pub use publisher::EventPublisher;

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of event types routed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskCreated,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    TaskFailedPermanently,
    TaskTimeout,
    AgentStarted,
    AgentStopped,
    AgentHeartbeat,
    AgentMetrics,
    SystemAlert,
    SystemPerformance,
    SystemStateChanged,
    ScaleUpNeeded,
    ScaleDownOpportunity,
    MemoryLeakDetected,
    EmergencyCleanup,
    CacheClear,
    ResourceCleanup,
    WorkflowStepCompleted,
    Rebalance,
    Proposal,
    Vote,
    /// Any dot-namespaced type this core does not handle itself.
    Other(String),
}

impl EventKind {
    /// The dot-namespaced wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::TaskCreated => "task.created",
            EventKind::TaskAssigned => "task.assigned",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskFailedPermanently => "task.failed_permanently",
            EventKind::TaskTimeout => "task.timeout",
            EventKind::AgentStarted => "agent.started",
            EventKind::AgentStopped => "agent.stopped",
            EventKind::AgentHeartbeat => "agent.heartbeat",
            EventKind::AgentMetrics => "agent.metrics",
            EventKind::SystemAlert => "system.alert",
            EventKind::SystemPerformance => "system.performance",
            EventKind::SystemStateChanged => "system.state_changed",
            EventKind::ScaleUpNeeded => "resource.scale_up_needed",
            EventKind::ScaleDownOpportunity => "resource.scale_down_opportunity",
            EventKind::MemoryLeakDetected => "resource.memory_leak_detected",
            EventKind::EmergencyCleanup => "resource.emergency_cleanup",
            EventKind::CacheClear => "resource.cache_clear",
            EventKind::ResourceCleanup => "resource.cleanup",
            EventKind::WorkflowStepCompleted => "workflow.step_completed",
            EventKind::Rebalance => "coordination.rebalance",
            EventKind::Proposal => "coordination.proposal",
            EventKind::Vote => "coordination.vote",
            EventKind::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "task.created" => EventKind::TaskCreated,
            "task.assigned" => EventKind::TaskAssigned,
            "task.completed" => EventKind::TaskCompleted,
            "task.failed" => EventKind::TaskFailed,
            "task.failed_permanently" => EventKind::TaskFailedPermanently,
            "task.timeout" => EventKind::TaskTimeout,
            "agent.started" => EventKind::AgentStarted,
            "agent.stopped" => EventKind::AgentStopped,
            "agent.heartbeat" => EventKind::AgentHeartbeat,
            "agent.metrics" => EventKind::AgentMetrics,
            "system.alert" => EventKind::SystemAlert,
            "system.performance" => EventKind::SystemPerformance,
            "system.state_changed" => EventKind::SystemStateChanged,
            "resource.scale_up_needed" => EventKind::ScaleUpNeeded,
            "resource.scale_down_opportunity" => EventKind::ScaleDownOpportunity,
            "resource.memory_leak_detected" => EventKind::MemoryLeakDetected,
            "resource.emergency_cleanup" => EventKind::EmergencyCleanup,
            "resource.cache_clear" => EventKind::CacheClear,
            "resource.cleanup" => EventKind::ResourceCleanup,
            "workflow.step_completed" => EventKind::WorkflowStepCompleted,
            "coordination.rebalance" => EventKind::Rebalance,
            "coordination.proposal" => EventKind::Proposal,
            "coordination.vote" => EventKind::Vote,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventKind::from(s.as_str()))
    }
}

/// Immutable message unit exchanged through the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub source: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Decode an event from its JSON wire form.
    pub fn from_json(payload: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Encode the event into its JSON wire form.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
