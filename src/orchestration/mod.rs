//! # Orchestration
//!
//! The sub-services that make up the orchestration core and the composition
//! root that owns them:
//!
//! - [`coordinator`]: task scheduling, claiming, retries and rebalancing
//! - [`health`]: agent heartbeats, threshold alerts, health score
//! - [`resources`]: usage histories, container limits, cleanup and scaling
//! - [`workflows`]: consensus, parallel and sequential team coordination
//! - [`orchestrator`]: event routing, system state machine, failover
//!
//! Every sub-service implements [`service::OrchestrationService`] and runs
//! under a [`service::ServiceRunner`].

pub mod coordinator;
pub mod health;
pub mod orchestrator;
pub mod probe;
pub mod resources;
pub mod service;
pub mod types;
pub mod workflows;

pub use coordinator::{CoordinatorStats, TaskCoordinator};
pub use health::HealthMonitor;
pub use orchestrator::Orchestrator;
pub use probe::{ResourceSample, StaticProbe, SysinfoProbe, SystemProbe};
pub use resources::ResourceManager;
pub use service::{BackgroundJob, OrchestrationService, ServiceRunner};
pub use types::{
    AgentHealthRecord, AgentMetrics, AgentRegistration, AgentStatus, Alert, AlertStatus,
    ContainerLimits, SystemSnapshot, SystemState, Task, TaskAssignment,
};
pub use workflows::{ConsensusResult, Vote, WorkflowEngine, WorkflowRecord, WorkflowStep};
