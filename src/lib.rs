//! # Hivemind Core
//!
//! Event-driven orchestration core for an autonomous agent platform: routes
//! tasks to worker agents, tracks agent health and load, performs automatic
//! recovery and rebalancing. External producers (API layers, the agents
//! themselves) interact exclusively through the shared store: they push
//! events onto the global queue and pop assignments from their own task
//! queues.
//!
//! ## Architecture
//!
//! ```text
//! events:queue ──► Orchestrator ──► TaskCoordinator ──► agent:{id}:tasks
//!                      │  ▲             HealthMonitor
//!                      │  └─ events ◄── ResourceManager
//!                      └────────────►   WorkflowEngine
//! ```
//!
//! The [`orchestration::Orchestrator`] is the composition root: it owns the
//! sub-services, pops the global event queue and routes each event by
//! [`events::EventKind`], re-evaluates the [`orchestration::SystemState`]
//! machine, and fails over agents that stop heartbeating.
//!
//! ## Quick start
//!
//! ```no_run
//! use hivemind_core::config::HivemindConfig;
//! use hivemind_core::orchestration::Orchestrator;
//! use hivemind_core::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> hivemind_core::error::Result<()> {
//! let config = HivemindConfig::load()?;
//! let store = Arc::new(MemoryStore::new());
//! let orchestrator = Arc::new(Orchestrator::new(config, store));
//! orchestrator.clone().start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod orchestration;
pub mod store;
pub mod utils;

pub use config::HivemindConfig;
pub use error::{HivemindError, Result};
pub use events::{Event, EventKind, EventPublisher};
pub use orchestration::Orchestrator;
pub use store::{MemoryStore, SharedStore};
