//! # Shared State Store
//!
//! The store is the system's only durable and cross-process surface: every
//! component publishes events, agent queues and snapshots through it, and
//! external producers (API layer, agents) reach the orchestrator the same
//! way. The trait mirrors the key/value, list, hash and pub/sub primitives
//! of a Redis-like service, plus `set_nx` — the atomic set-if-absent used as
//! the task-assignment claim so two coordinators cannot double-assign.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and
//! single-process deployments.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

/// Redis-shaped storage primitives shared by every component.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Atomic set-if-absent with TTL. Returns true if this caller won the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// All live keys starting with `prefix`.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Append to the tail of a list.
    async fn push_list(&self, key: &str, value: &str) -> Result<()>;
    /// Pop from the head of a list without blocking.
    async fn pop_list(&self, key: &str) -> Result<Option<String>>;
    /// Pop from the head of a list, waiting up to `timeout` for an item.
    async fn pop_list_timeout(&self, key: &str, timeout: Duration) -> Result<Option<String>>;
    async fn list_len(&self, key: &str) -> Result<usize>;
    /// Remove and return the entire list contents, head first.
    async fn drain_list(&self, key: &str) -> Result<Vec<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Fire-and-forget broadcast. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;
    /// Subscribe to a broadcast channel.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

/// Well-known key layout shared with external producers.
pub mod keys {
    /// Global event queue popped by the orchestrator's event loop.
    pub const EVENT_QUEUE: &str = "events:queue";
    /// Pub/sub channel mirroring the event queue for passive listeners.
    pub const EVENT_CHANNEL: &str = "events:channel";
    /// Latest health snapshot, published with a short TTL for dashboards.
    pub const SYSTEM_HEALTH: &str = "system:health";
    /// Latest resource snapshot, published with a short TTL for dashboards.
    pub const SYSTEM_RESOURCES: &str = "system:resources";

    /// Agent registry record.
    pub fn agent_record(agent_id: &str) -> String {
        format!("agent:{agent_id}")
    }

    /// Per-agent task queue.
    pub fn agent_queue(agent_id: &str) -> String {
        format!("agent:{agent_id}:tasks")
    }

    /// Assignment claim for a task.
    pub fn task_claim(task_id: &str) -> String {
        format!("claim:task:{task_id}")
    }

    /// Persisted sequential workflow record.
    pub fn workflow(workflow_id: &str) -> String {
        format!("workflow:{workflow_id}")
    }

    /// Vote collection list for a consensus proposal.
    pub fn consensus_votes(proposal_id: &str) -> String {
        format!("consensus:{proposal_id}:votes")
    }

    /// True for registry keys produced by [`agent_record`], false for the
    /// `:tasks` / `:status` suffixed keys that share the `agent:` prefix.
    pub fn is_agent_record(key: &str) -> bool {
        key.starts_with("agent:") && !key.ends_with(":tasks") && !key.ends_with(":status")
    }
}
