//! Event publisher bound to the shared store.
//!
//! Pushes events onto the global event queue (consumed by the orchestrator's
//! routing loop) and mirrors them on the pub/sub channel for passive
//! listeners. Publish failures are logged and swallowed: the orchestration
//! core is a background daemon and a lost telemetry event must never take a
//! service loop down with it.

use crate::events::{Event, EventKind};
use crate::store::{keys, SharedStore};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Clone-able handle for emitting events on behalf of a named source.
#[derive(Clone)]
pub struct EventPublisher {
    store: Arc<dyn SharedStore>,
    source: String,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn SharedStore>, source: impl Into<String>) -> Self {
        Self {
            store,
            source: source.into(),
        }
    }

    /// The source name stamped on published events.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Build and publish an event. Never fails; errors are logged.
    pub async fn publish(&self, kind: EventKind, data: Value) {
        let event = Event::new(kind, self.source.clone(), data);
        self.publish_event(&event).await;
    }

    /// Publish an already-constructed event (used when re-injecting tasks).
    pub async fn publish_event(&self, event: &Event) {
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %event.kind, error = %e, "Failed to encode event, dropping");
                return;
            }
        };

        if let Err(e) = self.store.push_list(keys::EVENT_QUEUE, &payload).await {
            warn!(kind = %event.kind, error = %e, "Failed to enqueue event");
            return;
        }
        if let Err(e) = self.store.publish(keys::EVENT_CHANNEL, &payload).await {
            debug!(kind = %event.kind, error = %e, "Failed to broadcast event");
        }
    }
}
