//! # Orchestration Service Skeleton
//!
//! [`OrchestrationService`] is the contract every sub-service (coordinator,
//! health monitor, resource manager) implements: a main tick, named
//! background jobs, and an event handler. [`ServiceRunner`] owns the
//! lifecycle: it spawns the service loop and each background job on a
//! `tokio::time::interval`, wires an optional store subscription for event
//! delivery, and tears everything down cooperatively on `stop()`.
//!
//! Failure semantics: every periodic loop catches its iteration's error,
//! logs it and continues. A single bad tick or malformed event must never
//! terminate a loop task.

use crate::error::Result;
use crate::events::{Event, EventKind};
use crate::store::{keys, SharedStore};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Descriptor for a named periodic job owned by a service.
#[derive(Debug, Clone, Copy)]
pub struct BackgroundJob {
    pub name: &'static str,
    pub interval: Duration,
}

/// Contract implemented by every orchestration sub-service.
#[async_trait]
pub trait OrchestrationService: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Event kinds this service wants delivered to [`handle_event`].
    ///
    /// [`handle_event`]: OrchestrationService::handle_event
    fn subscriptions(&self) -> Vec<EventKind>;

    /// One-time initialization before any loop starts.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Interval of the mandatory service loop.
    fn tick_interval(&self) -> Duration;

    /// One iteration of the service loop.
    async fn tick(&self) -> Result<()>;

    /// Additional periodic jobs, dispatched by name through
    /// [`run_background_job`].
    ///
    /// [`run_background_job`]: OrchestrationService::run_background_job
    fn background_jobs(&self) -> Vec<BackgroundJob> {
        Vec::new()
    }

    async fn run_background_job(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Handle one event. Errors are absorbed by the caller.
    async fn handle_event(&self, event: &Event) -> Result<()>;

    /// Teardown after all loops have stopped.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle owner for a single [`OrchestrationService`].
pub struct ServiceRunner {
    service: Arc<dyn OrchestrationService>,
    store: Arc<dyn SharedStore>,
    subscribe_events: bool,
    running: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceRunner {
    pub fn new(service: Arc<dyn OrchestrationService>, store: Arc<dyn SharedStore>) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            service,
            store,
            subscribe_events: true,
            running,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Disable the store subscription loop. Used when a composing
    /// orchestrator routes events itself, so they are not delivered twice.
    pub fn without_subscription(mut self) -> Self {
        self.subscribe_events = false;
        self
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Run setup, then spawn the service loop, background jobs and the
    /// optional subscription loop.
    pub async fn start(&self) -> Result<()> {
        self.service.setup().await?;
        self.running.send_replace(true);

        let mut handles = self.handles.lock();

        handles.push(self.spawn_periodic(
            "service_loop",
            self.service.tick_interval(),
            |service| async move { service.tick().await },
        ));

        for job in self.service.background_jobs() {
            handles.push(self.spawn_periodic(job.name, job.interval, move |service| async move {
                service.run_background_job(job.name).await
            }));
        }

        if self.subscribe_events {
            handles.push(self.spawn_subscription_loop());
        }

        info!(service = self.service.name(), "Service started");
        Ok(())
    }

    /// Flip the running flag, cancel every tracked task, await cancellation
    /// and run cleanup.
    pub async fn stop(&self) {
        self.running.send_replace(false);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in &handles {
            handle.abort();
        }
        // Cancellation surfaces as a JoinError; swallow it.
        let _ = futures::future::join_all(handles).await;

        if let Err(e) = self.service.cleanup().await {
            warn!(service = self.service.name(), error = %e, "Cleanup failed");
        }
        info!(service = self.service.name(), "Service stopped");
    }

    /// Health summary for monitoring endpoints.
    pub fn service_health(&self) -> Value {
        let status = if self.is_running() { "healthy" } else { "stopped" };
        json!({
            "service": self.service.name(),
            "status": status,
            "active_tasks": self.handles.lock().len(),
            "timestamp": Utc::now(),
        })
    }

    fn spawn_periodic<F, Fut>(
        &self,
        loop_name: &'static str,
        interval: Duration,
        iteration: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<dyn OrchestrationService>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let service = self.service.clone();
        let mut running = self.running.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = iteration(service.clone()).await {
                            error!(
                                service = service.name(),
                                loop_name = loop_name,
                                error = %e,
                                "Loop iteration failed, continuing"
                            );
                        }
                    }
                    changed = running.changed() => {
                        if changed.is_err() || !*running.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(service = service.name(), loop_name = loop_name, "Loop exited");
        })
    }

    fn spawn_subscription_loop(&self) -> JoinHandle<()> {
        let service = self.service.clone();
        let mut rx = self.store.subscribe(keys::EVENT_CHANNEL);
        let mut running = self.running.subscribe();
        let wanted = self.service.subscriptions();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(payload) => {
                            // Per-message failures are absorbed so one bad
                            // event cannot kill the subscription.
                            match Event::from_json(&payload) {
                                Ok(event) if wanted.contains(&event.kind) => {
                                    if let Err(e) = service.handle_event(&event).await {
                                        error!(
                                            service = service.name(),
                                            kind = %event.kind,
                                            error = %e,
                                            "Event handling failed"
                                        );
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!(service = service.name(), error = %e, "Undecodable event");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(service = service.name(), missed = missed, "Subscription lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    changed = running.changed() => {
                        if changed.is_err() || !*running.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(service = service.name(), "Subscription loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingService {
        ticks: AtomicUsize,
        events: AtomicUsize,
    }

    #[async_trait]
    impl OrchestrationService for CountingService {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn subscriptions(&self) -> Vec<EventKind> {
            vec![EventKind::TaskCreated]
        }

        fn tick_interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn tick(&self) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            // A failing tick must not stop the loop.
            Err(crate::error::HivemindError::OrchestrationError(
                "transient".to_string(),
            ))
        }

        async fn handle_event(&self, _event: &Event) -> Result<()> {
            self.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_ticks_do_not_stop_the_loop() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(CountingService {
            ticks: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
        });
        let runner = ServiceRunner::new(service.clone(), store);
        runner.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        runner.stop().await;
        assert!(service.ticks.load(Ordering::SeqCst) >= 2);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn subscription_filters_by_kind() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(CountingService {
            ticks: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
        });
        let runner = ServiceRunner::new(service.clone(), store.clone());
        runner.start().await.unwrap();

        let publisher = crate::events::EventPublisher::new(store.clone(), "test");
        publisher
            .publish(EventKind::TaskCreated, serde_json::json!({}))
            .await;
        publisher
            .publish(EventKind::AgentHeartbeat, serde_json::json!({}))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.stop().await;
        assert_eq!(service.events.load(Ordering::SeqCst), 1);
    }
}
