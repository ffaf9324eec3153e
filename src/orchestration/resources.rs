//! # Resource Manager
//!
//! Watches system resource usage, maintains simulated per-agent container
//! limits, detects memory-leak trends, and emits cleanup and scaling
//! advisories. The manager only advises: it never creates or destroys
//! agent processes itself.

use crate::config::ResourceConfig;
use crate::error::{HivemindError, Result};
use crate::events::{Event, EventKind, EventPublisher};
use crate::orchestration::probe::{ResourceSample, SystemProbe, SysinfoProbe};
use crate::orchestration::service::{BackgroundJob, OrchestrationService};
use crate::orchestration::types::ContainerLimits;
use crate::store::SharedStore;
use crate::utils::RingBuffer;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const USAGE_HISTORY: usize = 1000;
const CLEANUP_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy)]
struct UsageSample {
    at: DateTime<Utc>,
    value: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
struct CleanupRecord {
    at: DateTime<Utc>,
    action: String,
    trigger_value: f64,
}

struct ResourceState {
    memory_history: RingBuffer<UsageSample>,
    cpu_history: RingBuffer<UsageSample>,
    disk_history: RingBuffer<UsageSample>,
    cleanup_history: RingBuffer<CleanupRecord>,
    /// Latched once a leak is reported; cleared when the slope flattens.
    leak_alerted: bool,
}

impl ResourceState {
    fn new() -> Self {
        Self {
            memory_history: RingBuffer::new(USAGE_HISTORY),
            cpu_history: RingBuffer::new(USAGE_HISTORY),
            disk_history: RingBuffer::new(USAGE_HISTORY),
            cleanup_history: RingBuffer::new(CLEANUP_HISTORY),
            leak_alerted: false,
        }
    }

    fn trailing_average(history: &RingBuffer<UsageSample>, window: ChronoDuration) -> Option<f64> {
        let cutoff = Utc::now() - window;
        let recent: Vec<f64> = history
            .iter()
            .filter(|sample| sample.at >= cutoff)
            .map(|sample| sample.value)
            .collect();
        if recent.is_empty() {
            None
        } else {
            Some(recent.iter().sum::<f64>() / recent.len() as f64)
        }
    }
}

/// Resource monitoring and advisory service.
pub struct ResourceManager {
    config: ResourceConfig,
    publisher: EventPublisher,
    probe: Arc<dyn SystemProbe>,
    agent_limits: DashMap<String, ContainerLimits>,
    state: RwLock<ResourceState>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig, store: Arc<dyn SharedStore>) -> Self {
        Self::with_probe(config, store, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(
        config: ResourceConfig,
        store: Arc<dyn SharedStore>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let publisher = EventPublisher::new(store, "resource_manager");
        Self {
            config,
            publisher,
            probe,
            agent_limits: DashMap::new(),
            state: RwLock::new(ResourceState::new()),
        }
    }

    pub fn agent_limits(&self, agent_id: &str) -> Option<ContainerLimits> {
        self.agent_limits.get(agent_id).map(|limits| *limits)
    }

    pub async fn latest_memory_usage(&self) -> Option<f64> {
        let state = self.state.read().await;
        state.memory_history.last().map(|sample| sample.value)
    }

    /// Least-squares slope of `values` in units per sample index.
    pub fn regression_slope(values: &[f64]) -> f64 {
        let n = values.len();
        if n < 2 {
            return 0.0;
        }
        let n_f = n as f64;
        let mean_x = (n_f - 1.0) / 2.0;
        let mean_y = values.iter().sum::<f64>() / n_f;
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (i, value) in values.iter().enumerate() {
            let dx = i as f64 - mean_x;
            numerator += dx * (value - mean_y);
            denominator += dx * dx;
        }
        if denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        }
    }

    /// Record one usage reading and run every threshold reaction against it.
    /// Exposed so tests can feed synthetic sequences.
    pub async fn process_sample(&self, sample: ResourceSample) {
        let now = Utc::now();
        {
            let mut state = self.state.write().await;
            state.memory_history.push(UsageSample {
                at: now,
                value: sample.memory_usage,
            });
            state.cpu_history.push(UsageSample {
                at: now,
                value: sample.cpu_usage,
            });
            state.disk_history.push(UsageSample {
                at: now,
                value: sample.disk_usage,
            });
        }

        if sample.memory_usage >= self.config.memory_emergency {
            self.emergency_cleanup(sample.memory_usage).await;
        } else if sample.memory_usage >= self.config.memory_optimize {
            self.standard_optimization(sample.memory_usage).await;
        }

        if sample.disk_usage >= self.config.disk_cleanup {
            self.disk_cleanup(sample.disk_usage).await;
        }

        self.adjust_agent_limits(sample.memory_usage, sample.cpu_usage);
        self.detect_memory_leak().await;
    }

    /// Shed internal history to free heap and tell everyone else to do the
    /// same.
    async fn emergency_cleanup(&self, memory_usage: f64) {
        {
            let mut state = self.state.write().await;
            let keep: Vec<UsageSample> = state.memory_history.recent(self.config.leak_window).copied().collect();
            state.memory_history.clear();
            for sample in keep {
                state.memory_history.push(sample);
            }
            state.cpu_history.clear();
            state.disk_history.clear();
            state.cleanup_history.push(CleanupRecord {
                at: Utc::now(),
                action: "emergency".to_string(),
                trigger_value: memory_usage,
            });
        }
        warn!(memory_usage = memory_usage, "Emergency memory cleanup triggered");
        self.publisher
            .publish(
                EventKind::EmergencyCleanup,
                json!({"memory_usage": memory_usage}),
            )
            .await;
    }

    async fn standard_optimization(&self, memory_usage: f64) {
        {
            let mut state = self.state.write().await;
            state.cleanup_history.push(CleanupRecord {
                at: Utc::now(),
                action: "optimize".to_string(),
                trigger_value: memory_usage,
            });
        }
        info!(memory_usage = memory_usage, "Standard memory optimization");
        self.publisher
            .publish(EventKind::CacheClear, json!({"memory_usage": memory_usage}))
            .await;
    }

    async fn disk_cleanup(&self, disk_usage: f64) {
        {
            let mut state = self.state.write().await;
            state.cleanup_history.push(CleanupRecord {
                at: Utc::now(),
                action: "disk".to_string(),
                trigger_value: disk_usage,
            });
        }
        warn!(disk_usage = disk_usage, "Disk cleanup triggered");
        self.publisher
            .publish(
                EventKind::ResourceCleanup,
                json!({"disk_usage": disk_usage, "targets": ["logs", "temp", "metrics"]}),
            )
            .await;
    }

    /// Multiplicative ±10% per-agent limit adjustment, clamped to the
    /// configured bounds.
    fn adjust_agent_limits(&self, memory_usage: f64, cpu_usage: f64) {
        let factor = if memory_usage > self.config.limit_shrink_above
            || cpu_usage > self.config.limit_shrink_above
        {
            1.0 - self.config.limit_step
        } else if memory_usage < self.config.limit_grow_below
            && cpu_usage < self.config.limit_grow_below
        {
            1.0 + self.config.limit_step
        } else {
            return;
        };

        for mut entry in self.agent_limits.iter_mut() {
            let limits = entry.value_mut();
            limits.memory_mb = ((limits.memory_mb as f64 * factor) as u64)
                .clamp(self.config.min_memory_mb, self.config.max_memory_mb);
            limits.cpu_cores = (limits.cpu_cores * factor)
                .clamp(self.config.min_cpu_cores, self.config.max_cpu_cores);
        }
    }

    /// Heuristic leak detection: sustained positive regression slope over
    /// the last N memory samples while usage is already elevated.
    async fn detect_memory_leak(&self) {
        let (slope, current, should_alert) = {
            let mut state = self.state.write().await;
            if state.memory_history.len() < self.config.leak_window {
                return;
            }
            let values: Vec<f64> = state
                .memory_history
                .recent(self.config.leak_window)
                .map(|sample| sample.value)
                .collect();
            let slope = Self::regression_slope(&values);
            let current = *values.last().unwrap_or(&0.0);
            let leaking = slope > self.config.leak_slope && current > self.config.leak_min_usage;

            if !leaking {
                state.leak_alerted = false;
                return;
            }
            let should_alert = !state.leak_alerted;
            state.leak_alerted = true;
            (slope, current, should_alert)
        };

        if should_alert {
            warn!(slope = slope, memory_usage = current, "Memory leak trend detected");
            self.publisher
                .publish(
                    EventKind::MemoryLeakDetected,
                    json!({"slope": slope, "memory_usage": current}),
                )
                .await;
        }
    }

    /// Scaling advisory: scale up on pressure, scale down only when both the
    /// instantaneous reading and the trailing average agree (anti-flap).
    async fn advise_scaling(&self) -> Result<()> {
        let state = self.state.read().await;
        let memory = state.memory_history.last().map(|s| s.value);
        let cpu = state.cpu_history.last().map(|s| s.value);
        let window = ChronoDuration::seconds(self.config.scale_down_window_secs);
        let trailing_memory = ResourceState::trailing_average(&state.memory_history, window);
        let trailing_cpu = ResourceState::trailing_average(&state.cpu_history, window);
        drop(state);

        let (Some(memory), Some(cpu)) = (memory, cpu) else {
            return Ok(());
        };
        let usage = memory.max(cpu);

        if usage > self.config.scale_up_above {
            info!(usage = usage, "Scale-up advisory");
            self.publisher
                .publish(
                    EventKind::ScaleUpNeeded,
                    json!({"memory_usage": memory, "cpu_usage": cpu}),
                )
                .await;
            return Ok(());
        }

        let trailing = match (trailing_memory, trailing_cpu) {
            (Some(m), Some(c)) => m.max(c),
            _ => return Ok(()),
        };
        if usage < self.config.scale_down_below && trailing < self.config.scale_down_below {
            info!(usage = usage, trailing = trailing, "Scale-down advisory");
            self.publisher
                .publish(
                    EventKind::ScaleDownOpportunity,
                    json!({"usage": usage, "trailing_average": trailing}),
                )
                .await;
        }
        Ok(())
    }

    pub fn register_agent(&self, agent_id: &str) {
        self.agent_limits
            .insert(agent_id.to_string(), ContainerLimits::default());
    }

    pub fn forget_agent(&self, agent_id: &str) {
        self.agent_limits.remove(agent_id);
    }

    /// Summary published to the dashboard snapshot key.
    pub async fn summary(&self) -> Value {
        let state = self.state.read().await;
        json!({
            "memory_usage": state.memory_history.last().map(|s| s.value),
            "cpu_usage": state.cpu_history.last().map(|s| s.value),
            "disk_usage": state.disk_history.last().map(|s| s.value),
            "tracked_agents": self.agent_limits.len(),
            "recent_cleanups": state.cleanup_history.to_vec(),
        })
    }
}

#[async_trait]
impl OrchestrationService for ResourceManager {
    fn name(&self) -> &'static str {
        "resource_manager"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::SystemAlert,
            EventKind::AgentStarted,
            EventKind::AgentStopped,
        ]
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.config.monitor_interval_secs)
    }

    async fn tick(&self) -> Result<()> {
        let sample = self.probe.sample();
        self.process_sample(sample).await;
        Ok(())
    }

    fn background_jobs(&self) -> Vec<BackgroundJob> {
        vec![BackgroundJob {
            name: "scaling_advisor",
            interval: Duration::from_secs(self.config.scaling_interval_secs),
        }]
    }

    async fn run_background_job(&self, name: &str) -> Result<()> {
        match name {
            "scaling_advisor" => self.advise_scaling().await,
            other => Err(HivemindError::OrchestrationError(format!(
                "Unknown background job: {other}"
            ))),
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        match &event.kind {
            EventKind::SystemAlert => {
                // An external alert is treated like elevated pressure.
                let usage = self.latest_memory_usage().await.unwrap_or(0.0);
                self.standard_optimization(usage).await;
            }
            EventKind::AgentStarted => {
                if let Some(agent_id) = event.data.get("agent_id").and_then(Value::as_str) {
                    self.register_agent(agent_id);
                }
            }
            EventKind::AgentStopped => {
                if let Some(agent_id) = event.data.get("agent_id").and_then(Value::as_str) {
                    self.forget_agent(agent_id);
                }
            }
            other => {
                debug!(kind = %other, "Event not handled by resource manager");
            }
        }
        Ok(())
    }
}
