//! # Configuration Management
//!
//! Layered configuration for the orchestration core: compiled-in defaults,
//! an optional `hivemind.toml` file, and `HIVEMIND_`-prefixed environment
//! variables (highest precedence). Every threshold used by the coordinator,
//! health monitor, resource manager and orchestrator lives here so tests can
//! construct tight variants without touching the environment.

use crate::error::{HivemindError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Top-level configuration for a hivemind orchestrator process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HivemindConfig {
    pub orchestrator: OrchestratorConfig,
    pub coordinator: CoordinatorConfig,
    pub health: HealthConfig,
    pub resources: ResourceConfig,
}

impl HivemindConfig {
    /// Load configuration from defaults, `hivemind.toml` (if present) and
    /// `HIVEMIND_*` environment variables (e.g. `HIVEMIND_COORDINATOR__MAX_RETRIES=5`).
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .add_source(Config::try_from(&HivemindConfig::default()).map_err(|e| {
                HivemindError::ConfigurationError(format!("Invalid defaults: {e}"))
            })?)
            .add_source(File::with_name("hivemind").required(false))
            .add_source(Environment::with_prefix("HIVEMIND").separator("__"));

        builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| HivemindError::ConfigurationError(e.to_string()))
    }
}

/// Orchestrator-level settings: event loop, system state machine, failover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Blocking-pop timeout for the global event queue (seconds).
    pub event_poll_timeout_secs: u64,
    /// Interval between system state re-evaluations (seconds).
    pub state_eval_interval_secs: u64,
    /// Interval between cross-service coordination passes (seconds).
    pub coordination_interval_secs: u64,
    /// Interval between failover sweeps (seconds).
    pub failover_interval_secs: u64,
    /// Agents silent for longer than this are considered failed (seconds).
    pub heartbeat_timeout_secs: i64,
    /// Minimum healthy agent count before the system degrades.
    pub min_agents: usize,
    /// Error rate above which the system is degraded (0.0-1.0).
    pub error_rate_warning: f64,
    /// Error rate above which the system is critical (0.0-1.0).
    pub error_rate_critical: f64,
    /// TTL for published dashboard snapshots (seconds).
    pub snapshot_ttl_secs: u64,
    /// Interval between snapshot publications (seconds).
    pub snapshot_interval_secs: u64,
    /// Pending backlog per healthy agent that triggers a coordination alert.
    pub backlog_per_agent: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            event_poll_timeout_secs: 1,
            state_eval_interval_secs: 30,
            coordination_interval_secs: 30,
            failover_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            min_agents: 2,
            error_rate_warning: 0.10,
            error_rate_critical: 0.20,
            snapshot_ttl_secs: 120,
            snapshot_interval_secs: 60,
            backlog_per_agent: 10,
        }
    }
}

/// Task coordinator settings: scheduling, retries, rebalancing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Scheduling loop interval (seconds).
    pub schedule_interval_secs: u64,
    /// Dependency resolver interval (seconds).
    pub dependency_interval_secs: u64,
    /// Load balancer interval (seconds).
    pub rebalance_interval_secs: u64,
    /// Performance analyzer interval (seconds).
    pub performance_interval_secs: u64,
    /// Active tasks older than this are returned to pending (seconds).
    pub task_timeout_secs: i64,
    /// Maximum retry count before a task fails permanently.
    pub max_retries: u32,
    /// TTL on the per-task assignment claim (seconds).
    pub claim_ttl_secs: u64,
    /// Load score above which an agent is overloaded.
    pub overload_threshold: f64,
    /// Load score below which an agent is underloaded.
    pub underload_threshold: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            schedule_interval_secs: 5,
            dependency_interval_secs: 10,
            rebalance_interval_secs: 30,
            performance_interval_secs: 60,
            task_timeout_secs: 600,
            max_retries: 3,
            claim_ttl_secs: 600,
            overload_threshold: 80.0,
            underload_threshold: 30.0,
        }
    }
}

/// Health monitor settings: snapshot cadence, thresholds, alert lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// System snapshot and agent staleness check interval (seconds).
    pub snapshot_interval_secs: u64,
    /// Alert resolution sweep interval (seconds).
    pub alert_sweep_interval_secs: u64,
    /// Stopped-agent cleanup interval (seconds).
    pub cleanup_interval_secs: u64,
    /// Agents unseen for longer than this become unhealthy (seconds).
    pub agent_stale_secs: i64,
    /// Stopped agents are forgotten after this long (seconds).
    pub stopped_retention_secs: i64,
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub disk_warning: f64,
    pub disk_critical: f64,
    /// Active alerts older than this are force-resolved (seconds).
    pub alert_max_age_secs: i64,
    /// Alerts resolve once the metric drops below this fraction of its threshold.
    pub alert_resolve_factor: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 15,
            alert_sweep_interval_secs: 300,
            cleanup_interval_secs: 3600,
            agent_stale_secs: 120,
            stopped_retention_secs: 86_400,
            cpu_warning: 75.0,
            cpu_critical: 90.0,
            memory_warning: 70.0,
            memory_critical: 85.0,
            disk_warning: 75.0,
            disk_critical: 90.0,
            alert_max_age_secs: 3600,
            alert_resolve_factor: 0.9,
        }
    }
}

/// Resource manager settings: cleanup thresholds, container limits, scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource monitor interval (seconds).
    pub monitor_interval_secs: u64,
    /// Scaling advisory interval (seconds).
    pub scaling_interval_secs: u64,
    /// Memory usage that triggers emergency cleanup (percent).
    pub memory_emergency: f64,
    /// Memory usage that triggers standard optimization (percent).
    pub memory_optimize: f64,
    /// Disk usage that triggers log/temp/metrics cleanup (percent).
    pub disk_cleanup: f64,
    /// System usage above which per-agent limits shrink (percent).
    pub limit_shrink_above: f64,
    /// System usage below which per-agent limits grow (percent).
    pub limit_grow_below: f64,
    /// Multiplicative limit adjustment per cycle (fraction).
    pub limit_step: f64,
    pub min_memory_mb: u64,
    pub max_memory_mb: u64,
    pub min_cpu_cores: f64,
    pub max_cpu_cores: f64,
    /// Number of memory samples used for leak-slope regression.
    pub leak_window: usize,
    /// Memory growth slope (percent per sample) that flags a leak.
    pub leak_slope: f64,
    /// Memory usage below which leak detection stays quiet (percent).
    pub leak_min_usage: f64,
    /// Usage above which a scale-up advisory is emitted (percent).
    pub scale_up_above: f64,
    /// Usage below which a scale-down advisory may be emitted (percent).
    pub scale_down_below: f64,
    /// Trailing window for the scale-down average (seconds).
    pub scale_down_window_secs: i64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 10,
            scaling_interval_secs: 30,
            memory_emergency: 85.0,
            memory_optimize: 70.0,
            disk_cleanup: 90.0,
            limit_shrink_above: 80.0,
            limit_grow_below: 40.0,
            limit_step: 0.10,
            min_memory_mb: 512,
            max_memory_mb: 8192,
            min_cpu_cores: 0.5,
            max_cpu_cores: 4.0,
            leak_window: 10,
            leak_slope: 2.0,
            leak_min_usage: 70.0,
            scale_up_above: 80.0,
            scale_down_below: 30.0,
            scale_down_window_secs: 600,
        }
    }
}
