//! # Configuration Management Module
//!
//! Centralized, TOML-backed configuration for the agent. Every tunable has a
//! serde default, so a config file only needs the values it changes.
//!
//! ## Configuration Structure
//!
//! - [`AgentConfig`] - identity of the local node
//! - [`DeliveryConfig`] - chunking, pacing, acknowledgment and retry policy
//! - [`HealthConfig`] - watchdog timeouts, reconnection and liveness file
//! - [`SchedulerConfig`] - task scheduler limits and telemetry handling
//! - [`WorkersConfig`] - background response worker pool
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshagent::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshagent.toml").await?;
//!     config.validate()?;
//!     println!("ack timeout: {}s", config.delivery.ack_timeout_secs);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [agent]
//! name = "Mesh Agent"
//! node_id = "!a1b2c3d4"
//!
//! [delivery]
//! max_chunk_bytes = 200
//! direct_pacing_ms = 5000
//! broadcast_pacing_ms = 15000
//! ack_timeout_secs = 60
//! max_retries = 2
//!
//! [health]
//! activity_timeout_secs = 300
//! probe_timeout_secs = 30
//! liveness_file = "/tmp/healthy"
//!
//! [scheduler]
//! rearm_condition_watches = false
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::delivery::{DeliveryTuning, MARKER_RESERVE};
use crate::health::HealthTuning;
use crate::scheduler::SchedulerTuning;
use crate::transport::NodeId;

/// Largest payload a Meshtastic text frame carries once protocol overhead is paid.
pub const MAX_FRAME_BYTES: usize = 230;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Local node number (`!hex`, `0xhex` or decimal). Acks originating here are
    /// self-echoes and never count as remote delivery.
    pub node_id: String,
    /// Channel index used for broadcast notifications.
    #[serde(default)]
    pub primary_channel: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Mesh Agent".to_string(),
            node_id: "!00000001".to_string(),
            primary_channel: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Upper bound for one transmitted chunk, in bytes.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
    /// Prefix multi-part messages with `[i/n]` so receivers can spot reordering.
    #[serde(default = "default_true")]
    pub chunk_markers: bool,
    /// Delay between consecutive chunks of a direct message (ms).
    #[serde(default = "default_direct_pacing_ms")]
    pub direct_pacing_ms: u64,
    /// Delay between consecutive chunks of a broadcast (ms).
    #[serde(default = "default_broadcast_pacing_ms")]
    pub broadcast_pacing_ms: u64,
    /// Minimum gap between any two transmissions, across all destinations (ms).
    #[serde(default = "default_min_send_gap_ms")]
    pub min_send_gap_ms: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Resends of a chunk after the first attempt times out.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum messages queued across all destinations.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// How often expired ack deadlines are swept (ms).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Idle time after which a destination's lane is torn down (s).
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: default_max_chunk_bytes(),
            chunk_markers: true,
            direct_pacing_ms: default_direct_pacing_ms(),
            broadcast_pacing_ms: default_broadcast_pacing_ms(),
            min_send_gap_ms: default_min_send_gap_ms(),
            ack_timeout_secs: default_ack_timeout_secs(),
            max_retries: default_max_retries(),
            max_queue: default_max_queue(),
            sweep_interval_ms: default_sweep_interval_ms(),
            lane_idle_secs: default_lane_idle_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Silence after which the link is probed.
    #[serde(default = "default_activity_timeout_secs")]
    pub activity_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Disconnection longer than this terminates the process.
    #[serde(default = "default_prolonged_loss_secs")]
    pub prolonged_loss_secs: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Heartbeat file for an external supervisor. Unset disables it.
    #[serde(default = "default_liveness_file")]
    pub liveness_file: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            activity_timeout_secs: default_activity_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            prolonged_loss_secs: default_prolonged_loss_secs(),
            tick_ms: default_tick_ms(),
            liveness_file: default_liveness_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_max_tasks_per_owner")]
    pub max_tasks_per_owner: usize,
    /// When true a condition watcher stays armed after firing and fires again on
    /// every new not-satisfied -> satisfied edge. When false it fires once.
    #[serde(default)]
    pub rearm_condition_watches: bool,
    /// Observations kept per (node, metric).
    #[serde(default = "default_telemetry_history")]
    pub telemetry_history: usize,
    /// How long a synchronous telemetry request waits before deferring.
    #[serde(default = "default_telemetry_request_timeout_secs")]
    pub telemetry_request_timeout_secs: u64,
    /// Unresolved deferred-telemetry callbacks expire after this long.
    #[serde(default = "default_deferred_ttl_secs")]
    pub deferred_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_tasks_per_owner: default_max_tasks_per_owner(),
            rearm_condition_watches: false,
            telemetry_history: default_telemetry_history(),
            telemetry_request_timeout_secs: default_telemetry_request_timeout_secs(),
            deferred_ttl_secs: default_deferred_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshagent.log".to_string()),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_chunk_bytes() -> usize {
    200
}
fn default_direct_pacing_ms() -> u64 {
    5000
}
fn default_broadcast_pacing_ms() -> u64 {
    15000
}
fn default_min_send_gap_ms() -> u64 {
    2000
}
fn default_ack_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}
fn default_max_queue() -> usize {
    50
}
fn default_sweep_interval_ms() -> u64 {
    500
}
fn default_activity_timeout_secs() -> u64 {
    300
}
fn default_probe_timeout_secs() -> u64 {
    30
}
fn default_reconnect_interval_secs() -> u64 {
    10
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_prolonged_loss_secs() -> u64 {
    60
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_liveness_file() -> Option<String> {
    Some("/tmp/healthy".to_string())
}
fn default_max_tasks_per_owner() -> usize {
    5
}
fn default_lane_idle_secs() -> u64 {
    300
}
fn default_telemetry_history() -> usize {
    32
}
fn default_telemetry_request_timeout_secs() -> u64 {
    15
}
fn default_deferred_ttl_secs() -> u64 {
    3600
}
fn default_pool_size() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    16
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.local_node()?.is_unknown() {
            return Err(anyhow!(
                "agent.node_id must not be 0; the radio reports unattributed packets as node 0"
            ));
        }
        let d = &self.delivery;
        if d.max_chunk_bytes > MAX_FRAME_BYTES {
            return Err(anyhow!(
                "delivery.max_chunk_bytes {} exceeds the {}-byte radio frame",
                d.max_chunk_bytes,
                MAX_FRAME_BYTES
            ));
        }
        let floor = if d.chunk_markers { MARKER_RESERVE + 16 } else { 16 };
        if d.max_chunk_bytes < floor {
            return Err(anyhow!(
                "delivery.max_chunk_bytes must be at least {}",
                floor
            ));
        }
        if d.ack_timeout_secs == 0
            || d.sweep_interval_ms == 0
            || d.max_queue == 0
            || d.lane_idle_secs == 0
        {
            return Err(anyhow!(
                "delivery.ack_timeout_secs, sweep_interval_ms, max_queue and lane_idle_secs must be non-zero"
            ));
        }
        let h = &self.health;
        if h.activity_timeout_secs == 0 || h.probe_timeout_secs == 0 || h.tick_ms == 0 {
            return Err(anyhow!(
                "health.activity_timeout_secs, probe_timeout_secs and tick_ms must be non-zero"
            ));
        }
        if h.reconnect_interval_secs == 0 || h.max_reconnect_attempts == 0 {
            return Err(anyhow!(
                "health.reconnect_interval_secs and max_reconnect_attempts must be non-zero"
            ));
        }
        let s = &self.scheduler;
        if s.tick_ms == 0 || s.telemetry_history == 0 || s.max_tasks_per_owner == 0 {
            return Err(anyhow!(
                "scheduler.tick_ms, telemetry_history and max_tasks_per_owner must be non-zero"
            ));
        }
        if self.workers.pool_size == 0 || self.workers.queue_capacity == 0 {
            return Err(anyhow!("workers.pool_size and queue_capacity must be non-zero"));
        }
        Ok(())
    }

    /// Parsed local node id.
    pub fn local_node(&self) -> Result<NodeId> {
        self.agent
            .node_id
            .parse()
            .map_err(|e| anyhow!("agent.node_id: {}", e))
    }

    pub fn delivery_tuning(&self) -> DeliveryTuning {
        let d = &self.delivery;
        DeliveryTuning {
            max_chunk_bytes: d.max_chunk_bytes,
            chunk_markers: d.chunk_markers,
            direct_pacing: Duration::from_millis(d.direct_pacing_ms),
            broadcast_pacing: Duration::from_millis(d.broadcast_pacing_ms),
            min_send_gap: Duration::from_millis(d.min_send_gap_ms),
            ack_timeout: Duration::from_secs(d.ack_timeout_secs),
            max_retries: d.max_retries,
            max_queue: d.max_queue,
            sweep_interval: Duration::from_millis(d.sweep_interval_ms),
            lane_idle: Duration::from_secs(d.lane_idle_secs),
        }
    }

    pub fn health_tuning(&self) -> HealthTuning {
        let h = &self.health;
        HealthTuning {
            activity_timeout: Duration::from_secs(h.activity_timeout_secs),
            probe_timeout: Duration::from_secs(h.probe_timeout_secs),
            reconnect_interval: Duration::from_secs(h.reconnect_interval_secs),
            max_reconnect_attempts: h.max_reconnect_attempts,
            prolonged_loss: Duration::from_secs(h.prolonged_loss_secs),
            tick: Duration::from_millis(h.tick_ms),
        }
    }

    pub fn scheduler_tuning(&self) -> SchedulerTuning {
        let s = &self.scheduler;
        SchedulerTuning {
            tick: Duration::from_millis(s.tick_ms),
            max_tasks_per_owner: s.max_tasks_per_owner,
            rearm_condition_watches: s.rearm_condition_watches,
            telemetry_history: s.telemetry_history,
            telemetry_request_timeout: Duration::from_secs(s.telemetry_request_timeout_secs),
            deferred_ttl: Duration::from_secs(s.deferred_ttl_secs),
        }
    }
}
