//! Engine configuration types.
//!
//! `EngineConfig` is the top-level `conductor.toml`. Every field has a
//! default so an empty (or missing) file yields a working engine.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Node executions allowed at once, across all workflows.
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,

    /// Workflows coordinated at once; further submissions queue by priority.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Per-node timeout when the node does not set one.
    #[serde(default = "default_node_timeout_secs")]
    pub default_node_timeout_secs: u64,

    /// Per-workflow timeout when neither the caller nor the definition sets one.
    #[serde(default = "default_workflow_timeout_secs")]
    pub default_workflow_timeout_secs: u64,

    /// Terminal workflows kept in memory before the oldest are evicted.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_concurrent_nodes() -> usize {
    50
}

fn default_max_concurrent_workflows() -> usize {
    10
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_history_limit() -> usize {
    1000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: default_max_concurrent_nodes(),
            max_concurrent_workflows: default_max_concurrent_workflows(),
            default_node_timeout_secs: default_node_timeout_secs(),
            default_workflow_timeout_secs: default_workflow_timeout_secs(),
            history_limit: default_history_limit(),
            event_capacity: default_event_capacity(),
            backoff: BackoffConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Exponential retry backoff: `min(cap, base * 2^retry_count)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            cap_ms: default_backoff_cap_ms(),
        }
    }
}

/// Tracing output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel: false,
        }
    }
}
