//! Configuration types for Maestro
//!
//! Defines the structure of `.maestro.toml` configuration.

use crate::llm::DEFAULT_BASE_URL;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default iteration budget when a run does not ask for one
pub const DEFAULT_MAX_ITERATIONS: u32 = 30;

/// Allowed range for a requested iteration budget
pub const MAX_ITERATIONS_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaestroConfig {
    /// Model gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Run loop settings
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Data directory settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Keys seeded into the pool at startup
    #[serde(default)]
    pub keys: KeysConfig,
}

/// Gateway configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL for the API (supports ${ENV_VAR} syntax)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum retries for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, doubled on each attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Orchestration loop configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Iteration budget used when a run does not request one
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    /// Delay between iterations in milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Whether a failed worker call ends the whole run
    #[serde(default = "default_abort_on_worker_failure")]
    pub abort_on_worker_failure: bool,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_pacing_ms() -> u64 {
    500
}

fn default_abort_on_worker_failure() -> bool {
    true
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            pacing_ms: default_pacing_ms(),
            abort_on_worker_failure: default_abort_on_worker_failure(),
        }
    }
}

impl OrchestrationConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    /// The configured default budget, or the built-in one if it is out of range
    pub fn effective_default_max_iterations(&self) -> u32 {
        if MAX_ITERATIONS_RANGE.contains(&self.default_max_iterations) {
            self.default_max_iterations
        } else {
            DEFAULT_MAX_ITERATIONS
        }
    }
}

/// Storage configuration section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory; `~/.maestro` when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Key configuration section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeysConfig {
    /// API keys (supports ${ENV_VAR} syntax)
    #[serde(default)]
    pub api_keys: Vec<String>,
}
