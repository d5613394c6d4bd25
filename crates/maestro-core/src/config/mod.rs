//! Configuration module
//!
//! Handles loading and parsing of `.maestro.toml` configuration files.

mod loader;
mod types;

pub use loader::{load_config, load_from_file, sample_config, ConfigError};
pub use types::{
    GatewayConfig, KeysConfig, MaestroConfig, OrchestrationConfig, StorageConfig,
    DEFAULT_MAX_ITERATIONS, MAX_ITERATIONS_RANGE,
};
