//! Error types for Maestro Core
//!
//! Provides a unified error type for all backend operations. Each component
//! keeps its own narrow error enum; they all convert into [`MaestroError`].

use crate::keys::KeyError;
use crate::llm::GatewayError;
use crate::registry::RegistryError;
use crate::settings::SettingsError;
use thiserror::Error;

/// Result type for Maestro Core operations
pub type Result<T> = std::result::Result<T, MaestroError>;

/// Unified error type for Maestro Core
#[derive(Error, Debug)]
pub enum MaestroError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A run precondition failed; the run never started
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Model invocation failed
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Agent registry rejected an operation
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// API key pool rejected an operation
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// Global settings rejected an operation
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),
}

impl MaestroError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        MaestroError::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        MaestroError::NotFound(msg.into())
    }
}

impl From<serde_json::Error> for MaestroError {
    fn from(err: serde_json::Error) -> Self {
        MaestroError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MaestroError {
    fn from(err: toml::de::Error) -> Self {
        MaestroError::Config(err.to_string())
    }
}

/// Precondition failures detected before an orchestration run starts.
///
/// These are user-correctable and reported as notices; they never consume an
/// iteration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("API Key missing or no keys managed")]
    NoApiKeys,

    #[error("Master AI Orchestrator Agent not selected")]
    NoOrchestrator,

    #[error("High-Level Goal for Master AI is missing")]
    EmptyGoal,

    #[error("Master AI Orchestrator Agent configuration not found: {0}")]
    OrchestratorNotFound(String),

    #[error("Master AI agent's model \"{0}\" is not available")]
    ModelUnavailable(String),

    #[error("An orchestration run is already in progress")]
    AlreadyRunning,
}
