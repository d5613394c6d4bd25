//! Maestro Core - Backend library for Maestro
//!
//! This crate provides the UI-agnostic backend functionality:
//! - Agent registry and workflows
//! - Global model settings and the API key pool
//! - Gemini model gateway
//! - Master AI orchestration runs
//! - Configuration loading and JSON persistence
//!
//! Any front end (CLI, HTTP server) drives the crate through
//! [`OrchestrationService`] and renders the [`Notification`]s it emits.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐   start_run   ┌──────────────────────┐
//! │   Any front end   │ ─────────────→│     maestro-core     │
//! │   (CLI, server)   │               │ OrchestrationService │
//! │                   │ ←─────────────│                      │
//! └───────────────────┘  Notification └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use maestro_core::{Notification, OrchestrationService, RunRequest};
//!
//! let service = OrchestrationService::from_config(&config)?;
//! let report = service.start_run(RunRequest::new(master_id, "Write a haiku")).await?;
//!
//! while let Ok(notif) = service.notifications().try_recv() {
//!     if let Notification::Log { source, text, .. } = notif {
//!         println!("[{}] {}", source, text);
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod keys;
pub mod llm;
pub mod notifications;
pub mod orchestration;
pub mod registry;
pub mod settings;
pub mod storage;
pub mod studio;

// Re-export commonly used types
pub use error::{MaestroError, Result, ValidationError};
pub use notifications::{LogArea, Notification, Severity};

pub use config::{
    load_config, GatewayConfig, MaestroConfig, OrchestrationConfig, StorageConfig,
    DEFAULT_MAX_ITERATIONS,
};

pub use keys::{mask_key, ApiKeyPool, KeyError};

pub use llm::{GatewayError, GeminiGateway, Invocation, ModelGateway, SharedGateway};

pub use orchestration::{
    AbortReason, OrchestrationService, RunHandle, RunOptions, RunPhase, RunReport, RunRequest,
    RunStatus,
};

pub use registry::{
    Agent, AgentId, AgentRegistry, AgentUpdate, NewAgent, RegistryError, Workflow, WorkflowId,
};
pub use settings::GlobalSettings;
pub use storage::Storage;
pub use studio::{SharedStudio, Studio};

/// Get the crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
