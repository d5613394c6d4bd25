//! Model invocation gateway trait

use super::GatewayError;
use async_trait::async_trait;

/// One stateless model call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub credential: String,
    pub model: String,
    pub user_text: String,
    pub system_text: Option<String>,
}

impl Invocation {
    pub fn new(
        credential: impl Into<String>,
        model: impl Into<String>,
        user_text: impl Into<String>,
    ) -> Self {
        Self {
            credential: credential.into(),
            model: model.into(),
            user_text: user_text.into(),
            system_text: None,
        }
    }

    /// Attach a system prompt; blank prompts are dropped
    pub fn with_system(mut self, system_text: &str) -> Self {
        self.system_text = Some(system_text.to_string()).filter(|s| !s.trim().is_empty());
        self
    }
}

/// Generates text for a prompt.
///
/// Implementations hold no per-call state; the same gateway serves the
/// orchestrator and every worker.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<String, GatewayError>;
}

/// Shared handle to a gateway
pub type SharedGateway = std::sync::Arc<dyn ModelGateway>;
