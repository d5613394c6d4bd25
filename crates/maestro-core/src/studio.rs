//! Shared orchestration context
//!
//! Everything an orchestration run reads or mutates lives in one [`Studio`]
//! behind a lock, instead of in process-wide globals.

use crate::keys::ApiKeyPool;
use crate::registry::{
    Agent, AgentId, AgentRegistry, AgentUpdate, EditOutcome, NewAgent, RegistryError,
};
use crate::settings::GlobalSettings;
use parking_lot::RwLock;
use std::sync::Arc;

/// Agents, settings and credentials
#[derive(Debug, Clone, Default)]
pub struct Studio {
    pub registry: AgentRegistry,
    pub settings: GlobalSettings,
    pub keys: ApiKeyPool,
}

/// Handle shared by the service and the run loop.
///
/// Guards must never be held across an `.await`.
pub type SharedStudio = Arc<RwLock<Studio>>;

impl Studio {
    pub fn new(registry: AgentRegistry, settings: GlobalSettings, keys: ApiKeyPool) -> Self {
        Self {
            registry,
            settings,
            keys,
        }
    }

    pub fn into_shared(self) -> SharedStudio {
        Arc::new(RwLock::new(self))
    }

    /// Create an agent with models resolved against the current settings
    pub fn create_agent(&mut self, request: NewAgent) -> Result<Agent, RegistryError> {
        self.registry.create(request, &self.settings)
    }

    /// Edit an agent with models resolved against the current settings
    pub fn edit_agent(
        &mut self,
        id: &AgentId,
        update: AgentUpdate,
    ) -> Result<EditOutcome, RegistryError> {
        self.registry.edit(id, update, &self.settings)
    }

    /// An agent together with the model it would run on
    pub fn agent_with_model(&self, agent: &Agent) -> (Agent, String) {
        (agent.clone(), self.settings.effective_model(agent).to_string())
    }
}
