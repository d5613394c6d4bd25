//! Agent Registry
//!
//! Exclusive owner of the agent collection and the stored workflows. Callers
//! hold agents only by id or name and resolve them again whenever they need
//! them, since agents may be edited mid-run.

mod types;

pub use types::{
    Agent, AgentId, AgentUpdate, DeleteOutcome, EditOutcome, ModelChange, NewAgent, Workflow,
    WorkflowId, WorkflowStep, AUTO_SELECT_MODEL,
};

use crate::settings::GlobalSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from registry operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Agent name is required")]
    EmptyName,

    #[error("Agent model is required")]
    MissingModel,

    #[error("Agent with name \"{0}\" already exists")]
    DuplicateName(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Workflow name is required")]
    EmptyWorkflowName,

    #[error("Workflow \"{0}\" needs at least one step")]
    EmptyWorkflow(String),
}

/// Agents plus the workflows that reference them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
    #[serde(default)]
    workflows: Vec<Workflow>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted parts
    pub fn from_parts(agents: Vec<Agent>, workflows: Vec<Workflow>) -> Self {
        Self { agents, workflows }
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn workflows(&self) -> &[Workflow] {
        &self.workflows
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn find_by_id(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.iter().find(|a| &a.id == id)
    }

    /// Case-insensitive name lookup
    pub fn find_by_name(&self, name: &str) -> Option<&Agent> {
        let name = name.trim().to_lowercase();
        self.agents.iter().find(|a| a.name.to_lowercase() == name)
    }

    fn name_taken(&self, name: &str, except: Option<&AgentId>) -> bool {
        let name = name.to_lowercase();
        self.agents
            .iter()
            .any(|a| a.name.to_lowercase() == name && Some(&a.id) != except)
    }

    /// Create an agent.
    ///
    /// The model is resolved against the usable list, falling back to the
    /// default model. A duplicate name (any case) leaves the registry untouched.
    pub fn create(
        &mut self,
        request: NewAgent,
        settings: &GlobalSettings,
    ) -> Result<Agent, RegistryError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.name_taken(name, None) {
            tracing::warn!(name, "agent already exists, not creating");
            return Err(RegistryError::DuplicateName(name.to_string()));
        }

        let model = settings.resolve_model(request.model.as_deref());
        if let Some(requested) = request.model.as_deref() {
            if requested.trim() != model {
                tracing::debug!(requested, resolved = %model, "requested model not usable");
            }
        }

        let agent = Agent::new(name, request.system_prompt.trim(), model);
        tracing::info!(id = %agent.id, name = %agent.name, model = %agent.model, "agent created");
        self.agents.push(agent.clone());
        Ok(agent)
    }

    /// Replace an agent by id (or append it) as submitted from a user form
    ///
    /// Returns `true` when a new agent was added.
    pub fn upsert(&mut self, mut agent: Agent) -> Result<bool, RegistryError> {
        agent.name = agent.name.trim().to_string();
        agent.system_prompt = agent.system_prompt.trim().to_string();
        if agent.name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if agent.model.trim().is_empty() {
            return Err(RegistryError::MissingModel);
        }
        if self.name_taken(&agent.name, Some(&agent.id)) {
            return Err(RegistryError::DuplicateName(agent.name));
        }

        match self.agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => {
                *existing = agent;
                Ok(false)
            }
            None => {
                self.agents.push(agent);
                Ok(true)
            }
        }
    }

    /// Apply a partial update to an agent.
    ///
    /// Name and system prompt change only for a non-empty value that differs
    /// from the current one. The auto-select sentinel switches to the default
    /// model only when the system prompt changed in this same edit.
    pub fn edit(
        &mut self,
        id: &AgentId,
        update: AgentUpdate,
        settings: &GlobalSettings,
    ) -> Result<EditOutcome, RegistryError> {
        let rename_conflict = update
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .is_some_and(|n| self.name_taken(n, Some(id)));

        let agent = self
            .agents
            .iter_mut()
            .find(|a| &a.id == id)
            .ok_or_else(|| RegistryError::AgentNotFound(id.clone()))?;

        let mut outcome = EditOutcome {
            name_changed: false,
            prompt_changed: false,
            model_changed: false,
            model_change: ModelChange::NotRequested,
            warnings: Vec::new(),
        };

        if let Some(name) = update.name.as_deref().map(str::trim) {
            if !name.is_empty() && name != agent.name {
                if rename_conflict {
                    outcome.warnings.push(format!(
                        "Name \"{}\" is already used by another agent. Name not changed.",
                        name
                    ));
                } else {
                    agent.name = name.to_string();
                    outcome.name_changed = true;
                }
            }
        }

        if let Some(prompt) = update.system_prompt.as_deref().map(str::trim) {
            if !prompt.is_empty() && prompt != agent.system_prompt {
                agent.system_prompt = prompt.to_string();
                outcome.prompt_changed = true;
            }
        }

        if let Some(model) = update.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            let mut new_model = agent.model.clone();
            if model.eq_ignore_ascii_case(AUTO_SELECT_MODEL) {
                if outcome.prompt_changed {
                    if let Some(fallback) = settings.fallback_model() {
                        new_model = fallback.to_string();
                    }
                    outcome.model_change = ModelChange::AutoSelected;
                } else {
                    outcome.model_change = ModelChange::AutoSelectKept;
                }
            } else if settings.is_usable(model) {
                new_model = model.to_string();
                outcome.model_change = ModelChange::Adopted;
            } else {
                tracing::warn!(model, agent = %agent.id, "suggested model not usable");
                outcome.warnings.push(format!(
                    "Suggested model \"{}\" is not in usable models list. Model will not be changed from \"{}\".",
                    model, agent.model
                ));
                outcome.model_change = ModelChange::Rejected(model.to_string());
            }

            if new_model != agent.model {
                agent.model = new_model;
                outcome.model_changed = true;
            }
        }

        if outcome.changed() {
            tracing::info!(id = %agent.id, fields = ?outcome.changed_fields(), "agent edited");
        }
        Ok(outcome)
    }

    /// Remove an agent and strip it from every workflow step list
    pub fn delete(&mut self, id: &AgentId) -> Option<DeleteOutcome> {
        let index = self.agents.iter().position(|a| &a.id == id)?;
        let agent = self.agents.remove(index);

        let workflows_updated = self
            .workflows
            .iter_mut()
            .map(|wf| wf.strip_agent(id))
            .filter(|changed| *changed)
            .count();

        tracing::info!(id = %agent.id, workflows_updated, "agent deleted");
        Some(DeleteOutcome {
            agent,
            workflows_updated,
        })
    }

    pub fn find_workflow(&self, id: &WorkflowId) -> Option<&Workflow> {
        self.workflows.iter().find(|w| &w.id == id)
    }

    /// Store a workflow, replacing one with the same id
    pub fn save_workflow(&mut self, mut workflow: Workflow) -> Result<bool, RegistryError> {
        workflow.name = workflow.name.trim().to_string();
        if workflow.name.is_empty() {
            return Err(RegistryError::EmptyWorkflowName);
        }
        if workflow.steps.is_empty() {
            return Err(RegistryError::EmptyWorkflow(workflow.name));
        }

        match self.workflows.iter_mut().find(|w| w.id == workflow.id) {
            Some(existing) => {
                *existing = workflow;
                Ok(false)
            }
            None => {
                self.workflows.push(workflow);
                Ok(true)
            }
        }
    }

    pub fn delete_workflow(&mut self, id: &WorkflowId) -> Option<Workflow> {
        let index = self.workflows.iter().position(|w| &w.id == id)?;
        Some(self.workflows.remove(index))
    }
}
