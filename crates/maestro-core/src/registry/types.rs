//! Agent and workflow type definitions
//!
//! Serializable for persistence and for the HTTP surface.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel model value asking the registry to pick a model for a new prompt
pub const AUTO_SELECT_MODEL: &str = "AUTO_SELECT_BEST_MODEL_FOR_PROMPT";

/// Opaque unique agent identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Generate a new random agent ID
    pub fn generate() -> Self {
        Self(format!("agent_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A configured agent: a named system prompt bound to a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model: String,
}

impl Agent {
    /// Create an agent with a freshly generated ID
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: AgentId::generate(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            model: model.into(),
        }
    }
}

/// Request to create an agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Requested model; replaced by the default when missing or unusable
    #[serde(default)]
    pub model: Option<String>,
}

/// Partial update; only present fields are considered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl AgentUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.system_prompt.is_none() && self.model.is_none()
    }
}

/// How the `model` field of an edit was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChange {
    /// No model given
    NotRequested,
    /// A usable concrete model was given
    Adopted,
    /// Auto-select with a changed prompt: switched to the default model
    AutoSelected,
    /// Auto-select without a prompt change: model kept
    AutoSelectKept,
    /// The given model is not usable; model kept
    Rejected(String),
}

/// What an edit actually did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub name_changed: bool,
    pub prompt_changed: bool,
    pub model_changed: bool,
    pub model_change: ModelChange,
    pub warnings: Vec<String>,
}

impl EditOutcome {
    /// Whether any field actually changed
    pub fn changed(&self) -> bool {
        self.name_changed || self.prompt_changed || self.model_changed
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name_changed {
            fields.push("name");
        }
        if self.prompt_changed {
            fields.push("system prompt");
        }
        if self.model_changed {
            fields.push("model");
        }
        fields
    }
}

/// Result of deleting an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub agent: Agent,
    /// Number of workflows that lost at least one step
    pub workflows_updated: usize,
}

/// Unique workflow identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn generate() -> Self {
        Self(format!("workflow_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One step of a linear workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub agent_id: AgentId,
}

/// A stored straight-line pipeline of agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub initial_input: String,
}

impl Workflow {
    pub fn new(name: impl Into<String>, agents: &[AgentId]) -> Self {
        Self {
            id: WorkflowId::generate(),
            name: name.into(),
            steps: agents
                .iter()
                .map(|id| WorkflowStep { agent_id: id.clone() })
                .collect(),
            initial_input: String::new(),
        }
    }

    /// Drop every step that points at `agent`; returns whether anything was removed
    pub fn strip_agent(&mut self, agent: &AgentId) -> bool {
        let before = self.steps.len();
        self.steps.retain(|step| &step.agent_id != agent);
        before != self.steps.len()
    }
}
