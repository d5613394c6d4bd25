//! Global model settings
//!
//! Defines the universe of model identifiers agents may use. Any agent or
//! action referring to a model outside `usable_models` is treated as
//! unavailable.

use crate::registry::Agent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Models offered out of the box and re-added by [`GlobalSettings::discover_models`]
pub const DEFAULT_MODELS: &[&str] = &[
    "models/gemini-1.5-flash-latest",
    "models/gemini-1.5-pro-latest",
];

/// Last-resort model when settings have neither a default nor a usable model
pub const FALLBACK_MODEL: &str = "gemini-1.5-flash-latest";

/// Errors from settings mutation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Please enter a model name")]
    EmptyModelName,

    #[error("Model name already exists: {0}")]
    DuplicateModel(String),
}

/// Default model plus the ordered allow-list of usable models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    #[serde(default)]
    pub default_model: String,

    #[serde(default)]
    pub usable_models: Vec<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        let usable_models: Vec<String> = DEFAULT_MODELS.iter().map(|m| m.to_string()).collect();
        Self {
            default_model: usable_models[0].clone(),
            usable_models,
        }
    }
}

impl GlobalSettings {
    /// Build settings from an explicit list; the default is the first model
    pub fn with_models(models: &[&str]) -> Self {
        let usable_models: Vec<String> = models.iter().map(|m| m.to_string()).collect();
        Self {
            default_model: usable_models.first().cloned().unwrap_or_default(),
            usable_models,
        }
    }

    /// Repair settings loaded from disk: an empty list gets the built-in models
    /// and an empty default becomes the first usable model
    pub fn normalized(mut self) -> Self {
        if self.usable_models.is_empty() {
            self.usable_models = DEFAULT_MODELS.iter().map(|m| m.to_string()).collect();
        }
        let mut seen = std::collections::HashSet::new();
        self.usable_models.retain(|m| seen.insert(m.clone()));
        if self.default_model.is_empty() {
            self.default_model = self.usable_models[0].clone();
        }
        self
    }

    pub fn is_usable(&self, model: &str) -> bool {
        !model.is_empty() && self.usable_models.iter().any(|m| m == model)
    }

    /// The default model, or the first usable one when no default is set
    pub fn fallback_model(&self) -> Option<&str> {
        if !self.default_model.is_empty() {
            Some(&self.default_model)
        } else {
            self.usable_models.first().map(String::as_str)
        }
    }

    /// An agent's own model, or the global default if it has none
    pub fn effective_model<'a>(&'a self, agent: &'a Agent) -> &'a str {
        if agent.model.trim().is_empty() {
            &self.default_model
        } else {
            &agent.model
        }
    }

    /// Keep `requested` if usable, otherwise fall back to the default chain
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            Some(model) if self.is_usable(model) => model.to_string(),
            _ => self.fallback_model().unwrap_or(FALLBACK_MODEL).to_string(),
        }
    }

    pub fn add_model(&mut self, model: &str) -> Result<(), SettingsError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(SettingsError::EmptyModelName);
        }
        if self.usable_models.iter().any(|m| m == model) {
            return Err(SettingsError::DuplicateModel(model.to_string()));
        }
        self.usable_models.push(model.to_string());
        Ok(())
    }

    /// Remove a model; returns whether it was present.
    ///
    /// Removing the default model moves the default to the first remaining model.
    pub fn remove_model(&mut self, model: &str) -> bool {
        let before = self.usable_models.len();
        self.usable_models.retain(|m| m != model);
        if self.default_model == model {
            self.default_model = self.usable_models.first().cloned().unwrap_or_default();
        }
        before != self.usable_models.len()
    }

    /// Re-add any built-in models missing from the list; returns how many were added
    pub fn discover_models(&mut self) -> usize {
        let missing: Vec<String> = DEFAULT_MODELS
            .iter()
            .filter(|m| !self.usable_models.iter().any(|u| u == *m))
            .map(|m| m.to_string())
            .collect();
        let count = missing.len();
        self.usable_models.extend(missing);
        count
    }

    pub fn set_default_model(&mut self, model: &str) {
        self.default_model = model.trim().to_string();
    }
}
