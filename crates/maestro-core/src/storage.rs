//! Persistence layer
//!
//! Stores agents, workflows, global settings and the API key pool as JSON
//! files under the data directory (`~/.maestro` by default).

use crate::error::{MaestroError, Result};
use crate::keys::ApiKeyPool;
use crate::registry::{Agent, AgentRegistry, Workflow};
use crate::settings::GlobalSettings;
use crate::studio::Studio;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const AGENTS_FILE: &str = "agents.json";
const WORKFLOWS_FILE: &str = "workflows.json";
const SETTINGS_FILE: &str = "settings.json";
const KEYS_FILE: &str = "keys.json";

/// File-backed storage for everything a [`Studio`] holds
#[derive(Debug, Clone)]
pub struct Storage {
    /// Base directory (~/.maestro)
    data_dir: PathBuf,
}

impl Storage {
    /// Storage in the default data directory
    pub fn new() -> Result<Self> {
        let data_dir = dirs::home_dir()
            .ok_or_else(|| MaestroError::config("Could not determine home directory"))?
            .join(".maestro");
        Ok(Self { data_dir })
    }

    /// Storage in a custom directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir).map_err(|e| {
                MaestroError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create data directory: {}", e),
                ))
            })?;
        }
        Ok(())
    }

    /// Read a JSON file; a missing file yields the default value
    fn load_json<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T> {
        let path = self.data_dir.join(file);
        if !path.exists() {
            return Ok(T::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            MaestroError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read {}: {}", file, e),
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| MaestroError::Serialization(format!("Failed to parse {}: {}", file, e)))
    }

    /// Write a JSON file atomically using a temp file
    fn save_json<T: Serialize + ?Sized>(&self, file: &str, value: &T) -> Result<()> {
        self.ensure_data_dir()?;

        let content = serde_json::to_string_pretty(value).map_err(|e| {
            MaestroError::Serialization(format!("Failed to serialize {}: {}", file, e))
        })?;

        let path = self.data_dir.join(file);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &content).map_err(|e| {
            MaestroError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to write {}: {}", file, e),
            ))
        })?;
        fs::rename(&temp_path, &path).map_err(|e| {
            MaestroError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to save {}: {}", file, e),
            ))
        })?;

        tracing::debug!(path = %path.display(), "saved");
        Ok(())
    }

    pub fn load_agents(&self) -> Result<Vec<Agent>> {
        self.load_json(AGENTS_FILE)
    }

    pub fn save_agents(&self, agents: &[Agent]) -> Result<()> {
        self.save_json(AGENTS_FILE, agents)
    }

    pub fn load_workflows(&self) -> Result<Vec<Workflow>> {
        self.load_json(WORKFLOWS_FILE)
    }

    pub fn save_workflows(&self, workflows: &[Workflow]) -> Result<()> {
        self.save_json(WORKFLOWS_FILE, workflows)
    }

    /// Load settings; an empty usable-model list falls back to the built-ins
    pub fn load_settings(&self) -> Result<GlobalSettings> {
        let settings: GlobalSettings = self.load_json(SETTINGS_FILE)?;
        Ok(settings.normalized())
    }

    pub fn save_settings(&self, settings: &GlobalSettings) -> Result<()> {
        self.save_json(SETTINGS_FILE, settings)
    }

    pub fn load_keys(&self) -> Result<ApiKeyPool> {
        self.load_json(KEYS_FILE)
    }

    pub fn save_keys(&self, keys: &ApiKeyPool) -> Result<()> {
        self.save_json(KEYS_FILE, keys)
    }

    /// Persist both halves of the registry
    pub fn save_registry(&self, registry: &AgentRegistry) -> Result<()> {
        self.save_agents(registry.agents())?;
        self.save_workflows(registry.workflows())
    }

    /// Load everything into a fresh studio
    pub fn load_studio(&self) -> Result<Studio> {
        let registry = AgentRegistry::from_parts(self.load_agents()?, self.load_workflows()?);
        let studio = Studio::new(registry, self.load_settings()?, self.load_keys()?);
        tracing::info!(
            dir = %self.data_dir.display(),
            agents = studio.registry.len(),
            keys = studio.keys.len(),
            "studio loaded"
        );
        Ok(studio)
    }

    pub fn save_studio(&self, studio: &Studio) -> Result<()> {
        self.save_registry(&studio.registry)?;
        self.save_settings(&studio.settings)?;
        self.save_keys(&studio.keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewAgent;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_missing_files_load_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::with_data_dir(temp_dir.path().join("nested"));

        let studio = storage.load_studio().unwrap();
        assert!(studio.registry.is_empty());
        assert!(studio.keys.is_empty());
        assert_eq!(studio.settings, GlobalSettings::default());
    }

    #[test]
    fn test_studio_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::with_data_dir(temp_dir.path().to_path_buf());

        let mut studio = Studio::default();
        let writer = studio
            .create_agent(NewAgent {
                name: "Writer".to_string(),
                system_prompt: "Write.".to_string(),
                model: None,
            })
            .unwrap();
        studio
            .registry
            .save_workflow(Workflow::new("Draft", &[writer.id.clone()]))
            .unwrap();
        studio.keys.add("key-aaaaaaaaaa").unwrap();

        storage.save_studio(&studio).unwrap();
        assert!(!temp_dir.path().join("agents.json.tmp").exists());

        let loaded = storage.load_studio().unwrap();
        assert_eq!(loaded.registry.agents(), studio.registry.agents());
        assert_eq!(loaded.registry.workflows(), studio.registry.workflows());
        assert_eq!(loaded.keys, studio.keys);
        assert_eq!(loaded.settings, studio.settings);
    }

    #[test]
    fn test_empty_model_list_falls_back() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("settings.json"),
            r#"{"defaultModel": "", "usableModels": []}"#,
        )
        .unwrap();

        let storage = Storage::with_data_dir(temp_dir.path().to_path_buf());
        let settings = storage.load_settings().unwrap();
        assert_eq!(settings.usable_models.len(), 2);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("agents.json"), "{ not json").unwrap();

        let storage = Storage::with_data_dir(temp_dir.path().to_path_buf());
        assert!(matches!(
            storage.load_agents(),
            Err(MaestroError::Serialization(_))
        ));
    }
}
