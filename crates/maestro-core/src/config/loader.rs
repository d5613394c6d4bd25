//! Configuration loader with environment variable expansion
//!
//! Loads configuration from `.maestro.toml` in the project root or the user
//! config directory.

use super::types::MaestroConfig;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Load configuration from various sources
///
/// Priority order:
/// 1. Project-level `.maestro.toml`
/// 2. User-level `~/.config/maestro/config.toml`
/// 3. Default configuration
///
/// Environment overrides apply in every case.
pub fn load_config(project_dir: &Path) -> Result<MaestroConfig, ConfigError> {
    let project_config = project_dir.join(".maestro.toml");
    if project_config.exists() {
        return load_from_file(&project_config);
    }

    if let Some(user_config) = get_user_config_path() {
        if user_config.exists() {
            return load_from_file(&user_config);
        }
    }

    Ok(apply_env_overrides(MaestroConfig::default(), env_lookup))
}

/// Get user config directory path
fn get_user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("maestro").join("config.toml"))
}

/// Load configuration from a specific file
pub fn load_from_file(path: &Path) -> Result<MaestroConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content, env_lookup)?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Parse TOML text, expand `${VAR}` references and apply overrides
fn parse_config(
    content: &str,
    lookup: impl Fn(&str) -> Option<String> + Copy,
) -> Result<MaestroConfig, ConfigError> {
    let mut config: MaestroConfig = toml::from_str(content)?;
    expand_env_vars(&mut config, lookup);
    Ok(apply_env_overrides(config, lookup))
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Expand ${VAR} patterns in string values
fn expand_env_vars(config: &mut MaestroConfig, lookup: impl Fn(&str) -> Option<String> + Copy) {
    config.gateway.base_url = expand_string(&config.gateway.base_url, lookup);
    for key in &mut config.keys.api_keys {
        *key = expand_string(key, lookup);
    }
    if let Some(dir) = &config.storage.data_dir {
        let expanded = expand_string(&dir.to_string_lossy(), lookup);
        config.storage.data_dir = Some(PathBuf::from(expanded));
    }
    // Unresolved references stay literal; keys that are still placeholders are dropped.
    config.keys.api_keys.retain(|k| !k.is_empty() && !ENV_VAR.is_match(k));
}

/// Expand environment variables in a single string
fn expand_string(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_VAR
        .replace_all(s, |caps: &regex::Captures| {
            let var_name = &caps[1];
            lookup(var_name).unwrap_or_else(|| format!("${{{}}}", var_name))
        })
        .to_string()
}

/// Apply environment variable overrides for common settings
///
/// Supports direct environment variables:
/// - GEMINI_API_KEY / GOOGLE_API_KEY -> keys.api_keys
/// - MAESTRO_DATA_DIR -> storage.data_dir
/// - MAESTRO_GATEWAY_URL -> gateway.base_url
fn apply_env_overrides(
    mut config: MaestroConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> MaestroConfig {
    for env_var in ["GEMINI_API_KEY", "GOOGLE_API_KEY"] {
        if let Some(key) = lookup(env_var).filter(|k| !k.is_empty()) {
            if !config.keys.api_keys.contains(&key) {
                config.keys.api_keys.push(key);
            }
        }
    }

    if let Some(dir) = lookup("MAESTRO_DATA_DIR").filter(|d| !d.is_empty()) {
        config.storage.data_dir = Some(PathBuf::from(dir));
    }

    if let Some(url) = lookup("MAESTRO_GATEWAY_URL").filter(|u| !u.is_empty()) {
        config.gateway.base_url = url;
    }

    config.storage.data_dir = config.storage.data_dir.map(|dir| expand_home(&dir));
    config
}

/// Replace a leading `~` with the home directory
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Create a sample configuration file content
pub fn sample_config() -> &'static str {
    r#"# Maestro Configuration
# Place this file in your project root as .maestro.toml
# or in ~/.config/maestro/config.toml for global settings

[gateway]
base_url = "https://generativelanguage.googleapis.com"

# Request timeout in seconds
timeout = 120

# Retries for network errors, rate limits and server errors
max_retries = 2
retry_backoff_ms = 500

[orchestration]
# Used when a run does not request a budget (1-50)
default_max_iterations = 30

# Delay between iterations in milliseconds
pacing_ms = 500

# Set to false to record failed worker calls and keep going
abort_on_worker_failure = true

[storage]
# data_dir = "~/.maestro"

[keys]
api_keys = ["${GEMINI_API_KEY}"]
"#
}
