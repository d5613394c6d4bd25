//! API key pool and run-scoped key rotation
//!
//! [`ApiKeyPool`] is the persisted, user-managed set of credentials.
//! [`KeyRotation`] is the working cursor an orchestration run keeps into a
//! snapshot of that pool; it is never persisted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Keys rotate every this many iterations, starting after the first block
pub const ROTATION_INTERVAL: u32 = 7;

/// Keys must be longer than this to be accepted
const MIN_KEY_LEN: usize = 10;

/// Errors from key pool mutation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Please enter a valid API Key (must be longer than 10 characters)")]
    TooShort,

    #[error("This API Key is already saved")]
    Duplicate,

    #[error("API Key not managed: {0}")]
    Unknown(String),
}

/// Render a key for logs without revealing it
pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}...", prefix)
}

/// Whether the loop rotates keys before processing `iteration` (1-based).
///
/// True for 8, 15, 22, ...; never for the first iteration.
pub fn rotation_due(iteration: u32) -> bool {
    iteration > 1 && (iteration - 1) % ROTATION_INTERVAL == 0
}

/// Ordered set of managed credentials plus the last selected one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyPool {
    #[serde(default)]
    keys: Vec<String>,

    #[serde(default)]
    last_selected: Option<String>,
}

impl ApiKeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pool = Self::new();
        for key in keys {
            let key = key.into();
            if !pool.keys.contains(&key) {
                pool.keys.push(key);
            }
        }
        pool
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn last_selected(&self) -> Option<&str> {
        self.last_selected.as_deref()
    }

    /// Add a key and select it
    pub fn add(&mut self, key: &str) -> Result<(), KeyError> {
        let key = key.trim();
        if key.len() <= MIN_KEY_LEN {
            return Err(KeyError::TooShort);
        }
        if self.keys.iter().any(|k| k == key) {
            return Err(KeyError::Duplicate);
        }
        self.keys.push(key.to_string());
        self.last_selected = Some(key.to_string());
        Ok(())
    }

    /// Remove a key; clears the selection if it pointed at that key
    pub fn remove(&mut self, key: &str) -> Result<(), KeyError> {
        let index = self
            .keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| KeyError::Unknown(mask_key(key)))?;
        self.keys.remove(index);
        if self.last_selected.as_deref() == Some(key) {
            self.last_selected = None;
        }
        Ok(())
    }

    pub fn select(&mut self, key: &str) -> Result<(), KeyError> {
        if !self.keys.iter().any(|k| k == key) {
            return Err(KeyError::Unknown(mask_key(key)));
        }
        self.last_selected = Some(key.to_string());
        Ok(())
    }

    /// Selected key if it is still managed, else the first key
    pub fn current(&self) -> Option<&str> {
        self.last_selected
            .as_deref()
            .filter(|sel| self.keys.iter().any(|k| k == sel))
            .or_else(|| self.keys.first().map(String::as_str))
    }
}

/// How a rotation cursor picked its starting key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStart {
    /// The pre-selected key is a pool member
    Selected,
    /// Nothing (valid) was selected; started at index 0
    Defaulted,
}

/// Result of a rotation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    Rotated { index: usize },
    SingleKey,
}

/// Run-scoped cursor into a snapshot of the key pool
#[derive(Debug, Clone)]
pub struct KeyRotation {
    keys: Vec<String>,
    index: usize,
}

impl KeyRotation {
    /// Start at the selected key, or at index 0; `None` if the pool is empty
    pub fn start(pool: &ApiKeyPool) -> Option<(Self, KeyStart)> {
        if pool.is_empty() {
            return None;
        }
        let selected = pool
            .last_selected
            .as_deref()
            .and_then(|sel| pool.keys.iter().position(|k| k == sel));

        let (index, start) = match selected {
            Some(index) => (index, KeyStart::Selected),
            None => (0, KeyStart::Defaulted),
        };
        Some((
            Self {
                keys: pool.keys.clone(),
                index,
            },
            start,
        ))
    }

    pub fn current(&self) -> &str {
        &self.keys[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Advance to the next key, wrapping around; no-op with a single key
    pub fn rotate(&mut self) -> RotateOutcome {
        if self.keys.len() <= 1 {
            tracing::debug!("key rotation skipped: only one key available");
            return RotateOutcome::SingleKey;
        }
        self.index = (self.index + 1) % self.keys.len();
        tracing::info!(index = self.index, key = %mask_key(self.current()), "API key rotated");
        RotateOutcome::Rotated { index: self.index }
    }
}
