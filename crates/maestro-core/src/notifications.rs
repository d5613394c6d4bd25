//! Notifications that the Maestro backend sends to any front end
//!
//! The core never renders anything. Log lines, user-facing notices and run
//! lifecycle events are sent over a channel; a CLI prints them, a server
//! keeps them for clients. They are serializable for HTTP clients.

use crate::orchestration::{OutputBlock, RunStatus};
use serde::{Deserialize, Serialize};

/// Where a log line belongs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogArea {
    /// Step-by-step run log
    Run,
    /// The final synthesized output area
    FinalOutput,
}

/// Severity of a user notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Notifications that the backend sends to any front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    /// A line for a log area
    Log {
        area: LogArea,

        /// Who produced the line ("Orchestrator", an agent name, ...)
        source: String,

        text: String,

        /// Whether `text` carries emphasis markup
        rich: bool,
    },

    /// Short message meant to be surfaced to the user
    UserNotice { message: String, severity: Severity },

    /// Agents were created or edited; listings and selectors should refresh
    AgentsChanged,

    /// The run's final output (completion text or a stop notice)
    FinalOutput {
        text: String,

        /// Structured form when the output contains bullet lines
        blocks: Option<Vec<OutputBlock>>,
    },

    /// A run passed validation and started iterating
    RunStarted {
        goal: String,
        orchestrator: String,
        max_iterations: u32,
    },

    /// A run ended
    RunFinished { status: RunStatus, iterations: u32 },

    /// The run switched to another API key
    KeyRotated {
        index: usize,

        /// First characters of the key only
        masked: String,
    },
}

impl Notification {
    /// Create a plain run log line
    pub fn log(source: impl Into<String>, text: impl Into<String>) -> Self {
        Notification::Log {
            area: LogArea::Run,
            source: source.into(),
            text: text.into(),
            rich: false,
        }
    }

    /// Create an emphasized run log line
    pub fn rich_log(source: impl Into<String>, text: impl Into<String>) -> Self {
        Notification::Log {
            area: LogArea::Run,
            source: source.into(),
            text: text.into(),
            rich: true,
        }
    }

    /// Create a UserNotice notification
    pub fn notice(message: impl Into<String>, severity: Severity) -> Self {
        Notification::UserNotice {
            message: message.into(),
            severity,
        }
    }

    pub fn final_output(text: impl Into<String>, blocks: Option<Vec<OutputBlock>>) -> Self {
        Notification::FinalOutput {
            text: text.into(),
            blocks,
        }
    }
}
