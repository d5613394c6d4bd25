//! Orchestrator response protocol
//!
//! Turns the free text an orchestrator model returns into exactly one
//! [`Action`]. Rules are tried in priority order (complete, call, create,
//! edit) and only the first match of each kind is considered. Malformed JSON
//! payloads never fail the parse; they degrade and leave a [`ProtocolError`]
//! in the diagnostics.

use crate::registry::AgentUpdate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

/// Output used when the completion marker carries no text at all
pub const EMPTY_COMPLETION_OUTPUT: &str =
    "Task is marked complete by Master AI, but no specific output was provided after 'Final Output:'.";

static COMPLETE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)TASK\s+COMPLETE\.").expect("valid regex"));
static FINAL_OUTPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Final\s+Output:\s*([\s\S]*)").expect("valid regex"));
static AFTER_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)TASK\s+COMPLETE\.\s*([\s\S]*)").expect("valid regex"));
static CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)CALL\s+"([^"]+)"\s+WITH\s+INPUT\s+(\{[\s\S]*?\})(?:\n|$)"#).expect("valid regex")
});
static CREATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)CREATE\s+NEW\s+AGENT\s+(\{[\s\S]*?\})(?:\n|$)").expect("valid regex")
});
static EDIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)EDIT\s+AGENT\s+"([^"]+)"\s+WITH\s+NEW_CONFIG\s+(\{[\s\S]*?\})(?:\n|$)"#)
        .expect("valid regex")
});

/// Non-fatal problem found while reading a matched action
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Parsing CALL input JSON failed: {reason}. Using raw string: {raw}")]
    CallInput { reason: String, raw: String },

    #[error("Error parsing CREATE NEW AGENT JSON: {reason}. Raw: {raw}")]
    CreateConfig { reason: String, raw: String },

    #[error("Error parsing EDIT AGENT NEW_CONFIG JSON: {reason}. Raw: {raw}")]
    EditConfig { reason: String, raw: String },
}

/// Where the completion text was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    /// Text after `Final Output:`
    FinalOutput,
    /// Text after the `TASK COMPLETE.` marker
    AfterMarker,
    /// Nothing followed the marker
    Placeholder,
}

/// Structured rendering of a bulleted final output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum OutputBlock {
    Paragraph(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub output: String,
    pub source: CompletionSource,
    /// Present only when the output contains bullet lines
    pub blocks: Option<Vec<OutputBlock>>,
}

/// Fields of a `CREATE NEW AGENT` payload; missing or non-string fields are `None`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CreateRequest {
    /// All three fields, when each is present and non-blank
    pub fn complete(&self) -> Option<(&str, &str, &str)> {
        fn present(f: &Option<String>) -> Option<&str> {
            f.as_deref().filter(|s| !s.trim().is_empty())
        }
        Some((
            present(&self.name)?,
            present(&self.system_prompt)?,
            present(&self.model)?,
        ))
    }
}

/// One orchestrator instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Complete(Completion),
    Call { agent_name: String, input: String },
    Create(CreateRequest),
    Edit { agent_id: String, update: AgentUpdate },
    Unrecognized,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Complete(_) => "complete",
            Action::Call { .. } => "call",
            Action::Create(_) => "create",
            Action::Edit { .. } => "edit",
            Action::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAction {
    pub action: Action,
    pub diagnostics: Vec<ProtocolError>,
}

impl ParsedAction {
    fn clean(action: Action) -> Self {
        Self {
            action,
            diagnostics: Vec::new(),
        }
    }
}

/// Parse one orchestrator response
pub fn parse_action(text: &str) -> ParsedAction {
    if COMPLETE_MARKER.is_match(text) {
        return ParsedAction::clean(Action::Complete(parse_completion(text)));
    }

    if let Some(caps) = CALL.captures(text) {
        let agent_name = caps[1].trim().to_string();
        let raw = caps[2].to_string();
        let mut diagnostics = Vec::new();
        let input = match serde_json::from_str::<Value>(&raw) {
            Ok(json) => json
                .get("prompt_text")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| raw.clone()),
            Err(e) => {
                diagnostics.push(ProtocolError::CallInput {
                    reason: e.to_string(),
                    raw: raw.clone(),
                });
                raw.clone()
            }
        };
        return ParsedAction {
            action: Action::Call { agent_name, input },
            diagnostics,
        };
    }

    if let Some(caps) = CREATE.captures(text) {
        let raw = &caps[1];
        return match serde_json::from_str::<Value>(raw) {
            Ok(json) => ParsedAction::clean(Action::Create(CreateRequest {
                name: string_field(&json, "name"),
                system_prompt: string_field(&json, "system_prompt"),
                model: string_field(&json, "model"),
            })),
            Err(e) => ParsedAction {
                action: Action::Unrecognized,
                diagnostics: vec![ProtocolError::CreateConfig {
                    reason: e.to_string(),
                    raw: raw.to_string(),
                }],
            },
        };
    }

    if let Some(caps) = EDIT.captures(text) {
        let agent_id = caps[1].trim().to_string();
        let raw = &caps[2];
        return match serde_json::from_str::<Value>(raw) {
            Ok(json) => ParsedAction::clean(Action::Edit {
                agent_id,
                update: AgentUpdate {
                    name: string_field(&json, "name"),
                    system_prompt: string_field(&json, "system_prompt"),
                    model: string_field(&json, "model"),
                },
            }),
            Err(e) => ParsedAction {
                action: Action::Unrecognized,
                diagnostics: vec![ProtocolError::EditConfig {
                    reason: e.to_string(),
                    raw: raw.to_string(),
                }],
            },
        };
    }

    ParsedAction::clean(Action::Unrecognized)
}

fn string_field(json: &Value, key: &str) -> Option<String> {
    json.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_completion(text: &str) -> Completion {
    let captured = |re: &Regex| {
        re.captures(text)
            .map(|c| c[1].trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let (output, source) = if let Some(out) = captured(&FINAL_OUTPUT) {
        (out, CompletionSource::FinalOutput)
    } else if let Some(out) = captured(&AFTER_MARKER) {
        (out, CompletionSource::AfterMarker)
    } else {
        (EMPTY_COMPLETION_OUTPUT.to_string(), CompletionSource::Placeholder)
    };

    let blocks = has_bullets(&output).then(|| output_blocks(&output));
    Completion {
        output,
        source,
        blocks,
    }
}

fn has_bullets(output: &str) -> bool {
    output.contains("\n* ") || output.starts_with("* ")
}

/// Group bullet lines into lists and keep other non-empty lines as paragraphs
pub fn output_blocks(output: &str) -> Vec<OutputBlock> {
    let mut blocks = Vec::new();
    let mut items: Vec<String> = Vec::new();

    for line in output.lines().map(str::trim) {
        if let Some(item) = line.strip_prefix("* ") {
            items.push(item.trim().to_string());
            continue;
        }
        if !items.is_empty() {
            blocks.push(OutputBlock::List(std::mem::take(&mut items)));
        }
        if !line.is_empty() {
            blocks.push(OutputBlock::Paragraph(line.to_string()));
        }
    }
    if !items.is_empty() {
        blocks.push(OutputBlock::List(items));
    }
    blocks
}
