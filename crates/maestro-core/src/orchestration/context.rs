//! Orchestrator context document
//!
//! The instruction block at the end is the contract the orchestrator model is
//! prompted against. Its wording must not change.

use crate::registry::{Agent, AgentId};
use crate::settings::GlobalSettings;
use std::fmt::Write;

const PROMPT_PREVIEW_CHARS: usize = 120;
const NO_PROMPT_PREVIEW: &str = "No specific prompt defined, general purpose.";
const NO_HISTORY: &str = "(No actions taken yet in this session)";

const RESPONSE_FORMATS: &str = concat!(
    "Based on the user's goal, available agents (with their IDs for precise editing), available models, and the history of actions/results, what is the next single, specific action? ",
    "Format your response strictly as ONE of the following:\n",
    "1. CALL \"Agent Name\" WITH INPUT {\"prompt_text\": \"Exact input for the agent...\"}\n",
    "2. CREATE NEW AGENT {\"name\": \"Suggested Agent Name\", \"system_prompt\": \"Detailed system prompt for the new agent...\", \"model\": \"Specify a model from the 'Available Models' list or let the system pick a default if unsure\"}\n",
    "3. EDIT AGENT \"Agent ID To Edit\" WITH NEW_CONFIG {\"name\": \"Optional New Name\", \"system_prompt\": \"Optional New System Prompt\", \"model\": \"Optional: Specify a new model from 'Available Models' list, or if not specified and a prompt change suggests a different model type, you can suggest 'AUTO_SELECT_BEST_MODEL_FOR_PROMPT'\"}\n",
    "   (Provide only the fields you want to change in NEW_CONFIG. Use the Agent ID for accuracy.)\n",
    "4. TASK COMPLETE. Final Output: [Your final synthesized answer based on all previous steps and results]",
);

/// First `max` characters of `text`
pub(crate) fn excerpt(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Build the user text sent to the orchestrator for one iteration
pub fn build_context(
    goal: &str,
    orchestrator: &AgentId,
    agents: &[Agent],
    settings: &GlobalSettings,
    history: &str,
) -> String {
    let mut doc = String::new();
    let _ = write!(doc, "User's High-Level Goal: \"{}\"\n\n", goal);
    doc.push_str("List of currently available worker agents (you should not call yourself or agents already called if their task is done for this iteration, unless necessary for refinement):\n");

    for agent in agents.iter().filter(|a| &a.id != orchestrator) {
        let prompt = if agent.system_prompt.is_empty() {
            NO_PROMPT_PREVIEW
        } else {
            &agent.system_prompt
        };
        let model = [agent.model.as_str(), settings.default_model.as_str()]
            .into_iter()
            .find(|m| !m.is_empty())
            .unwrap_or("Default");
        let _ = writeln!(
            doc,
            "- Name: \"{}\", ID: \"{}\", Description/System Prompt: \"{}...\" (Model: {})",
            agent.name,
            agent.id,
            excerpt(prompt, PROMPT_PREVIEW_CHARS),
            model
        );
    }

    doc.push_str("\nAvailable Models for Agent Configuration (if changing an agent's model):\n");
    for model in &settings.usable_models {
        let _ = writeln!(doc, "- {}", model);
    }

    let history = if history.is_empty() { NO_HISTORY } else { history };
    let _ = write!(
        doc,
        "\nHISTORY OF ACTIONS AND RESULTS SO FAR THIS SESSION (use this to inform your next step and avoid repetition unless necessary):\n{}\n\n",
        history
    );
    doc.push_str(RESPONSE_FORMATS);
    doc
}
