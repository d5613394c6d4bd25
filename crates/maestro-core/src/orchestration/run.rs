//! The orchestration run loop
//!
//! A run asks the orchestrator agent for one action per iteration, carries it
//! out against the shared [`Studio`], and feeds a textual history of what
//! happened back into the next request. It stops on completion, when the
//! iteration budget is spent, on a gateway failure, or when cancelled.

use super::context::{build_context, excerpt};
use super::protocol::{parse_action, Action, Completion, CompletionSource, CreateRequest};
use crate::config::{OrchestrationConfig, MAX_ITERATIONS_RANGE};
use crate::error::ValidationError;
use crate::keys::{mask_key, rotation_due, KeyRotation, KeyStart, RotateOutcome};
use crate::llm::{Invocation, SharedGateway};
use crate::notifications::{Notification, Severity};
use crate::registry::{Agent, AgentId, AgentUpdate, ModelChange, NewAgent, RegistryError};
use crate::storage::Storage;
use crate::studio::{SharedStudio, Studio};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Final output shown when a run ends without a completion
pub const STOPPED_NOTICE: &str =
    "Orchestration stopped before a final output was explicitly generated by Master AI.";

/// Final output shown when the budget runs out without a completion
pub const MAX_ITERATIONS_NOTICE: &str = "Orchestration finished, but no explicit \"TASK COMPLETE\" with final output was issued by Master AI within the iteration limit.";

const ORCHESTRATOR: &str = "Orchestrator";
const ORCHESTRATOR_ERROR: &str = "Orchestrator Error";

const INPUT_EXCERPT_CHARS: usize = 50;
const OUTPUT_EXCERPT_CHARS: usize = 100;
const UNCLEAR_LOG_CHARS: usize = 200;

/// What the caller asks for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Id of the orchestrator agent
    pub orchestrator: String,
    pub goal: String,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl RunRequest {
    pub fn new(orchestrator: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            orchestrator: orchestrator.into(),
            goal: goal.into(),
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    MaxIterationsReached,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::MaxIterationsReached => write!(f, "max iterations reached"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Why an aborted run stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// Stop was requested
    Cancelled,

    /// The orchestrator's own model call failed
    OrchestratorFailed { iteration: u32, message: String },

    /// A worker call failed while failures abort the run
    WorkerFailed {
        iteration: u32,
        agent: String,
        message: String,
    },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "stopped by user"),
            AbortReason::OrchestratorFailed { iteration, message } => {
                write!(f, "orchestrator call failed at step {}: {}", iteration, message)
            }
            AbortReason::WorkerFailed {
                iteration,
                agent,
                message,
            } => write!(
                f,
                "call to agent \"{}\" failed at step {}: {}",
                agent, iteration, message
            ),
        }
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub status: RunStatus,
    pub iterations: u32,
    pub max_iterations: u32,
    /// Completion text, or the stop/limit notice
    pub final_output: String,
    pub history: String,
    pub abort_reason: Option<AbortReason>,
}

/// Loop settings taken from the `[orchestration]` config section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub default_max_iterations: u32,
    pub pacing: Duration,
    pub abort_on_worker_failure: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from(&OrchestrationConfig::default())
    }
}

impl From<&OrchestrationConfig> for RunOptions {
    fn from(config: &OrchestrationConfig) -> Self {
        Self {
            default_max_iterations: config.effective_default_max_iterations(),
            pacing: config.pacing(),
            abort_on_worker_failure: config.abort_on_worker_failure,
        }
    }
}

/// A request that passed validation
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub orchestrator: Agent,
    /// Effective model of the orchestrator, fixed for the whole run
    pub model: String,
    pub goal: String,
    pub max_iterations: u32,
    pub rotation: KeyRotation,
    pub key_start: KeyStart,
    /// The requested budget was out of range and the default is used instead
    pub budget_replaced: bool,
}

/// Check every precondition of a run, in order, without side effects
pub fn validate(
    request: &RunRequest,
    studio: &Studio,
    options: &RunOptions,
) -> Result<RunPlan, ValidationError> {
    let (rotation, key_start) =
        KeyRotation::start(&studio.keys).ok_or(ValidationError::NoApiKeys)?;

    let orchestrator_id = request.orchestrator.trim();
    if orchestrator_id.is_empty() {
        return Err(ValidationError::NoOrchestrator);
    }

    let goal = request.goal.trim();
    if goal.is_empty() {
        return Err(ValidationError::EmptyGoal);
    }

    let orchestrator = studio
        .registry
        .find_by_id(&AgentId::from(orchestrator_id))
        .ok_or_else(|| ValidationError::OrchestratorNotFound(orchestrator_id.to_string()))?;

    let model = studio.settings.effective_model(orchestrator);
    if !studio.settings.is_usable(model) {
        return Err(ValidationError::ModelUnavailable(model.to_string()));
    }

    let (max_iterations, budget_replaced) = match request.max_iterations {
        None => (options.default_max_iterations, false),
        Some(max) if MAX_ITERATIONS_RANGE.contains(&max) => (max, false),
        Some(_) => (options.default_max_iterations, true),
    };

    Ok(RunPlan {
        orchestrator: orchestrator.clone(),
        model: model.to_string(),
        goal: goal.to_string(),
        max_iterations,
        rotation,
        key_start,
        budget_replaced,
    })
}

/// What an iteration decided
enum Step {
    Continue,
    Complete(String),
    Abort(AbortReason),
}

/// One executing run; dropped when the loop exits
pub(crate) struct Run {
    pub studio: SharedStudio,
    pub gateway: SharedGateway,
    pub storage: Option<Arc<Storage>>,
    pub notifier: Sender<Notification>,
    pub options: RunOptions,
    pub cancel: CancellationToken,
    pub plan: RunPlan,
}

impl Run {
    fn log(&self, source: &str, text: impl Into<String>) {
        let _ = self.notifier.send(Notification::log(source, text));
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifier.send(notification);
    }

    /// Drive the loop to termination
    pub async fn execute(mut self) -> RunReport {
        let max = self.plan.max_iterations;
        tracing::info!(
            orchestrator = %self.plan.orchestrator.id,
            model = %self.plan.model,
            max_iterations = max,
            "orchestration started"
        );
        self.notify(Notification::RunStarted {
            goal: self.plan.goal.clone(),
            orchestrator: self.plan.orchestrator.name.clone(),
            max_iterations: max,
        });
        self.log(ORCHESTRATOR, format!("Max Iterations set to: {}", max));
        self.log(
            ORCHESTRATOR,
            format!(
                "Using initial API Key: {} (Index: {})",
                mask_key(self.plan.rotation.current()),
                self.plan.rotation.index()
            ),
        );
        self.notify(Notification::rich_log(
            ORCHESTRATOR,
            format!("Starting Master AI Orchestration... Goal: \"{}\"", self.plan.goal),
        ));
        self.log(
            ORCHESTRATOR,
            format!(
                "Using Master AI: \"{}\" (Model: {})",
                self.plan.orchestrator.name, self.plan.model
            ),
        );

        let mut iteration = 0;
        let mut history = String::new();
        let mut completion: Option<String> = None;
        let mut abort: Option<AbortReason> = None;
        let mut max_reached = false;

        while iteration < max && !self.cancel.is_cancelled() {
            iteration += 1;

            if rotation_due(iteration) {
                self.rotate_key();
            }

            match self.iterate(iteration, &mut history).await {
                Step::Continue => {}
                Step::Complete(output) => {
                    completion = Some(output);
                    break;
                }
                Step::Abort(reason) => {
                    abort = Some(reason);
                    break;
                }
            }

            if iteration >= max && !self.cancel.is_cancelled() {
                self.log(
                    ORCHESTRATOR,
                    format!("Max iterations ({}) reached. Stopping orchestration.", max),
                );
                max_reached = true;
                break;
            }

            // Pacing only; a stop request ends the wait early
            tokio::select! {
                _ = tokio::time::sleep(self.options.pacing) => {}
                _ = self.cancel.cancelled() => {}
            }
        }

        let status = if completion.is_some() {
            RunStatus::Completed
        } else if abort.is_some() {
            RunStatus::Aborted
        } else if max_reached {
            RunStatus::MaxIterationsReached
        } else {
            abort = Some(AbortReason::Cancelled);
            RunStatus::Aborted
        };

        let final_output = match status {
            RunStatus::Completed => {
                self.log(ORCHESTRATOR, "Orchestration successfully completed by Master AI.");
                completion.unwrap_or_default()
            }
            RunStatus::Aborted => {
                match &abort {
                    Some(AbortReason::Cancelled) => {
                        self.log(ORCHESTRATOR, "Orchestration stopped by user request.")
                    }
                    _ => self.log(ORCHESTRATOR, "Orchestration stopped due to an error."),
                }
                self.notify(Notification::final_output(STOPPED_NOTICE, None));
                STOPPED_NOTICE.to_string()
            }
            RunStatus::MaxIterationsReached => {
                self.log(
                    ORCHESTRATOR,
                    "Orchestration finished (max iterations reached without explicit completion).",
                );
                self.notify(Notification::final_output(MAX_ITERATIONS_NOTICE, None));
                MAX_ITERATIONS_NOTICE.to_string()
            }
        };

        match &abort {
            Some(reason) => tracing::warn!(%status, iterations = iteration, %reason, "orchestration finished"),
            None => tracing::info!(%status, iterations = iteration, "orchestration finished"),
        }
        self.notify(Notification::RunFinished {
            status,
            iterations: iteration,
        });

        RunReport {
            status,
            iterations: iteration,
            max_iterations: max,
            final_output,
            history,
            abort_reason: abort,
        }
    }

    fn rotate_key(&mut self) {
        match self.plan.rotation.rotate() {
            RotateOutcome::Rotated { index } => {
                let masked = mask_key(self.plan.rotation.current());
                self.log(
                    ORCHESTRATOR,
                    format!("API Key Rotated. Now using: {} (Index: {})", masked, index),
                );
                self.notify(Notification::notice(
                    format!("API Key rotated to: {}", masked),
                    Severity::Info,
                ));
                self.notify(Notification::KeyRotated { index, masked });
            }
            RotateOutcome::SingleKey => self.log(
                ORCHESTRATOR,
                format!(
                    "API Key Rotation attempt: Only one key available. Sticking to {}",
                    mask_key(self.plan.rotation.current())
                ),
            ),
        }
    }

    /// One request to the orchestrator and the action it asks for
    async fn iterate(&self, iteration: u32, history: &mut String) -> Step {
        let max = self.plan.max_iterations;
        let credential = self.plan.rotation.current().to_string();
        self.log(
            ORCHESTRATOR,
            format!(
                "Iteration {}/{}: Asking Master AI for the next step... (Using API Key: {})",
                iteration,
                max,
                mask_key(&credential)
            ),
        );

        // Agents are re-read every iteration; edits from earlier steps are visible.
        let (orchestrator, context) = {
            let studio = self.studio.read();
            let orchestrator = studio
                .registry
                .find_by_id(&self.plan.orchestrator.id)
                .cloned()
                .unwrap_or_else(|| self.plan.orchestrator.clone());
            let context = build_context(
                &self.plan.goal,
                &orchestrator.id,
                studio.registry.agents(),
                &studio.settings,
                history,
            );
            (orchestrator, context)
        };
        tracing::debug!(iteration, context_len = context.len(), "asking orchestrator");

        let invocation = Invocation::new(credential, self.plan.model.clone(), context)
            .with_system(&orchestrator.system_prompt);
        let response = match self.gateway.invoke(invocation).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(iteration, error = %err, "orchestrator call failed");
                self.notify(Notification::rich_log(
                    ORCHESTRATOR_ERROR,
                    format!("Critical Error during Master AI step {}: {}", iteration, err),
                ));
                return Step::Abort(AbortReason::OrchestratorFailed {
                    iteration,
                    message: err.to_string(),
                });
            }
        };
        self.log(
            &orchestrator.name,
            format!("Suggestion (Iter {}): {}", iteration, response),
        );

        let parsed = parse_action(&response);
        for diagnostic in &parsed.diagnostics {
            tracing::warn!(iteration, %diagnostic, "malformed action payload");
            self.log(ORCHESTRATOR, format!("Warning: {}", diagnostic));
        }
        tracing::debug!(iteration, action = parsed.action.kind(), "action parsed");

        match parsed.action {
            Action::Complete(completion) => self.complete(completion),
            Action::Call { agent_name, input } => {
                self.call_agent(iteration, &agent_name, &input, history).await
            }
            Action::Create(request) => {
                self.create_agent(iteration, request, history);
                Step::Continue
            }
            Action::Edit { agent_id, update } => {
                self.edit_agent(iteration, &agent_id, update, history);
                Step::Continue
            }
            Action::Unrecognized => {
                self.log(
                    ORCHESTRATOR,
                    format!(
                        "Master AI did not provide a clear CALL, CREATE, EDIT, or TASK COMPLETE instruction. Master AI response needs to be more precise. Trying to continue, or stopping if max iterations reached. Response was: {}...",
                        excerpt(&response, UNCLEAR_LOG_CHARS)
                    ),
                );
                history.push_str(&format!(
                    "Step {}: Master AI response was unclear or did not match expected format: {}...\n",
                    iteration,
                    excerpt(&response, OUTPUT_EXCERPT_CHARS)
                ));
                Step::Continue
            }
        }
    }

    fn complete(&self, completion: Completion) -> Step {
        self.log(ORCHESTRATOR, "Master AI indicated task is complete.");
        self.log(
            ORCHESTRATOR,
            match completion.source {
                CompletionSource::FinalOutput => "Explicit 'Final Output:' content found.",
                CompletionSource::AfterMarker => {
                    "Using content after 'TASK COMPLETE.' as final output."
                }
                CompletionSource::Placeholder => "No clear 'Final Output:' or subsequent content.",
            },
        );
        self.notify(Notification::final_output(
            completion.output.clone(),
            completion.blocks,
        ));
        Step::Complete(completion.output)
    }

    async fn call_agent(
        &self,
        iteration: u32,
        agent_name: &str,
        input: &str,
        history: &mut String,
    ) -> Step {
        let target = {
            let studio = self.studio.read();
            studio
                .registry
                .find_by_name(agent_name)
                .map(|agent| studio.agent_with_model(agent))
                .map(|(agent, model)| {
                    let usable = studio.settings.is_usable(&model);
                    (agent, model, usable)
                })
        };

        let Some((worker, model, usable)) = target else {
            self.log(
                ORCHESTRATOR,
                format!(
                    "Error: Agent \"{}\" suggested by Master AI was not found. Suggestion: Master AI should CREATE it if needed or check spelling.",
                    agent_name
                ),
            );
            history.push_str(&format!(
                "Step {}: Attempted to call non-existent agent \"{}\".\n",
                iteration, agent_name
            ));
            return Step::Continue;
        };

        if !usable {
            self.log(
                ORCHESTRATOR,
                format!(
                    "Error: Worker agent \"{}\" model \"{}\" is not available. Skipping call.",
                    worker.name, model
                ),
            );
            history.push_str(&format!(
                "Step {}: Attempted to call {} but its model {} was invalid or unavailable.\n",
                iteration, worker.name, model
            ));
            return Step::Continue;
        }

        self.log(
            ORCHESTRATOR,
            format!(
                "Calling agent \"{}\" (Model: {}) with input (first 100 chars): {}...",
                worker.name,
                model,
                excerpt(input, OUTPUT_EXCERPT_CHARS)
            ),
        );

        let invocation = Invocation::new(self.plan.rotation.current(), model, input)
            .with_system(&worker.system_prompt);
        match self.gateway.invoke(invocation).await {
            Ok(output) => {
                self.log(&worker.name, format!("Output: {}", output));
                history.push_str(&format!(
                    "Step {}: Called agent \"{}\". Input: \"{}...\". Output: \"{}...\"\n",
                    iteration,
                    worker.name,
                    excerpt(input, INPUT_EXCERPT_CHARS),
                    excerpt(&output, OUTPUT_EXCERPT_CHARS)
                ));
                Step::Continue
            }
            Err(err) if self.options.abort_on_worker_failure => {
                tracing::error!(iteration, agent = %worker.name, error = %err, "worker call failed");
                self.notify(Notification::rich_log(
                    ORCHESTRATOR_ERROR,
                    format!("Critical Error during Master AI step {}: {}", iteration, err),
                ));
                Step::Abort(AbortReason::WorkerFailed {
                    iteration,
                    agent: worker.name,
                    message: err.to_string(),
                })
            }
            Err(err) => {
                tracing::warn!(iteration, agent = %worker.name, error = %err, "worker call failed, continuing");
                self.log(
                    ORCHESTRATOR,
                    format!(
                        "Error: Call to agent \"{}\" failed: {}. Continuing with the next step.",
                        worker.name, err
                    ),
                );
                history.push_str(&format!(
                    "Step {}: Called agent \"{}\" but the call failed: {}\n",
                    iteration, worker.name, err
                ));
                Step::Continue
            }
        }
    }

    fn create_agent(&self, iteration: u32, request: CreateRequest, history: &mut String) {
        self.log(
            ORCHESTRATOR,
            format!(
                "Master AI suggests CREATE AGENT: {}",
                serde_json::to_string(&request).unwrap_or_default()
            ),
        );

        let Some((name, system_prompt, model)) = request.complete() else {
            self.log(
                ORCHESTRATOR,
                "CREATE AGENT command from Master AI was missing required fields (name, system_prompt, model). Cannot create agent.",
            );
            history.push_str(&format!(
                "Step {}: Master AI's CREATE AGENT command was malformed or incomplete.\n",
                iteration
            ));
            return;
        };

        let created = {
            let mut studio = self.studio.write();
            let result = studio.create_agent(NewAgent {
                name: name.to_string(),
                system_prompt: system_prompt.to_string(),
                model: Some(model.to_string()),
            });
            if result.is_ok() {
                self.persist_agents(&studio);
            }
            result
        };

        match created {
            Ok(agent) => {
                self.notify(Notification::AgentsChanged);
                self.log(
                    ORCHESTRATOR,
                    format!(
                        "SUCCESS: Agent \"{}\" created and saved by Master AI's request! It is now available for subsequent calls.",
                        agent.name
                    ),
                );
                history.push_str(&format!(
                    "Step {}: Successfully created new agent \"{}\" as per Master AI. It is now available.\n",
                    iteration, agent.name
                ));
            }
            Err(RegistryError::DuplicateName(_)) => {
                self.log(
                    ORCHESTRATOR,
                    format!(
                        "Agent with name \"{}\" already exists. Not creating. Master AI should check existing agents first.",
                        name
                    ),
                );
                history.push_str(&format!(
                    "Step {}: Master AI suggested creating agent \"{}\", but it already exists.\n",
                    iteration, name
                ));
            }
            Err(err) => {
                self.log(ORCHESTRATOR, format!("Cannot create agent: {}", err));
                history.push_str(&format!(
                    "Step {}: Master AI's CREATE AGENT command was malformed or incomplete.\n",
                    iteration
                ));
            }
        }
    }

    fn edit_agent(&self, iteration: u32, agent_id: &str, update: AgentUpdate, history: &mut String) {
        self.log(
            ORCHESTRATOR,
            format!(
                "Master AI suggests EDIT AGENT (ID: \"{}\") with NEW_CONFIG: {}",
                agent_id,
                serde_json::to_string(&update).unwrap_or_default()
            ),
        );

        let id = AgentId::from(agent_id);
        let edited = {
            let mut studio = self.studio.write();
            studio.edit_agent(&id, update).map(|outcome| {
                if outcome.changed() {
                    self.persist_agents(&studio);
                }
                let agent = studio.registry.find_by_id(&id).cloned();
                (outcome, agent)
            })
        };

        let (outcome, agent) = match edited {
            Ok((outcome, Some(agent))) => (outcome, agent),
            _ => {
                self.log(
                    ORCHESTRATOR,
                    format!(
                        "Error: Agent with ID \"{}\" for EDIT AGENT command not found.",
                        agent_id
                    ),
                );
                history.push_str(&format!(
                    "Step {}: Master AI attempted to edit non-existent agent with ID \"{}\".\n",
                    iteration, agent_id
                ));
                return;
            }
        };

        match &outcome.model_change {
            ModelChange::AutoSelected => self.log(
                ORCHESTRATOR,
                format!(
                    "AUTO_SELECT_BEST_MODEL triggered for agent {}. New prompt detected. Switched to default model: {}",
                    agent_id, agent.model
                ),
            ),
            ModelChange::AutoSelectKept => self.log(
                ORCHESTRATOR,
                format!(
                    "AUTO_SELECT_BEST_MODEL triggered for agent {}, but prompt unchanged. Keeping model: {}",
                    agent_id, agent.model
                ),
            ),
            _ => {}
        }
        for warning in &outcome.warnings {
            self.log(ORCHESTRATOR, format!("Warning: {}", warning));
        }

        if outcome.changed() {
            self.notify(Notification::AgentsChanged);
            self.log(
                ORCHESTRATOR,
                format!(
                    "SUCCESS: Agent \"{}\" (ID: {}) updated by Master AI's request! Changed: {}. New Model: {}",
                    agent.name,
                    agent_id,
                    outcome.changed_fields().join(", "),
                    agent.model
                ),
            );
            history.push_str(&format!(
                "Step {}: Successfully edited agent \"{}\" (ID: {}). New model: {}.\n",
                iteration, agent.name, agent_id, agent.model
            ));
        } else {
            self.log(
                ORCHESTRATOR,
                format!(
                    "Agent (ID: {}) found, but no valid changes provided in NEW_CONFIG or new values matched existing. No update performed. Current model: {}",
                    agent_id, agent.model
                ),
            );
            history.push_str(&format!(
                "Step {}: Attempted to edit agent (ID: {}) but no changes were applied.\n",
                iteration, agent_id
            ));
        }
    }

    /// Save agents while the caller holds the studio lock
    fn persist_agents(&self, studio: &Studio) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(err) = storage.save_agents(studio.registry.agents()) {
            tracing::warn!(error = %err, "failed to save agents");
            self.log(ORCHESTRATOR, format!("Warning: failed to save agents: {}", err));
        }
    }
}
