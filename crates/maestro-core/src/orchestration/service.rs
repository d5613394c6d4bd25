//! Orchestration Service
//!
//! Main facade for front ends: owns the shared [`Studio`], the model gateway,
//! persistence and the run slot that guarantees at most one active run.

use super::run::{validate, Run, RunOptions, RunReport, RunRequest};
use crate::config::MaestroConfig;
use crate::error::{MaestroError, Result, ValidationError};
use crate::keys::{mask_key, ApiKeyPool, KeyStart};
use crate::llm::{GeminiGateway, SharedGateway};
use crate::notifications::{Notification, Severity};
use crate::registry::{
    Agent, AgentId, AgentUpdate, DeleteOutcome, EditOutcome, NewAgent, Workflow, WorkflowId,
};
use crate::settings::GlobalSettings;
use crate::storage::Storage;
use crate::studio::{SharedStudio, Studio};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const SYSTEM_ERROR: &str = "System Error";

/// Where the single run slot is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Validating,
    Running,
}

#[derive(Debug)]
struct SlotState {
    phase: RunPhase,
    cancel: Option<CancellationToken>,
}

/// Holds the run slot; returns it to `Idle` when dropped
struct RunSlot {
    state: Arc<Mutex<SlotState>>,
}

impl RunSlot {
    fn claim(state: &Arc<Mutex<SlotState>>) -> std::result::Result<Self, ValidationError> {
        let mut slot = state.lock();
        if slot.phase != RunPhase::Idle {
            return Err(ValidationError::AlreadyRunning);
        }
        slot.phase = RunPhase::Validating;
        Ok(Self {
            state: state.clone(),
        })
    }

    fn start(&self, cancel: CancellationToken) {
        let mut slot = self.state.lock();
        slot.phase = RunPhase::Running;
        slot.cancel = Some(cancel);
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        let mut slot = self.state.lock();
        slot.phase = RunPhase::Idle;
        slot.cancel = None;
    }
}

/// A validated run that already owns the slot.
///
/// The slot is `Running` from the moment the handle exists, so
/// [`OrchestrationService::request_stop`] reaches it even before
/// [`RunHandle::execute`] is first polled. Dropping the handle without
/// executing releases the slot.
pub struct RunHandle {
    slot: RunSlot,
    run: Run,
}

impl RunHandle {
    pub fn max_iterations(&self) -> u32 {
        self.run.plan.max_iterations
    }

    /// Drive the run to termination and release the slot
    pub async fn execute(self) -> RunReport {
        let Self { slot, run } = self;
        let report = run.execute().await;
        drop(slot);
        report
    }
}

/// Orchestration service for agents, settings, keys and runs
pub struct OrchestrationService {
    /// Agents, settings and keys
    studio: SharedStudio,

    /// Model gateway shared by orchestrator and workers
    gateway: SharedGateway,

    /// Persistence; `None` keeps everything in memory
    storage: Option<Arc<Storage>>,

    /// Loop settings
    options: RunOptions,

    /// Run slot
    slot: Arc<Mutex<SlotState>>,

    /// Notification sender (to front ends)
    notification_tx: Sender<Notification>,

    /// Notification receiver (for front ends to poll)
    notification_rx: Receiver<Notification>,
}

impl OrchestrationService {
    /// Create an in-memory service
    pub fn new(studio: Studio, gateway: SharedGateway) -> Self {
        let (notification_tx, notification_rx) = unbounded();
        Self {
            studio: studio.into_shared(),
            gateway,
            storage: None,
            options: RunOptions::default(),
            slot: Arc::new(Mutex::new(SlotState {
                phase: RunPhase::Idle,
                cancel: None,
            })),
            notification_tx,
            notification_rx,
        }
    }

    /// Create a service backed by the Gemini gateway and on-disk storage
    pub fn from_config(config: &MaestroConfig) -> Result<Self> {
        let storage = match &config.storage.data_dir {
            Some(dir) => Storage::with_data_dir(dir),
            None => Storage::new()?,
        };
        let mut studio = storage.load_studio()?;

        let mut seeded = 0;
        for key in &config.keys.api_keys {
            match studio.keys.add(key) {
                Ok(()) => seeded += 1,
                Err(crate::keys::KeyError::Duplicate) => {}
                Err(err) => tracing::warn!(key = %mask_key(key), error = %err, "configured key ignored"),
            }
        }
        if seeded > 0 {
            storage.save_keys(&studio.keys)?;
            tracing::info!(seeded, "API keys added from configuration");
        }

        let gateway: SharedGateway = Arc::new(GeminiGateway::from_config(&config.gateway));
        Ok(Self::new(studio, gateway)
            .with_storage(Arc::new(storage))
            .with_options(RunOptions::from(&config.orchestration)))
    }

    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Poll for a notification (non-blocking)
    pub fn poll_notification(&self) -> Option<Notification> {
        self.notification_rx.try_recv().ok()
    }

    /// Get the notification receiver for select! or blocking receive
    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.notification_rx
    }

    pub fn studio(&self) -> &SharedStudio {
        &self.studio
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notification_tx.send(notification);
    }

    // ========== Runs ==========

    /// Validate a request and run it to termination.
    ///
    /// Fails with [`ValidationError::AlreadyRunning`] while another run holds
    /// the slot; any other validation error is also reported as a notice.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunReport> {
        Ok(self.prepare_run(request)?.execute().await)
    }

    /// Claim the slot and validate without awaiting.
    ///
    /// On success the slot is already `Running`; the returned handle can be
    /// executed in place or spawned onto a task.
    pub fn prepare_run(&self, request: RunRequest) -> Result<RunHandle> {
        let slot = match RunSlot::claim(&self.slot) {
            Ok(slot) => slot,
            Err(err) => {
                self.notify(Notification::notice(err.to_string(), Severity::Warning));
                return Err(err.into());
            }
        };

        let validated = {
            let studio = self.studio.read();
            validate(&request, &studio, &self.options)
        };
        let plan = match validated {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(error = %err, "run rejected");
                let severity = match err {
                    ValidationError::NoOrchestrator | ValidationError::EmptyGoal => {
                        Severity::Warning
                    }
                    _ => Severity::Error,
                };
                self.notify(Notification::notice(err.to_string(), severity));
                self.notify(Notification::rich_log(
                    SYSTEM_ERROR,
                    format!("<strong>Error:</strong> {}.", err),
                ));
                return Err(err.into());
            }
        };

        if plan.key_start == KeyStart::Defaulted {
            self.adopt_default_key(plan.rotation.current());
        }
        if plan.budget_replaced {
            self.notify(Notification::notice(
                format!(
                    "Invalid Max Iterations value (must be 1-50). Using default ({}).",
                    plan.max_iterations
                ),
                Severity::Warning,
            ));
        }

        let cancel = CancellationToken::new();
        slot.start(cancel.clone());

        let run = Run {
            studio: self.studio.clone(),
            gateway: self.gateway.clone(),
            storage: self.storage.clone(),
            notifier: self.notification_tx.clone(),
            options: self.options.clone(),
            cancel,
            plan,
        };
        Ok(RunHandle { slot, run })
    }

    /// Persist the key a run fell back to as the selected one
    fn adopt_default_key(&self, key: &str) {
        let had_selection = {
            let mut studio = self.studio.write();
            let had_selection = studio.keys.last_selected().is_some();
            if studio.keys.select(key).is_ok() {
                self.persist(|storage| storage.save_keys(&studio.keys));
            }
            had_selection
        };
        let text = if had_selection {
            format!(
                "Initial API Key was invalid or not found, defaulting to first managed key: {}",
                mask_key(key)
            )
        } else {
            format!(
                "No API Key selected, defaulting to first managed key: {}",
                mask_key(key)
            )
        };
        self.notify(Notification::log("Orchestrator", text));
    }

    /// Ask the active run to stop after its current step
    pub fn request_stop(&self) -> bool {
        let slot = self.slot.lock();
        match (&slot.phase, &slot.cancel) {
            (RunPhase::Running, Some(cancel)) => {
                cancel.cancel();
                tracing::info!("stop requested");
                self.notify(Notification::rich_log(
                    "Orchestrator",
                    "<strong>Stop signal received. Attempting to halt orchestration gracefully after current step...</strong>",
                ));
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase() != RunPhase::Idle
    }

    pub fn phase(&self) -> RunPhase {
        self.slot.lock().phase
    }

    // ========== Agents ==========

    pub fn agents(&self) -> Vec<Agent> {
        self.studio.read().registry.agents().to_vec()
    }

    pub fn find_agent(&self, id: &AgentId) -> Option<Agent> {
        self.studio.read().registry.find_by_id(id).cloned()
    }

    pub fn find_agent_by_name(&self, name: &str) -> Option<Agent> {
        self.studio.read().registry.find_by_name(name).cloned()
    }

    pub fn create_agent(&self, request: NewAgent) -> Result<Agent> {
        let agent = {
            let mut studio = self.studio.write();
            let agent = studio.create_agent(request)?;
            self.persist(|storage| storage.save_agents(studio.registry.agents()));
            agent
        };
        self.notify(Notification::AgentsChanged);
        Ok(agent)
    }

    pub fn edit_agent(&self, id: &AgentId, update: AgentUpdate) -> Result<EditOutcome> {
        let outcome = {
            let mut studio = self.studio.write();
            let outcome = studio.edit_agent(id, update)?;
            if outcome.changed() {
                self.persist(|storage| storage.save_agents(studio.registry.agents()));
            }
            outcome
        };
        if outcome.changed() {
            self.notify(Notification::AgentsChanged);
        }
        Ok(outcome)
    }

    /// Save an agent from a user form; returns `true` when it was new
    pub fn upsert_agent(&self, agent: Agent) -> Result<bool> {
        let created = {
            let mut studio = self.studio.write();
            let created = studio.registry.upsert(agent)?;
            self.persist(|storage| storage.save_agents(studio.registry.agents()));
            created
        };
        self.notify(Notification::AgentsChanged);
        Ok(created)
    }

    pub fn delete_agent(&self, id: &AgentId) -> Result<DeleteOutcome> {
        let outcome = {
            let mut studio = self.studio.write();
            let outcome = studio
                .registry
                .delete(id)
                .ok_or_else(|| MaestroError::not_found(format!("agent {}", id)))?;
            self.persist(|storage| storage.save_registry(&studio.registry));
            outcome
        };
        self.notify(Notification::AgentsChanged);
        Ok(outcome)
    }

    // ========== Workflows ==========

    pub fn workflows(&self) -> Vec<Workflow> {
        self.studio.read().registry.workflows().to_vec()
    }

    /// Store a workflow; returns `true` when it was new
    pub fn save_workflow(&self, workflow: Workflow) -> Result<bool> {
        let mut studio = self.studio.write();
        let created = studio.registry.save_workflow(workflow)?;
        self.persist(|storage| storage.save_workflows(studio.registry.workflows()));
        Ok(created)
    }

    pub fn delete_workflow(&self, id: &WorkflowId) -> Result<Workflow> {
        let mut studio = self.studio.write();
        let workflow = studio
            .registry
            .delete_workflow(id)
            .ok_or_else(|| MaestroError::not_found(format!("workflow {}", id)))?;
        self.persist(|storage| storage.save_workflows(studio.registry.workflows()));
        Ok(workflow)
    }

    // ========== Settings ==========

    pub fn settings(&self) -> GlobalSettings {
        self.studio.read().settings.clone()
    }

    pub fn add_model(&self, model: &str) -> Result<()> {
        self.update_settings(|settings| settings.add_model(model).map_err(Into::into))
    }

    pub fn remove_model(&self, model: &str) -> Result<()> {
        self.update_settings(|settings| {
            if settings.remove_model(model) {
                Ok(())
            } else {
                Err(MaestroError::not_found(format!("model {}", model)))
            }
        })
    }

    pub fn set_default_model(&self, model: &str) -> Result<()> {
        self.update_settings(|settings| {
            if !settings.is_usable(model.trim()) {
                return Err(MaestroError::not_found(format!("model {}", model)));
            }
            settings.set_default_model(model);
            Ok(())
        })
    }

    /// Re-add missing built-in models; returns how many were added
    pub fn discover_models(&self) -> Result<usize> {
        let mut added = 0;
        self.update_settings(|settings| {
            added = settings.discover_models();
            Ok(())
        })?;
        Ok(added)
    }

    fn update_settings(
        &self,
        change: impl FnOnce(&mut GlobalSettings) -> Result<()>,
    ) -> Result<()> {
        let mut studio = self.studio.write();
        change(&mut studio.settings)?;
        self.persist(|storage| storage.save_settings(&studio.settings));
        Ok(())
    }

    // ========== Keys ==========

    pub fn keys(&self) -> ApiKeyPool {
        self.studio.read().keys.clone()
    }

    pub fn add_key(&self, key: &str) -> Result<()> {
        self.update_keys(|keys| keys.add(key))
    }

    pub fn remove_key(&self, key: &str) -> Result<()> {
        self.update_keys(|keys| keys.remove(key))
    }

    pub fn select_key(&self, key: &str) -> Result<()> {
        self.update_keys(|keys| keys.select(key))
    }

    fn update_keys(
        &self,
        change: impl FnOnce(&mut ApiKeyPool) -> std::result::Result<(), crate::keys::KeyError>,
    ) -> Result<()> {
        let mut studio = self.studio.write();
        change(&mut studio.keys)?;
        self.persist(|storage| storage.save_keys(&studio.keys));
        Ok(())
    }

    /// Write through to storage; failures are logged and surfaced as notices
    fn persist(&self, save: impl FnOnce(&Storage) -> Result<()>) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(err) = save(storage) {
            tracing::warn!(error = %err, "failed to persist");
            self.notify(Notification::notice(
                format!("Failed to save: {}", err),
                Severity::Error,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GatewayError, Invocation, ModelGateway};
    use crate::orchestration::{AbortReason, RunStatus, MAX_ITERATIONS_NOTICE, STOPPED_NOTICE};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Replays canned replies; once exhausted it keeps answering with filler
    struct ScriptedGateway {
        replies: Mutex<VecDeque<std::result::Result<String, GatewayError>>>,
        calls: Mutex<Vec<Invocation>>,
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl ScriptedGateway {
        fn new(replies: Vec<std::result::Result<String, GatewayError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
                gate: None,
            })
        }

        fn gated(replies: Vec<&str>, gate: Arc<tokio::sync::Notify>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
                calls: Mutex::new(Vec::new()),
                gate: Some(gate),
            })
        }

        fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn invoke(&self, invocation: Invocation) -> std::result::Result<String, GatewayError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.calls.lock().push(invocation);
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("I am thinking...".to_string()))
        }
    }

    fn ok(text: &str) -> std::result::Result<String, GatewayError> {
        Ok(text.to_string())
    }

    fn fast_options() -> RunOptions {
        RunOptions {
            pacing: Duration::ZERO,
            ..RunOptions::default()
        }
    }

    /// A studio with one key, an orchestrator and a "Writer" worker
    fn setup(
        gateway: Arc<ScriptedGateway>,
        keys: &[&str],
    ) -> (OrchestrationService, AgentId, AgentId) {
        let mut studio = Studio::default();
        studio.keys = ApiKeyPool::from_keys(keys.iter().copied());
        let master = studio
            .create_agent(NewAgent {
                name: "Master".to_string(),
                system_prompt: "You orchestrate.".to_string(),
                model: None,
            })
            .unwrap();
        let writer = studio
            .create_agent(NewAgent {
                name: "Writer".to_string(),
                system_prompt: "You write.".to_string(),
                model: Some("models/gemini-1.5-pro-latest".to_string()),
            })
            .unwrap();
        let service = OrchestrationService::new(studio, gateway).with_options(fast_options());
        (service, master.id, writer.id)
    }

    const KEY_A: &str = "key-aaaaaaaaaa";
    const KEY_B: &str = "key-bbbbbbbbbb";
    const KEY_C: &str = "key-cccccccccc";

    fn drain(service: &OrchestrationService) -> Vec<Notification> {
        service.notifications().try_iter().collect()
    }

    #[tokio::test]
    async fn test_haiku_completes_in_one_iteration() {
        let gateway = ScriptedGateway::new(vec![ok(
            "TASK COMPLETE. Final Output: Leaves fall softly down",
        )]);
        let (service, master, _) = setup(gateway.clone(), &[KEY_A]);

        let report = service
            .start_run(RunRequest::new(master.as_str(), "Write a haiku"))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.final_output, "Leaves fall softly down");
        assert_eq!(report.iterations, 1);
        assert_eq!(report.abort_reason, None);
        assert_eq!(service.phase(), RunPhase::Idle);

        let calls = gateway.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].credential, KEY_A);
        assert_eq!(calls[0].model, "models/gemini-1.5-flash-latest");
        assert_eq!(calls[0].system_text.as_deref(), Some("You orchestrate."));
        assert!(calls[0].user_text.contains("User's High-Level Goal: \"Write a haiku\""));

        let notifications = drain(&service);
        assert!(notifications.contains(&Notification::final_output(
            "Leaves fall softly down",
            None
        )));
        assert!(notifications.contains(&Notification::RunFinished {
            status: RunStatus::Completed,
            iterations: 1
        }));
    }

    #[tokio::test]
    async fn test_max_iterations_without_completion() {
        let gateway = ScriptedGateway::new(Vec::new());
        let (service, master, _) = setup(gateway.clone(), &[KEY_A]);
        let before = service.agents();

        let report = service
            .start_run(RunRequest::new(master.as_str(), "Loop").with_max_iterations(3))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::MaxIterationsReached);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.final_output, MAX_ITERATIONS_NOTICE);
        assert_eq!(gateway.calls().len(), 3);
        assert_eq!(service.agents(), before);
        assert_eq!(
            report.history.lines().collect::<Vec<_>>(),
            vec![
                "Step 1: Master AI response was unclear or did not match expected format: I am thinking......",
                "Step 2: Master AI response was unclear or did not match expected format: I am thinking......",
                "Step 3: Master AI response was unclear or did not match expected format: I am thinking......",
            ]
        );
    }

    #[tokio::test]
    async fn test_history_feeds_next_context() {
        let gateway = ScriptedGateway::new(vec![
            ok(r#"CALL "Ghost" WITH INPUT {"prompt_text": "boo"}"#),
            ok("TASK COMPLETE. Final Output: ok"),
        ]);
        let (service, master, _) = setup(gateway.clone(), &[KEY_A]);

        let report = service
            .start_run(RunRequest::new(master.as_str(), "g"))
            .await
            .unwrap();
        assert_eq!(report.iterations, 2);

        let calls = gateway.calls();
        assert!(calls[0].user_text.contains("(No actions taken yet in this session)"));
        assert!(calls[1]
            .user_text
            .contains("Step 1: Attempted to call non-existent agent \"Ghost\".\n"));
    }

    #[tokio::test]
    async fn test_create_then_call_in_same_run() {
        let gateway = ScriptedGateway::new(vec![
            ok(r#"CREATE NEW AGENT {"name": "Poet", "system_prompt": "Write poems.", "model": "models/gemini-1.5-pro-latest"}"#),
            ok(r#"CALL "poet" WITH INPUT {"prompt_text": "A haiku about leaves"}"#),
            ok("Leaves fall softly down"),
            ok("TASK COMPLETE. Final Output: Leaves fall softly down"),
        ]);
        let (service, master, _) = setup(gateway.clone(), &[KEY_A]);

        let report = service
            .start_run(RunRequest::new(master.as_str(), "Write a haiku"))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.iterations, 3);
        let poet = service.find_agent_by_name("Poet").unwrap();
        assert_eq!(poet.model, "models/gemini-1.5-pro-latest");

        let calls = gateway.calls();
        assert_eq!(calls[2].user_text, "A haiku about leaves");
        assert_eq!(calls[2].system_text.as_deref(), Some("Write poems."));
        assert_eq!(calls[2].model, "models/gemini-1.5-pro-latest");

        assert!(report.history.contains(
            "Step 1: Successfully created new agent \"Poet\" as per Master AI. It is now available.\n"
        ));
        assert!(report.history.contains(
            "Step 2: Called agent \"Poet\". Input: \"A haiku about leaves...\". Output: \"Leaves fall softly down...\"\n"
        ));
        assert!(drain(&service).contains(&Notification::AgentsChanged));
    }

    #[tokio::test]
    async fn test_duplicate_and_incomplete_create_are_notes() {
        let gateway = ScriptedGateway::new(vec![
            ok(r#"CREATE NEW AGENT {"name": "writer", "system_prompt": "x", "model": "y"}"#),
            ok(r#"CREATE NEW AGENT {"name": "Poet"}"#),
        ]);
        let (service, master, _) = setup(gateway, &[KEY_A]);

        let report = service
            .start_run(RunRequest::new(master.as_str(), "g").with_max_iterations(2))
            .await
            .unwrap();

        assert_eq!(service.agents().len(), 2);
        assert!(report.history.contains(
            "Step 1: Master AI suggested creating agent \"writer\", but it already exists.\n"
        ));
        assert!(report
            .history
            .contains("Step 2: Master AI's CREATE AGENT command was malformed or incomplete.\n"));
    }

    #[tokio::test]
    async fn test_edit_with_auto_select() {
        let (service, master, writer) = setup(ScriptedGateway::new(Vec::new()), &[KEY_A]);
        let edit = format!(
            r#"EDIT AGENT "{}" WITH NEW_CONFIG {{"system_prompt": "You write limericks.", "model": "AUTO_SELECT_BEST_MODEL_FOR_PROMPT"}}"#,
            writer
        );
        let noop = format!(
            r#"EDIT AGENT "{}" WITH NEW_CONFIG {{"model": "AUTO_SELECT_BEST_MODEL_FOR_PROMPT"}}"#,
            writer
        );
        let gateway = ScriptedGateway::new(vec![
            ok(&noop),
            ok(&edit),
            ok(r#"EDIT AGENT "agent_missing" WITH NEW_CONFIG {"name": "X"}"#),
            ok("TASK COMPLETE. Final Output: done"),
        ]);
        let service = OrchestrationService::new(service.studio().read().clone(), gateway)
            .with_options(fast_options());

        let report = service
            .start_run(RunRequest::new(master.as_str(), "g"))
            .await
            .unwrap();

        let edited = service.find_agent(&writer).unwrap();
        assert_eq!(edited.system_prompt, "You write limericks.");
        assert_eq!(edited.model, "models/gemini-1.5-flash-latest");
        assert!(report.history.contains(&format!(
            "Step 1: Attempted to edit agent (ID: {}) but no changes were applied.\n",
            writer
        )));
        assert!(report.history.contains(&format!(
            "Step 2: Successfully edited agent \"Writer\" (ID: {}). New model: models/gemini-1.5-flash-latest.\n",
            writer
        )));
        assert!(report.history.contains(
            "Step 3: Master AI attempted to edit non-existent agent with ID \"agent_missing\".\n"
        ));
    }

    #[tokio::test]
    async fn test_worker_with_unusable_model_is_skipped() {
        let gateway = ScriptedGateway::new(vec![
            ok(r#"CALL "Writer" WITH INPUT {"prompt_text": "hi"}"#),
            ok("TASK COMPLETE. Final Output: ok"),
        ]);
        let (service, master, writer) = setup(gateway.clone(), &[KEY_A]);
        service
            .upsert_agent(Agent {
                id: writer,
                name: "Writer".to_string(),
                system_prompt: "You write.".to_string(),
                model: "models/retired".to_string(),
            })
            .unwrap();

        let report = service
            .start_run(RunRequest::new(master.as_str(), "g"))
            .await
            .unwrap();

        assert_eq!(gateway.calls().len(), 2);
        assert!(report.history.contains(
            "Step 1: Attempted to call Writer but its model models/retired was invalid or unavailable.\n"
        ));
    }

    #[tokio::test]
    async fn test_worker_failure_aborts_run() {
        let gateway = ScriptedGateway::new(vec![
            ok(r#"CALL "Writer" WITH INPUT {"prompt_text": "hi"}"#),
            Err(GatewayError::NoCandidates),
        ]);
        let (service, master, _) = setup(gateway.clone(), &[KEY_A]);

        let report = service
            .start_run(RunRequest::new(master.as_str(), "g"))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.final_output, STOPPED_NOTICE);
        assert!(matches!(
            report.abort_reason,
            Some(AbortReason::WorkerFailed { iteration: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_failure_can_degrade_to_note() {
        let gateway = ScriptedGateway::new(vec![
            ok(r#"CALL "Writer" WITH INPUT {"prompt_text": "hi"}"#),
            Err(GatewayError::NoCandidates),
            ok("TASK COMPLETE. Final Output: recovered"),
        ]);
        let (service, master, _) = setup(gateway, &[KEY_A]);
        let service = service.with_options(RunOptions {
            abort_on_worker_failure: false,
            ..fast_options()
        });

        let report = service
            .start_run(RunRequest::new(master.as_str(), "g"))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.final_output, "recovered");
        assert!(report
            .history
            .contains("Step 1: Called agent \"Writer\" but the call failed:"));
    }

    #[tokio::test]
    async fn test_orchestrator_failure_aborts_run() {
        let gateway = ScriptedGateway::new(vec![Err(GatewayError::Api {
            status: 400,
            message: "Bad Request".to_string(),
        })]);
        let (service, master, _) = setup(gateway, &[KEY_A]);

        let report = service
            .start_run(RunRequest::new(master.as_str(), "g"))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.iterations, 1);
        assert_eq!(
            report.abort_reason,
            Some(AbortReason::OrchestratorFailed {
                iteration: 1,
                message: "API Error (400): Bad Request".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_key_rotation_during_run() {
        let gateway = ScriptedGateway::new(Vec::new());
        let (service, master, _) = setup(gateway.clone(), &[KEY_A, KEY_B, KEY_C]);

        service
            .start_run(RunRequest::new(master.as_str(), "g").with_max_iterations(8))
            .await
            .unwrap();

        let credentials: Vec<String> = gateway.calls().into_iter().map(|c| c.credential).collect();
        assert_eq!(credentials.len(), 8);
        assert!(credentials[..7].iter().all(|c| c == KEY_A));
        assert_eq!(credentials[7], KEY_B);

        let rotations: Vec<Notification> = drain(&service)
            .into_iter()
            .filter(|n| matches!(n, Notification::KeyRotated { .. }))
            .collect();
        assert_eq!(
            rotations,
            vec![Notification::KeyRotated {
                index: 1,
                masked: "key-...".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_defaulted_key_becomes_selected() {
        let (service, master, _) = setup(
            ScriptedGateway::new(vec![ok("TASK COMPLETE. Final Output: ok")]),
            &[KEY_A, KEY_B],
        );
        assert_eq!(service.keys().last_selected(), None);

        service
            .start_run(RunRequest::new(master.as_str(), "g"))
            .await
            .unwrap();
        assert_eq!(service.keys().last_selected(), Some(KEY_A));
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_slot_idle() {
        let gateway = ScriptedGateway::new(Vec::new());
        let (service, master, _) = setup(gateway.clone(), &[KEY_A]);

        let err = service
            .start_run(RunRequest::new(master.as_str(), "   "))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MaestroError::Validation(ValidationError::EmptyGoal)
        ));
        assert_eq!(service.phase(), RunPhase::Idle);
        assert!(gateway.calls().is_empty());
        assert!(drain(&service).contains(&Notification::notice(
            "High-Level Goal for Master AI is missing",
            Severity::Warning
        )));
    }

    #[tokio::test]
    async fn test_out_of_range_budget_warns() {
        let (service, master, _) = setup(
            ScriptedGateway::new(vec![ok("TASK COMPLETE. Final Output: ok")]),
            &[KEY_A],
        );
        let report = service
            .start_run(RunRequest::new(master.as_str(), "g").with_max_iterations(99))
            .await
            .unwrap();
        assert_eq!(report.max_iterations, 30);
        assert!(drain(&service).contains(&Notification::notice(
            "Invalid Max Iterations value (must be 1-50). Using default (30).",
            Severity::Warning
        )));
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_running() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let gateway = ScriptedGateway::gated(vec!["TASK COMPLETE. Final Output: ok"], gate.clone());
        let (service, master, _) = setup(gateway, &[KEY_A]);
        let service = Arc::new(service);

        let first = tokio::spawn({
            let service = service.clone();
            let request = RunRequest::new(master.as_str(), "g");
            async move { service.start_run(request).await }
        });
        while service.phase() != RunPhase::Running {
            tokio::task::yield_now().await;
        }

        let err = service
            .start_run(RunRequest::new(master.as_str(), "g"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MaestroError::Validation(ValidationError::AlreadyRunning)
        ));

        gate.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_stop_request_aborts_at_boundary() {
        let (service, master, _) = setup(ScriptedGateway::new(Vec::new()), &[KEY_A]);
        let service = Arc::new(service.with_options(RunOptions {
            pacing: Duration::from_millis(20),
            ..RunOptions::default()
        }));
        assert!(!service.request_stop());

        let run = tokio::spawn({
            let service = service.clone();
            let request = RunRequest::new(master.as_str(), "g").with_max_iterations(50);
            async move { service.start_run(request).await }
        });
        while service.phase() != RunPhase::Running {
            tokio::task::yield_now().await;
        }
        assert!(service.request_stop());

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::Cancelled));
        assert_eq!(report.final_output, STOPPED_NOTICE);
        assert!(report.iterations < 50);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_key_out_of_report_and_log() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let gateway = crate::llm::GeminiGateway::from_config(&crate::config::GatewayConfig {
            base_url: format!("http://127.0.0.1:{}", port),
            max_retries: 0,
            ..crate::config::GatewayConfig::default()
        });

        let secret = "SECRETKEY-1234567890";
        let mut studio = Studio::default();
        studio.keys = ApiKeyPool::from_keys([secret]);
        let master = studio
            .create_agent(NewAgent {
                name: "Master".to_string(),
                system_prompt: "You orchestrate.".to_string(),
                model: None,
            })
            .unwrap();
        let service =
            OrchestrationService::new(studio, Arc::new(gateway)).with_options(fast_options());

        let report = service
            .start_run(RunRequest::new(master.id.as_str(), "g"))
            .await
            .unwrap();

        assert!(matches!(
            report.abort_reason,
            Some(AbortReason::OrchestratorFailed { .. })
        ));
        let rendered = serde_json::to_string(&report).unwrap();
        assert!(!rendered.contains(secret), "report leaked key: {}", rendered);
        for notification in drain(&service) {
            let rendered = format!("{:?}", notification);
            assert!(!rendered.contains(secret), "notification leaked key: {}", rendered);
        }
    }

    #[tokio::test]
    async fn test_prepared_run_holds_slot_before_execute() {
        let (service, master, _) = setup(ScriptedGateway::new(Vec::new()), &[KEY_A]);

        let handle = service
            .prepare_run(RunRequest::new(master.as_str(), "g").with_max_iterations(5))
            .unwrap();
        assert_eq!(handle.max_iterations(), 5);
        assert_eq!(service.phase(), RunPhase::Running);
        assert!(matches!(
            service.prepare_run(RunRequest::new(master.as_str(), "g")),
            Err(MaestroError::Validation(ValidationError::AlreadyRunning))
        ));

        // A stop sent before the first poll is not lost
        assert!(service.request_stop());
        let report = handle.execute().await;
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::Cancelled));
        assert_eq!(report.iterations, 0);
        assert!(!service.is_running());
    }

    #[test]
    fn test_dropped_handle_releases_slot() {
        let (service, master, _) = setup(ScriptedGateway::new(Vec::new()), &[KEY_A]);
        let handle = service
            .prepare_run(RunRequest::new(master.as_str(), "g"))
            .unwrap();
        assert!(service.is_running());
        drop(handle);
        assert_eq!(service.phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_created_agent_is_persisted() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let gateway = ScriptedGateway::new(vec![
            ok(r#"CREATE NEW AGENT {"name": "Poet", "system_prompt": "Write poems.", "model": "unknown"}"#),
            ok("TASK COMPLETE. Final Output: ok"),
        ]);
        let (service, master, _) = setup(gateway, &[KEY_A]);
        let storage = Arc::new(Storage::with_data_dir(temp_dir.path().to_path_buf()));
        let service = service.with_storage(storage.clone());

        service
            .start_run(RunRequest::new(master.as_str(), "g"))
            .await
            .unwrap();

        let saved = storage.load_agents().unwrap();
        let poet = saved.iter().find(|a| a.name == "Poet").unwrap();
        assert_eq!(poet.model, "models/gemini-1.5-flash-latest");
    }

    #[test]
    fn test_delete_agent_cascades_and_persists() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let (service, master, writer) = setup(ScriptedGateway::new(Vec::new()), &[KEY_A]);
        let storage = Arc::new(Storage::with_data_dir(temp_dir.path().to_path_buf()));
        let service = service.with_storage(storage.clone());

        service
            .save_workflow(Workflow::new("Pipeline", &[writer.clone(), master.clone()]))
            .unwrap();
        let outcome = service.delete_agent(&writer).unwrap();
        assert_eq!(outcome.workflows_updated, 1);

        let workflows = storage.load_workflows().unwrap();
        assert_eq!(workflows[0].steps.len(), 1);
        assert_eq!(workflows[0].steps[0].agent_id, master);
        assert!(matches!(
            service.delete_agent(&writer),
            Err(MaestroError::NotFound(_))
        ));
    }

    #[test]
    fn test_settings_and_keys_passthrough() {
        let (service, _, _) = setup(ScriptedGateway::new(Vec::new()), &[KEY_A]);

        service.add_model("models/gemini-2.0-flash").unwrap();
        service.set_default_model("models/gemini-2.0-flash").unwrap();
        assert_eq!(service.settings().default_model, "models/gemini-2.0-flash");
        assert!(service.set_default_model("models/unknown").is_err());

        service.remove_model("models/gemini-2.0-flash").unwrap();
        assert_eq!(service.settings().default_model, "models/gemini-1.5-flash-latest");
        service.remove_model("models/gemini-1.5-pro-latest").unwrap();
        assert_eq!(service.discover_models().unwrap(), 1);

        service.add_key(KEY_B).unwrap();
        assert!(matches!(
            service.add_key("short"),
            Err(MaestroError::Key(crate::keys::KeyError::TooShort))
        ));
        service.select_key(KEY_A).unwrap();
        service.remove_key(KEY_A).unwrap();
        assert_eq!(service.keys().current(), Some(KEY_B));
    }
}
