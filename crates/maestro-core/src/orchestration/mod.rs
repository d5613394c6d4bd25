//! Master AI orchestration
//!
//! An orchestrator agent is asked, one iteration at a time, for the next
//! action toward a user goal:
//! - `CALL` a worker agent with some input
//! - `CREATE NEW AGENT` from a JSON config
//! - `EDIT AGENT` by id with a partial JSON config
//! - `TASK COMPLETE` with the final output
//!
//! # Example
//!
//! ```no_run
//! use maestro_core::orchestration::{OrchestrationService, RunRequest};
//! use maestro_core::MaestroConfig;
//!
//! # async fn demo() -> maestro_core::Result<()> {
//! let service = OrchestrationService::from_config(&MaestroConfig::default())?;
//! let orchestrator = service.find_agent_by_name("Master").expect("agent exists");
//!
//! let report = service
//!     .start_run(RunRequest::new(orchestrator.id.as_str(), "Write a haiku"))
//!     .await?;
//! println!("{}: {}", report.status, report.final_output);
//! # Ok(())
//! # }
//! ```

mod context;
mod protocol;
mod run;
mod service;

pub use context::build_context;
pub use protocol::{
    output_blocks, parse_action, Action, Completion, CompletionSource, CreateRequest,
    OutputBlock, ParsedAction, ProtocolError, EMPTY_COMPLETION_OUTPUT,
};
pub use run::{
    validate, AbortReason, RunOptions, RunPlan, RunReport, RunRequest, RunStatus,
    MAX_ITERATIONS_NOTICE, STOPPED_NOTICE,
};
pub use service::{OrchestrationService, RunHandle, RunPhase};
