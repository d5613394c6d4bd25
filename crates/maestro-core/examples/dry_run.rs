//! Offline orchestration run against a canned gateway
//!
//! Run with: cargo run --example dry_run

use async_trait::async_trait;
use maestro_core::{
    ApiKeyPool, GatewayError, Invocation, ModelGateway, NewAgent, Notification,
    OrchestrationService, RunRequest, Studio,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Plays the orchestrator and a worker from a fixed script
struct CannedGateway {
    step: AtomicUsize,
}

#[async_trait]
impl ModelGateway for CannedGateway {
    async fn invoke(&self, _invocation: Invocation) -> Result<String, GatewayError> {
        let reply = match self.step.fetch_add(1, Ordering::SeqCst) {
            0 => r#"CREATE NEW AGENT {"name": "Poet", "system_prompt": "You write haiku.", "model": "models/gemini-1.5-flash-latest"}"#,
            1 => r#"CALL "Poet" WITH INPUT {"prompt_text": "A haiku about autumn leaves"}"#,
            2 => "Leaves fall softly down",
            _ => "TASK COMPLETE. Final Output: Leaves fall softly down",
        };
        Ok(reply.to_string())
    }
}

#[tokio::main]
async fn main() -> maestro_core::Result<()> {
    println!("=== Dry Run ===\n");

    let mut studio = Studio::default();
    studio.keys = ApiKeyPool::from_keys(["demo-key-0000000"]);
    let master = studio.create_agent(NewAgent {
        name: "Master".to_string(),
        system_prompt: "You coordinate other agents.".to_string(),
        model: None,
    })?;

    let gateway = Arc::new(CannedGateway {
        step: AtomicUsize::new(0),
    });
    let service = OrchestrationService::new(studio, gateway);

    let report = service
        .start_run(RunRequest::new(master.id.as_str(), "Write a haiku").with_max_iterations(5))
        .await?;

    for notification in service.notifications().try_iter() {
        if let Notification::Log { source, text, .. } = notification {
            println!("[{}] {}", source, text);
        }
    }

    println!("\nStatus: {} after {} iteration(s)", report.status, report.iterations);
    println!("Final output: {}", report.final_output);
    println!("\nHistory:\n{}", report.history);
    Ok(())
}
