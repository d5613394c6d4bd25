//! Maestro - Master AI orchestrator
//!
//! Command-line front end over `maestro-core`: runs the orchestrator with a
//! live log, manages agents, keys, models and workflows, and (with the `web`
//! feature) serves the HTTP API.

mod cli;
mod console;

use anyhow::{anyhow, Context};
use clap::Parser;
use cli::{AgentCommands, Cli, Commands, KeyCommands, ModelCommands, WorkflowCommands};
use maestro_core::{
    mask_key, Agent, AgentId, AgentUpdate, MaestroConfig, NewAgent, OrchestrationService,
    RunRequest, RunStatus, Workflow, WorkflowId,
};
use std::io::IsTerminal;
use std::sync::{Arc, Once};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing subscriber on stderr (only once)
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "maestro=warn,maestro_core=warn",
        1 => "maestro=info,maestro_core=info,maestro_server=info",
        _ => "maestro=debug,maestro_core=debug,maestro_server=debug,tower_http=debug",
    };
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
            ))
            .with_writer(std::io::stderr)
            .init();
    });
}

fn load_config(cli: &Cli) -> anyhow::Result<MaestroConfig> {
    let cwd = std::env::current_dir()?;
    let mut config = maestro_core::load_config(&cwd).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        MaestroConfig::default()
    });
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }
    Ok(config)
}

/// Look an agent up by id, then by name
fn resolve_agent(service: &OrchestrationService, key: &str) -> anyhow::Result<Agent> {
    service
        .find_agent(&AgentId::from(key))
        .or_else(|| service.find_agent_by_name(key))
        .ok_or_else(|| anyhow!("Agent not found: {}", key))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    #[cfg(feature = "web")]
    let verbose = match cli.command {
        Commands::Serve { .. } => cli.verbose.max(1),
        _ => cli.verbose,
    };
    #[cfg(not(feature = "web"))]
    let verbose = cli.verbose;
    init_tracing(verbose);

    if let Commands::SampleConfig = cli.command {
        print!("{}", maestro_core::config::sample_config());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let service = OrchestrationService::from_config(&config)?;

    match cli.command {
        Commands::Run {
            orchestrator,
            goal,
            max_iterations,
        } => run_goal(Arc::new(service), &orchestrator, goal, max_iterations).await,
        #[cfg(feature = "web")]
        Commands::Serve { port, open } => {
            if open {
                let url = format!("http://localhost:{}", port);
                if let Err(e) = open::that(&url) {
                    tracing::warn!("Failed to open browser: {}", e);
                }
            }
            maestro_server::serve(service, port).await
        }
        Commands::Agents { command } => agents(&service, command),
        Commands::Keys { command } => keys(&service, command),
        Commands::Models { command } => models(&service, command),
        Commands::Workflows { command } => workflows(&service, command),
        Commands::SampleConfig => Ok(()),
    }
}

/// Run to completion, printing notifications as they arrive
async fn run_goal(
    service: Arc<OrchestrationService>,
    orchestrator: &str,
    goal: String,
    max_iterations: Option<u32>,
) -> anyhow::Result<()> {
    let orchestrator = resolve_agent(&service, orchestrator)?;
    let mut request = RunRequest::new(orchestrator.id.as_str(), goal);
    if let Some(max) = max_iterations {
        request = request.with_max_iterations(max);
    }

    // First Ctrl-C stops after the current step; a second one exits
    let stopper = service.clone();
    ctrlc::set_handler(move || {
        if !stopper.request_stop() {
            std::process::exit(130);
        }
    })
    .context("Failed to install Ctrl-C handler")?;

    let color = std::io::stdout().is_terminal();
    let notifications = service.notifications().clone();
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
    let printer = std::thread::spawn(move || loop {
        crossbeam_channel::select! {
            recv(notifications) -> notification => match notification {
                Ok(notification) => {
                    if let Some(line) = console::render(&notification, color) {
                        println!("{}", line);
                    }
                }
                Err(_) => break,
            },
            recv(done_rx) -> _ => {
                for notification in notifications.try_iter() {
                    if let Some(line) = console::render(&notification, color) {
                        println!("{}", line);
                    }
                }
                break;
            }
        }
    });

    let result = service.start_run(request).await;
    drop(done_tx);
    let _ = printer.join();

    let report = result.context("Run did not start")?;
    if report.status == RunStatus::Aborted {
        if let Some(reason) = &report.abort_reason {
            eprintln!("Stopped: {}", reason);
        }
    }
    Ok(())
}

fn agents(service: &OrchestrationService, command: AgentCommands) -> anyhow::Result<()> {
    match command {
        AgentCommands::List => {
            let agents = service.agents();
            if agents.is_empty() {
                println!("No agents yet. Create one with `maestro agents add`.");
            }
            for agent in agents {
                println!("{}  {}  ({})", agent.id, agent.name, agent.model);
            }
        }
        AgentCommands::Add {
            name,
            prompt,
            model,
        } => {
            let agent = service.create_agent(NewAgent {
                name,
                system_prompt: prompt,
                model,
            })?;
            println!("Created {} ({}) on {}", agent.name, agent.id, agent.model);
        }
        AgentCommands::Edit {
            agent,
            name,
            prompt,
            model,
        } => {
            let target = resolve_agent(service, &agent)?;
            let outcome = service.edit_agent(
                &target.id,
                AgentUpdate {
                    name,
                    system_prompt: prompt,
                    model,
                },
            )?;
            for warning in &outcome.warnings {
                eprintln!("warning: {}", warning);
            }
            if outcome.changed() {
                println!("Updated {}: {}", target.id, outcome.changed_fields().join(", "));
            } else {
                println!("No changes applied to {}", target.id);
            }
        }
        AgentCommands::Delete { agent } => {
            let target = resolve_agent(service, &agent)?;
            let outcome = service.delete_agent(&target.id)?;
            println!(
                "Deleted {} ({} workflow(s) updated)",
                outcome.agent.name, outcome.workflows_updated
            );
        }
    }
    Ok(())
}

fn keys(service: &OrchestrationService, command: KeyCommands) -> anyhow::Result<()> {
    match command {
        KeyCommands::List => {
            let pool = service.keys();
            if pool.is_empty() {
                println!("No API keys. Add one with `maestro keys add` or set GEMINI_API_KEY.");
            }
            let current = pool.current();
            for (index, key) in pool.keys().iter().enumerate() {
                let marker = if Some(key.as_str()) == current { "*" } else { " " };
                println!("{} {}  {}", marker, index, mask_key(key));
            }
        }
        KeyCommands::Add { key } => {
            service.add_key(&key)?;
            println!("Added and selected {}", mask_key(&key));
        }
        KeyCommands::Remove { key } => {
            service.remove_key(&key)?;
            println!("Removed {}", mask_key(&key));
        }
        KeyCommands::Select { key } => {
            service.select_key(&key)?;
            println!("Selected {}", mask_key(&key));
        }
    }
    Ok(())
}

fn models(service: &OrchestrationService, command: ModelCommands) -> anyhow::Result<()> {
    match command {
        ModelCommands::List => {
            let settings = service.settings();
            for model in &settings.usable_models {
                let marker = if *model == settings.default_model { "*" } else { " " };
                println!("{} {}", marker, model);
            }
        }
        ModelCommands::Add { model } => {
            service.add_model(&model)?;
            println!("Added {}", model.trim());
        }
        ModelCommands::Remove { model } => {
            service.remove_model(&model)?;
            println!("Removed {}", model);
        }
        ModelCommands::Default { model } => {
            service.set_default_model(&model)?;
            println!("Default model is now {}", model.trim());
        }
        ModelCommands::Discover => {
            let added = service.discover_models()?;
            println!("{} model(s) added", added);
        }
    }
    Ok(())
}

fn workflows(service: &OrchestrationService, command: WorkflowCommands) -> anyhow::Result<()> {
    match command {
        WorkflowCommands::List => {
            for workflow in service.workflows() {
                let steps: Vec<String> = workflow
                    .steps
                    .iter()
                    .map(|step| {
                        service
                            .find_agent(&step.agent_id)
                            .map(|agent| agent.name)
                            .unwrap_or_else(|| step.agent_id.to_string())
                    })
                    .collect();
                println!("{}  {}: {}", workflow.id, workflow.name, steps.join(" -> "));
            }
        }
        WorkflowCommands::Add {
            name,
            agents,
            input,
        } => {
            let ids = agents
                .iter()
                .map(|key| resolve_agent(service, key).map(|agent| agent.id))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let mut workflow = Workflow::new(name, &ids);
            workflow.initial_input = input;
            let id = workflow.id.clone();
            service.save_workflow(workflow)?;
            println!("Saved workflow {}", id);
        }
        WorkflowCommands::Delete { id } => {
            let workflow = service.delete_workflow(&WorkflowId::from(id.as_str()))?;
            println!("Deleted workflow {}", workflow.name);
        }
    }
    Ok(())
}
