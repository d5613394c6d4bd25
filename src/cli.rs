//! Command-line arguments

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "maestro", version, about = "Master AI orchestrator for Gemini agents")]
pub struct Cli {
    /// Directory holding agents.json, settings.json, keys.json and workflows.json
    #[arg(long, global = true, env = "MAESTRO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log backend activity to stderr (repeat for more detail)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the orchestrator toward a goal, streaming its log")]
    Run {
        /// Orchestrator agent, by id or name
        #[arg(long, short)]
        orchestrator: String,
        #[arg(long, short)]
        goal: String,
        /// Iteration budget (1-50); out-of-range values use the default
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    #[cfg(feature = "web")]
    #[command(about = "Serve the HTTP API")]
    Serve {
        #[arg(long, default_value_t = 8080, env = "PORT")]
        port: u16,
        /// Open the landing page in a browser
        #[arg(long, default_value_t = false)]
        open: bool,
    },
    #[command(about = "Manage agents")]
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
    #[command(about = "Manage API keys")]
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
    #[command(about = "Manage usable models")]
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },
    #[command(about = "Manage stored workflows")]
    Workflows {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    #[command(about = "Print a commented sample .maestro.toml")]
    SampleConfig,
}

#[derive(Debug, Subcommand)]
pub enum AgentCommands {
    #[command(about = "List agents")]
    List,
    #[command(about = "Create an agent")]
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        prompt: String,
        /// Falls back to the default model when missing or not usable
        #[arg(long)]
        model: Option<String>,
    },
    #[command(about = "Edit an agent; the model may be AUTO_SELECT_BEST_MODEL_FOR_PROMPT")]
    Edit {
        /// Agent id or name
        agent: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    #[command(about = "Delete an agent and remove it from workflows")]
    Delete {
        /// Agent id or name
        agent: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum KeyCommands {
    #[command(about = "List managed keys (masked)")]
    List,
    #[command(about = "Add a key and select it")]
    Add { key: String },
    #[command(about = "Remove a key")]
    Remove { key: String },
    #[command(about = "Select the key runs start with")]
    Select { key: String },
}

#[derive(Debug, Subcommand)]
pub enum ModelCommands {
    #[command(about = "List usable models")]
    List,
    #[command(about = "Add a usable model")]
    Add { model: String },
    #[command(about = "Remove a usable model")]
    Remove { model: String },
    #[command(about = "Set the default model")]
    Default { model: String },
    #[command(about = "Re-add missing built-in models")]
    Discover,
}

#[derive(Debug, Subcommand)]
pub enum WorkflowCommands {
    #[command(about = "List workflows")]
    List,
    #[command(about = "Store a workflow of agent steps")]
    Add {
        #[arg(long)]
        name: String,
        /// Agent ids or names, in step order
        #[arg(long, value_delimiter = ',', required = true)]
        agents: Vec<String>,
        #[arg(long, default_value = "")]
        input: String,
    },
    #[command(about = "Delete a workflow")]
    Delete { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "maestro",
            "run",
            "-o",
            "Master",
            "-g",
            "Write a haiku",
            "--max-iterations",
            "5",
        ]);
        match cli.command {
            Commands::Run {
                orchestrator,
                goal,
                max_iterations,
            } => {
                assert_eq!(orchestrator, "Master");
                assert_eq!(goal, "Write a haiku");
                assert_eq!(max_iterations, Some(5));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_workflow_agents() {
        let cli = Cli::parse_from([
            "maestro",
            "workflows",
            "add",
            "--name",
            "Draft",
            "--agents",
            "Writer,Editor",
        ]);
        match cli.command {
            Commands::Workflows {
                command: WorkflowCommands::Add { agents, input, .. },
            } => {
                assert_eq!(agents, vec!["Writer", "Editor"]);
                assert_eq!(input, "");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
