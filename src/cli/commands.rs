//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// taskstack - provisions the tasks demo stack on AWS.
#[derive(Parser, Debug)]
#[command(name = "taskstack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "TASKSTACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format.
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Cloud backend to run against.
    #[arg(long, global = true, default_value = "aws", env = "TASKSTACK_BACKEND")]
    pub backend: BackendKind,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter configuration.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration and the declared plan.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Preview the changes an apply would make.
    Plan {
        /// Include unchanged resources.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Create or update the stack.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete every recorded resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the outputs of the last apply.
    Outputs {
        /// Print a single output's raw value.
        name: Option<String>,
    },

    /// Show recorded resources.
    Status {
        /// Probe the API health endpoint.
        #[arg(long)]
        health: bool,
    },

    /// Compare recorded state with the cloud.
    Drift,

    /// Print the dependency graph in apply order.
    Graph {
        /// Emit Graphviz dot instead of a list.
        #[arg(long)]
        dot: bool,
    },

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log line formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Cloud backends selectable from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Amazon Web Services.
    #[default]
    Aws,
    /// In-process rehearsal cloud; nothing is created.
    Memory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_global_flags() {
        let cli = Cli::try_parse_from([
            "taskstack",
            "--backend",
            "memory",
            "--output",
            "json",
            "apply",
            "--yes",
        ])
        .unwrap();

        assert_eq!(cli.backend, BackendKind::Memory);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Apply { yes: true }));
    }

    #[test]
    fn test_state_subcommands() {
        let cli = Cli::try_parse_from(["taskstack", "state", "unlock", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { force: true, .. }
            }
        ));
    }

    #[test]
    fn test_command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
