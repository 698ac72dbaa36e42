//! CLI command definitions and dispatch for the `flowline` binary.
//!
//! Uses clap derive macros for argument parsing. The CLI follows a
//! noun-verb pattern (e.g., `flowline execution show <id>`,
//! `flowline dead-letter replay <id>`).

pub mod circuit;
pub mod config;
pub mod dead_letter;
pub mod env;
pub mod execution;
pub mod serve;
pub mod workflow;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use flowline_types::execution::ExecutionStatus;

/// Durable workflow execution engine.
#[derive(Parser)]
#[command(name = "flowline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format.
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormatArg,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory (defaults to ~/.flowline).
    #[arg(long, env = "FLOWLINE_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Keep all engine state in memory; nothing is persisted.
    #[arg(long, global = true)]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server (and the background worker).
    Serve {
        /// Address to bind to (overrides [server].bind).
        #[arg(long)]
        bind: Option<String>,

        /// Do not run the background worker in this process.
        #[arg(long)]
        no_worker: bool,
    },

    /// Run the background worker: wake parked executions, redeliver dead
    /// letters, flush batch windows, recover stalled executions.
    Worker {
        /// Run every sweep once and exit.
        #[arg(long)]
        once: bool,
    },

    /// Register a workflow file and run one execution of it to completion.
    Run {
        /// Workflow definition (.yaml, .yml or .json).
        file: PathBuf,

        /// Trigger data as JSON.
        #[arg(long, default_value = "{}")]
        data: String,

        /// Environment whose config applies.
        #[arg(long = "env")]
        environment: Option<String>,
    },

    /// Trigger a registered workflow and drive it until it settles.
    Trigger {
        /// Workflow id.
        workflow_id: String,

        /// Trigger data as JSON.
        #[arg(long, default_value = "{}")]
        data: String,

        /// Trigger type recorded on the execution.
        #[arg(long = "type", default_value = "manual")]
        trigger_type: String,

        /// Repeated triggers with the same key return the first execution.
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Environment whose config applies.
        #[arg(long = "env")]
        environment: Option<String>,
    },

    /// Manage workflow definitions (register, list, show).
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Inspect and control executions (show, list, cancel, resume).
    #[command(alias = "exec")]
    Execution {
        #[command(subcommand)]
        action: execution::ExecutionCommand,
    },

    /// Triage the dead letter queue (list, replay).
    #[command(name = "dead-letter", alias = "dlq")]
    DeadLetter {
        #[command(subcommand)]
        action: dead_letter::DeadLetterCommand,
    },

    /// Inspect or force circuit breakers (show, list, force).
    Circuit {
        #[command(subcommand)]
        action: circuit::CircuitCommand,
    },

    /// Per-environment configuration (show, set, promote, rollback, history).
    Env {
        #[command(subcommand)]
        action: env::EnvCommand,
    },

    /// Inspect the engine configuration.
    Config {
        #[command(subcommand)]
        action: config::ConfigCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a JSON command-line argument.
pub fn parse_json_arg(what: &str, raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON: {raw}"))
}

/// Print a value as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Running | ExecutionStatus::Pending => Color::Cyan,
        ExecutionStatus::Waiting => Color::Yellow,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status.to_string()).fg(color)
}

pub fn styled_status(status: ExecutionStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        ExecutionStatus::Completed => console::style(text).green(),
        ExecutionStatus::Running | ExecutionStatus::Pending => console::style(text).cyan(),
        ExecutionStatus::Waiting => console::style(text).yellow(),
        ExecutionStatus::Failed => console::style(text).red(),
        ExecutionStatus::Cancelled => console::style(text).dim(),
    }
}

pub fn format_relative_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let diff = chrono::Utc::now() - *dt;

    if diff.num_seconds() < 0 {
        let ahead = -diff;
        if ahead.num_minutes() < 1 {
            format!("in {}s", ahead.num_seconds())
        } else if ahead.num_hours() < 1 {
            format!("in {}m", ahead.num_minutes())
        } else {
            format!("in {}h", ahead.num_hours())
        }
    } else if diff.num_minutes() < 1 {
        "just now".to_string()
    } else if diff.num_hours() < 1 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_days() < 1 {
        format!("{}h ago", diff.num_hours())
    } else {
        format!("{}d ago", diff.num_days())
    }
}

/// Shorten long text for table cells.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "flowline", "execution", "list", "--workflow", "leads", "-vv", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Execution { .. }));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg("data", r#"{"a":1}"#).unwrap()["a"], 1);
        assert!(parse_json_arg("data", "{a").is_err());
    }
}
