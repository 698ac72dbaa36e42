//! Execution CLI commands: trigger, show, list, cancel, resume.

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowline_core::engine::{ExecutionView, Ingested, RunMode, TriggerRequest};
use flowline_core::repository::EngineStore;
use flowline_types::execution::{Execution, ExecutionStatus, NodeStatus};
use uuid::Uuid;

use crate::cli::{format_relative_time, print_json, status_cell, styled_status, truncate};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// Show an execution with its node records, checkpoints and snapshots.
    Show {
        /// Execution id.
        id: Uuid,
    },

    /// List executions, most recent first.
    #[command(alias = "ls")]
    List {
        /// Only executions of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Filter by status (pending, running, waiting, completed, failed, cancelled).
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Cancel an execution. In-flight node calls finish but nothing new is dispatched.
    Cancel {
        /// Execution id.
        id: Uuid,
    },

    /// Resume a pending, waiting, stalled or failed execution from its latest checkpoint.
    Resume {
        /// Execution id.
        id: Uuid,
    },
}

pub async fn handle_execution_command<S: EngineStore>(
    cmd: ExecutionCommand,
    state: &AppState<S>,
    json: bool,
) -> Result<()> {
    match cmd {
        ExecutionCommand::Show { id } => {
            let view = state.coordinator.get_execution(id).await?;
            if json {
                return print_json(&view);
            }
            print_view(&view);
            Ok(())
        }
        ExecutionCommand::List {
            workflow,
            status,
            limit,
        } => list_executions(state, workflow.as_deref(), status, limit, json).await,
        ExecutionCommand::Cancel { id } => {
            let execution = state.coordinator.cancel_execution(id).await?;
            print_outcome(&execution, "cancelled", json)
        }
        ExecutionCommand::Resume { id } => {
            let execution = state.coordinator.resume_execution(id).await?;
            print_outcome(&execution, "resumed", json)
        }
    }
}

/// Ingest a trigger and drive the resulting execution until it settles.
pub async fn trigger<S: EngineStore>(
    state: &AppState<S>,
    request: TriggerRequest,
    json: bool,
) -> Result<()> {
    let ingested = state
        .coordinator
        .ingest_trigger(request, RunMode::Inline)
        .await?;

    let started = match ingested {
        Ingested::Started(started) => started,
        Ingested::Buffered {
            workflow_id,
            node_id,
        } => {
            if json {
                return print_json(&Ingested::Buffered {
                    workflow_id,
                    node_id,
                });
            }
            println!();
            println!(
                "  {} Event buffered in the batch window of {}/{}",
                style("…").cyan().bold(),
                style(&workflow_id).cyan(),
                node_id
            );
            println!();
            return Ok(());
        }
    };

    let view = state.coordinator.get_execution(started.execution_id).await?;
    if json {
        return print_json(&serde_json::json!({
            "deduplicated": started.deduplicated,
            "execution": view,
        }));
    }
    if started.deduplicated {
        println!();
        println!(
            "  {} Idempotency key already used; showing the existing execution",
            style("i").blue().bold()
        );
    }
    print_view(&view);
    Ok(())
}

async fn list_executions<S: EngineStore>(
    state: &AppState<S>,
    workflow: Option<&str>,
    status: Option<String>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let status = match status {
        Some(s) => Some(s.parse::<ExecutionStatus>().map_err(|e| anyhow!(e))?),
        None => None,
    };
    let executions = state
        .coordinator
        .list_executions(workflow, status, limit)
        .await?;

    if json {
        return print_json(&executions);
    }

    if executions.is_empty() {
        println!();
        println!("  {} No executions found.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Id").fg(Color::White),
        Cell::new("Workflow").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Trigger").fg(Color::White),
        Cell::new("Env").fg(Color::White),
        Cell::new("Started").fg(Color::White),
        Cell::new("Error").fg(Color::White),
    ]);
    for execution in &executions {
        table.add_row(vec![
            Cell::new(execution.id).fg(Color::DarkGrey),
            Cell::new(&execution.workflow_id).fg(Color::Cyan),
            status_cell(execution.status),
            Cell::new(&execution.trigger_type),
            Cell::new(&execution.environment),
            Cell::new(format_relative_time(&execution.started_at)),
            Cell::new(truncate(execution.error.as_deref().unwrap_or(""), 60)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} execution{}",
        style(executions.len()).bold(),
        if executions.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

fn print_outcome(execution: &Execution, verb: &str, json: bool) -> Result<()> {
    if json {
        return print_json(execution);
    }
    println!();
    println!(
        "  {} Execution {} {}: now {}",
        style("✓").green().bold(),
        style(execution.id).dim(),
        verb,
        styled_status(execution.status)
    );
    if let Some(error) = &execution.error {
        println!("    {}", style(error).red());
    }
    println!();
    Ok(())
}

fn print_view(view: &ExecutionView) {
    let execution = &view.execution;
    println!();
    println!(
        "  {} {}  {}",
        style("Execution").bold(),
        style(execution.id).dim(),
        styled_status(execution.status)
    );
    println!(
        "  {}  {}  ({} trigger, {} environment)",
        style("Workflow:").bold(),
        style(&execution.workflow_id).cyan(),
        execution.trigger_type,
        execution.environment
    );
    if let Some(next) = &execution.next_check_at {
        println!(
            "  {}  {}",
            style("Next check:").bold(),
            format_relative_time(next)
        );
    }
    if let Some(error) = &execution.error {
        println!("  {}  {}", style("Error:").bold(), style(error).red());
    }
    println!();

    if !view.nodes.is_empty() {
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Node").fg(Color::White),
            Cell::new("Type").fg(Color::White),
            Cell::new("Attempt").fg(Color::White),
            Cell::new("Status").fg(Color::White),
            Cell::new("Detail").fg(Color::White),
        ]);
        for node in &view.nodes {
            let status = match node.status {
                NodeStatus::Succeeded => Cell::new("succeeded").fg(Color::Green),
                NodeStatus::Skipped => Cell::new("skipped").fg(Color::DarkGrey),
                NodeStatus::Failed => Cell::new("failed").fg(Color::Red),
                other => Cell::new(other.to_string()).fg(Color::Cyan),
            };
            let detail = match (&node.error, &node.output) {
                (Some(error), _) => error.clone(),
                (None, Some(output)) => output.to_string(),
                (None, None) => String::new(),
            };
            table.add_row(vec![
                Cell::new(&node.node_id).fg(Color::Cyan),
                Cell::new(&node.node_type),
                Cell::new(node.attempt),
                status,
                Cell::new(truncate(&detail, 60)),
            ]);
        }
        println!("{table}");
        println!();
    }

    let invocations = view.snapshots.len();
    let total_ms: u64 = view.snapshots.iter().map(|s| s.duration_ms).sum();
    println!(
        "  {} checkpoint{}, {} executor invocation{} ({} ms)",
        view.checkpoints.len(),
        if view.checkpoints.len() == 1 { "" } else { "s" },
        invocations,
        if invocations == 1 { "" } else { "s" },
        total_ms
    );

    if let Some(letter) = &view.dead_letter {
        println!(
            "  {}  {} (attempt {}/{}, next retry {})",
            style("Dead letter:").bold().red(),
            letter.status,
            letter.attempt_count,
            letter.max_attempts,
            format_relative_time(&letter.next_retry_at)
        );
    }
    println!();
}
