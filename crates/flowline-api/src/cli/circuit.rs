//! Circuit breaker inspection and operator overrides.

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowline_core::repository::EngineStore;
use flowline_types::resilience::{CircuitBreakerRecord, CircuitState};

use crate::cli::{format_relative_time, print_json};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum CircuitCommand {
    /// Show the breaker guarding one node.
    Show {
        /// Workflow id.
        workflow: String,
        /// Node id.
        node: String,
    },

    /// List every breaker of a workflow.
    #[command(alias = "ls")]
    List {
        /// Workflow id.
        workflow: String,
    },

    /// Force a breaker into a state (closed, open, half_open).
    Force {
        /// Workflow id.
        workflow: String,
        /// Node id.
        node: String,
        /// Target state.
        state: String,
    },
}

pub async fn handle_circuit_command<S: EngineStore>(
    cmd: CircuitCommand,
    state: &AppState<S>,
    json: bool,
) -> Result<()> {
    match cmd {
        CircuitCommand::Show { workflow, node } => {
            let record = state
                .coordinator
                .get_circuit(&workflow, &node)
                .await?
                .ok_or_else(|| anyhow!("no breaker recorded for {workflow}/{node}"))?;
            if json {
                return print_json(&record);
            }
            print_record(&record);
            Ok(())
        }
        CircuitCommand::List { workflow } => {
            let records = state.coordinator.list_circuits(&workflow).await?;
            if json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!();
                println!(
                    "  {} No breakers recorded for {}.",
                    style("i").blue().bold(),
                    style(&workflow).cyan()
                );
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(presets::UTF8_FULL_CONDENSED);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec![
                Cell::new("Node").fg(Color::White),
                Cell::new("State").fg(Color::White),
                Cell::new("Failures").fg(Color::White),
                Cell::new("Last failure").fg(Color::White),
                Cell::new("Updated").fg(Color::White),
            ]);
            for record in &records {
                table.add_row(vec![
                    Cell::new(&record.node_id).fg(Color::Cyan),
                    state_cell(record.state),
                    Cell::new(format!(
                        "{}/{}",
                        record.failure_count, record.policy.failure_threshold
                    )),
                    Cell::new(
                        record
                            .last_failure_at
                            .as_ref()
                            .map(format_relative_time)
                            .unwrap_or_else(|| "-".to_string()),
                    ),
                    Cell::new(format_relative_time(&record.updated_at)),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }
        CircuitCommand::Force {
            workflow,
            node,
            state: target,
        } => {
            let target: CircuitState = target.parse().map_err(|e: String| anyhow!(e))?;
            let record = state
                .coordinator
                .force_circuit_state(&workflow, &node, target)
                .await?;
            if json {
                return print_json(&record);
            }
            println!();
            println!(
                "  {} Breaker {}/{} forced {}",
                style("✓").green().bold(),
                style(&workflow).cyan(),
                node,
                style(record.state).bold()
            );
            println!();
            Ok(())
        }
    }
}

fn state_cell(state: CircuitState) -> Cell {
    let color = match state {
        CircuitState::Closed => Color::Green,
        CircuitState::Open => Color::Red,
        CircuitState::HalfOpen => Color::Yellow,
    };
    Cell::new(state.to_string()).fg(color)
}

fn print_record(record: &CircuitBreakerRecord) {
    let state = match record.state {
        CircuitState::Closed => style(record.state.to_string()).green(),
        CircuitState::Open => style(record.state.to_string()).red(),
        CircuitState::HalfOpen => style(record.state.to_string()).yellow(),
    };
    println!();
    println!(
        "  {} {}/{}  {}",
        style("Breaker").bold(),
        style(&record.workflow_id).cyan(),
        record.node_id,
        state
    );
    println!(
        "  {}  {}/{} in a {}s window",
        style("Failures:").bold(),
        record.failure_count,
        record.policy.failure_threshold,
        record.policy.window_seconds
    );
    if record.state == CircuitState::HalfOpen {
        println!(
            "  {}  {}/{}",
            style("Probe successes:").bold(),
            record.success_count,
            record.policy.success_threshold
        );
    }
    if let Some(opens_at) = &record.opens_at {
        println!(
            "  {}  {}",
            style("Admits probe:").bold(),
            format_relative_time(opens_at)
        );
    }
    println!();
}
