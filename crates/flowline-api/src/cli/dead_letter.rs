//! Dead letter queue triage.

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowline_core::repository::EngineStore;
use flowline_types::dead_letter::DeadLetterStatus;
use uuid::Uuid;

use crate::cli::{format_relative_time, print_json, styled_status, truncate};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum DeadLetterCommand {
    /// List dead letters, soonest retry first.
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, retrying, resolved, abandoned).
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Resume a dead-lettered execution now, regardless of its retry schedule.
    Replay {
        /// Execution id of the dead letter.
        execution_id: Uuid,
    },
}

pub async fn handle_dead_letter_command<S: EngineStore>(
    cmd: DeadLetterCommand,
    state: &AppState<S>,
    json: bool,
) -> Result<()> {
    match cmd {
        DeadLetterCommand::List { status, limit } => {
            let status = status
                .map(|s| s.parse::<DeadLetterStatus>().map_err(|e| anyhow!(e)))
                .transpose()?;
            let entries = state.coordinator.list_dead_letters(status, limit).await?;
            if json {
                return print_json(&entries);
            }

            if entries.is_empty() {
                println!();
                println!("  {} Dead letter queue is empty.", style("✓").green().bold());
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(presets::UTF8_FULL_CONDENSED);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec![
                Cell::new("Execution").fg(Color::White),
                Cell::new("Workflow").fg(Color::White),
                Cell::new("Status").fg(Color::White),
                Cell::new("Attempts").fg(Color::White),
                Cell::new("Next retry").fg(Color::White),
                Cell::new("Error").fg(Color::White),
            ]);
            for entry in &entries {
                let color = match entry.status {
                    DeadLetterStatus::Pending | DeadLetterStatus::Retrying => Color::Yellow,
                    DeadLetterStatus::Resolved => Color::Green,
                    DeadLetterStatus::Abandoned => Color::Red,
                };
                let next_retry = if !entry.status.is_terminal() {
                    format_relative_time(&entry.next_retry_at)
                } else {
                    "-".to_string()
                };
                table.add_row(vec![
                    Cell::new(entry.execution_id).fg(Color::DarkGrey),
                    Cell::new(&entry.workflow_id).fg(Color::Cyan),
                    Cell::new(entry.status.to_string()).fg(color),
                    Cell::new(format!("{}/{}", entry.attempt_count, entry.max_attempts)),
                    Cell::new(next_retry),
                    Cell::new(truncate(&entry.error, 60)),
                ]);
            }

            println!();
            println!("{table}");
            println!();
            Ok(())
        }
        DeadLetterCommand::Replay { execution_id } => {
            let execution = state.coordinator.replay_dead_letter(execution_id).await?;
            if json {
                return print_json(&execution);
            }
            println!();
            println!(
                "  {} Replayed {}: now {}",
                style("✓").green().bold(),
                style(execution.id).dim(),
                styled_status(execution.status)
            );
            if let Some(error) = &execution.error {
                println!("    {}", style(error).red());
            }
            println!();
            Ok(())
        }
    }
}
