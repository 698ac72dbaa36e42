//! Workflow definition CLI commands: register, list, show, and the one-shot
//! `run` command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowline_core::engine::TriggerRequest;
use flowline_core::repository::EngineStore;
use flowline_core::workflow::definition::load_workflow_file;
use flowline_types::workflow::WorkflowDefinition;

use crate::cli::{execution, parse_json_arg, print_json};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Validate and store a workflow definition (YAML or JSON).
    Register {
        /// Definition file (.yaml, .yml or .json).
        file: PathBuf,
    },

    /// List registered workflows.
    #[command(alias = "ls")]
    List,

    /// Show a workflow definition.
    Show {
        /// Workflow id.
        id: String,
    },
}

pub async fn handle_workflow_command<S: EngineStore>(
    cmd: WorkflowCommand,
    state: &AppState<S>,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Register { file } => {
            let def = register_file(state, &file).await?;
            if json {
                return print_json(&def);
            }
            println!();
            println!(
                "  {} Registered workflow {} (v{}, {} nodes)",
                style("✓").green().bold(),
                style(&def.id).cyan(),
                def.version,
                def.nodes.len()
            );
            println!();
            Ok(())
        }
        WorkflowCommand::List => list_workflows(state, json).await,
        WorkflowCommand::Show { id } => show_workflow(state, &id, json).await,
    }
}

async fn register_file<S: EngineStore>(
    state: &AppState<S>,
    file: &Path,
) -> Result<WorkflowDefinition> {
    let def = load_workflow_file(file)
        .with_context(|| format!("failed to load workflow from {}", file.display()))?;
    Ok(state.coordinator.register_workflow(def).await?)
}

/// Register `file` and drive one execution of it.
pub async fn run_file<S: EngineStore>(
    state: &AppState<S>,
    file: &Path,
    data: &str,
    environment: Option<String>,
    json: bool,
) -> Result<()> {
    let def = register_file(state, file).await?;
    let mut request = TriggerRequest::new(def.id, "manual", parse_json_arg("--data", data)?);
    request.environment = environment;
    execution::trigger(state, request, json).await
}

async fn list_workflows<S: EngineStore>(state: &AppState<S>, json: bool) -> Result<()> {
    let defs = state.coordinator.list_workflows().await?;
    if json {
        return print_json(&defs);
    }

    if defs.is_empty() {
        println!();
        println!(
            "  {} No workflows registered. Register one with: {}",
            style("i").blue().bold(),
            style("flowline workflow register <file>").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Id").fg(Color::White),
        Cell::new("Name").fg(Color::White),
        Cell::new("Version").fg(Color::White),
        Cell::new("Nodes").fg(Color::White),
        Cell::new("Batching").fg(Color::White),
    ]);
    for def in &defs {
        let batching = match &def.batching {
            Some(policy) => format!("{} x{}", policy.node_id, policy.window_size),
            None => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&def.id).fg(Color::Cyan),
            Cell::new(&def.name),
            Cell::new(def.version),
            Cell::new(def.nodes.len()),
            Cell::new(batching).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn show_workflow<S: EngineStore>(state: &AppState<S>, id: &str, json: bool) -> Result<()> {
    let def = state.coordinator.get_workflow(id).await?;
    if json {
        return print_json(&def);
    }

    println!();
    println!(
        "  {} {} {}",
        style(&def.name).bold(),
        style(&def.id).cyan(),
        style(format!("v{}", def.version)).dim()
    );
    if let Some(description) = &def.description {
        println!("  {}", style(description).dim());
    }
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Node").fg(Color::White),
        Cell::new("Type").fg(Color::White),
        Cell::new("Depends on").fg(Color::White),
        Cell::new("Join").fg(Color::White),
        Cell::new("Side effects").fg(Color::White),
    ]);
    for node in &def.nodes {
        let effects = if !node.side_effecting {
            "none"
        } else if node.is_guarded() {
            "guarded"
        } else if node.safe_to_repeat {
            "safe to repeat"
        } else {
            "unguarded"
        };
        let depends = if node.depends_on.is_empty() {
            "-".to_string()
        } else {
            node.depends_on.join(", ")
        };
        table.add_row(vec![
            Cell::new(&node.id).fg(Color::Cyan),
            Cell::new(&node.node_type),
            Cell::new(depends),
            Cell::new(format!("{:?}", node.join).to_lowercase()),
            Cell::new(effects),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}
