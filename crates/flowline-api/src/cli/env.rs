//! Per-environment configuration: show, set, promote, rollback, history.

use anyhow::{Result, anyhow, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowline_core::repository::EngineStore;
use flowline_types::environment::{DiffChange, Environment, EnvironmentConfig, Promotion};
use serde_json::Value;
use uuid::Uuid;

use crate::cli::{format_relative_time, print_json};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum EnvCommand {
    /// Show a workflow's config for one environment.
    Show {
        /// Workflow id.
        workflow: String,
        /// development, staging or production.
        env: String,
    },

    /// Merge variables and secret references into an environment config.
    Set {
        /// Workflow id.
        workflow: String,
        /// development, staging or production.
        env: String,

        /// Variable as key=value. Values parse as JSON, falling back to a string.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Secret reference as key=ref.
        #[arg(long = "secret", value_name = "KEY=REF")]
        secrets: Vec<String>,
    },

    /// Copy one environment's config onto a later stage.
    Promote {
        /// Workflow id.
        workflow: String,
        /// Source environment.
        from: String,
        /// Target environment.
        to: String,
    },

    /// Undo a promotion.
    Rollback {
        /// Promotion id.
        promotion_id: Uuid,
    },

    /// List a workflow's promotions, most recent first.
    History {
        /// Workflow id.
        workflow: String,
    },
}

pub async fn handle_env_command<S: EngineStore>(
    cmd: EnvCommand,
    state: &AppState<S>,
    json: bool,
) -> Result<()> {
    let environments = state.coordinator.environments();
    match cmd {
        EnvCommand::Show { workflow, env } => {
            let environment = parse_env(&env)?;
            let config = environments
                .get(&workflow, environment)
                .await?
                .ok_or_else(|| anyhow!("workflow '{workflow}' has no {environment} config"))?;
            if json {
                return print_json(&config);
            }
            print_config(&config);
            Ok(())
        }
        EnvCommand::Set {
            workflow,
            env,
            vars,
            secrets,
        } => {
            let environment = parse_env(&env)?;
            state.coordinator.get_workflow(&workflow).await?;

            let mut config = environments
                .get(&workflow, environment)
                .await?
                .unwrap_or_else(|| {
                    EnvironmentConfig::empty(&workflow, environment, chrono::Utc::now())
                });
            for raw in &vars {
                let (key, value) = parse_var(raw)?;
                config.variables.insert(key, value);
            }
            for raw in &secrets {
                let (key, reference) = split_pair(raw)?;
                config.secret_refs.insert(key.to_string(), reference.to_string());
            }

            let saved = environments.set(config).await?;
            if json {
                return print_json(&saved);
            }
            println!();
            println!(
                "  {} Saved {} config for {} ({} variables, {} secret refs)",
                style("✓").green().bold(),
                saved.environment,
                style(&saved.workflow_id).cyan(),
                saved.variables.len(),
                saved.secret_refs.len()
            );
            println!();
            Ok(())
        }
        EnvCommand::Promote { workflow, from, to } => {
            let promotion = environments
                .promote(&workflow, parse_env(&from)?, parse_env(&to)?)
                .await?;
            if json {
                return print_json(&promotion);
            }
            print_promotion(&promotion);
            Ok(())
        }
        EnvCommand::Rollback { promotion_id } => {
            let promotion = environments.rollback(promotion_id).await?;
            if json {
                return print_json(&promotion);
            }
            println!();
            println!(
                "  {} Rolled back {} to its state before promotion {}",
                style("✓").green().bold(),
                promotion.to_env,
                style(promotion.id).dim()
            );
            println!();
            Ok(())
        }
        EnvCommand::History { workflow } => {
            let promotions = environments.list_promotions(&workflow).await?;
            if json {
                return print_json(&promotions);
            }
            if promotions.is_empty() {
                println!();
                println!(
                    "  {} {} has never been promoted.",
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
                Cell::new("Id").fg(Color::White),
                Cell::new("From").fg(Color::White),
                Cell::new("To").fg(Color::White),
                Cell::new("Changes").fg(Color::White),
                Cell::new("Promoted").fg(Color::White),
                Cell::new("Rolled back").fg(Color::White),
            ]);
            for promotion in &promotions {
                table.add_row(vec![
                    Cell::new(promotion.id).fg(Color::DarkGrey),
                    Cell::new(promotion.from_env.to_string()),
                    Cell::new(promotion.to_env.to_string()).fg(Color::Cyan),
                    Cell::new(promotion.diff.len()),
                    Cell::new(format_relative_time(&promotion.promoted_at)),
                    Cell::new(
                        promotion
                            .rolled_back_at
                            .as_ref()
                            .map(format_relative_time)
                            .unwrap_or_else(|| "-".to_string()),
                    ),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }
    }
}

fn parse_env(name: &str) -> Result<Environment> {
    name.parse().map_err(|e: String| anyhow!(e))
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => bail!("expected KEY=VALUE, got '{raw}'"),
    }
}

/// `key=value`, where the value is JSON if it parses and a plain string otherwise.
fn parse_var(raw: &str) -> Result<(String, Value)> {
    let (key, value) = split_pair(raw)?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_config(config: &EnvironmentConfig) {
    println!();
    println!(
        "  {} {}  {}",
        style("Environment").bold(),
        style(&config.workflow_id).cyan(),
        style(config.environment).bold()
    );
    println!(
        "  {}  {}",
        style("Updated:").bold(),
        format_relative_time(&config.updated_at)
    );
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Section").fg(Color::White),
        Cell::new("Key").fg(Color::White),
        Cell::new("Value").fg(Color::White),
    ]);
    for (key, value) in &config.variables {
        table.add_row(vec![
            Cell::new("variables"),
            Cell::new(key).fg(Color::Cyan),
            Cell::new(value.to_string()),
        ]);
    }
    for (key, reference) in &config.secret_refs {
        table.add_row(vec![
            Cell::new("secret_refs"),
            Cell::new(key).fg(Color::Cyan),
            Cell::new(reference).fg(Color::DarkGrey),
        ]);
    }
    for (node, policy) in &config.rate_limits {
        table.add_row(vec![
            Cell::new("rate_limits"),
            Cell::new(node).fg(Color::Cyan),
            Cell::new(to_compact_json(policy)),
        ]);
    }
    for (node, policy) in &config.circuit_breakers {
        table.add_row(vec![
            Cell::new("circuit_breakers"),
            Cell::new(node).fg(Color::Cyan),
            Cell::new(to_compact_json(policy)),
        ]);
    }
    println!("{table}");
    println!();
}

fn to_compact_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn print_promotion(promotion: &Promotion) {
    println!();
    println!(
        "  {} Promoted {} {} -> {}",
        style("✓").green().bold(),
        style(&promotion.workflow_id).cyan(),
        promotion.from_env,
        promotion.to_env
    );
    println!("  {}  {}", style("Promotion:").bold(), promotion.id);
    if promotion.diff.is_empty() {
        println!("  {}", style("No changes.").dim());
    }
    for entry in &promotion.diff {
        let marker = match entry.change {
            DiffChange::Added { .. } => style("+").green(),
            DiffChange::Removed { .. } => style("-").red(),
            DiffChange::Changed { .. } => style("~").yellow(),
        };
        println!("    {marker} {}.{}", entry.section, entry.key);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_var_prefers_json() {
        assert_eq!(parse_var("limit=10").unwrap(), ("limit".to_string(), json!(10)));
        assert_eq!(
            parse_var("flags=[1,2]").unwrap(),
            ("flags".to_string(), json!([1, 2]))
        );
        assert_eq!(
            parse_var("region=eu-west").unwrap(),
            ("region".to_string(), json!("eu-west"))
        );
        assert_eq!(
            parse_var("url=https://a.example/?x=1").unwrap(),
            ("url".to_string(), json!("https://a.example/?x=1"))
        );
    }

    #[test]
    fn test_split_pair_rejects_missing_key() {
        assert!(split_pair("novalue").is_err());
        assert!(split_pair("=value").is_err());
        assert_eq!(split_pair("k=").unwrap(), ("k", ""));
    }
}
