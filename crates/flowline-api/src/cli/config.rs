//! Engine configuration inspection.

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;
use console::style;
use flowline_infra::config::{config_path, read_engine_config, secret_from_env};
use flowline_types::config::EngineConfig;

use crate::cli::print_json;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Parse config.toml strictly and print the effective settings.
    Check,
}

pub async fn handle_config_command(cmd: ConfigCommand, data_dir: &Path, json: bool) -> Result<()> {
    match cmd {
        ConfigCommand::Check => {
            let path = config_path(data_dir);
            let (config, found) = match read_engine_config(data_dir).await? {
                Some(config) => (config, true),
                None => (EngineConfig::default(), false),
            };
            if json {
                return print_json(&config);
            }
            print_summary(&config, &path, found);
            Ok(())
        }
    }
}

fn print_summary(config: &EngineConfig, path: &Path, found: bool) {
    println!();
    if found {
        println!(
            "  {} {} is valid",
            style("✓").green().bold(),
            style(path.display()).cyan()
        );
    } else {
        println!(
            "  {} {} not found, using defaults",
            style("i").blue().bold(),
            style(path.display()).cyan()
        );
    }
    println!();

    let engine = &config.engine;
    println!("  {}", style("Engine").bold());
    println!("    default environment  {}", engine.default_environment);
    println!("    poll interval        {} ms", engine.poll_interval_ms);
    println!("    driver lease         {} s", engine.stall_threshold_secs);
    println!("    node timeout         {} s", engine.node_timeout_secs);
    println!();

    println!("  {}", style("Resilience").bold());
    println!(
        "    retry                {} attempts",
        config.retry.max_attempts
    );
    println!(
        "    circuit breaker      {} failures in {} s, open {} s",
        config.circuit_breaker.failure_threshold,
        config.circuit_breaker.window_seconds,
        config.circuit_breaker.timeout_seconds
    );
    println!(
        "    dead letters         {} attempts, {}..{} ms backoff",
        config.dead_letter.max_attempts,
        config.dead_letter.base_delay_ms,
        config.dead_letter.max_delay_ms
    );
    println!();

    if !config.executors.is_empty() {
        println!("  {}", style("Executors").bold());
        for (node_type, endpoint) in &config.executors {
            println!("    {:<20} {}", node_type, endpoint.url);
        }
        println!();
    }

    let server = &config.server;
    println!("  {}", style("Server").bold());
    println!("    bind                 {}", server.bind);
    println!(
        "    operator token       {}",
        env_status(&server.api_token_env)
    );
    println!(
        "    trigger secret       {}",
        env_status(&server.trigger_secret_env)
    );
    println!();
}

fn env_status(var: &str) -> String {
    match secret_from_env(var) {
        Some(_) => format!("{} ({var})", style("set").green()),
        None => format!("{} ({var}, auth disabled)", style("unset").yellow()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_accepts_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        handle_config_command(ConfigCommand::Check, dir.path(), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_check_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(config_path(dir.path()), "[engine\npoll_interval_ms = 5").unwrap();

        let err = handle_config_command(ConfigCommand::Check, dir.path(), true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }
}
