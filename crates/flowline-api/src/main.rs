//! Flowline CLI and REST API entry point.
//!
//! Binary name: `flowline`
//!
//! Parses CLI arguments, opens the engine store, then dispatches to the
//! appropriate command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use flowline_core::engine::TriggerRequest;
use flowline_core::repository::EngineStore;
use flowline_infra::config::{load_engine_config, resolve_data_dir};
use flowline_observe::{LogFormat, TracingOptions, default_filter, init_tracing, shutdown_tracing};

use cli::{Cli, Commands, LogFormatArg};
use state::{AppState, EphemeralState, PersistentState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        filter: default_filter(cli.quiet, cli.verbose).to_string(),
        format: match cli.log_format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        },
        otel: cli.otel,
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "flowline", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);

    // Config check must report parse errors instead of falling back to defaults
    if let Commands::Config { action } = cli.command {
        return cli::config::handle_config_command(action, &data_dir, cli.json).await;
    }

    let config = load_engine_config(&data_dir).await;
    if cli.ephemeral {
        run(cli, EphemeralState::ephemeral(config, data_dir)).await
    } else {
        run(cli, PersistentState::init(data_dir, config).await?).await
    }
}

async fn run<S: EngineStore>(cli: Cli, state: AppState<S>) -> anyhow::Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Serve { bind, no_worker } => cli::serve::serve(state, bind, no_worker).await,
        Commands::Worker { once } => cli::serve::worker(state, once, json).await,
        Commands::Run {
            file,
            data,
            environment,
        } => cli::workflow::run_file(&state, &file, &data, environment, json).await,
        Commands::Trigger {
            workflow_id,
            data,
            trigger_type,
            idempotency_key,
            environment,
        } => {
            let mut request = TriggerRequest::new(
                workflow_id,
                trigger_type,
                cli::parse_json_arg("--data", &data)?,
            );
            request.idempotency_key = idempotency_key;
            request.environment = environment;
            cli::execution::trigger(&state, request, json).await
        }
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, json).await
        }
        Commands::Execution { action } => {
            cli::execution::handle_execution_command(action, &state, json).await
        }
        Commands::DeadLetter { action } => {
            cli::dead_letter::handle_dead_letter_command(action, &state, json).await
        }
        Commands::Circuit { action } => {
            cli::circuit::handle_circuit_command(action, &state, json).await
        }
        Commands::Env { action } => cli::env::handle_env_command(action, &state, json).await,
        Commands::Config { .. } | Commands::Completions { .. } => {
            unreachable!("handled before state initialization")
        }
    }
}
