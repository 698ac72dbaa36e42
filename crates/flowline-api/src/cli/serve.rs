//! Long-running processes: the REST server and the background worker.

use std::time::Duration;

use anyhow::Result;
use console::style;
use flowline_core::engine::Worker;
use flowline_core::event::EventBus;
use flowline_core::repository::EngineStore;
use flowline_types::event::EngineEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::cli::print_json;
use crate::http::router::build_router;
use crate::state::AppState;

/// Serve the API until Ctrl+C or SIGTERM, running the worker alongside
/// unless `no_worker` is set.
pub async fn serve<S: EngineStore>(
    state: AppState<S>,
    bind: Option<String>,
    no_worker: bool,
) -> Result<()> {
    let addr = bind.unwrap_or_else(|| state.config().server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let shutdown = CancellationToken::new();
    let events = tokio::spawn(log_events(state.coordinator.events().clone(), shutdown.clone()));
    let worker = if no_worker {
        None
    } else {
        let interval = Duration::from_millis(state.config().engine.poll_interval_ms);
        let worker = Worker::new(state.coordinator.clone());
        let token = shutdown.clone();
        Some(tokio::spawn(async move { worker.run(interval, token).await }))
    };

    tracing::info!(
        addr = addr.as_str(),
        data_dir = %state.data_dir.display(),
        worker = !no_worker,
        "server starting"
    );
    if state.api_token.is_none() {
        tracing::warn!(
            var = state.config().server.api_token_env.as_str(),
            "operator routes are unauthenticated"
        );
    }
    println!(
        "  {} Flowline API listening on {}",
        style("⚡").bold(),
        style(format!("http://{addr}")).cyan()
    );
    println!("  {}", style("Press Ctrl+C to stop").dim());

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Some(worker) = worker {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "worker task panicked");
        }
    }
    let _ = events.await;

    println!("\n  Server stopped.");
    Ok(())
}

/// Run the worker loop, or a single sweep with `once`.
pub async fn worker<S: EngineStore>(state: AppState<S>, once: bool, json: bool) -> Result<()> {
    let worker = Worker::new(state.coordinator.clone());

    if once {
        let report = worker.tick().await;
        if json {
            return print_json(&report);
        }
        println!();
        if report.is_idle() {
            println!("  {} Nothing due.", style("✓").green().bold());
        } else {
            println!(
                "  {} woke {}, redelivered {}, flushed {}, recovered {}, purged {}",
                style("✓").green().bold(),
                report.woken,
                report.redelivered,
                report.flushed,
                report.recovered,
                report.purged
            );
        }
        println!();
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let events = tokio::spawn(log_events(state.coordinator.events().clone(), shutdown.clone()));
    let interval = Duration::from_millis(state.config().engine.poll_interval_ms);
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(interval, token).await });

    println!("  {}", style("Worker running. Press Ctrl+C to stop").dim());
    shutdown_signal().await;
    shutdown.cancel();
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "worker task panicked");
    }
    let _ = events.await;
    Ok(())
}

/// Mirror engine events into the log. Abandoned dead letters need an
/// operator, so they log at error.
async fn log_events(bus: EventBus, shutdown: CancellationToken) {
    let mut rx = bus.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => received,
        };
        match event {
            Ok(EngineEvent::DeadLetterAbandoned {
                execution_id,
                workflow_id,
                error,
                attempt_count,
            }) => {
                tracing::error!(
                    execution_id = %execution_id,
                    workflow_id = workflow_id.as_str(),
                    attempt_count,
                    error = error.as_str(),
                    "dead letter abandoned, operator action required"
                );
            }
            Ok(EngineEvent::CircuitStateChanged {
                workflow_id,
                node_id,
                from,
                to,
            }) => {
                tracing::info!(
                    workflow_id = workflow_id.as_str(),
                    node_id = node_id.as_str(),
                    from = %from,
                    to = %to,
                    "circuit state changed"
                );
            }
            Ok(event) => tracing::debug!(?event, "engine event"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event logger lagged behind the bus");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_event_logger_stops_on_shutdown() {
        let bus = EventBus::new(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(log_events(bus.clone(), shutdown.clone()));

        bus.publish(EngineEvent::ExecutionCompleted {
            execution_id: Uuid::now_v7(),
        });
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
