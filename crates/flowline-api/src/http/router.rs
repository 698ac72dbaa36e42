//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`. `/triggers` is authenticated by body
//! signature; every other route requires the operator token.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use flowline_core::repository::EngineStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router<S: EngineStore>(state: AppState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Trigger ingestion
        .route("/triggers", post(handlers::trigger::ingest_trigger::<S>))
        // Workflows
        .route(
            "/workflows",
            get(handlers::workflow::list_workflows::<S>)
                .post(handlers::workflow::register_workflow::<S>),
        )
        .route("/workflows/{id}", get(handlers::workflow::get_workflow::<S>))
        // Executions
        .route("/executions", get(handlers::execution::list_executions::<S>))
        .route("/executions/{id}", get(handlers::execution::get_execution::<S>))
        .route(
            "/executions/{id}/cancel",
            post(handlers::execution::cancel_execution::<S>),
        )
        .route(
            "/executions/{id}/resume",
            post(handlers::execution::resume_execution::<S>),
        )
        // Dead letters
        .route(
            "/dead-letters",
            get(handlers::dead_letter::list_dead_letters::<S>),
        )
        .route(
            "/dead-letters/{execution_id}/replay",
            post(handlers::dead_letter::replay_dead_letter::<S>),
        )
        // Circuit breakers
        .route(
            "/circuits/{workflow_id}",
            get(handlers::circuit::list_circuits::<S>),
        )
        .route(
            "/circuits/{workflow_id}/{node_id}",
            get(handlers::circuit::get_circuit::<S>).put(handlers::circuit::force_circuit::<S>),
        )
        // Environments
        .route(
            "/environments/{workflow_id}/promote",
            post(handlers::environment::promote_environment::<S>),
        )
        .route(
            "/environments/{workflow_id}/promotions",
            get(handlers::environment::list_promotions::<S>),
        )
        .route(
            "/environments/{workflow_id}/{env}",
            get(handlers::environment::get_environment::<S>)
                .put(handlers::environment::set_environment::<S>),
        )
        .route(
            "/promotions/{id}/rollback",
            post(handlers::environment::rollback_promotion::<S>),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint (no auth required).
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
