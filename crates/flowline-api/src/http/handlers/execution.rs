//! Execution inspection and control.

use axum::Json;
use axum::extract::{Path, Query, State};
use flowline_core::engine::ExecutionView;
use flowline_core::repository::EngineStore;
use flowline_types::execution::{Execution, ExecutionStatus};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::auth::Operator;
use crate::http::extractors::query::ExecutionListQuery;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// GET /api/v1/executions - Most recent first.
pub async fn list_executions<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Query(query): Query<ExecutionListQuery>,
) -> Result<Json<ApiResponse<Vec<Execution>>>, AppError> {
    let timer = RequestTimer::start();

    let status = query
        .status
        .as_deref()
        .map(str::parse::<ExecutionStatus>)
        .transpose()
        .map_err(AppError::Validation)?;

    let executions = state
        .coordinator
        .list_executions(query.workflow_id.as_deref(), status, query.limit)
        .await?;

    Ok(Json(timer.success(executions).with_link("self", "/api/v1/executions")))
}

/// GET /api/v1/executions/:id - Execution with node records, checkpoints,
/// snapshots and its dead letter.
pub async fn get_execution<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ExecutionView>>, AppError> {
    let timer = RequestTimer::start();
    let view = state.coordinator.get_execution(id).await?;

    let workflow = format!("/api/v1/workflows/{}", view.execution.workflow_id);
    Ok(Json(
        timer
            .success(view)
            .with_link("self", &format!("/api/v1/executions/{id}"))
            .with_link("workflow", &workflow),
    ))
}

/// POST /api/v1/executions/:id/cancel
pub async fn cancel_execution<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state.coordinator.cancel_execution(id).await?;
    Ok(Json(timer.success(execution)))
}

/// POST /api/v1/executions/:id/resume - Drives the execution until it
/// settles and returns the settled record.
pub async fn resume_execution<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state.coordinator.resume_execution(id).await?;
    Ok(Json(
        timer
            .success(execution)
            .with_link("self", &format!("/api/v1/executions/{id}")),
    ))
}
