//! Workflow definition registration and lookup.

use axum::Json;
use axum::extract::{Path, State};
use flowline_core::repository::EngineStore;
use flowline_types::workflow::WorkflowDefinition;

use crate::http::error::AppError;
use crate::http::extractors::auth::Operator;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// POST /api/v1/workflows - Register (or replace) a definition. The
/// definition is validated before it is stored.
pub async fn register_workflow<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Json(body): Json<WorkflowDefinition>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let timer = RequestTimer::start();
    let def = state.coordinator.register_workflow(body).await?;
    let href = format!("/api/v1/workflows/{}", def.id);
    Ok(Json(timer.success(def).with_link("self", &href)))
}

/// GET /api/v1/workflows
pub async fn list_workflows<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
) -> Result<Json<ApiResponse<Vec<WorkflowDefinition>>>, AppError> {
    let timer = RequestTimer::start();
    let defs = state.coordinator.list_workflows().await?;
    Ok(Json(timer.success(defs).with_link("self", "/api/v1/workflows")))
}

/// GET /api/v1/workflows/:id
pub async fn get_workflow<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let timer = RequestTimer::start();
    let def = state.coordinator.get_workflow(&id).await?;
    Ok(Json(
        timer
            .success(def)
            .with_link("executions", &format!("/api/v1/executions?workflow_id={id}")),
    ))
}
