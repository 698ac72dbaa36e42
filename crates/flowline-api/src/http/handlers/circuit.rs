//! Circuit breaker inspection and operator overrides.

use axum::Json;
use axum::extract::{Path, State};
use flowline_core::repository::EngineStore;
use flowline_types::resilience::{CircuitBreakerRecord, CircuitState};
use serde::Deserialize;

use crate::http::error::AppError;
use crate::http::extractors::auth::Operator;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ForceCircuitBody {
    pub state: CircuitState,
}

/// GET /api/v1/circuits/:workflow_id
pub async fn list_circuits<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path(workflow_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<CircuitBreakerRecord>>>, AppError> {
    let timer = RequestTimer::start();
    let records = state.coordinator.list_circuits(&workflow_id).await?;
    Ok(Json(timer.success(records)))
}

/// GET /api/v1/circuits/:workflow_id/:node_id
pub async fn get_circuit<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path((workflow_id, node_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<CircuitBreakerRecord>>, AppError> {
    let timer = RequestTimer::start();
    let record = state
        .coordinator
        .get_circuit(&workflow_id, &node_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no circuit breaker recorded for {workflow_id}/{node_id}"
            ))
        })?;
    Ok(Json(timer.success(record)))
}

/// PUT /api/v1/circuits/:workflow_id/:node_id - Force `{"state": "open"}`,
/// `"closed"` or `"half_open"`.
pub async fn force_circuit<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path((workflow_id, node_id)): Path<(String, String)>,
    Json(body): Json<ForceCircuitBody>,
) -> Result<Json<ApiResponse<CircuitBreakerRecord>>, AppError> {
    let timer = RequestTimer::start();
    let record = state
        .coordinator
        .force_circuit_state(&workflow_id, &node_id, body.state)
        .await?;
    Ok(Json(timer.success(record)))
}
