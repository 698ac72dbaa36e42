//! Dead letter triage.

use axum::Json;
use axum::extract::{Path, Query, State};
use flowline_core::repository::EngineStore;
use flowline_types::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use flowline_types::execution::Execution;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::auth::Operator;
use crate::http::extractors::query::DeadLetterListQuery;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// GET /api/v1/dead-letters - Optionally filtered by status.
pub async fn list_dead_letters<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Query(query): Query<DeadLetterListQuery>,
) -> Result<Json<ApiResponse<Vec<DeadLetterEntry>>>, AppError> {
    let timer = RequestTimer::start();

    let status = query
        .status
        .as_deref()
        .map(str::parse::<DeadLetterStatus>)
        .transpose()
        .map_err(AppError::Validation)?;

    let entries = state
        .coordinator
        .list_dead_letters(status, query.limit)
        .await?;

    Ok(Json(timer.success(entries).with_link("self", "/api/v1/dead-letters")))
}

/// POST /api/v1/dead-letters/:execution_id/replay - Redeliver now, reviving
/// an abandoned entry.
pub async fn replay_dead_letter<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state.coordinator.replay_dead_letter(execution_id).await?;
    tracing::info!(
        execution_id = %execution_id,
        status = %execution.status,
        "dead letter replayed by operator"
    );
    Ok(Json(
        timer
            .success(execution)
            .with_link("execution", &format!("/api/v1/executions/{execution_id}")),
    ))
}
