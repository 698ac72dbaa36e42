//! Trigger ingestion.
//!
//! `POST /api/v1/triggers` accepts `{workflow_id, trigger_type, trigger_data,
//! idempotency_key?, environment?}`. When a trigger secret is configured the
//! raw body must carry a matching `X-Flowline-Signature: sha256=<hex>`.
//! Executions are driven on a background task; the response returns as soon
//! as the execution exists (or the event is buffered in a batch window).

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use flowline_core::engine::{Ingested, RunMode, TriggerRequest};
use flowline_core::repository::EngineStore;
use flowline_infra::signature::{SIGNATURE_HEADER, authorize_trigger};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// POST /api/v1/triggers
pub async fn ingest_trigger<S: EngineStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<Ingested>>), AppError> {
    let timer = RequestTimer::start();

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    authorize_trigger(state.trigger_secret.as_deref(), &body, signature).map_err(|e| {
        tracing::warn!(error = %e, "trigger rejected");
        AppError::from(e)
    })?;

    let request: TriggerRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("invalid trigger body: {e}")))?;

    let ingested = state
        .coordinator
        .ingest_trigger(request, RunMode::Background)
        .await?;

    let link = match &ingested {
        Ingested::Started(started) => Some(format!("/api/v1/executions/{}", started.execution_id)),
        Ingested::Buffered { .. } => None,
    };
    let mut resp = timer.success(ingested);
    if let Some(href) = link {
        resp = resp.with_link("execution", &href);
    }

    Ok((StatusCode::ACCEPTED, Json(resp)))
}
