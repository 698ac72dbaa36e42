//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowline_core::error::EngineError;
use flowline_infra::signature::SignatureError;
use flowline_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    NotFound(String),
    Unauthorized(String),
    Validation(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<SignatureError> for AppError {
    fn from(e: SignatureError) -> Self {
        AppError::Unauthorized(e.to_string())
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Engine(e) => {
                let (status, code) = engine_status(e);
                (status, code, e.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        }
    }
}

fn engine_status(e: &EngineError) -> (StatusCode, &'static str) {
    match e {
        EngineError::ExecutionNotFound(_) => (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND"),
        EngineError::WorkflowNotFound(_) => (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND"),
        EngineError::NodeNotFound { .. } => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
        EngineError::InvalidRequest(_) | EngineError::Workflow(_) => {
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
        }
        EngineError::InvalidTransition(_) => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
        EngineError::IdempotencyConflict { .. } => (StatusCode::CONFLICT, "IDEMPOTENCY_CONFLICT"),
        EngineError::Contention(_) => (StatusCode::CONFLICT, "CONTENTION"),
        EngineError::Cancelled(_) => (StatusCode::CONFLICT, "EXECUTION_CANCELLED"),
        EngineError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN"),
        EngineError::RateLimitExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
        EngineError::PermanentNode { .. }
        | EngineError::RetriesExhausted { .. } => (StatusCode::BAD_GATEWAY, "NODE_FAILED"),
        EngineError::ExecutorNotFound(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "EXECUTOR_NOT_FOUND")
        }
        EngineError::CheckpointCorruption { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "CHECKPOINT_CORRUPTION")
        }
        EngineError::Repository(RepositoryError::NotFound) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        EngineError::Repository(RepositoryError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
        EngineError::Repository(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, error = message.as_str(), "request failed");
        }
        (status, Json(ApiResponse::error(code, &message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_engine_errors_map_to_status_codes() {
        let cases = [
            (
                EngineError::ExecutionNotFound(Uuid::now_v7()),
                StatusCode::NOT_FOUND,
            ),
            (
                EngineError::InvalidTransition("completed".into()),
                StatusCode::CONFLICT,
            ),
            (
                EngineError::InvalidRequest("bad status".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                EngineError::CheckpointCorruption {
                    execution_id: Uuid::now_v7(),
                    sequence: 3,
                    reason: "checksum mismatch".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                EngineError::Repository(RepositoryError::Conflict("dup".into())),
                StatusCode::CONFLICT,
            ),
        ];
        for (error, expected) in cases {
            let (status, _, _) = AppError::from(error).parts();
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn test_signature_error_is_unauthorized() {
        let (status, code, _) = AppError::from(SignatureError::SignatureMismatch).parts();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code, "UNAUTHORIZED");
    }
}
