//! Operator authentication extractor.
//!
//! Operator routes take `Authorization: Bearer <token>`, compared in constant
//! time against the token named by `[server].api_token_env`. With no token
//! configured the routes are open.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use flowline_core::repository::EngineStore;
use flowline_infra::signature::authorize_operator;

use crate::http::error::AppError;
use crate::state::AppState;

/// Authenticated operator marker. Extracting this validates the token.
pub struct Operator;

impl<S: EngineStore> FromRequestParts<AppState<S>> for Operator {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<S>,
    ) -> Result<Self, Self::Rejection> {
        let header = match parts.headers.get(axum::http::header::AUTHORIZATION) {
            Some(value) => Some(value.to_str().map_err(|_| {
                AppError::Unauthorized("Invalid Authorization header encoding".to_string())
            })?),
            None => None,
        };

        authorize_operator(state.api_token.as_deref(), header.map(str::trim)).map_err(|e| {
            tracing::warn!(path = parts.uri.path(), error = %e, "operator authentication failed");
            AppError::from(e)
        })?;
        Ok(Operator)
    }
}
