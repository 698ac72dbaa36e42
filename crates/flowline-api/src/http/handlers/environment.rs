//! Per-environment configuration and promotion.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use flowline_core::repository::EngineStore;
use flowline_types::environment::{Environment, EnvironmentConfig, Promotion};
use flowline_types::workflow::{CircuitBreakerPolicy, RateLimitPolicy};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::auth::Operator;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Body of `PUT /environments/:workflow_id/:env`. Replaces the whole config.
#[derive(Debug, Deserialize)]
pub struct EnvironmentBody {
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub secret_refs: BTreeMap<String, String>,
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitPolicy>,
    #[serde(default)]
    pub circuit_breakers: BTreeMap<String, CircuitBreakerPolicy>,
}

#[derive(Debug, Deserialize)]
pub struct PromoteBody {
    pub from: Environment,
    pub to: Environment,
}

fn parse_env(name: &str) -> Result<Environment, AppError> {
    name.parse().map_err(AppError::Validation)
}

/// GET /api/v1/environments/:workflow_id/:env
pub async fn get_environment<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path((workflow_id, env)): Path<(String, String)>,
) -> Result<Json<ApiResponse<EnvironmentConfig>>, AppError> {
    let timer = RequestTimer::start();
    let environment = parse_env(&env)?;
    let config = state
        .coordinator
        .environments()
        .get(&workflow_id, environment)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("workflow '{workflow_id}' has no {environment} config"))
        })?;
    Ok(Json(timer.success(config)))
}

/// PUT /api/v1/environments/:workflow_id/:env
pub async fn set_environment<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path((workflow_id, env)): Path<(String, String)>,
    Json(body): Json<EnvironmentBody>,
) -> Result<Json<ApiResponse<EnvironmentConfig>>, AppError> {
    let timer = RequestTimer::start();
    let environment = parse_env(&env)?;
    // Only configs for registered workflows.
    state.coordinator.get_workflow(&workflow_id).await?;

    let config = EnvironmentConfig {
        workflow_id,
        environment,
        variables: body.variables,
        secret_refs: body.secret_refs,
        rate_limits: body.rate_limits,
        circuit_breakers: body.circuit_breakers,
        updated_at: chrono::Utc::now(),
    };
    let saved = state.coordinator.environments().set(config).await?;
    Ok(Json(timer.success(saved)))
}

/// POST /api/v1/environments/:workflow_id/promote
pub async fn promote_environment<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path(workflow_id): Path<String>,
    Json(body): Json<PromoteBody>,
) -> Result<Json<ApiResponse<Promotion>>, AppError> {
    let timer = RequestTimer::start();
    let promotion = state
        .coordinator
        .environments()
        .promote(&workflow_id, body.from, body.to)
        .await?;
    let rollback = format!("/api/v1/promotions/{}/rollback", promotion.id);
    Ok(Json(timer.success(promotion).with_link("rollback", &rollback)))
}

/// GET /api/v1/environments/:workflow_id/promotions - Most recent first.
pub async fn list_promotions<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path(workflow_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<Promotion>>>, AppError> {
    let timer = RequestTimer::start();
    let promotions = state
        .coordinator
        .environments()
        .list_promotions(&workflow_id)
        .await?;
    Ok(Json(timer.success(promotions)))
}

/// POST /api/v1/promotions/:id/rollback
pub async fn rollback_promotion<S: EngineStore>(
    State(state): State<AppState<S>>,
    _auth: Operator,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Promotion>>, AppError> {
    let timer = RequestTimer::start();
    let promotion = state.coordinator.environments().rollback(id).await?;
    Ok(Json(timer.success(promotion)))
}
