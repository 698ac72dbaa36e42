//! Query parameter extractors for list endpoints.

use serde::Deserialize;

/// Query parameters for `GET /executions`.
#[derive(Debug, Deserialize)]
pub struct ExecutionListQuery {
    pub workflow_id: Option<String>,
    /// pending, running, waiting, completed, failed or cancelled.
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

/// Query parameters for `GET /dead-letters`.
#[derive(Debug, Deserialize)]
pub struct DeadLetterListQuery {
    /// pending, retrying, resolved or abandoned.
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}
