use thiserror::Error;

/// Errors from repository operations (used by trait definitions in flowline-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Outcome of a failed node executor invocation.
///
/// The executor decides which class a failure belongs to; the engine only
/// retries `Transient` failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    /// Retryable failure (timeouts, 5xx, connection resets).
    #[error("transient node error: {0}")]
    Transient(String),

    /// Non-retryable failure (bad input, 4xx, contract violations).
    #[error("permanent node error: {0}")]
    Permanent(String),
}

impl NodeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            NodeError::Transient(m) | NodeError::Permanent(m) => m,
        }
    }
}
