//! Engine error taxonomy.

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

use crate::workflow::definition::WorkflowError;

/// Errors produced by the execution coordinator and its components.
///
/// Dispatch errors carry enough context to decide what happens to the
/// execution: retry locally, park it, fail it, or dead-letter it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("node '{node_id}' failed permanently: {message}")]
    PermanentNode { node_id: String, message: String },

    #[error("node '{node_id}' failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        node_id: String,
        attempts: u32,
        message: String,
    },

    /// Dispatch refused by an open breaker or an occupied half-open probe.
    #[error("circuit open for node '{node_id}' until {retry_at}")]
    CircuitOpen {
        node_id: String,
        retry_at: DateTime<Utc>,
    },

    #[error("rate limit '{limit_key}' exceeded for node '{node_id}' after waiting {waited_ms}ms")]
    RateLimitExceeded {
        node_id: String,
        limit_key: String,
        waited_ms: u64,
    },

    #[error("idempotency key '{key}' is held by another in-flight dispatch")]
    IdempotencyConflict { key: String },

    #[error("checkpoint {sequence} of execution {execution_id} is corrupt: {reason}")]
    CheckpointCorruption {
        execution_id: Uuid,
        sequence: u64,
        reason: String,
    },

    #[error("execution {0} was cancelled")]
    Cancelled(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("node '{node_id}' not found in workflow '{workflow_id}'")]
    NodeNotFound { workflow_id: String, node_id: String },

    #[error("no executor registered for node type '{0}'")]
    ExecutorNotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("optimistic update on {0} kept losing the race")]
    Contention(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// Conditions that park an execution instead of failing it. Lost CAS
    /// races are expected under contention and only need a later recheck.
    pub fn is_deferral(&self) -> bool {
        matches!(
            self,
            EngineError::CircuitOpen { .. }
                | EngineError::IdempotencyConflict { .. }
                | EngineError::Contention(_)
        )
    }

    /// Failures handed to the dead letter queue for scheduled redelivery.
    /// Includes storage outages hit while dispatching a node.
    pub fn is_dead_letterable(&self) -> bool {
        matches!(
            self,
            EngineError::RetriesExhausted { .. }
                | EngineError::RateLimitExceeded { .. }
                | EngineError::Repository(RepositoryError::Connection | RepositoryError::Query(_))
        )
    }
}
