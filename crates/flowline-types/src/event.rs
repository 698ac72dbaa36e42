//! Engine events published on the in-process event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resilience::CircuitState;

/// Lifecycle notifications. Subscribers log them, stream them, or forward
/// abandoned dead letters to alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
    },
    NodeStarted {
        execution_id: Uuid,
        node_id: String,
        attempt: u32,
    },
    NodeSucceeded {
        execution_id: Uuid,
        node_id: String,
        duration_ms: u64,
        cached: bool,
    },
    NodeFailed {
        execution_id: Uuid,
        node_id: String,
        error: String,
        will_retry: bool,
    },
    NodeSkipped {
        execution_id: Uuid,
        node_id: String,
    },
    ExecutionWaiting {
        execution_id: Uuid,
        reason: String,
        next_check_at: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: Uuid,
    },
    ExecutionFailed {
        execution_id: Uuid,
        error: String,
    },
    ExecutionCancelled {
        execution_id: Uuid,
    },
    CircuitStateChanged {
        workflow_id: String,
        node_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    DeadLetterEnqueued {
        execution_id: Uuid,
        error: String,
    },
    DeadLetterAbandoned {
        execution_id: Uuid,
        workflow_id: String,
        error: String,
        attempt_count: u32,
    },
    BatchFlushed {
        workflow_id: String,
        node_id: String,
        count: u32,
    },
}

impl EngineEvent {
    /// Execution the event belongs to, if any.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::ExecutionStarted { execution_id, .. }
            | EngineEvent::NodeStarted { execution_id, .. }
            | EngineEvent::NodeSucceeded { execution_id, .. }
            | EngineEvent::NodeFailed { execution_id, .. }
            | EngineEvent::NodeSkipped { execution_id, .. }
            | EngineEvent::ExecutionWaiting { execution_id, .. }
            | EngineEvent::ExecutionCompleted { execution_id }
            | EngineEvent::ExecutionFailed { execution_id, .. }
            | EngineEvent::ExecutionCancelled { execution_id }
            | EngineEvent::DeadLetterEnqueued { execution_id, .. }
            | EngineEvent::DeadLetterAbandoned { execution_id, .. } => Some(*execution_id),
            EngineEvent::CircuitStateChanged { .. } | EngineEvent::BatchFlushed { .. } => None,
        }
    }
}
