//! Dead letter entries: executions that exhausted their retries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Captured failed execution awaiting scheduled or manual redelivery.
///
/// Keyed by `execution_id`: an execution has at most one dead letter, which
/// is rescheduled on each renewed failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub execution_id: Uuid,
    pub workflow_id: String,
    /// Full trigger payload, kept so the run can be reconstructed.
    pub trigger_data: Value,
    pub error: String,
    /// Redelivery attempts made so far.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
    /// Latest checkpoint at the time of capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_sequence: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    /// Claimed by a worker; the resumed execution is running.
    Retrying,
    Resolved,
    /// Out of attempts; needs an operator.
    Abandoned,
}

impl DeadLetterStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeadLetterStatus::Resolved | DeadLetterStatus::Abandoned)
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterStatus::Pending => write!(f, "pending"),
            DeadLetterStatus::Retrying => write!(f, "retrying"),
            DeadLetterStatus::Resolved => write!(f, "resolved"),
            DeadLetterStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeadLetterStatus::Pending),
            "retrying" => Ok(DeadLetterStatus::Retrying),
            "resolved" => Ok(DeadLetterStatus::Resolved),
            "abandoned" => Ok(DeadLetterStatus::Abandoned),
            other => Err(format!("invalid dead letter status: '{other}'")),
        }
    }
}
