//! Execution tracking types: executions, per-node attempts, checkpoints and
//! diagnostic snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a workflow triggered by a single event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub workflow_id: String,
    /// How this run was triggered (e.g. "webhook", "batch", "manual").
    pub trigger_type: String,
    pub trigger_data: Value,
    pub status: ExecutionStatus,
    /// Environment whose variables and overrides apply.
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When a waiting execution should be re-evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_check_at: Option<DateTime<Utc>>,
    /// Coordinator instance that last claimed the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Uuid>,
    /// A running execution belongs to `owner` until this instant. The
    /// driver renews it while nodes are in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Bumped on every write; updates compare-and-swap on it.
    #[serde(default)]
    pub version: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Running under a lease that has not lapsed.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Running && self.lease_expires_at.is_some_and(|t| t > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    /// Parked on a persisted suspension (open breaker, in-flight key).
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Forward transitions. `Failed -> Running` is only reachable through an
    /// explicit resume and is checked separately by [`Self::can_resume`].
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Running)
                | (Running, Waiting)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Waiting, Running)
                | (Waiting, Failed)
                | (Waiting, Cancelled)
        )
    }

    /// Statuses a resume-from-checkpoint may pick up.
    pub fn can_resume(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending
                | ExecutionStatus::Running
                | ExecutionStatus::Waiting
                | ExecutionStatus::Failed
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "waiting" => Ok(ExecutionStatus::Waiting),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Node Execution
// ---------------------------------------------------------------------------

/// Runtime record of one dispatch attempt of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    /// 1-based attempt number within the current dispatch.
    pub attempt: u32,
    pub status: NodeStatus,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Successors chosen by a routing node. `None` means all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeStatus::Pending),
            "running" => Ok(NodeStatus::Running),
            "succeeded" => Ok(NodeStatus::Succeeded),
            "failed" => Ok(NodeStatus::Failed),
            "skipped" => Ok(NodeStatus::Skipped),
            other => Err(format!("invalid node status: '{other}'")),
        }
    }
}

/// Successful result returned by a node executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub output: Value,
    /// Routing decision: only these successors become live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,
    /// Number of external calls the executor made (diagnostics only).
    #[serde(default)]
    pub outbound_calls: u32,
}

impl NodeOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            branches: None,
            outbound_calls: 0,
        }
    }

    pub fn with_branches(mut self, branches: Vec<String>) -> Self {
        self.branches = Some(branches);
        self
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Immutable, ordered snapshot of execution state enabling resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: Uuid,
    /// Strictly increasing per execution, starting at 1.
    pub sequence_number: u64,
    /// Node whose completion produced this checkpoint (None for lifecycle checkpoints).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub state: CheckpointState,
    /// False once the execution reached a state resume must not pick up.
    pub can_resume: bool,
    /// Hex SHA-256 of the serialized state.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to rebuild an execution's progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Output of every succeeded node.
    #[serde(default)]
    pub node_outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub node_status: BTreeMap<String, NodeStatus>,
    /// Branch choices of routing nodes.
    #[serde(default)]
    pub routes: BTreeMap<String, Vec<String>>,
}

/// Per-attempt instrumentation. Diagnostic only, never read for control decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub execution_id: Uuid,
    pub sequence_number: u64,
    pub node_id: String,
    pub attempt: u32,
    pub duration_ms: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub outbound_calls: u32,
    /// "succeeded", "transient_error", "permanent_error", "timeout" or "cached".
    pub outcome: String,
    pub recorded_at: DateTime<Utc>,
}
