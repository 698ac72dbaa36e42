//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the canonical form of an automation: a trigger
//! feeds a DAG of nodes, each node naming a `node_type` that an external
//! executor plugin implements. Definitions are authored as YAML or JSON and
//! stored verbatim; every resilience knob (retry, breaker, limiter,
//! idempotency, checkpointing, batching) is optional and falls back to the
//! engine configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable, user-chosen identifier (e.g. "lead-enrichment").
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Nodes forming the DAG. Order is irrelevant; edges come from `depends_on`.
    pub nodes: Vec<NodeDefinition>,
    /// Workflow-wide retry policy, overridden per node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Workflow-wide breaker thresholds, overridden per node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    /// Token bucket settings keyed by limit key (node type or integration name).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rate_limits: BTreeMap<String, RateLimitPolicy>,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<IdempotencyPolicy>,
    /// Coalesce trigger bursts into one execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batching: Option<BatchingPolicy>,
    /// Node timeout for nodes that set none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

// ---------------------------------------------------------------------------
// Node Definition
// ---------------------------------------------------------------------------

/// A single node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique within a workflow (e.g. "enrich-lead").
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Executor plugin that runs this node (e.g. "http", "crm_write").
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// How predecessors gate this node. Only meaningful with predecessors.
    #[serde(default)]
    pub join: JoinPolicy,
    /// Node performs an external effect (email, CRM write, payment).
    #[serde(default)]
    pub side_effecting: bool,
    /// Side effects are guarded by the idempotency registry. Ignored when
    /// the node is not side-effecting.
    #[serde(default = "default_true")]
    pub idempotent: bool,
    /// Re-running an interrupted attempt is harmless even without a guard.
    #[serde(default)]
    pub safe_to_repeat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    /// Token bucket to draw from. Defaults to the node type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_key: Option<String>,
    /// Opaque node-type configuration handed to the executor.
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_contract: Option<PayloadContract>,
}

fn default_true() -> bool {
    true
}

impl NodeDefinition {
    pub fn limit_key(&self) -> &str {
        self.rate_limit_key.as_deref().unwrap_or(&self.node_type)
    }

    /// Whether dispatch must go through the idempotency registry.
    pub fn is_guarded(&self) -> bool {
        self.side_effecting && self.idempotent
    }

    /// Whether an attempt whose outcome is unknown may be dispatched again.
    pub fn is_repeatable(&self) -> bool {
        !self.side_effecting || self.idempotent || self.safe_to_repeat
    }
}

/// How a join node combines its predecessors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Every predecessor must succeed.
    #[default]
    All,
    /// The first live predecessor releases the node.
    Any,
}

// ---------------------------------------------------------------------------
// Resilience policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive probe successes needed to close from half-open.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long the breaker stays open after the tripping failure.
    #[serde(default = "default_breaker_timeout")]
    pub timeout_seconds: u64,
    /// Failures older than this no longer count towards the threshold.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_breaker_timeout() -> u64 {
    60
}

fn default_window_seconds() -> u64 {
    60
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_seconds: default_breaker_timeout(),
            window_seconds: default_window_seconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Tokens added per second.
    pub rate_per_second: f64,
    /// Bucket capacity.
    pub burst_size: u32,
}

/// When the coordinator persists a checkpoint after a node succeeds.
///
/// Checkpoints are always written at start, when the execution parks, and
/// when it reaches a terminal state regardless of policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CheckpointPolicy {
    #[default]
    EveryNode,
    /// Only after nodes with more than one predecessor.
    JoinPoints,
    /// After every `every`-th node completion.
    Interval { every: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyPolicy {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub in_flight: InFlightPolicy,
}

fn default_ttl_seconds() -> u64 {
    86_400
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            in_flight: InFlightPolicy::default(),
        }
    }
}

/// What a dispatcher does when another holder has the same key in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Poll until the holder completes or `max_wait_ms` elapses.
    Wait { max_wait_ms: u64, poll_ms: u64 },
    /// Return an idempotency conflict immediately.
    FailFast,
}

impl Default for InFlightPolicy {
    fn default() -> Self {
        InFlightPolicy::Wait {
            max_wait_ms: 5_000,
            poll_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingPolicy {
    /// Root node receiving the coalesced batch.
    pub node_id: String,
    pub window_size: u32,
    pub window_secs: u64,
}

// ---------------------------------------------------------------------------
// Payload contracts
// ---------------------------------------------------------------------------

/// Optional shape check for a node's payload.
///
/// Payloads are otherwise passed through opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadContract {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, ValueKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Object,
    Array,
    Any,
}

impl ValueKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::Null => value.is_null(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Number => value.is_number(),
            ValueKind::String => value.is_string(),
            ValueKind::Object => value.is_object(),
            ValueKind::Array => value.is_array(),
            ValueKind::Any => true,
        }
    }
}

impl PayloadContract {
    /// Check `payload` against the contract, returning every violation.
    pub fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
        let Some(object) = payload.as_object() else {
            return Err(vec!["payload must be an object".to_string()]);
        };

        let mut violations = Vec::new();
        for key in &self.required {
            if !object.contains_key(key) {
                violations.push(format!("missing required field '{key}'"));
            }
        }
        for (key, kind) in &self.properties {
            if let Some(value) = object.get(key) {
                if !kind.matches(value) {
                    violations.push(format!("field '{key}' must be {kind:?}"));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
