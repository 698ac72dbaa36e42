//! Workflow definition parsing and validation.

use std::collections::HashSet;
use std::path::Path;

use flowline_types::workflow::{CheckpointPolicy, WorkflowDefinition};
use thiserror::Error;

use super::graph::WorkflowGraph;

/// Errors from loading or validating workflow definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A node references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),
}

/// Parse and validate a YAML workflow definition.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse and validate a JSON workflow definition.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load a definition from disk, picking the format from the extension.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Id is non-empty and uses only alphanumerics, hyphens and underscores
/// - At least one node exists and node IDs are unique
/// - Dependencies exist and form a DAG
/// - Numeric policy knobs are in range
/// - The batching target, if any, is a root node
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }
    if !def
        .id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkflowError::ValidationError(format!(
            "workflow id '{}' contains invalid characters",
            def.id
        )));
    }

    if def.nodes.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one node".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for node in &def.nodes {
        if node.id.is_empty() {
            return Err(WorkflowError::ValidationError(
                "node id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(node.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate node ID: '{}'",
                node.id
            )));
        }
        if node.timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "node '{}' timeout must be > 0",
                node.id
            )));
        }
        if let Some(retry) = &node.retry {
            if retry.max_attempts == 0 {
                return Err(WorkflowError::ValidationError(format!(
                    "node '{}' retry.max_attempts must be >= 1",
                    node.id
                )));
            }
        }
        if let Some(cb) = &node.circuit_breaker {
            if cb.failure_threshold == 0 || cb.success_threshold == 0 {
                return Err(WorkflowError::ValidationError(format!(
                    "node '{}' circuit breaker thresholds must be >= 1",
                    node.id
                )));
            }
        }
    }

    if def.retry.is_some_and(|r| r.max_attempts == 0) {
        return Err(WorkflowError::ValidationError(
            "retry.max_attempts must be >= 1".to_string(),
        ));
    }

    if def
        .circuit_breaker
        .is_some_and(|cb| cb.failure_threshold == 0 || cb.success_threshold == 0)
    {
        return Err(WorkflowError::ValidationError(
            "circuit breaker thresholds must be >= 1".to_string(),
        ));
    }

    for (key, limit) in &def.rate_limits {
        if limit.burst_size == 0 || !(limit.rate_per_second > 0.0) {
            return Err(WorkflowError::ValidationError(format!(
                "rate limit '{key}' needs burst_size >= 1 and rate_per_second > 0"
            )));
        }
    }

    if let CheckpointPolicy::Interval { every: 0 } = def.checkpoint_policy {
        return Err(WorkflowError::ValidationError(
            "checkpoint interval must be >= 1".to_string(),
        ));
    }

    let graph = WorkflowGraph::build(def)?;

    if let Some(batching) = &def.batching {
        if batching.window_size == 0 || batching.window_secs == 0 {
            return Err(WorkflowError::ValidationError(
                "batching window_size and window_secs must be >= 1".to_string(),
            ));
        }
        if !graph.roots().any(|root| root == batching.node_id) {
            return Err(WorkflowError::ValidationError(format!(
                "batching target '{}' must be a root node",
                batching.node_id
            )));
        }
    }

    Ok(())
}
