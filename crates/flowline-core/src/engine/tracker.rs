//! Node execution tracker: per-attempt status and I/O records plus
//! diagnostic snapshots.
//!
//! Records move pending -> running -> succeeded | failed, or are created
//! directly as skipped. Terminal records are immutable; the store refuses to
//! rewrite them.

use std::time::Duration;

use flowline_types::execution::{NodeExecution, NodeOutput, NodeStatus, Snapshot};
use flowline_types::workflow::NodeDefinition;
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::repository::NodeExecutionRepository;

/// Snapshot outcome labels.
pub mod outcome {
    pub const SUCCEEDED: &str = "succeeded";
    pub const CACHED: &str = "cached";
    pub const TRANSIENT_ERROR: &str = "transient_error";
    pub const PERMANENT_ERROR: &str = "permanent_error";
    pub const TIMEOUT: &str = "timeout";
}

#[derive(Clone)]
pub struct NodeTracker<S> {
    store: S,
    clock: Clock,
}

impl<S: NodeExecutionRepository> NodeTracker<S> {
    pub fn new(store: S, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Create the attempt record and move it to running.
    pub async fn begin(
        &self,
        execution_id: Uuid,
        node: &NodeDefinition,
        attempt: u32,
        input: &Value,
    ) -> Result<NodeExecution, EngineError> {
        let now = self.clock.now();
        let mut record = NodeExecution {
            id: Uuid::now_v7(),
            execution_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            attempt,
            status: NodeStatus::Pending,
            input: input.clone(),
            output: None,
            branches: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.store.create_node_execution(&record).await?;

        record.status = NodeStatus::Running;
        record.started_at = Some(now);
        self.store.update_node_execution(&record).await?;
        Ok(record)
    }

    pub async fn succeed(
        &self,
        mut record: NodeExecution,
        output: &NodeOutput,
    ) -> Result<NodeExecution, EngineError> {
        record.status = NodeStatus::Succeeded;
        record.output = Some(output.output.clone());
        record.branches = output.branches.clone();
        record.completed_at = Some(self.clock.now());
        self.finish(record).await
    }

    pub async fn fail(
        &self,
        mut record: NodeExecution,
        error: &str,
    ) -> Result<NodeExecution, EngineError> {
        record.status = NodeStatus::Failed;
        record.error = Some(error.to_string());
        record.completed_at = Some(self.clock.now());
        self.finish(record).await
    }

    /// Record a node whose join can no longer be satisfied.
    pub async fn skip(
        &self,
        execution_id: Uuid,
        node: &NodeDefinition,
    ) -> Result<NodeExecution, EngineError> {
        let now = self.clock.now();
        let record = NodeExecution {
            id: Uuid::now_v7(),
            execution_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            attempt: 0,
            status: NodeStatus::Skipped,
            input: Value::Null,
            output: None,
            branches: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: Some(now),
        };
        self.store.create_node_execution(&record).await?;
        Ok(record)
    }

    async fn finish(&self, record: NodeExecution) -> Result<NodeExecution, EngineError> {
        if !self.store.update_node_execution(&record).await? {
            tracing::warn!(
                execution_id = %record.execution_id,
                node_id = record.node_id.as_str(),
                attempt = record.attempt,
                "node execution already terminal, result not recorded"
            );
        }
        Ok(record)
    }

    pub async fn list(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, EngineError> {
        Ok(self.store.list_node_executions(&execution_id).await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn snapshot(
        &self,
        execution_id: Uuid,
        node_id: &str,
        attempt: u32,
        elapsed: Duration,
        input: &Value,
        output: Option<&NodeOutput>,
        outcome: &str,
    ) -> Result<u64, EngineError> {
        let snapshot = Snapshot {
            execution_id,
            sequence_number: 0,
            node_id: node_id.to_string(),
            attempt,
            duration_ms: elapsed.as_millis() as u64,
            input_bytes: encoded_len(input),
            output_bytes: output.map_or(0, |o| encoded_len(&o.output)),
            outbound_calls: output.map_or(0, |o| o.outbound_calls),
            outcome: outcome.to_string(),
            recorded_at: self.clock.now(),
        };
        Ok(self.store.append_snapshot(&snapshot).await?)
    }

    pub async fn snapshots(&self, execution_id: Uuid) -> Result<Vec<Snapshot>, EngineError> {
        Ok(self.store.list_snapshots(&execution_id).await?)
    }
}

fn encoded_len(value: &Value) -> u64 {
    serde_json::to_vec(value).map_or(0, |b| b.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn node() -> NodeDefinition {
        serde_json::from_value(json!({"id": "send", "type": "email"})).unwrap()
    }

    #[tokio::test]
    async fn attempt_lifecycle_is_recorded() {
        let store = MemoryStore::new();
        let tracker = NodeTracker::new(store, Clock::new());
        let exec = Uuid::now_v7();

        let running = tracker.begin(exec, &node(), 1, &json!({"to": "a@b.c"})).await.unwrap();
        assert_eq!(running.status, NodeStatus::Running);
        assert!(running.started_at.is_some());

        let done = tracker
            .succeed(running.clone(), &NodeOutput::new(json!({"id": 7})))
            .await
            .unwrap();
        assert_eq!(done.status, NodeStatus::Succeeded);

        // Terminal records stay as they are.
        tracker.fail(running, "late failure").await.unwrap();
        let stored = tracker.list(exec).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, NodeStatus::Succeeded);
        assert_eq!(stored[0].output, Some(json!({"id": 7})));
    }

    #[tokio::test]
    async fn snapshots_measure_payloads() {
        let store = MemoryStore::new();
        let tracker = NodeTracker::new(store, Clock::new());
        let exec = Uuid::now_v7();
        let mut output = NodeOutput::new(json!("ok"));
        output.outbound_calls = 2;

        let seq = tracker
            .snapshot(
                exec,
                "send",
                1,
                Duration::from_millis(40),
                &json!({"k": 1}),
                Some(&output),
                outcome::SUCCEEDED,
            )
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let snaps = tracker.snapshots(exec).await.unwrap();
        assert_eq!(snaps[0].duration_ms, 40);
        assert_eq!(snaps[0].input_bytes, 7);
        assert_eq!(snaps[0].output_bytes, 4);
        assert_eq!(snaps[0].outbound_calls, 2);
    }
}
