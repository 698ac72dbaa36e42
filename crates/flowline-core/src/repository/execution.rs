//! Execution and node execution repository traits.

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use flowline_types::execution::{Execution, ExecutionStatus, NodeExecution, Snapshot};
use uuid::Uuid;

/// Storage for executions.
///
/// Every change goes through [`ExecutionRepository::update_execution`], which
/// only applies when the stored version still equals `expected_version`; two
/// workers racing to claim the same execution cannot both win.
pub trait ExecutionRepository: Send + Sync {
    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Replace the execution if its stored version is `expected_version`.
    /// Returns `false` if someone else wrote it since the caller read it.
    fn update_execution(
        &self,
        execution: &Execution,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Most recent first.
    fn list_executions(
        &self,
        workflow_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Waiting executions whose `next_check_at` has passed.
    fn list_due_waiting(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Running executions whose driver lease lapsed before `now`.
    fn list_stalled(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;
}

/// Storage for per-attempt node records and diagnostic snapshots.
pub trait NodeExecutionRepository: Send + Sync {
    fn create_node_execution(
        &self,
        node: &NodeExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace a node execution unless the stored one is already terminal.
    /// Returns `false` for terminal records, which are immutable.
    fn update_node_execution(
        &self,
        node: &NodeExecution,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Ordered by creation time.
    fn list_node_executions(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Append a snapshot, assigning the next sequence number for its
    /// execution (the supplied `sequence_number` is ignored). Returns the
    /// assigned number.
    fn append_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn list_snapshots(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Snapshot>, RepositoryError>> + Send;
}
