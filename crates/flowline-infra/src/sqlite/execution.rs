//! SQLite execution, node execution and snapshot storage.
//!
//! Execution updates are conditional on the stored version, so two workers
//! racing to claim the same execution cannot both succeed.

use chrono::{DateTime, Utc};
use flowline_core::repository::{ExecutionRepository, NodeExecutionRepository};
use flowline_types::error::RepositoryError;
use flowline_types::execution::{
    Execution, ExecutionStatus, NodeExecution, NodeStatus, Snapshot,
};
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteStore, format_datetime, format_opt_datetime, from_json, parse_datetime, parse_enum,
    parse_opt_datetime, parse_uuid, query_err, to_json,
};

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const EXECUTION_COLUMNS: &str = "id, workflow_id, trigger_type, trigger_data, status, environment, \
     idempotency_key, error, next_check_at, owner, lease_expires_at, version, started_at, \
     updated_at, completed_at";

struct ExecutionRow {
    id: String,
    workflow_id: String,
    trigger_type: String,
    trigger_data: String,
    status: String,
    environment: String,
    idempotency_key: Option<String>,
    error: Option<String>,
    next_check_at: Option<String>,
    owner: Option<String>,
    lease_expires_at: Option<String>,
    version: i64,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            trigger_type: row.try_get("trigger_type")?,
            trigger_data: row.try_get("trigger_data")?,
            status: row.try_get("status")?,
            environment: row.try_get("environment")?,
            idempotency_key: row.try_get("idempotency_key")?,
            error: row.try_get("error")?,
            next_check_at: row.try_get("next_check_at")?,
            owner: row.try_get("owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            version: row.try_get("version")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            trigger_type: self.trigger_type,
            trigger_data: from_json(&self.trigger_data, "trigger_data")?,
            status: parse_enum(&self.status)?,
            environment: self.environment,
            idempotency_key: self.idempotency_key,
            error: self.error,
            next_check_at: parse_opt_datetime(self.next_check_at)?,
            owner: self.owner.as_deref().map(parse_uuid).transpose()?,
            lease_expires_at: parse_opt_datetime(self.lease_expires_at)?,
            version: self.version,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: parse_opt_datetime(self.completed_at)?,
        })
    }
}

struct NodeExecutionRow {
    id: String,
    execution_id: String,
    node_id: String,
    node_type: String,
    attempt: i64,
    status: String,
    input: String,
    output: Option<String>,
    branches: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl NodeExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            node_id: row.try_get("node_id")?,
            node_type: row.try_get("node_type")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            branches: row.try_get("branches")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_node_execution(self) -> Result<NodeExecution, RepositoryError> {
        Ok(NodeExecution {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            node_id: self.node_id,
            node_type: self.node_type,
            attempt: self.attempt as u32,
            status: parse_enum(&self.status)?,
            input: from_json(&self.input, "node input")?,
            output: self
                .output
                .as_deref()
                .map(|s| from_json(s, "node output"))
                .transpose()?,
            branches: self
                .branches
                .as_deref()
                .map(|s| from_json(s, "branches"))
                .transpose()?,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            started_at: parse_opt_datetime(self.started_at)?,
            completed_at: parse_opt_datetime(self.completed_at)?,
        })
    }
}

struct SnapshotRow {
    execution_id: String,
    sequence_number: i64,
    node_id: String,
    attempt: i64,
    duration_ms: i64,
    input_bytes: i64,
    output_bytes: i64,
    outbound_calls: i64,
    outcome: String,
    recorded_at: String,
}

impl SnapshotRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            sequence_number: row.try_get("sequence_number")?,
            node_id: row.try_get("node_id")?,
            attempt: row.try_get("attempt")?,
            duration_ms: row.try_get("duration_ms")?,
            input_bytes: row.try_get("input_bytes")?,
            output_bytes: row.try_get("output_bytes")?,
            outbound_calls: row.try_get("outbound_calls")?,
            outcome: row.try_get("outcome")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_snapshot(self) -> Result<Snapshot, RepositoryError> {
        Ok(Snapshot {
            execution_id: parse_uuid(&self.execution_id)?,
            sequence_number: self.sequence_number as u64,
            node_id: self.node_id,
            attempt: self.attempt as u32,
            duration_ms: self.duration_ms as u64,
            input_bytes: self.input_bytes as u64,
            output_bytes: self.output_bytes as u64,
            outbound_calls: self.outbound_calls as u32,
            outcome: self.outcome,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

fn collect_executions(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Execution>, RepositoryError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ExecutionRow::from_row(row).map_err(query_err)?.into_execution()?);
    }
    Ok(out)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|d| d.is_unique_violation())
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteStore {
    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let trigger_data = to_json(&execution.trigger_data)?;

        sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, trigger_type, trigger_data, status, environment,
                idempotency_key, error, next_check_at, owner, lease_expires_at, version,
                started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.workflow_id)
        .bind(&execution.trigger_type)
        .bind(&trigger_data)
        .bind(execution.status.to_string())
        .bind(&execution.environment)
        .bind(&execution.idempotency_key)
        .bind(&execution.error)
        .bind(format_opt_datetime(execution.next_check_at.as_ref()))
        .bind(execution.owner.map(|o| o.to_string()))
        .bind(format_opt_datetime(execution.lease_expires_at.as_ref()))
        .bind(execution.version)
        .bind(format_datetime(&execution.started_at))
        .bind(format_datetime(&execution.updated_at))
        .bind(format_opt_datetime(execution.completed_at.as_ref()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("execution {} already exists", execution.id))
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn update_execution(
        &self,
        execution: &Execution,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let trigger_data = to_json(&execution.trigger_data)?;

        let result = sqlx::query(
            r#"UPDATE executions SET
                 trigger_type = ?, trigger_data = ?, status = ?, environment = ?,
                 idempotency_key = ?, error = ?, next_check_at = ?, owner = ?,
                 lease_expires_at = ?, version = ?, updated_at = ?, completed_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(&execution.trigger_type)
        .bind(&trigger_data)
        .bind(execution.status.to_string())
        .bind(&execution.environment)
        .bind(&execution.idempotency_key)
        .bind(&execution.error)
        .bind(format_opt_datetime(execution.next_check_at.as_ref()))
        .bind(execution.owner.map(|o| o.to_string()))
        .bind(format_opt_datetime(execution.lease_expires_at.as_ref()))
        .bind(execution.version)
        .bind(format_datetime(&execution.updated_at))
        .bind(format_opt_datetime(execution.completed_at.as_ref()))
        .bind(execution.id.to_string())
        .bind(expected_version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM executions WHERE id = ?")
            .bind(execution.id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let status = status.map(|s| s.to_string());

        let rows = sqlx::query(&format!(
            r#"SELECT {EXECUTION_COLUMNS} FROM executions
               WHERE (?1 IS NULL OR workflow_id = ?1)
                 AND (?2 IS NULL OR status = ?2)
               ORDER BY started_at DESC, id DESC
               LIMIT ?3"#
        ))
        .bind(workflow_id)
        .bind(status)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        collect_executions(&rows)
    }

    async fn list_due_waiting(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {EXECUTION_COLUMNS} FROM executions
               WHERE status = 'waiting'
                 AND (next_check_at IS NULL OR next_check_at <= ?)
               ORDER BY next_check_at ASC
               LIMIT ?"#
        ))
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        collect_executions(&rows)
    }

    async fn list_stalled(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {EXECUTION_COLUMNS} FROM executions
               WHERE status = 'running'
                 AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
               ORDER BY lease_expires_at ASC
               LIMIT ?"#
        ))
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        collect_executions(&rows)
    }
}

// ---------------------------------------------------------------------------
// NodeExecutionRepository impl
// ---------------------------------------------------------------------------

impl NodeExecutionRepository for SqliteStore {
    async fn create_node_execution(&self, node: &NodeExecution) -> Result<(), RepositoryError> {
        let input = to_json(&node.input)?;
        let output = node.output.as_ref().map(to_json).transpose()?;
        let branches = node.branches.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO node_executions
               (id, execution_id, node_id, node_type, attempt, status, input, output,
                branches, error, created_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(node.id.to_string())
        .bind(node.execution_id.to_string())
        .bind(&node.node_id)
        .bind(&node.node_type)
        .bind(i64::from(node.attempt))
        .bind(node.status.to_string())
        .bind(&input)
        .bind(&output)
        .bind(&branches)
        .bind(&node.error)
        .bind(format_datetime(&node.created_at))
        .bind(format_opt_datetime(node.started_at.as_ref()))
        .bind(format_opt_datetime(node.completed_at.as_ref()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn update_node_execution(&self, node: &NodeExecution) -> Result<bool, RepositoryError> {
        let input = to_json(&node.input)?;
        let output = node.output.as_ref().map(to_json).transpose()?;
        let branches = node.branches.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE node_executions SET
                 status = ?, input = ?, output = ?, branches = ?, error = ?,
                 started_at = ?, completed_at = ?
               WHERE id = ? AND status NOT IN (?, ?, ?)"#,
        )
        .bind(node.status.to_string())
        .bind(&input)
        .bind(&output)
        .bind(&branches)
        .bind(&node.error)
        .bind(format_opt_datetime(node.started_at.as_ref()))
        .bind(format_opt_datetime(node.completed_at.as_ref()))
        .bind(node.id.to_string())
        .bind(NodeStatus::Succeeded.to_string())
        .bind(NodeStatus::Failed.to_string())
        .bind(NodeStatus::Skipped.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM node_executions WHERE id = ?")
                .bind(node.id.to_string())
                .fetch_optional(&self.pool.writer)
                .await
                .map_err(query_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_node_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, execution_id, node_id, node_type, attempt, status, input, output,
                      branches, error, created_at, started_at, completed_at
               FROM node_executions
               WHERE execution_id = ?
               ORDER BY created_at ASC, rowid ASC"#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = NodeExecutionRow::from_row(row).map_err(query_err)?;
            nodes.push(r.into_node_execution()?);
        }
        Ok(nodes)
    }

    async fn append_snapshot(&self, snapshot: &Snapshot) -> Result<u64, RepositoryError> {
        // Sequence assignment and insert are one statement on the single
        // writer connection.
        let row = sqlx::query(
            r#"INSERT INTO snapshots
               (execution_id, sequence_number, node_id, attempt, duration_ms, input_bytes,
                output_bytes, outbound_calls, outcome, recorded_at)
               SELECT ?1, COALESCE(MAX(sequence_number), 0) + 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
               FROM snapshots WHERE execution_id = ?1
               RETURNING sequence_number"#,
        )
        .bind(snapshot.execution_id.to_string())
        .bind(&snapshot.node_id)
        .bind(i64::from(snapshot.attempt))
        .bind(snapshot.duration_ms as i64)
        .bind(snapshot.input_bytes as i64)
        .bind(snapshot.output_bytes as i64)
        .bind(i64::from(snapshot.outbound_calls))
        .bind(&snapshot.outcome)
        .bind(format_datetime(&snapshot.recorded_at))
        .fetch_one(&self.pool.writer)
        .await
        .map_err(query_err)?;

        let sequence: i64 = row.try_get("sequence_number").map_err(query_err)?;
        Ok(sequence as u64)
    }

    async fn list_snapshots(&self, execution_id: &Uuid) -> Result<Vec<Snapshot>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT execution_id, sequence_number, node_id, attempt, duration_ms, input_bytes,
                      output_bytes, outbound_calls, outcome, recorded_at
               FROM snapshots
               WHERE execution_id = ?
               ORDER BY sequence_number ASC"#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = SnapshotRow::from_row(row).map_err(query_err)?;
            snapshots.push(r.into_snapshot()?);
        }
        Ok(snapshots)
    }
}
