//! SQLite checkpoint storage.
//!
//! Checkpoints are append-only. The sequence check and the insert happen in
//! one statement, so a stale writer gets a conflict instead of a gap or a
//! duplicate.

use flowline_core::repository::CheckpointRepository;
use flowline_types::error::RepositoryError;
use flowline_types::execution::{Checkpoint, CheckpointState};
use sqlx::Row;
use uuid::Uuid;

use super::{SqliteStore, format_datetime, parse_datetime, parse_uuid, query_err, to_json};

struct CheckpointRow {
    execution_id: String,
    sequence_number: i64,
    node_id: Option<String>,
    state: String,
    can_resume: bool,
    checksum: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            sequence_number: row.try_get("sequence_number")?,
            node_id: row.try_get("node_id")?,
            state: row.try_get("state")?,
            can_resume: row.try_get("can_resume")?,
            checksum: row.try_get("checksum")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// A state blob that no longer decodes is surfaced through the checksum,
    /// so verification reports it as corruption instead of a storage error.
    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let (state, checksum) = match serde_json::from_str::<CheckpointState>(&self.state) {
            Ok(state) => (state, self.checksum),
            Err(e) => (CheckpointState::default(), format!("undecodable:{e}")),
        };
        Ok(Checkpoint {
            execution_id: parse_uuid(&self.execution_id)?,
            sequence_number: self.sequence_number as u64,
            node_id: self.node_id,
            state,
            can_resume: self.can_resume,
            checksum,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

const CHECKPOINT_COLUMNS: &str =
    "execution_id, sequence_number, node_id, state, can_resume, checksum, created_at";

impl CheckpointRepository for SqliteStore {
    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let state = to_json(&checkpoint.state)?;
        let sequence = checkpoint.sequence_number as i64;

        let result = sqlx::query(
            r#"INSERT INTO checkpoints
               (execution_id, sequence_number, node_id, state, can_resume, checksum, created_at)
               SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
               WHERE ?2 > (SELECT COALESCE(MAX(sequence_number), 0)
                           FROM checkpoints WHERE execution_id = ?1)"#,
        )
        .bind(checkpoint.execution_id.to_string())
        .bind(sequence)
        .bind(&checkpoint.node_id)
        .bind(&state)
        .bind(checkpoint.can_resume)
        .bind(&checkpoint.checksum)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint sequence {} for execution {} is not after the latest",
                checkpoint.sequence_number, checkpoint.execution_id
            )));
        }
        Ok(())
    }

    async fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        // Read from the writer so a sequence computed from this is never
        // behind the last append.
        let row = sqlx::query(&format!(
            r#"SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
               WHERE execution_id = ?
               ORDER BY sequence_number DESC
               LIMIT 1"#
        ))
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
               WHERE execution_id = ?
               ORDER BY sequence_number ASC"#
        ))
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row).map_err(query_err)?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::store;
    use super::*;
    use chrono::Utc;
    use flowline_core::engine::checkpoint::{checksum, verify};
    use flowline_core::repository::ExecutionRepository;
    use flowline_types::execution::{Execution, ExecutionStatus, NodeStatus};
    use serde_json::json;

    async fn seeded(store: &SqliteStore) -> Uuid {
        let now = Utc::now();
        let exec = Execution {
            id: Uuid::now_v7(),
            workflow_id: "wf".into(),
            trigger_type: "manual".into(),
            trigger_data: json!({}),
            status: ExecutionStatus::Running,
            environment: "development".into(),
            idempotency_key: None,
            error: None,
            next_check_at: None,
            owner: None,
            lease_expires_at: None,
            version: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        store.create_execution(&exec).await.unwrap();
        exec.id
    }

    fn checkpoint(execution_id: Uuid, seq: u64) -> Checkpoint {
        let mut state = CheckpointState::default();
        state.node_outputs.insert("a".into(), json!({"score": 0.75, "tags": ["x"]}));
        state.node_status.insert("a".into(), NodeStatus::Succeeded);
        state.variables.insert("region".into(), json!("eu"));
        Checkpoint {
            execution_id,
            sequence_number: seq,
            node_id: Some("a".into()),
            checksum: checksum(&state),
            state,
            can_resume: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_rejects_stale_sequence() {
        let (store, _dir) = store().await;
        let id = seeded(&store).await;

        store.append_checkpoint(&checkpoint(id, 1)).await.unwrap();
        store.append_checkpoint(&checkpoint(id, 2)).await.unwrap();
        let stale = store.append_checkpoint(&checkpoint(id, 2)).await;
        assert!(matches!(stale, Err(RepositoryError::Conflict(_))));

        let seqs: Vec<u64> = store
            .list_checkpoints(&id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_latest_checkpoint_verifies_after_reload() {
        let (store, _dir) = store().await;
        let id = seeded(&store).await;
        assert!(store.latest_checkpoint(&id).await.unwrap().is_none());

        store.append_checkpoint(&checkpoint(id, 1)).await.unwrap();
        let mut sealed = checkpoint(id, 2);
        sealed.can_resume = false;
        store.append_checkpoint(&sealed).await.unwrap();

        let latest = store.latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 2);
        assert!(!latest.can_resume);
        verify(&latest).unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_state_fails_verification() {
        let (store, _dir) = store().await;
        let id = seeded(&store).await;
        store.append_checkpoint(&checkpoint(id, 1)).await.unwrap();

        sqlx::query("UPDATE checkpoints SET state = '{not json' WHERE execution_id = ?")
            .bind(id.to_string())
            .execute(&store.pool().writer)
            .await
            .unwrap();

        let loaded = store.latest_checkpoint(&id).await.unwrap().unwrap();
        assert!(loaded.checksum.starts_with("undecodable:"));
        assert!(verify(&loaded).is_err());
    }
}
