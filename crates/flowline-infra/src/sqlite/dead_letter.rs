//! SQLite dead letter queue storage.

use chrono::{DateTime, Utc};
use flowline_core::repository::DeadLetterRepository;
use flowline_types::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use flowline_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteStore, format_datetime, from_json, parse_datetime, parse_enum, parse_uuid, query_err,
    to_json,
};

const DEAD_LETTER_COLUMNS: &str = "execution_id, workflow_id, trigger_data, error, attempt_count, \
     max_attempts, next_retry_at, status, checkpoint_sequence, created_at, updated_at, version";

struct DeadLetterRow {
    execution_id: String,
    workflow_id: String,
    trigger_data: String,
    error: String,
    attempt_count: i64,
    max_attempts: i64,
    next_retry_at: String,
    status: String,
    checkpoint_sequence: Option<i64>,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl DeadLetterRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            workflow_id: row.try_get("workflow_id")?,
            trigger_data: row.try_get("trigger_data")?,
            error: row.try_get("error")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            status: row.try_get("status")?,
            checkpoint_sequence: row.try_get("checkpoint_sequence")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }

    fn into_entry(self) -> Result<DeadLetterEntry, RepositoryError> {
        Ok(DeadLetterEntry {
            execution_id: parse_uuid(&self.execution_id)?,
            workflow_id: self.workflow_id,
            trigger_data: from_json(&self.trigger_data, "dead letter trigger_data")?,
            error: self.error,
            attempt_count: self.attempt_count as u32,
            max_attempts: self.max_attempts as u32,
            next_retry_at: parse_datetime(&self.next_retry_at)?,
            status: parse_enum(&self.status)?,
            checkpoint_sequence: self.checkpoint_sequence.map(|s| s as u64),
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            version: self.version,
        })
    }
}

fn collect(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(DeadLetterRow::from_row(row).map_err(query_err)?.into_entry()?);
    }
    Ok(entries)
}

impl DeadLetterRepository for SqliteStore {
    async fn get_dead_letter(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<DeadLetterEntry>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE execution_id = ?"
        ))
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = DeadLetterRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_entry()?))
            }
            None => Ok(None),
        }
    }

    async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<bool, RepositoryError> {
        let trigger_data = to_json(&entry.trigger_data)?;

        let result = sqlx::query(
            r#"INSERT INTO dead_letters
               (execution_id, workflow_id, trigger_data, error, attempt_count, max_attempts,
                next_retry_at, status, checkpoint_sequence, created_at, updated_at, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id) DO NOTHING"#,
        )
        .bind(entry.execution_id.to_string())
        .bind(&entry.workflow_id)
        .bind(&trigger_data)
        .bind(&entry.error)
        .bind(i64::from(entry.attempt_count))
        .bind(i64::from(entry.max_attempts))
        .bind(format_datetime(&entry.next_retry_at))
        .bind(entry.status.to_string())
        .bind(entry.checkpoint_sequence.map(|s| s as i64))
        .bind(format_datetime(&entry.created_at))
        .bind(format_datetime(&entry.updated_at))
        .bind(entry.version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_swap_dead_letter(
        &self,
        entry: &DeadLetterEntry,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let trigger_data = to_json(&entry.trigger_data)?;

        let result = sqlx::query(
            r#"UPDATE dead_letters SET
                 workflow_id = ?, trigger_data = ?, error = ?, attempt_count = ?,
                 max_attempts = ?, next_retry_at = ?, status = ?, checkpoint_sequence = ?,
                 updated_at = ?, version = ?
               WHERE execution_id = ? AND version = ?"#,
        )
        .bind(&entry.workflow_id)
        .bind(&trigger_data)
        .bind(&entry.error)
        .bind(i64::from(entry.attempt_count))
        .bind(i64::from(entry.max_attempts))
        .bind(format_datetime(&entry.next_retry_at))
        .bind(entry.status.to_string())
        .bind(entry.checkpoint_sequence.map(|s| s as i64))
        .bind(format_datetime(&entry.updated_at))
        .bind(entry.version)
        .bind(entry.execution_id.to_string())
        .bind(expected_version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due_dead_letters(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
               WHERE status = ? AND next_retry_at <= ?
               ORDER BY next_retry_at ASC
               LIMIT ?"#
        ))
        .bind(DeadLetterStatus::Pending.to_string())
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        collect(&rows)
    }

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
               WHERE (?1 IS NULL OR status = ?1)
               ORDER BY updated_at DESC
               LIMIT ?2"#
        ))
        .bind(status.map(|s| s.to_string()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        collect(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::store;
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(now: DateTime<Utc>, due_in: Duration) -> DeadLetterEntry {
        DeadLetterEntry {
            execution_id: Uuid::now_v7(),
            workflow_id: "wf".into(),
            trigger_data: json!({"order": 42}),
            error: "transient node error: 503".into(),
            attempt_count: 0,
            max_attempts: 3,
            next_retry_at: now + due_in,
            status: DeadLetterStatus::Pending,
            checkpoint_sequence: Some(2),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_due_entries_oldest_first() {
        let (store, _dir) = store().await;
        let now = Utc::now();
        let older = entry(now, Duration::minutes(-5));
        let newer = entry(now, Duration::minutes(-1));
        let future = entry(now, Duration::minutes(5));
        for e in [&newer, &older, &future] {
            assert!(store.insert_dead_letter(e).await.unwrap());
        }
        assert!(!store.insert_dead_letter(&older).await.unwrap());

        let due = store.list_due_dead_letters(now, 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|d| d.execution_id).collect();
        assert_eq!(ids, vec![older.execution_id, newer.execution_id]);
        assert_eq!(due[0].checkpoint_sequence, Some(2));
        assert_eq!(due[0].trigger_data["order"], 42);
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_swap() {
        let (store, _dir) = store().await;
        let now = Utc::now();
        let e = entry(now, Duration::minutes(-1));
        store.insert_dead_letter(&e).await.unwrap();

        let mut claimed = e.clone();
        claimed.status = DeadLetterStatus::Retrying;
        claimed.attempt_count = 1;
        claimed.version = 1;
        assert!(store.compare_and_swap_dead_letter(&claimed, 0).await.unwrap());
        // A second worker holding version 0 loses the claim.
        assert!(!store.compare_and_swap_dead_letter(&claimed, 0).await.unwrap());

        assert!(store.list_due_dead_letters(now, 10).await.unwrap().is_empty());
        let retrying = store
            .list_dead_letters(Some(DeadLetterStatus::Retrying), 10)
            .await
            .unwrap();
        assert_eq!(retrying.len(), 1);
        assert_eq!(retrying[0].attempt_count, 1);
        assert_eq!(store.list_dead_letters(None, 10).await.unwrap().len(), 1);
    }
}
