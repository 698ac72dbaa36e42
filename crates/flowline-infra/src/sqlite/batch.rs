//! SQLite batch window storage.

use chrono::{DateTime, Utc};
use flowline_core::repository::BatchWindowRepository;
use flowline_types::batch::BatchWindow;
use flowline_types::error::RepositoryError;
use sqlx::Row;

use super::{
    SqliteStore, format_datetime, format_opt_datetime, from_json, parse_opt_datetime, query_err,
    to_json,
};

const WINDOW_COLUMNS: &str = "workflow_id, node_id, current_batch, current_count, window_size, \
     window_secs, window_started_at, window_closes_at, generation, version";

struct WindowRow {
    workflow_id: String,
    node_id: String,
    current_batch: String,
    current_count: i64,
    window_size: i64,
    window_secs: i64,
    window_started_at: Option<String>,
    window_closes_at: Option<String>,
    generation: i64,
    version: i64,
}

impl WindowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            node_id: row.try_get("node_id")?,
            current_batch: row.try_get("current_batch")?,
            current_count: row.try_get("current_count")?,
            window_size: row.try_get("window_size")?,
            window_secs: row.try_get("window_secs")?,
            window_started_at: row.try_get("window_started_at")?,
            window_closes_at: row.try_get("window_closes_at")?,
            generation: row.try_get("generation")?,
            version: row.try_get("version")?,
        })
    }

    fn into_window(self) -> Result<BatchWindow, RepositoryError> {
        Ok(BatchWindow {
            workflow_id: self.workflow_id,
            node_id: self.node_id,
            current_batch: from_json(&self.current_batch, "batch")?,
            current_count: self.current_count as u32,
            window_size: self.window_size as u32,
            window_secs: self.window_secs as u64,
            window_started_at: parse_opt_datetime(self.window_started_at)?,
            window_closes_at: parse_opt_datetime(self.window_closes_at)?,
            generation: self.generation as u64,
            version: self.version,
        })
    }
}

impl BatchWindowRepository for SqliteStore {
    async fn get_window(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Option<BatchWindow>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {WINDOW_COLUMNS} FROM batch_windows WHERE workflow_id = ? AND node_id = ?"
        ))
        .bind(workflow_id)
        .bind(node_id)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = WindowRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_window()?))
            }
            None => Ok(None),
        }
    }

    async fn insert_window(&self, window: &BatchWindow) -> Result<bool, RepositoryError> {
        let batch = to_json(&window.current_batch)?;

        let result = sqlx::query(
            r#"INSERT INTO batch_windows
               (workflow_id, node_id, current_batch, current_count, window_size, window_secs,
                window_started_at, window_closes_at, generation, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id, node_id) DO NOTHING"#,
        )
        .bind(&window.workflow_id)
        .bind(&window.node_id)
        .bind(&batch)
        .bind(i64::from(window.current_count))
        .bind(i64::from(window.window_size))
        .bind(window.window_secs as i64)
        .bind(format_opt_datetime(window.window_started_at.as_ref()))
        .bind(format_opt_datetime(window.window_closes_at.as_ref()))
        .bind(window.generation as i64)
        .bind(window.version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_swap_window(
        &self,
        window: &BatchWindow,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let batch = to_json(&window.current_batch)?;

        let result = sqlx::query(
            r#"UPDATE batch_windows SET
                 current_batch = ?, current_count = ?, window_size = ?, window_secs = ?,
                 window_started_at = ?, window_closes_at = ?, generation = ?, version = ?
               WHERE workflow_id = ? AND node_id = ? AND version = ?"#,
        )
        .bind(&batch)
        .bind(i64::from(window.current_count))
        .bind(i64::from(window.window_size))
        .bind(window.window_secs as i64)
        .bind(format_opt_datetime(window.window_started_at.as_ref()))
        .bind(format_opt_datetime(window.window_closes_at.as_ref()))
        .bind(window.generation as i64)
        .bind(window.version)
        .bind(&window.workflow_id)
        .bind(&window.node_id)
        .bind(expected_version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_expired_windows(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<BatchWindow>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {WINDOW_COLUMNS} FROM batch_windows
               WHERE current_count > 0
                 AND window_closes_at IS NOT NULL
                 AND window_closes_at <= ?
               ORDER BY window_closes_at ASC
               LIMIT ?"#
        ))
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut windows = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WindowRow::from_row(row).map_err(query_err)?;
            windows.push(r.into_window()?);
        }
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::store;
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_window_cas_and_expiry() {
        let (store, _dir) = store().await;
        let now = Utc::now();

        let empty = BatchWindow::empty("wf", "collect", 3, 10);
        assert!(store.insert_window(&empty).await.unwrap());
        assert!(!store.insert_window(&empty).await.unwrap());
        // Empty windows never expire.
        assert!(store.list_expired_windows(now, 10).await.unwrap().is_empty());

        let mut opened = empty.clone();
        opened.current_batch.push(json!({"event": 1}));
        opened.current_count = 1;
        opened.window_started_at = Some(now - Duration::seconds(11));
        opened.window_closes_at = Some(now - Duration::seconds(1));
        opened.version = 1;
        assert!(store.compare_and_swap_window(&opened, 0).await.unwrap());
        assert!(!store.compare_and_swap_window(&opened, 0).await.unwrap());

        let expired = store.list_expired_windows(now, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].current_batch, vec![json!({"event": 1})]);
        assert_eq!(expired[0].window_size, 3);

        let loaded = store.get_window("wf", "collect").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert!(loaded.is_open());
    }
}
