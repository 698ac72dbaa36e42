//! SQLite storage for shared resilience state: circuit breakers, token
//! buckets and idempotency keys.
//!
//! Every write after the initial insert is a compare-and-swap on `version`.

use chrono::{DateTime, Utc};
use flowline_core::repository::{
    CircuitBreakerRepository, IdempotencyRepository, RateLimiterRepository,
};
use flowline_types::error::RepositoryError;
use flowline_types::resilience::{
    CircuitBreakerRecord, IdempotencyEntry, IdempotencyStatus, RateLimiterRecord,
};
use sqlx::Row;

use super::{
    SqliteStore, format_datetime, format_opt_datetime, from_json, parse_datetime, parse_enum,
    parse_opt_datetime, parse_uuid, query_err, to_json,
};

// ---------------------------------------------------------------------------
// Circuit breakers
// ---------------------------------------------------------------------------

const BREAKER_COLUMNS: &str = "workflow_id, node_id, state, failure_count, success_count, \
     window_started_at, last_failure_at, opens_at, probe_lease_until, policy, version, updated_at";

struct BreakerRow {
    workflow_id: String,
    node_id: String,
    state: String,
    failure_count: i64,
    success_count: i64,
    window_started_at: Option<String>,
    last_failure_at: Option<String>,
    opens_at: Option<String>,
    probe_lease_until: Option<String>,
    policy: String,
    version: i64,
    updated_at: String,
}

impl BreakerRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            node_id: row.try_get("node_id")?,
            state: row.try_get("state")?,
            failure_count: row.try_get("failure_count")?,
            success_count: row.try_get("success_count")?,
            window_started_at: row.try_get("window_started_at")?,
            last_failure_at: row.try_get("last_failure_at")?,
            opens_at: row.try_get("opens_at")?,
            probe_lease_until: row.try_get("probe_lease_until")?,
            policy: row.try_get("policy")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<CircuitBreakerRecord, RepositoryError> {
        Ok(CircuitBreakerRecord {
            workflow_id: self.workflow_id,
            node_id: self.node_id,
            state: parse_enum(&self.state)?,
            failure_count: self.failure_count as u32,
            success_count: self.success_count as u32,
            window_started_at: parse_opt_datetime(self.window_started_at)?,
            last_failure_at: parse_opt_datetime(self.last_failure_at)?,
            opens_at: parse_opt_datetime(self.opens_at)?,
            probe_lease_until: parse_opt_datetime(self.probe_lease_until)?,
            policy: from_json(&self.policy, "breaker policy")?,
            version: self.version,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

impl CircuitBreakerRepository for SqliteStore {
    async fn get_breaker(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Option<CircuitBreakerRecord>, RepositoryError> {
        // Writer connection: a CAS loop must never re-read a stale version.
        let row = sqlx::query(&format!(
            "SELECT {BREAKER_COLUMNS} FROM circuit_breakers WHERE workflow_id = ? AND node_id = ?"
        ))
        .bind(workflow_id)
        .bind(node_id)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = BreakerRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn insert_breaker(&self, record: &CircuitBreakerRecord) -> Result<bool, RepositoryError> {
        let policy = to_json(&record.policy)?;

        let result = sqlx::query(
            r#"INSERT INTO circuit_breakers
               (workflow_id, node_id, state, failure_count, success_count, window_started_at,
                last_failure_at, opens_at, probe_lease_until, policy, version, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id, node_id) DO NOTHING"#,
        )
        .bind(&record.workflow_id)
        .bind(&record.node_id)
        .bind(record.state.to_string())
        .bind(i64::from(record.failure_count))
        .bind(i64::from(record.success_count))
        .bind(format_opt_datetime(record.window_started_at.as_ref()))
        .bind(format_opt_datetime(record.last_failure_at.as_ref()))
        .bind(format_opt_datetime(record.opens_at.as_ref()))
        .bind(format_opt_datetime(record.probe_lease_until.as_ref()))
        .bind(&policy)
        .bind(record.version)
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_swap_breaker(
        &self,
        record: &CircuitBreakerRecord,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let policy = to_json(&record.policy)?;

        let result = sqlx::query(
            r#"UPDATE circuit_breakers SET
                 state = ?, failure_count = ?, success_count = ?, window_started_at = ?,
                 last_failure_at = ?, opens_at = ?, probe_lease_until = ?, policy = ?,
                 version = ?, updated_at = ?
               WHERE workflow_id = ? AND node_id = ? AND version = ?"#,
        )
        .bind(record.state.to_string())
        .bind(i64::from(record.failure_count))
        .bind(i64::from(record.success_count))
        .bind(format_opt_datetime(record.window_started_at.as_ref()))
        .bind(format_opt_datetime(record.last_failure_at.as_ref()))
        .bind(format_opt_datetime(record.opens_at.as_ref()))
        .bind(format_opt_datetime(record.probe_lease_until.as_ref()))
        .bind(&policy)
        .bind(record.version)
        .bind(format_datetime(&record.updated_at))
        .bind(&record.workflow_id)
        .bind(&record.node_id)
        .bind(expected_version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_breakers(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<CircuitBreakerRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {BREAKER_COLUMNS} FROM circuit_breakers WHERE workflow_id = ? ORDER BY node_id ASC"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = BreakerRow::from_row(row).map_err(query_err)?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Rate limiters
// ---------------------------------------------------------------------------

struct BucketRow {
    limit_key: String,
    tokens: f64,
    last_refill_at: String,
    rate_per_second: f64,
    burst_size: i64,
    version: i64,
}

impl BucketRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            limit_key: row.try_get("limit_key")?,
            tokens: row.try_get("tokens")?,
            last_refill_at: row.try_get("last_refill_at")?,
            rate_per_second: row.try_get("rate_per_second")?,
            burst_size: row.try_get("burst_size")?,
            version: row.try_get("version")?,
        })
    }

    fn into_record(self) -> Result<RateLimiterRecord, RepositoryError> {
        Ok(RateLimiterRecord {
            limit_key: self.limit_key,
            tokens: self.tokens,
            last_refill_at: parse_datetime(&self.last_refill_at)?,
            rate_per_second: self.rate_per_second,
            burst_size: self.burst_size as u32,
            version: self.version,
        })
    }
}

impl RateLimiterRepository for SqliteStore {
    async fn get_bucket(&self, limit_key: &str) -> Result<Option<RateLimiterRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT limit_key, tokens, last_refill_at, rate_per_second, burst_size, version
               FROM rate_limiters WHERE limit_key = ?"#,
        )
        .bind(limit_key)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = BucketRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn insert_bucket(&self, record: &RateLimiterRecord) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO rate_limiters
               (limit_key, tokens, last_refill_at, rate_per_second, burst_size, version)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(limit_key) DO NOTHING"#,
        )
        .bind(&record.limit_key)
        .bind(record.tokens)
        .bind(format_datetime(&record.last_refill_at))
        .bind(record.rate_per_second)
        .bind(i64::from(record.burst_size))
        .bind(record.version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_swap_bucket(
        &self,
        record: &RateLimiterRecord,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE rate_limiters SET
                 tokens = ?, last_refill_at = ?, rate_per_second = ?, burst_size = ?, version = ?
               WHERE limit_key = ? AND version = ?"#,
        )
        .bind(record.tokens)
        .bind(format_datetime(&record.last_refill_at))
        .bind(record.rate_per_second)
        .bind(i64::from(record.burst_size))
        .bind(record.version)
        .bind(&record.limit_key)
        .bind(expected_version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Idempotency keys
// ---------------------------------------------------------------------------

struct IdempotencyRow {
    workflow_id: String,
    key: String,
    execution_id: String,
    status: String,
    result: Option<String>,
    lease_expires_at: Option<String>,
    expires_at: String,
    created_at: String,
    version: i64,
}

impl IdempotencyRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            key: row.try_get("key")?,
            execution_id: row.try_get("execution_id")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }

    fn into_entry(self) -> Result<IdempotencyEntry, RepositoryError> {
        Ok(IdempotencyEntry {
            workflow_id: self.workflow_id,
            key: self.key,
            execution_id: parse_uuid(&self.execution_id)?,
            status: parse_enum(&self.status)?,
            result: self
                .result
                .as_deref()
                .map(|s| from_json(s, "idempotency result"))
                .transpose()?,
            lease_expires_at: parse_opt_datetime(self.lease_expires_at)?,
            expires_at: parse_datetime(&self.expires_at)?,
            created_at: parse_datetime(&self.created_at)?,
            version: self.version,
        })
    }
}

impl IdempotencyRepository for SqliteStore {
    async fn get_idempotency_key(
        &self,
        workflow_id: &str,
        key: &str,
    ) -> Result<Option<IdempotencyEntry>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT workflow_id, key, execution_id, status, result, lease_expires_at,
                      expires_at, created_at, version
               FROM idempotency_keys WHERE workflow_id = ? AND key = ?"#,
        )
        .bind(workflow_id)
        .bind(key)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = IdempotencyRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_entry()?))
            }
            None => Ok(None),
        }
    }

    async fn insert_idempotency_key(&self, entry: &IdempotencyEntry) -> Result<bool, RepositoryError> {
        let result_json = entry.result.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO idempotency_keys
               (workflow_id, key, execution_id, status, result, lease_expires_at, expires_at,
                created_at, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id, key) DO NOTHING"#,
        )
        .bind(&entry.workflow_id)
        .bind(&entry.key)
        .bind(entry.execution_id.to_string())
        .bind(entry.status.to_string())
        .bind(&result_json)
        .bind(format_opt_datetime(entry.lease_expires_at.as_ref()))
        .bind(format_datetime(&entry.expires_at))
        .bind(format_datetime(&entry.created_at))
        .bind(entry.version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_swap_idempotency_key(
        &self,
        entry: &IdempotencyEntry,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let result_json = entry.result.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE idempotency_keys SET
                 execution_id = ?, status = ?, result = ?, lease_expires_at = ?,
                 expires_at = ?, created_at = ?, version = ?
               WHERE workflow_id = ? AND key = ? AND version = ?"#,
        )
        .bind(entry.execution_id.to_string())
        .bind(entry.status.to_string())
        .bind(&result_json)
        .bind(format_opt_datetime(entry.lease_expires_at.as_ref()))
        .bind(format_datetime(&entry.expires_at))
        .bind(format_datetime(&entry.created_at))
        .bind(entry.version)
        .bind(&entry.workflow_id)
        .bind(&entry.key)
        .bind(expected_version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_idempotency_key(
        &self,
        workflow_id: &str,
        key: &str,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM idempotency_keys WHERE workflow_id = ? AND key = ? AND version = ?",
        )
        .bind(workflow_id)
        .bind(key)
        .bind(expected_version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired_idempotency_keys(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        // Same liveness rule as `IdempotencyEntry::is_live`.
        let now = format_datetime(&now);
        let result = sqlx::query(
            r#"DELETE FROM idempotency_keys
               WHERE (status = ?1 AND expires_at <= ?3)
                  OR (status = ?2 AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?3)"#,
        )
        .bind(IdempotencyStatus::Completed.to_string())
        .bind(IdempotencyStatus::InProgress.to_string())
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected())
    }
}
