//! SQLite environment configuration and promotion storage.
//!
//! Each section of an environment config is stored as its own JSON column.

use flowline_core::repository::EnvironmentRepository;
use flowline_types::environment::{Environment, EnvironmentConfig, Promotion};
use flowline_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteStore, format_datetime, format_opt_datetime, from_json, parse_datetime, parse_enum,
    parse_opt_datetime, parse_uuid, query_err, to_json,
};

struct EnvironmentRow {
    workflow_id: String,
    environment: String,
    variables: String,
    secret_refs: String,
    rate_limits: String,
    circuit_breakers: String,
    updated_at: String,
}

impl EnvironmentRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            environment: row.try_get("environment")?,
            variables: row.try_get("variables")?,
            secret_refs: row.try_get("secret_refs")?,
            rate_limits: row.try_get("rate_limits")?,
            circuit_breakers: row.try_get("circuit_breakers")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_config(self) -> Result<EnvironmentConfig, RepositoryError> {
        Ok(EnvironmentConfig {
            workflow_id: self.workflow_id,
            environment: parse_enum(&self.environment)?,
            variables: from_json(&self.variables, "variables")?,
            secret_refs: from_json(&self.secret_refs, "secret_refs")?,
            rate_limits: from_json(&self.rate_limits, "rate_limits")?,
            circuit_breakers: from_json(&self.circuit_breakers, "circuit_breakers")?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct PromotionRow {
    id: String,
    workflow_id: String,
    from_env: String,
    to_env: String,
    diff: String,
    rollback_snapshot: Option<String>,
    promoted_at: String,
    rolled_back_at: Option<String>,
}

impl PromotionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            from_env: row.try_get("from_env")?,
            to_env: row.try_get("to_env")?,
            diff: row.try_get("diff")?,
            rollback_snapshot: row.try_get("rollback_snapshot")?,
            promoted_at: row.try_get("promoted_at")?,
            rolled_back_at: row.try_get("rolled_back_at")?,
        })
    }

    fn into_promotion(self) -> Result<Promotion, RepositoryError> {
        Ok(Promotion {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            from_env: parse_enum(&self.from_env)?,
            to_env: parse_enum(&self.to_env)?,
            diff: from_json(&self.diff, "promotion diff")?,
            rollback_snapshot: self
                .rollback_snapshot
                .as_deref()
                .map(|s| from_json(s, "rollback snapshot"))
                .transpose()?,
            promoted_at: parse_datetime(&self.promoted_at)?,
            rolled_back_at: parse_opt_datetime(self.rolled_back_at)?,
        })
    }
}

const PROMOTION_COLUMNS: &str =
    "id, workflow_id, from_env, to_env, diff, rollback_snapshot, promoted_at, rolled_back_at";

impl EnvironmentRepository for SqliteStore {
    async fn get_environment(
        &self,
        workflow_id: &str,
        environment: Environment,
    ) -> Result<Option<EnvironmentConfig>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT workflow_id, environment, variables, secret_refs, rate_limits,
                      circuit_breakers, updated_at
               FROM environment_configs WHERE workflow_id = ? AND environment = ?"#,
        )
        .bind(workflow_id)
        .bind(environment.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = EnvironmentRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_config()?))
            }
            None => Ok(None),
        }
    }

    async fn save_environment(&self, config: &EnvironmentConfig) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO environment_configs
               (workflow_id, environment, variables, secret_refs, rate_limits, circuit_breakers,
                updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id, environment) DO UPDATE SET
                 variables = excluded.variables,
                 secret_refs = excluded.secret_refs,
                 rate_limits = excluded.rate_limits,
                 circuit_breakers = excluded.circuit_breakers,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&config.workflow_id)
        .bind(config.environment.to_string())
        .bind(to_json(&config.variables)?)
        .bind(to_json(&config.secret_refs)?)
        .bind(to_json(&config.rate_limits)?)
        .bind(to_json(&config.circuit_breakers)?)
        .bind(format_datetime(&config.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn delete_environment(
        &self,
        workflow_id: &str,
        environment: Environment,
    ) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM environment_configs WHERE workflow_id = ? AND environment = ?")
                .bind(workflow_id)
                .bind(environment.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_promotion(&self, promotion: &Promotion) -> Result<(), RepositoryError> {
        let rollback = promotion
            .rollback_snapshot
            .as_ref()
            .map(to_json)
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO promotions
               (id, workflow_id, from_env, to_env, diff, rollback_snapshot, promoted_at,
                rolled_back_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 diff = excluded.diff,
                 rollback_snapshot = excluded.rollback_snapshot,
                 rolled_back_at = excluded.rolled_back_at"#,
        )
        .bind(promotion.id.to_string())
        .bind(&promotion.workflow_id)
        .bind(promotion.from_env.to_string())
        .bind(promotion.to_env.to_string())
        .bind(to_json(&promotion.diff)?)
        .bind(&rollback)
        .bind(format_datetime(&promotion.promoted_at))
        .bind(format_opt_datetime(promotion.rolled_back_at.as_ref()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_promotion(&self, id: &Uuid) -> Result<Option<Promotion>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {PROMOTION_COLUMNS} FROM promotions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = PromotionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_promotion()?))
            }
            None => Ok(None),
        }
    }

    async fn list_promotions(&self, workflow_id: &str) -> Result<Vec<Promotion>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {PROMOTION_COLUMNS} FROM promotions
               WHERE workflow_id = ?
               ORDER BY promoted_at DESC, id DESC"#
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut promotions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = PromotionRow::from_row(row).map_err(query_err)?;
            promotions.push(r.into_promotion()?);
        }
        Ok(promotions)
    }
}
