//! Environment resolution and promotion.
//!
//! Each (workflow, environment) pair may carry variables, secret references
//! and limiter/breaker overrides. Promotion copies one environment's config
//! onto a later stage, recording a key-level diff and the target's previous
//! config so the promotion can be rolled back.

use std::collections::BTreeMap;

use flowline_types::environment::{DiffChange, DiffEntry, Environment, EnvironmentConfig, Promotion};
use flowline_types::workflow::{CircuitBreakerPolicy, RateLimitPolicy};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::repository::EnvironmentRepository;

/// Effective settings for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEnvironment {
    pub environment: Environment,
    pub variables: BTreeMap<String, Value>,
    pub secret_refs: BTreeMap<String, String>,
    pub rate_limits: BTreeMap<String, RateLimitPolicy>,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerPolicy>,
}

impl ResolvedEnvironment {
    pub fn empty(environment: Environment) -> Self {
        Self {
            environment,
            variables: BTreeMap::new(),
            secret_refs: BTreeMap::new(),
            rate_limits: BTreeMap::new(),
            circuit_breakers: BTreeMap::new(),
        }
    }
}

impl From<EnvironmentConfig> for ResolvedEnvironment {
    fn from(config: EnvironmentConfig) -> Self {
        Self {
            environment: config.environment,
            variables: config.variables,
            secret_refs: config.secret_refs,
            rate_limits: config.rate_limits,
            circuit_breakers: config.circuit_breakers,
        }
    }
}

/// Key-level diff of two configs, section by section.
pub fn diff_configs(old: &EnvironmentConfig, new: &EnvironmentConfig) -> Vec<DiffEntry> {
    let mut diff = Vec::new();
    diff_section(&mut diff, "variables", &old.variables, &new.variables);
    diff_section(&mut diff, "secret_refs", &old.secret_refs, &new.secret_refs);
    diff_section(&mut diff, "rate_limits", &old.rate_limits, &new.rate_limits);
    diff_section(
        &mut diff,
        "circuit_breakers",
        &old.circuit_breakers,
        &new.circuit_breakers,
    );
    diff
}

fn diff_section<T: Serialize>(
    out: &mut Vec<DiffEntry>,
    section: &str,
    old: &BTreeMap<String, T>,
    new: &BTreeMap<String, T>,
) {
    let to_value = |v: &T| serde_json::to_value(v).unwrap_or(Value::Null);
    for (key, value) in new {
        let change = match old.get(key) {
            None => DiffChange::Added {
                value: to_value(value),
            },
            Some(previous) => {
                let (from, to) = (to_value(previous), to_value(value));
                if from == to {
                    continue;
                }
                DiffChange::Changed { from, to }
            }
        };
        out.push(DiffEntry {
            section: section.to_string(),
            key: key.clone(),
            change,
        });
    }
    for (key, value) in old {
        if !new.contains_key(key) {
            out.push(DiffEntry {
                section: section.to_string(),
                key: key.clone(),
                change: DiffChange::Removed {
                    value: to_value(value),
                },
            });
        }
    }
}

#[derive(Clone)]
pub struct EnvironmentResolver<S> {
    store: S,
    clock: Clock,
}

impl<S: EnvironmentRepository> EnvironmentResolver<S> {
    pub fn new(store: S, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Effective settings, empty when the environment has no config.
    pub async fn resolve(
        &self,
        workflow_id: &str,
        environment: Environment,
    ) -> Result<ResolvedEnvironment, EngineError> {
        Ok(self
            .store
            .get_environment(workflow_id, environment)
            .await?
            .map(ResolvedEnvironment::from)
            .unwrap_or_else(|| ResolvedEnvironment::empty(environment)))
    }

    pub async fn get(
        &self,
        workflow_id: &str,
        environment: Environment,
    ) -> Result<Option<EnvironmentConfig>, EngineError> {
        Ok(self.store.get_environment(workflow_id, environment).await?)
    }

    pub async fn set(&self, mut config: EnvironmentConfig) -> Result<EnvironmentConfig, EngineError> {
        config.updated_at = self.clock.now();
        self.store.save_environment(&config).await?;
        tracing::info!(
            workflow_id = config.workflow_id.as_str(),
            environment = %config.environment,
            variables = config.variables.len(),
            "environment config saved"
        );
        Ok(config)
    }

    /// Copy `from`'s config onto `to`. Only forward promotions are allowed.
    pub async fn promote(
        &self,
        workflow_id: &str,
        from: Environment,
        to: Environment,
    ) -> Result<Promotion, EngineError> {
        if from >= to {
            return Err(EngineError::InvalidTransition(format!(
                "cannot promote {from} to {to}: promotion only moves forward"
            )));
        }
        let source = self
            .store
            .get_environment(workflow_id, from)
            .await?
            .ok_or_else(|| {
                EngineError::InvalidRequest(format!(
                    "workflow '{workflow_id}' has no {from} config to promote"
                ))
            })?;
        let previous = self.store.get_environment(workflow_id, to).await?;

        let now = self.clock.now();
        let promoted = EnvironmentConfig {
            environment: to,
            updated_at: now,
            ..source
        };
        let baseline = previous
            .clone()
            .unwrap_or_else(|| EnvironmentConfig::empty(workflow_id, to, now));
        let diff = diff_configs(&baseline, &promoted);

        self.store.save_environment(&promoted).await?;
        let promotion = Promotion {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            from_env: from,
            to_env: to,
            diff,
            rollback_snapshot: previous,
            promoted_at: now,
            rolled_back_at: None,
        };
        self.store.save_promotion(&promotion).await?;

        tracing::info!(
            workflow_id,
            promotion_id = %promotion.id,
            from = %from,
            to = %to,
            changes = promotion.diff.len(),
            "environment promoted"
        );
        Ok(promotion)
    }

    /// Restore the target environment to its pre-promotion config.
    pub async fn rollback(&self, promotion_id: Uuid) -> Result<Promotion, EngineError> {
        let mut promotion = self
            .store
            .get_promotion(&promotion_id)
            .await?
            .ok_or_else(|| EngineError::InvalidRequest(format!("promotion {promotion_id} not found")))?;
        if promotion.rolled_back_at.is_some() {
            return Err(EngineError::InvalidTransition(format!(
                "promotion {promotion_id} was already rolled back"
            )));
        }

        let now = self.clock.now();
        match &promotion.rollback_snapshot {
            Some(snapshot) => {
                let restored = EnvironmentConfig {
                    updated_at: now,
                    ..snapshot.clone()
                };
                self.store.save_environment(&restored).await?;
            }
            None => {
                self.store
                    .delete_environment(&promotion.workflow_id, promotion.to_env)
                    .await?;
            }
        }
        promotion.rolled_back_at = Some(now);
        self.store.save_promotion(&promotion).await?;

        tracing::info!(
            workflow_id = promotion.workflow_id.as_str(),
            promotion_id = %promotion_id,
            environment = %promotion.to_env,
            "promotion rolled back"
        );
        Ok(promotion)
    }

    pub async fn list_promotions(&self, workflow_id: &str) -> Result<Vec<Promotion>, EngineError> {
        Ok(self.store.list_promotions(workflow_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn config(env: Environment, region: &str) -> EnvironmentConfig {
        let mut config = EnvironmentConfig::empty("wf", env, chrono::Utc::now());
        config.variables.insert("region".into(), json!(region));
        config
    }

    #[tokio::test]
    async fn resolve_defaults_to_empty() {
        let resolver = EnvironmentResolver::new(MemoryStore::new(), Clock::new());
        let resolved = resolver.resolve("wf", Environment::Staging).await.unwrap();
        assert_eq!(resolved, ResolvedEnvironment::empty(Environment::Staging));
    }

    #[tokio::test]
    async fn promote_records_diff_and_rolls_back() {
        let resolver = EnvironmentResolver::new(MemoryStore::new(), Clock::new());
        let mut dev = config(Environment::Development, "us");
        dev.rate_limits.insert(
            "crm".into(),
            RateLimitPolicy {
                rate_per_second: 5.0,
                burst_size: 10,
            },
        );
        resolver.set(dev).await.unwrap();
        let mut staging = config(Environment::Staging, "eu");
        staging.variables.insert("debug".into(), json!(true));
        resolver.set(staging).await.unwrap();

        let promotion = resolver
            .promote("wf", Environment::Development, Environment::Staging)
            .await
            .unwrap();
        let keys: Vec<(&str, &str)> = promotion
            .diff
            .iter()
            .map(|d| (d.section.as_str(), d.key.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("variables", "region"),
                ("variables", "debug"),
                ("rate_limits", "crm")
            ]
        );
        assert!(matches!(promotion.diff[1].change, DiffChange::Removed { .. }));

        let resolved = resolver.resolve("wf", Environment::Staging).await.unwrap();
        assert_eq!(resolved.variables["region"], json!("us"));
        assert!(resolved.rate_limits.contains_key("crm"));

        resolver.rollback(promotion.id).await.unwrap();
        let restored = resolver.resolve("wf", Environment::Staging).await.unwrap();
        assert_eq!(restored.variables["region"], json!("eu"));
        assert_eq!(restored.variables["debug"], json!(true));
        assert!(resolver.rollback(promotion.id).await.is_err());
    }

    #[tokio::test]
    async fn promotion_is_forward_only() {
        let resolver = EnvironmentResolver::new(MemoryStore::new(), Clock::new());
        resolver.set(config(Environment::Production, "us")).await.unwrap();
        let err = resolver
            .promote("wf", Environment::Production, Environment::Staging)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn rollback_of_first_promotion_removes_target() {
        let resolver = EnvironmentResolver::new(MemoryStore::new(), Clock::new());
        resolver.set(config(Environment::Staging, "us")).await.unwrap();
        let promotion = resolver
            .promote("wf", Environment::Staging, Environment::Production)
            .await
            .unwrap();
        assert!(promotion.rollback_snapshot.is_none());
        resolver.rollback(promotion.id).await.unwrap();
        assert!(
            resolver
                .get("wf", Environment::Production)
                .await
                .unwrap()
                .is_none()
        );
    }
}
