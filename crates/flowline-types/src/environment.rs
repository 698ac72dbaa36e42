//! Per-environment configuration and promotion records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{CircuitBreakerPolicy, RateLimitPolicy};

/// Deployment stage. Promotion only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("invalid environment: '{other}'")),
        }
    }
}

/// Variables, secret references and resilience overrides for one
/// (workflow, environment) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub workflow_id: String,
    pub environment: Environment,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Name -> reference into the external secret store. Never the secret itself.
    #[serde(default)]
    pub secret_refs: BTreeMap<String, String>,
    /// Limit key -> bucket override.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitPolicy>,
    /// Node id -> breaker override.
    #[serde(default)]
    pub circuit_breakers: BTreeMap<String, CircuitBreakerPolicy>,
    pub updated_at: DateTime<Utc>,
}

impl EnvironmentConfig {
    pub fn empty(workflow_id: &str, environment: Environment, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            environment,
            variables: BTreeMap::new(),
            secret_refs: BTreeMap::new(),
            rate_limits: BTreeMap::new(),
            circuit_breakers: BTreeMap::new(),
            updated_at: now,
        }
    }
}

/// Audit record of copying one environment's config onto the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    pub id: Uuid,
    pub workflow_id: String,
    pub from_env: Environment,
    pub to_env: Environment,
    pub diff: Vec<DiffEntry>,
    /// Target config before promotion. `None` if the target had none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_snapshot: Option<EnvironmentConfig>,
    pub promoted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<DateTime<Utc>>,
}

/// One changed key between the target's old config and the promoted one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// "variables", "secret_refs", "rate_limits" or "circuit_breakers".
    pub section: String,
    pub key: String,
    #[serde(flatten)]
    pub change: DiffChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum DiffChange {
    Added { value: Value },
    Removed { value: Value },
    Changed { from: Value, to: Value },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_order_and_aliases() {
        assert!(Environment::Development < Environment::Staging);
        assert!(Environment::Staging < Environment::Production);
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_diff_entry_is_flat() {
        let entry = DiffEntry {
            section: "variables".into(),
            key: "region".into(),
            change: DiffChange::Changed {
                from: "eu".into(),
                to: "us".into(),
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["change"], "changed");
        assert_eq!(json["from"], "eu");
        assert_eq!(json["section"], "variables");
    }
}
