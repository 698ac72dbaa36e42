//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! section and field has a default, so an empty or missing file yields a
//! working engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::workflow::{CircuitBreakerPolicy, IdempotencyPolicy, RetryPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    /// Default node retry policy when neither node nor workflow sets one.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerPolicy,
    #[serde(default)]
    pub idempotency: IdempotencyPolicy,
    #[serde(default)]
    pub dead_letter: DeadLetterSettings,
    /// HTTP executor plugins keyed by node type.
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorEndpoint>,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_environment")]
    pub default_environment: String,
    /// Worker loop tick.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Length of a driver's lease on a running execution. The driver renews
    /// it every third of this; once it lapses the execution is presumed
    /// orphaned and another instance may resume it.
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    /// Rows claimed per sweep.
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: u32,
    /// How long a half-open probe holds the breaker.
    #[serde(default = "default_probe_lease_seconds")]
    pub probe_lease_seconds: u64,
    /// How long an in-progress idempotency key blocks other holders.
    #[serde(default = "default_in_progress_lease_seconds")]
    pub in_progress_lease_seconds: u64,
    /// Shortest rate limiter deferral.
    #[serde(default = "default_rate_limit_poll_ms")]
    pub rate_limit_poll_ms: u64,
    /// Recheck delay for executions parked on an in-flight idempotency key.
    #[serde(default = "default_conflict_recheck_secs")]
    pub conflict_recheck_secs: u64,
    /// Node timeout when the definition sets none.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_stall_threshold_secs() -> u64 {
    300
}

fn default_sweep_batch_size() -> u32 {
    50
}

fn default_probe_lease_seconds() -> u64 {
    30
}

fn default_in_progress_lease_seconds() -> u64 {
    300
}

fn default_rate_limit_poll_ms() -> u64 {
    50
}

fn default_conflict_recheck_secs() -> u64 {
    5
}

fn default_node_timeout_secs() -> u64 {
    300
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_environment: default_environment(),
            poll_interval_ms: default_poll_interval_ms(),
            stall_threshold_secs: default_stall_threshold_secs(),
            sweep_batch_size: default_sweep_batch_size(),
            probe_lease_seconds: default_probe_lease_seconds(),
            in_progress_lease_seconds: default_in_progress_lease_seconds(),
            rate_limit_poll_ms: default_rate_limit_poll_ms(),
            conflict_recheck_secs: default_conflict_recheck_secs(),
            node_timeout_secs: default_node_timeout_secs(),
        }
    }
}

/// Redelivery schedule for dead letters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeadLetterSettings {
    #[serde(default = "default_dlq_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_dlq_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_dlq_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_dlq_max_attempts() -> u32 {
    5
}

fn default_dlq_base_delay_ms() -> u64 {
    1_000
}

fn default_dlq_max_delay_ms() -> u64 {
    3_600_000
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_dlq_max_attempts(),
            base_delay_ms: default_dlq_base_delay_ms(),
            max_delay_ms: default_dlq_max_delay_ms(),
        }
    }
}

/// Remote executor for one node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorEndpoint {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Env var holding the operator bearer token. Unset var disables auth.
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,
    /// Env var holding the trigger HMAC secret. Unset var disables verification.
    #[serde(default = "default_trigger_secret_env")]
    pub trigger_secret_env: String,
}

fn default_bind() -> String {
    "127.0.0.1:3700".to_string()
}

fn default_api_token_env() -> String {
    "FLOWLINE_API_TOKEN".to_string()
}

fn default_trigger_secret_env() -> String {
    "FLOWLINE_TRIGGER_SECRET".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_token_env: default_api_token_env(),
            trigger_secret_env: default_trigger_secret_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::InFlightPolicy;

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.default_environment, "development");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.dead_letter.max_attempts, 5);
        assert!(config.executors.is_empty());
        assert_eq!(config.server.bind, "127.0.0.1:3700");
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
[engine]
default_environment = "staging"
stall_threshold_secs = 60

[retry]
max_attempts = 4
base_delay_ms = 50

[circuit_breaker]
failure_threshold = 3
timeout_seconds = 10

[idempotency]
ttl_seconds = 3600
in_flight = { mode = "fail_fast" }

[executors.crm_write]
url = "http://localhost:9000/crm"
headers = { "x-api-key" = "abc" }
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.default_environment, "staging");
        assert_eq!(config.engine.stall_threshold_secs, 60);
        assert_eq!(config.engine.sweep_batch_size, 50);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.success_threshold, 1);
        assert_eq!(config.idempotency.in_flight, InFlightPolicy::FailFast);
        assert_eq!(config.executors["crm_write"].headers["x-api-key"], "abc");
    }
}
