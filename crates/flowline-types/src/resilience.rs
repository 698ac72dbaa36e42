//! Shared resilience state: circuit breakers, rate limiters and idempotency
//! keys.
//!
//! All three records are shared across executions and workers, and carry a
//! `version` used for compare-and-swap updates in the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{CircuitBreakerPolicy, RateLimitPolicy};

// ---------------------------------------------------------------------------
// Circuit Breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" | "half-open" | "halfopen" => Ok(CircuitState::HalfOpen),
            other => Err(format!("invalid circuit state: '{other}'")),
        }
    }
}

/// Failure tracker for one (workflow, node) target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerRecord {
    pub workflow_id: String,
    pub node_id: String,
    pub state: CircuitState,
    /// Failures inside the current observation window.
    pub failure_count: u32,
    /// Consecutive probe successes while half-open.
    pub success_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When an open breaker may admit a probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opens_at: Option<DateTime<Utc>>,
    /// Lease on the single half-open probe. Expired leases are reclaimable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_lease_until: Option<DateTime<Utc>>,
    pub policy: CircuitBreakerPolicy,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl CircuitBreakerRecord {
    pub fn new(
        workflow_id: &str,
        node_id: &str,
        policy: CircuitBreakerPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            node_id: node_id.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            window_started_at: None,
            last_failure_at: None,
            opens_at: None,
            probe_lease_until: None,
            policy,
            version: 0,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Rate Limiter
// ---------------------------------------------------------------------------

/// Token bucket for one limit key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterRecord {
    pub limit_key: String,
    /// Never negative.
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
    pub rate_per_second: f64,
    pub burst_size: u32,
    pub version: i64,
}

impl RateLimiterRecord {
    /// A full bucket.
    pub fn new(limit_key: &str, policy: RateLimitPolicy, now: DateTime<Utc>) -> Self {
        Self {
            limit_key: limit_key.to_string(),
            tokens: f64::from(policy.burst_size),
            last_refill_at: now,
            rate_per_second: policy.rate_per_second,
            burst_size: policy.burst_size,
            version: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdempotencyStatus::InProgress => write!(f, "in_progress"),
            IdempotencyStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for IdempotencyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(IdempotencyStatus::InProgress),
            "completed" => Ok(IdempotencyStatus::Completed),
            other => Err(format!("invalid idempotency status: '{other}'")),
        }
    }
}

/// Key -> result cache entry, scoped to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub workflow_id: String,
    pub key: String,
    /// Execution that holds (or held) the key.
    pub execution_id: Uuid,
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// In-progress entries whose lease passed are presumed abandoned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Completed entries stop deduplicating after this instant.
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl IdempotencyEntry {
    /// Whether the entry still blocks a new holder at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            IdempotencyStatus::Completed => now < self.expires_at,
            IdempotencyStatus::InProgress => self.lease_expires_at.is_none_or(|lease| now < lease),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_circuit_state_parse_variants() {
        assert_eq!("half-open".parse::<CircuitState>().unwrap(), CircuitState::HalfOpen);
        assert_eq!("OPEN".parse::<CircuitState>().unwrap(), CircuitState::Open);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert!("tripped".parse::<CircuitState>().is_err());
    }

    #[test]
    fn test_new_bucket_is_full() {
        let policy = RateLimitPolicy {
            rate_per_second: 2.0,
            burst_size: 10,
        };
        let bucket = RateLimiterRecord::new("http", policy, Utc::now());
        assert!((bucket.tokens - 10.0).abs() < f64::EPSILON);
        assert_eq!(bucket.version, 0);
    }

    #[test]
    fn test_idempotency_entry_liveness() {
        let now = Utc::now();
        let mut entry = IdempotencyEntry {
            workflow_id: "wf".into(),
            key: "k".into(),
            execution_id: Uuid::now_v7(),
            status: IdempotencyStatus::InProgress,
            result: None,
            lease_expires_at: Some(now + Duration::seconds(30)),
            expires_at: now + Duration::hours(1),
            created_at: now,
            version: 0,
        };
        assert!(entry.is_live(now));
        assert!(!entry.is_live(now + Duration::seconds(31)));

        entry.status = IdempotencyStatus::Completed;
        assert!(entry.is_live(now + Duration::minutes(59)));
        assert!(!entry.is_live(now + Duration::hours(1)));
    }
}
