//! Token bucket rate limiting over shared bucket records.
//!
//! On every check: `tokens = min(burst, tokens + elapsed * rate)`; a dispatch
//! consumes one token. A caller that finds fewer than one token is told how
//! long until the next token accrues; deferral and escalation are the
//! caller's job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use flowline_types::resilience::RateLimiterRecord;
use flowline_types::workflow::RateLimitPolicy;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::repository::RateLimiterRepository;

const MAX_CAS_ATTEMPTS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenGrant {
    Granted,
    Denied { retry_after: Duration },
}

/// Accrue tokens for the time since the last refill.
pub fn refill(bucket: &mut RateLimiterRecord, now: DateTime<Utc>) {
    if now <= bucket.last_refill_at {
        return;
    }
    let elapsed = (now - bucket.last_refill_at)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let burst = f64::from(bucket.burst_size);
    bucket.tokens = (bucket.tokens + elapsed * bucket.rate_per_second).min(burst);
    bucket.last_refill_at = now;
}

/// Refill, then take one token if available.
pub fn try_take(bucket: &mut RateLimiterRecord, now: DateTime<Utc>) -> TokenGrant {
    refill(bucket, now);
    if bucket.tokens >= 1.0 {
        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
        TokenGrant::Granted
    } else {
        let missing = 1.0 - bucket.tokens;
        let secs = if bucket.rate_per_second > 0.0 {
            missing / bucket.rate_per_second
        } else {
            f64::MAX
        };
        TokenGrant::Denied {
            retry_after: Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX),
        }
    }
}

/// Apply a (possibly changed) policy to an existing bucket.
fn apply_policy(bucket: &mut RateLimiterRecord, policy: RateLimitPolicy) {
    bucket.rate_per_second = policy.rate_per_second;
    bucket.burst_size = policy.burst_size;
    bucket.tokens = bucket.tokens.min(f64::from(policy.burst_size));
}

#[derive(Clone)]
pub struct RateLimiters<S> {
    store: S,
    clock: Clock,
}

impl<S: RateLimiterRepository> RateLimiters<S> {
    pub fn new(store: S, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Try to consume one token from `limit_key`'s bucket.
    pub async fn try_acquire(
        &self,
        limit_key: &str,
        policy: RateLimitPolicy,
    ) -> Result<TokenGrant, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = match self.store.get_bucket(limit_key).await? {
                Some(bucket) => bucket,
                None => {
                    let fresh = RateLimiterRecord::new(limit_key, policy, now);
                    self.store.insert_bucket(&fresh).await?;
                    continue;
                }
            };

            let mut next = current.clone();
            apply_policy(&mut next, policy);
            let grant = try_take(&mut next, now);
            if let TokenGrant::Denied { retry_after } = grant {
                tracing::debug!(
                    limit_key,
                    tokens = next.tokens,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limit token unavailable"
                );
                return Ok(grant);
            }

            next.version = current.version + 1;
            if self
                .store
                .compare_and_swap_bucket(&next, current.version)
                .await?
            {
                return Ok(grant);
            }
        }
        Err(EngineError::Contention(format!("rate limiter {limit_key}")))
    }
}
