//! Repository traits for shared resilience state.
//!
//! All three record kinds are updated with compare-and-swap on `version`.

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use flowline_types::resilience::{CircuitBreakerRecord, IdempotencyEntry, RateLimiterRecord};

pub trait CircuitBreakerRepository: Send + Sync {
    fn get_breaker(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<CircuitBreakerRecord>, RepositoryError>> + Send;

    /// Insert if absent. Returns `false` if a record already exists.
    fn insert_breaker(
        &self,
        record: &CircuitBreakerRecord,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn compare_and_swap_breaker(
        &self,
        record: &CircuitBreakerRecord,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn list_breakers(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<CircuitBreakerRecord>, RepositoryError>> + Send;
}

pub trait RateLimiterRepository: Send + Sync {
    fn get_bucket(
        &self,
        limit_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<RateLimiterRecord>, RepositoryError>> + Send;

    /// Insert if absent. Returns `false` if a bucket already exists.
    fn insert_bucket(
        &self,
        record: &RateLimiterRecord,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn compare_and_swap_bucket(
        &self,
        record: &RateLimiterRecord,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

pub trait IdempotencyRepository: Send + Sync {
    fn get_idempotency_key(
        &self,
        workflow_id: &str,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<IdempotencyEntry>, RepositoryError>> + Send;

    /// Insert if absent. Returns `false` if the key already exists.
    fn insert_idempotency_key(
        &self,
        entry: &IdempotencyEntry,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn compare_and_swap_idempotency_key(
        &self,
        entry: &IdempotencyEntry,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Delete the key if its version still matches.
    fn delete_idempotency_key(
        &self,
        workflow_id: &str,
        key: &str,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Remove keys that no longer block a new holder at `now` (completed
    /// past `expires_at`, in progress past their lease). Returns the count.
    fn purge_expired_idempotency_keys(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
