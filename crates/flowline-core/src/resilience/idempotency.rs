//! Idempotency registry: key -> result cache guarding side effects.
//!
//! `acquire` hands a key to exactly one holder. A completed, unexpired entry
//! returns its cached result so the side effect is not repeated; an
//! in-progress entry blocks other holders until it completes or its lease
//! lapses. After `expires_at` a key may be reused, so the guarantee is
//! time-bounded.

use chrono::{DateTime, TimeDelta};
use chrono::Utc;
use flowline_types::resilience::{IdempotencyEntry, IdempotencyStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::repository::IdempotencyRepository;

const MAX_CAS_ATTEMPTS: u32 = 32;

/// Outcome of [`IdempotencyRegistry::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    /// The caller now holds the key and must `complete` or `release` it.
    Proceed,
    /// The side effect already happened; reuse its result.
    Completed {
        execution_id: Uuid,
        result: Option<Value>,
    },
    /// Another holder is mid-flight.
    InProgress {
        execution_id: Uuid,
        lease_expires_at: Option<DateTime<Utc>>,
    },
}

#[derive(Clone)]
pub struct IdempotencyRegistry<S> {
    store: S,
    clock: Clock,
    lease: TimeDelta,
}

impl<S: IdempotencyRepository> IdempotencyRegistry<S> {
    pub fn new(store: S, clock: Clock, in_progress_lease_seconds: u64) -> Self {
        Self {
            store,
            clock,
            lease: crate::clock::seconds(in_progress_lease_seconds),
        }
    }

    pub async fn acquire(
        &self,
        workflow_id: &str,
        key: &str,
        execution_id: Uuid,
    ) -> Result<Acquisition, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let lease_until = now + self.lease;
            let claim = |version: i64| IdempotencyEntry {
                workflow_id: workflow_id.to_string(),
                key: key.to_string(),
                execution_id,
                status: IdempotencyStatus::InProgress,
                result: None,
                lease_expires_at: Some(lease_until),
                expires_at: lease_until,
                created_at: now,
                version,
            };

            match self.store.get_idempotency_key(workflow_id, key).await? {
                None => {
                    if self.store.insert_idempotency_key(&claim(0)).await? {
                        tracing::debug!(workflow_id, key, %execution_id, "idempotency key acquired");
                        return Ok(Acquisition::Proceed);
                    }
                }
                Some(existing) if !existing.is_live(now) => {
                    if self
                        .store
                        .compare_and_swap_idempotency_key(&claim(existing.version + 1), existing.version)
                        .await?
                    {
                        tracing::debug!(
                            workflow_id,
                            key,
                            %execution_id,
                            previous_holder = %existing.execution_id,
                            "idempotency key reclaimed after expiry"
                        );
                        return Ok(Acquisition::Proceed);
                    }
                }
                Some(existing) => {
                    return Ok(match existing.status {
                        IdempotencyStatus::Completed => Acquisition::Completed {
                            execution_id: existing.execution_id,
                            result: existing.result,
                        },
                        IdempotencyStatus::InProgress => Acquisition::InProgress {
                            execution_id: existing.execution_id,
                            lease_expires_at: existing.lease_expires_at,
                        },
                    });
                }
            }
        }
        Err(EngineError::Contention(format!("idempotency key {key}")))
    }

    /// Finalize a held key with its result and start the TTL countdown.
    ///
    /// Returns `false` if the caller no longer holds the key (its lease
    /// lapsed and another holder took over).
    pub async fn complete(
        &self,
        workflow_id: &str,
        key: &str,
        execution_id: Uuid,
        result: Value,
        ttl_seconds: u64,
    ) -> Result<bool, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let Some(existing) = self.store.get_idempotency_key(workflow_id, key).await? else {
                tracing::warn!(workflow_id, key, %execution_id, "completing an idempotency key that no longer exists");
                return Ok(false);
            };
            if existing.execution_id != execution_id
                || existing.status != IdempotencyStatus::InProgress
            {
                tracing::warn!(
                    workflow_id,
                    key,
                    %execution_id,
                    holder = %existing.execution_id,
                    "idempotency key lost before completion"
                );
                return Ok(false);
            }

            let done = IdempotencyEntry {
                status: IdempotencyStatus::Completed,
                result: Some(result.clone()),
                lease_expires_at: None,
                expires_at: now + crate::clock::seconds(ttl_seconds),
                version: existing.version + 1,
                ..existing.clone()
            };
            if self
                .store
                .compare_and_swap_idempotency_key(&done, existing.version)
                .await?
            {
                tracing::debug!(workflow_id, key, %execution_id, ttl_seconds, "idempotency key completed");
                return Ok(true);
            }
        }
        Err(EngineError::Contention(format!("idempotency key {key}")))
    }

    /// Drop a held in-progress key after a failed attempt so a retry can
    /// acquire it.
    pub async fn release(
        &self,
        workflow_id: &str,
        key: &str,
        execution_id: Uuid,
    ) -> Result<bool, EngineError> {
        let Some(existing) = self.store.get_idempotency_key(workflow_id, key).await? else {
            return Ok(false);
        };
        if existing.execution_id != execution_id || existing.status != IdempotencyStatus::InProgress {
            return Ok(false);
        }
        Ok(self
            .store
            .delete_idempotency_key(workflow_id, key, existing.version)
            .await?)
    }

    pub async fn purge_expired(&self) -> Result<u64, EngineError> {
        Ok(self
            .store
            .purge_expired_idempotency_keys(self.clock.now())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn registry(store: &MemoryStore, clock: Clock) -> IdempotencyRegistry<MemoryStore> {
        IdempotencyRegistry::new(store.clone(), clock, 60)
    }

    #[tokio::test]
    async fn first_holder_proceeds_second_sees_in_progress() {
        let store = MemoryStore::new();
        let reg = registry(&store, Clock::new());
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());

        assert_eq!(reg.acquire("wf", "k", a).await.unwrap(), Acquisition::Proceed);
        match reg.acquire("wf", "k", b).await.unwrap() {
            Acquisition::InProgress { execution_id, .. } => assert_eq!(execution_id, a),
            other => panic!("expected in-progress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_key_returns_cached_result() {
        let store = MemoryStore::new();
        let reg = registry(&store, Clock::new());
        let a = Uuid::now_v7();

        reg.acquire("wf", "k", a).await.unwrap();
        assert!(reg.complete("wf", "k", a, json!({"sent": 1}), 3600).await.unwrap());

        match reg.acquire("wf", "k", Uuid::now_v7()).await.unwrap() {
            Acquisition::Completed {
                execution_id,
                result,
            } => {
                assert_eq!(execution_id, a);
                assert_eq!(result, Some(json!({"sent": 1})));
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn keys_are_scoped_per_workflow() {
        let store = MemoryStore::new();
        let reg = registry(&store, Clock::new());
        reg.acquire("wf-a", "k", Uuid::now_v7()).await.unwrap();
        assert_eq!(
            reg.acquire("wf-b", "k", Uuid::now_v7()).await.unwrap(),
            Acquisition::Proceed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_reusable() {
        let store = MemoryStore::new();
        let reg = registry(&store, Clock::new());
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());

        reg.acquire("wf", "k", a).await.unwrap();
        reg.complete("wf", "k", a, json!(1), 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(reg.acquire("wf", "k", b).await.unwrap(), Acquisition::Proceed);

        // Stale lease: b never completes, c takes over after the lease.
        let c = Uuid::now_v7();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(reg.acquire("wf", "k", c).await.unwrap(), Acquisition::Proceed);
        assert!(!reg.complete("wf", "k", b, json!(2), 10).await.unwrap());
    }

    #[tokio::test]
    async fn release_lets_retry_acquire() {
        let store = MemoryStore::new();
        let reg = registry(&store, Clock::new());
        let a = Uuid::now_v7();
        reg.acquire("wf", "k", a).await.unwrap();
        assert!(!reg.release("wf", "k", Uuid::now_v7()).await.unwrap());
        assert!(reg.release("wf", "k", a).await.unwrap());
        assert_eq!(reg.acquire("wf", "k", a).await.unwrap(), Acquisition::Proceed);
    }
}
