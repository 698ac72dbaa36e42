//! Dead letter queue.
//!
//! An execution that exhausts its retries is captured here with its full
//! trigger payload and latest checkpoint. A worker claims due entries
//! (pending -> retrying), resumes the execution, and on renewed failure the
//! entry is rescheduled with exponential backoff, or abandoned once
//! `attempt_count >= max_attempts`. Abandoned entries wait for an operator.

use flowline_types::config::DeadLetterSettings;
use flowline_types::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use flowline_types::event::EngineEvent;
use flowline_types::execution::Execution;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::event::EventBus;
use crate::repository::DeadLetterRepository;
use crate::workflow::retry::backoff_delay;

const MAX_CAS_ATTEMPTS: u32 = 32;

#[derive(Clone)]
pub struct DeadLetterQueue<S> {
    store: S,
    clock: Clock,
    events: EventBus,
    settings: DeadLetterSettings,
}

impl<S: DeadLetterRepository> DeadLetterQueue<S> {
    pub fn new(store: S, clock: Clock, events: EventBus, settings: DeadLetterSettings) -> Self {
        Self {
            store,
            clock,
            events,
            settings,
        }
    }

    fn next_retry_at(&self, attempt_index: u32) -> chrono::DateTime<chrono::Utc> {
        let delay = backoff_delay(
            attempt_index,
            self.settings.base_delay_ms,
            self.settings.max_delay_ms,
        );
        self.clock.now() + chrono::TimeDelta::from_std(delay).unwrap_or(chrono::TimeDelta::MAX)
    }

    /// Capture a failed execution, or record a renewed failure of one that
    /// was being redelivered.
    pub async fn enqueue(
        &self,
        execution: &Execution,
        error: &str,
        checkpoint_sequence: Option<u64>,
    ) -> Result<DeadLetterEntry, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let Some(current) = self.store.get_dead_letter(&execution.id).await? else {
                let entry = DeadLetterEntry {
                    execution_id: execution.id,
                    workflow_id: execution.workflow_id.clone(),
                    trigger_data: execution.trigger_data.clone(),
                    error: error.to_string(),
                    attempt_count: 0,
                    max_attempts: self.settings.max_attempts,
                    next_retry_at: self.next_retry_at(0),
                    status: DeadLetterStatus::Pending,
                    checkpoint_sequence,
                    created_at: now,
                    updated_at: now,
                    version: 0,
                };
                if self.store.insert_dead_letter(&entry).await? {
                    tracing::warn!(
                        execution_id = %execution.id,
                        workflow_id = execution.workflow_id.as_str(),
                        next_retry_at = %entry.next_retry_at,
                        error,
                        "execution dead-lettered"
                    );
                    self.events.publish(EngineEvent::DeadLetterEnqueued {
                        execution_id: execution.id,
                        error: error.to_string(),
                    });
                    return Ok(entry);
                }
                continue;
            };

            let mut next = current.clone();
            next.error = error.to_string();
            next.updated_at = now;
            if checkpoint_sequence.is_some() {
                next.checkpoint_sequence = checkpoint_sequence;
            }
            if current.status == DeadLetterStatus::Retrying {
                if current.attempt_count >= current.max_attempts {
                    next.status = DeadLetterStatus::Abandoned;
                } else {
                    next.status = DeadLetterStatus::Pending;
                    next.next_retry_at = self.next_retry_at(current.attempt_count);
                }
            }
            next.version = current.version + 1;

            if self
                .store
                .compare_and_swap_dead_letter(&next, current.version)
                .await?
            {
                match next.status {
                    DeadLetterStatus::Abandoned if current.status != DeadLetterStatus::Abandoned => {
                        self.abandoned(&next);
                    }
                    DeadLetterStatus::Pending => {
                        tracing::warn!(
                            execution_id = %execution.id,
                            attempt_count = next.attempt_count,
                            max_attempts = next.max_attempts,
                            next_retry_at = %next.next_retry_at,
                            error,
                            "dead letter redelivery failed, rescheduled"
                        );
                    }
                    _ => {}
                }
                return Ok(next);
            }
        }
        Err(EngineError::Contention(format!("dead letter {}", execution.id)))
    }

    /// Claim a pending entry for redelivery. `force` ignores the schedule and
    /// revives abandoned entries (operator replay).
    pub async fn claim(
        &self,
        execution_id: Uuid,
        force: bool,
    ) -> Result<Option<DeadLetterEntry>, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let Some(current) = self.store.get_dead_letter(&execution_id).await? else {
                return Ok(None);
            };
            let claimable = match current.status {
                DeadLetterStatus::Pending => force || current.next_retry_at <= now,
                DeadLetterStatus::Abandoned => force,
                DeadLetterStatus::Retrying | DeadLetterStatus::Resolved => false,
            };
            if !claimable {
                return Ok(None);
            }

            let mut next = current.clone();
            if current.status == DeadLetterStatus::Abandoned {
                next.attempt_count = 0;
            }
            next.attempt_count += 1;
            next.status = DeadLetterStatus::Retrying;
            next.updated_at = now;
            next.version = current.version + 1;
            if self
                .store
                .compare_and_swap_dead_letter(&next, current.version)
                .await?
            {
                tracing::info!(
                    execution_id = %execution_id,
                    attempt = next.attempt_count,
                    max_attempts = next.max_attempts,
                    forced = force,
                    "dead letter claimed for redelivery"
                );
                return Ok(Some(next));
            }
        }
        Err(EngineError::Contention(format!("dead letter {execution_id}")))
    }

    /// Mark an entry resolved after its execution completed. No-op without one.
    pub async fn resolve(&self, execution_id: Uuid) -> Result<(), EngineError> {
        self.settle(execution_id, DeadLetterStatus::Resolved, None).await
    }

    /// Give up on an entry whose execution failed in a way redelivery cannot fix.
    pub async fn abandon(&self, execution_id: Uuid, error: &str) -> Result<(), EngineError> {
        self.settle(execution_id, DeadLetterStatus::Abandoned, Some(error))
            .await
    }

    async fn settle(
        &self,
        execution_id: Uuid,
        status: DeadLetterStatus,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.store.get_dead_letter(&execution_id).await? else {
                return Ok(());
            };
            if current.status.is_terminal() {
                return Ok(());
            }
            let mut next = current.clone();
            next.status = status;
            if let Some(error) = error {
                next.error = error.to_string();
            }
            next.updated_at = self.clock.now();
            next.version = current.version + 1;
            if self
                .store
                .compare_and_swap_dead_letter(&next, current.version)
                .await?
            {
                match status {
                    DeadLetterStatus::Abandoned => self.abandoned(&next),
                    _ => tracing::info!(
                        execution_id = %execution_id,
                        attempts = next.attempt_count,
                        "dead letter resolved"
                    ),
                }
                return Ok(());
            }
        }
        Err(EngineError::Contention(format!("dead letter {execution_id}")))
    }

    fn abandoned(&self, entry: &DeadLetterEntry) {
        tracing::error!(
            execution_id = %entry.execution_id,
            workflow_id = entry.workflow_id.as_str(),
            attempt_count = entry.attempt_count,
            error = entry.error.as_str(),
            "dead letter abandoned, operator action required"
        );
        self.events.publish(EngineEvent::DeadLetterAbandoned {
            execution_id: entry.execution_id,
            workflow_id: entry.workflow_id.clone(),
            error: entry.error.clone(),
            attempt_count: entry.attempt_count,
        });
    }

    pub async fn get(&self, execution_id: Uuid) -> Result<Option<DeadLetterEntry>, EngineError> {
        Ok(self.store.get_dead_letter(&execution_id).await?)
    }

    pub async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, EngineError> {
        Ok(self.store.list_dead_letters(status, limit).await?)
    }

    pub async fn due(&self, limit: u32) -> Result<Vec<DeadLetterEntry>, EngineError> {
        Ok(self
            .store
            .list_due_dead_letters(self.clock.now(), limit)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowline_types::execution::ExecutionStatus;
    use serde_json::json;
    use std::time::Duration;

    use crate::memory::MemoryStore;

    fn execution() -> Execution {
        let now = Utc::now();
        Execution {
            id: Uuid::now_v7(),
            workflow_id: "wf".into(),
            trigger_type: "webhook".into(),
            trigger_data: json!({"lead": 42}),
            status: ExecutionStatus::Failed,
            environment: "development".into(),
            idempotency_key: None,
            error: Some("boom".into()),
            next_check_at: None,
            owner: None,
            lease_expires_at: None,
            version: 0,
            started_at: now,
            updated_at: now,
            completed_at: Some(now),
        }
    }

    fn queue(max_attempts: u32) -> (DeadLetterQueue<MemoryStore>, EventBus) {
        let events = EventBus::new(16);
        let settings = DeadLetterSettings {
            max_attempts,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        };
        (
            DeadLetterQueue::new(MemoryStore::new(), Clock::new(), events.clone(), settings),
            events,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_schedules_with_backoff() {
        let (dlq, _) = queue(3);
        let exec = execution();
        let entry = dlq.enqueue(&exec, "retries exhausted", Some(4)).await.unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.trigger_data, json!({"lead": 42}));
        assert_eq!(entry.checkpoint_sequence, Some(4));

        assert!(dlq.due(10).await.unwrap().is_empty());
        assert!(dlq.claim(exec.id, false).await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(1_300)).await;
        assert_eq!(dlq.due(10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_failures_abandon_after_max_attempts() {
        let (dlq, events) = queue(2);
        let mut rx = events.subscribe();
        let exec = execution();
        dlq.enqueue(&exec, "e0", None).await.unwrap();

        for attempt in 1..=2 {
            tokio::time::advance(Duration::from_secs(120)).await;
            let claimed = dlq.claim(exec.id, false).await.unwrap().unwrap();
            assert_eq!(claimed.attempt_count, attempt);
            assert_eq!(claimed.status, DeadLetterStatus::Retrying);
            // A second worker cannot claim the same entry.
            assert!(dlq.claim(exec.id, false).await.unwrap().is_none());
            dlq.enqueue(&exec, &format!("e{attempt}"), None).await.unwrap();
        }

        let entry = dlq.get(exec.id).await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Abandoned);
        assert_eq!(entry.error, "e2");

        let mut abandoned = false;
        while let Ok(event) = rx.try_recv() {
            abandoned |= matches!(event, EngineEvent::DeadLetterAbandoned { attempt_count: 2, .. });
        }
        assert!(abandoned);
    }

    #[tokio::test]
    async fn forced_claim_revives_abandoned_entry() {
        let (dlq, _) = queue(1);
        let exec = execution();
        dlq.enqueue(&exec, "e0", None).await.unwrap();
        dlq.abandon(exec.id, "gave up").await.unwrap();
        assert!(dlq.claim(exec.id, false).await.unwrap().is_none());

        let claimed = dlq.claim(exec.id, true).await.unwrap().unwrap();
        assert_eq!(claimed.attempt_count, 1);
        dlq.resolve(exec.id).await.unwrap();
        assert_eq!(
            dlq.get(exec.id).await.unwrap().unwrap().status,
            DeadLetterStatus::Resolved
        );
        assert_eq!(dlq.list(Some(DeadLetterStatus::Resolved), 10).await.unwrap().len(), 1);
    }
}
