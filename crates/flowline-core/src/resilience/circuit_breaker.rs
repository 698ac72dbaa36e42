//! Per-(workflow, node) circuit breakers.
//!
//! State transitions are pure functions over a [`CircuitBreakerRecord`];
//! [`CircuitBreakers`] applies them to the shared store with
//! compare-and-swap so every worker sees the same breaker.
//!
//! - closed -> open when `failure_count >= failure_threshold` inside the
//!   observation window
//! - open -> half_open once `now >= opens_at`, admitting one probe
//! - half_open -> closed after `success_threshold` consecutive probe successes
//! - half_open -> open on any probe failure

use chrono::{DateTime, TimeDelta, Utc};
use flowline_types::event::EngineEvent;
use flowline_types::resilience::{CircuitBreakerRecord, CircuitState};
use flowline_types::workflow::CircuitBreakerPolicy;

use crate::clock::{Clock, seconds};
use crate::error::EngineError;
use crate::event::EventBus;
use crate::repository::CircuitBreakerRepository;

/// Bound on lost CAS races before giving up on one update.
const MAX_CAS_ATTEMPTS: u32 = 32;

/// Breaker verdict for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Half-open probe; the caller holds the probe lease and must report
    /// success, failure, or release.
    Probe,
    Reject { retry_at: DateTime<Utc> },
}

// ---------------------------------------------------------------------------
// Pure transitions
// ---------------------------------------------------------------------------

/// Decide whether a dispatch may proceed, moving open -> half_open when due.
pub fn admit(record: &mut CircuitBreakerRecord, now: DateTime<Utc>, probe_lease: TimeDelta) -> Admission {
    match record.state {
        CircuitState::Closed => Admission::Allow,
        CircuitState::Open => {
            let due = record.opens_at.is_none_or(|at| now >= at);
            if due {
                record.state = CircuitState::HalfOpen;
                record.success_count = 0;
                record.probe_lease_until = Some(now + probe_lease);
                Admission::Probe
            } else {
                Admission::Reject {
                    retry_at: record.opens_at.unwrap_or(now),
                }
            }
        }
        CircuitState::HalfOpen => match record.probe_lease_until {
            Some(lease) if now < lease => Admission::Reject { retry_at: lease },
            _ => {
                record.probe_lease_until = Some(now + probe_lease);
                Admission::Probe
            }
        },
    }
}

pub fn on_success(record: &mut CircuitBreakerRecord) {
    match record.state {
        CircuitState::Closed => {
            record.failure_count = 0;
            record.window_started_at = None;
        }
        CircuitState::HalfOpen => {
            record.success_count += 1;
            record.probe_lease_until = None;
            if record.success_count >= record.policy.success_threshold {
                record.state = CircuitState::Closed;
                record.failure_count = 0;
                record.success_count = 0;
                record.window_started_at = None;
                record.opens_at = None;
            }
        }
        // A call admitted before the breaker opened finished late.
        CircuitState::Open => {}
    }
}

pub fn on_failure(record: &mut CircuitBreakerRecord, now: DateTime<Utc>) {
    record.last_failure_at = Some(now);
    let timeout = seconds(record.policy.timeout_seconds);
    match record.state {
        CircuitState::Closed => {
            let window = seconds(record.policy.window_seconds);
            let window_expired = record
                .window_started_at
                .is_none_or(|start| now - start > window);
            if window_expired {
                record.window_started_at = Some(now);
                record.failure_count = 0;
            }
            record.failure_count += 1;
            if record.failure_count >= record.policy.failure_threshold {
                record.state = CircuitState::Open;
                record.opens_at = Some(now + timeout);
            }
        }
        CircuitState::HalfOpen => {
            record.state = CircuitState::Open;
            record.opens_at = Some(now + timeout);
            record.success_count = 0;
            record.probe_lease_until = None;
        }
        CircuitState::Open => {}
    }
}

/// Give back a probe lease without a verdict (the probe never reached the
/// dependency).
pub fn release_probe(record: &mut CircuitBreakerRecord) {
    if record.state == CircuitState::HalfOpen {
        record.probe_lease_until = None;
    }
}

/// Operator override.
pub fn force(record: &mut CircuitBreakerRecord, state: CircuitState, now: DateTime<Utc>) {
    record.state = state;
    record.success_count = 0;
    record.probe_lease_until = None;
    match state {
        CircuitState::Closed => {
            record.failure_count = 0;
            record.window_started_at = None;
            record.opens_at = None;
        }
        CircuitState::Open => {
            record.opens_at = Some(now + seconds(record.policy.timeout_seconds));
        }
        CircuitState::HalfOpen => {
            record.opens_at = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Store-backed service
// ---------------------------------------------------------------------------

/// Shared breaker access for the coordinator and operator interface.
#[derive(Clone)]
pub struct CircuitBreakers<S> {
    store: S,
    clock: Clock,
    events: EventBus,
    probe_lease: TimeDelta,
}

impl<S: CircuitBreakerRepository> CircuitBreakers<S> {
    pub fn new(store: S, clock: Clock, events: EventBus, probe_lease_seconds: u64) -> Self {
        Self {
            store,
            clock,
            events,
            probe_lease: seconds(probe_lease_seconds),
        }
    }

    pub async fn get(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Option<CircuitBreakerRecord>, EngineError> {
        Ok(self.store.get_breaker(workflow_id, node_id).await?)
    }

    pub async fn check(
        &self,
        workflow_id: &str,
        node_id: &str,
        policy: CircuitBreakerPolicy,
    ) -> Result<Admission, EngineError> {
        let probe_lease = self.probe_lease;
        self.update(workflow_id, node_id, policy, |record, now| {
            admit(record, now, probe_lease)
        })
        .await
    }

    pub async fn record_success(
        &self,
        workflow_id: &str,
        node_id: &str,
        policy: CircuitBreakerPolicy,
    ) -> Result<(), EngineError> {
        self.update(workflow_id, node_id, policy, |record, _| on_success(record))
            .await
    }

    pub async fn record_failure(
        &self,
        workflow_id: &str,
        node_id: &str,
        policy: CircuitBreakerPolicy,
    ) -> Result<(), EngineError> {
        self.update(workflow_id, node_id, policy, on_failure).await
    }

    pub async fn release_probe(
        &self,
        workflow_id: &str,
        node_id: &str,
        policy: CircuitBreakerPolicy,
    ) -> Result<(), EngineError> {
        self.update(workflow_id, node_id, policy, |record, _| release_probe(record))
            .await
    }

    /// Operator override of a breaker's state.
    pub async fn force_state(
        &self,
        workflow_id: &str,
        node_id: &str,
        state: CircuitState,
        policy: CircuitBreakerPolicy,
    ) -> Result<CircuitBreakerRecord, EngineError> {
        self.update(workflow_id, node_id, policy, |record, now| {
            force(record, state, now);
            record.clone()
        })
        .await
    }

    /// Read-modify-CAS loop. Unchanged records are not written.
    async fn update<T>(
        &self,
        workflow_id: &str,
        node_id: &str,
        policy: CircuitBreakerPolicy,
        mut apply: impl FnMut(&mut CircuitBreakerRecord, DateTime<Utc>) -> T,
    ) -> Result<T, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = match self.store.get_breaker(workflow_id, node_id).await? {
                Some(record) => record,
                None => {
                    let fresh = CircuitBreakerRecord::new(workflow_id, node_id, policy, now);
                    self.store.insert_breaker(&fresh).await?;
                    continue;
                }
            };

            let mut next = current.clone();
            next.policy = policy;
            let out = apply(&mut next, now);
            if next == current {
                return Ok(out);
            }

            next.version = current.version + 1;
            next.updated_at = now;
            if self
                .store
                .compare_and_swap_breaker(&next, current.version)
                .await?
            {
                if next.state != current.state {
                    tracing::info!(
                        workflow_id,
                        node_id,
                        from = %current.state,
                        to = %next.state,
                        failure_count = next.failure_count,
                        "circuit breaker state changed"
                    );
                    self.events.publish(EngineEvent::CircuitStateChanged {
                        workflow_id: workflow_id.to_string(),
                        node_id: node_id.to_string(),
                        from: current.state,
                        to: next.state,
                    });
                }
                return Ok(out);
            }
            tracing::debug!(workflow_id, node_id, "circuit breaker CAS lost, retrying");
        }
        Err(EngineError::Contention(format!(
            "circuit breaker {workflow_id}/{node_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::time::Duration;

    fn policy(failure_threshold: u32, success_threshold: u32) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            failure_threshold,
            success_threshold,
            timeout_seconds: 30,
            window_seconds: 60,
        }
    }

    fn record(p: CircuitBreakerPolicy) -> CircuitBreakerRecord {
        CircuitBreakerRecord::new("wf", "node", p, Utc::now())
    }

    #[test]
    fn opens_at_threshold() {
        let now = Utc::now();
        let mut r = record(policy(3, 1));
        on_failure(&mut r, now);
        on_failure(&mut r, now);
        assert_eq!(r.state, CircuitState::Closed);
        on_failure(&mut r, now);
        assert_eq!(r.state, CircuitState::Open);
        assert_eq!(r.opens_at, Some(now + TimeDelta::seconds(30)));
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let now = Utc::now();
        let mut r = record(policy(2, 1));
        on_failure(&mut r, now);
        on_failure(&mut r, now + TimeDelta::seconds(61));
        assert_eq!(r.state, CircuitState::Closed);
        assert_eq!(r.failure_count, 1);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let now = Utc::now();
        let mut r = record(policy(2, 1));
        on_failure(&mut r, now);
        on_success(&mut r);
        on_failure(&mut r, now);
        assert_eq!(r.state, CircuitState::Closed);
    }

    #[test]
    fn open_rejects_until_due_then_admits_single_probe() {
        let now = Utc::now();
        let lease = TimeDelta::seconds(10);
        let mut r = record(policy(1, 2));
        on_failure(&mut r, now);

        assert_eq!(
            admit(&mut r, now + TimeDelta::seconds(5), lease),
            Admission::Reject {
                retry_at: now + TimeDelta::seconds(30)
            }
        );

        let due = now + TimeDelta::seconds(30);
        assert_eq!(admit(&mut r, due, lease), Admission::Probe);
        assert_eq!(r.state, CircuitState::HalfOpen);
        assert!(matches!(admit(&mut r, due, lease), Admission::Reject { .. }));

        // One success is not enough with success_threshold = 2.
        on_success(&mut r);
        assert_eq!(r.state, CircuitState::HalfOpen);
        assert_eq!(admit(&mut r, due, lease), Admission::Probe);
        on_success(&mut r);
        assert_eq!(r.state, CircuitState::Closed);
        assert_eq!(admit(&mut r, due, lease), Admission::Allow);
    }

    #[test]
    fn probe_failure_reopens() {
        let now = Utc::now();
        let mut r = record(policy(1, 1));
        on_failure(&mut r, now);
        let due = now + TimeDelta::seconds(30);
        admit(&mut r, due, TimeDelta::seconds(10));
        on_failure(&mut r, due);
        assert_eq!(r.state, CircuitState::Open);
        assert_eq!(r.opens_at, Some(due + TimeDelta::seconds(30)));
        assert!(r.probe_lease_until.is_none());
    }

    #[test]
    fn expired_probe_lease_is_reclaimable() {
        let now = Utc::now();
        let lease = TimeDelta::seconds(10);
        let mut r = record(policy(1, 1));
        force(&mut r, CircuitState::HalfOpen, now);
        assert_eq!(admit(&mut r, now, lease), Admission::Probe);
        assert!(matches!(admit(&mut r, now, lease), Admission::Reject { .. }));
        assert_eq!(admit(&mut r, now + TimeDelta::seconds(11), lease), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn service_persists_and_publishes_transitions() {
        let store = MemoryStore::new();
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let breakers = CircuitBreakers::new(store.clone(), Clock::new(), events, 10);
        let p = policy(2, 1);

        assert_eq!(breakers.check("wf", "b", p).await.unwrap(), Admission::Allow);
        breakers.record_failure("wf", "b", p).await.unwrap();
        breakers.record_failure("wf", "b", p).await.unwrap();

        let stored = breakers.get("wf", "b").await.unwrap().unwrap();
        assert_eq!(stored.state, CircuitState::Open);
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::CircuitStateChanged {
                to: CircuitState::Open,
                ..
            }
        ));
        assert!(matches!(
            breakers.check("wf", "b", p).await.unwrap(),
            Admission::Reject { .. }
        ));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breakers.check("wf", "b", p).await.unwrap(), Admission::Probe);
        breakers.record_success("wf", "b", p).await.unwrap();
        let stored = breakers.get("wf", "b").await.unwrap().unwrap();
        assert_eq!(stored.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn force_state_overrides() {
        let store = MemoryStore::new();
        let breakers = CircuitBreakers::new(store, Clock::new(), EventBus::new(4), 10);
        let p = policy(5, 1);
        let forced = breakers
            .force_state("wf", "b", CircuitState::Open, p)
            .await
            .unwrap();
        assert_eq!(forced.state, CircuitState::Open);
        assert!(matches!(
            breakers.check("wf", "b", p).await.unwrap(),
            Admission::Reject { .. }
        ));
        breakers
            .force_state("wf", "b", CircuitState::Closed, p)
            .await
            .unwrap();
        assert_eq!(breakers.check("wf", "b", p).await.unwrap(), Admission::Allow);
    }
}
