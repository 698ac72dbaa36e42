//! Batch window manager.
//!
//! Trigger events for a batching workflow accumulate in a shared window row.
//! The window flushes exactly once per lifetime: either the append that
//! brings `current_count` to `window_size`, or a sweep that sees
//! `window_closes_at` pass. Both paths claim the flush with the same
//! compare-and-swap that empties the window, so only one caller ever
//! receives a given batch.

use flowline_types::batch::BatchWindow;
use flowline_types::event::EngineEvent;
use flowline_types::workflow::BatchingPolicy;
use serde_json::Value;

use crate::clock::{Clock, seconds};
use crate::error::EngineError;
use crate::event::EventBus;
use crate::repository::BatchWindowRepository;

const MAX_CAS_ATTEMPTS: u32 = 32;

/// A claimed batch, ready to be delivered downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Flush {
    pub workflow_id: String,
    pub node_id: String,
    pub generation: u64,
    pub events: Vec<Value>,
}

/// Reset `window` after claiming its contents.
fn take(window: &mut BatchWindow) -> Vec<Value> {
    let events = std::mem::take(&mut window.current_batch);
    window.current_count = 0;
    window.window_started_at = None;
    window.window_closes_at = None;
    window.generation += 1;
    events
}

#[derive(Clone)]
pub struct BatchWindows<S> {
    store: S,
    clock: Clock,
    events: EventBus,
}

impl<S: BatchWindowRepository> BatchWindows<S> {
    pub fn new(store: S, clock: Clock, events: EventBus) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    /// Append one event. Returns the flushed batch if this append filled the
    /// window.
    pub async fn accumulate(
        &self,
        workflow_id: &str,
        policy: &BatchingPolicy,
        event: Value,
    ) -> Result<Option<Flush>, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = match self.store.get_window(workflow_id, &policy.node_id).await? {
                Some(window) => window,
                None => {
                    let fresh = BatchWindow::empty(
                        workflow_id,
                        &policy.node_id,
                        policy.window_size,
                        policy.window_secs,
                    );
                    self.store.insert_window(&fresh).await?;
                    continue;
                }
            };

            let mut next = current.clone();
            next.window_size = policy.window_size;
            next.window_secs = policy.window_secs;
            if !next.is_open() {
                next.window_started_at = Some(now);
                next.window_closes_at = Some(now + seconds(policy.window_secs));
            }
            next.current_batch.push(event.clone());
            next.current_count += 1;

            let generation = next.generation;
            let flushed = (next.current_count >= next.window_size).then(|| take(&mut next));
            next.version = current.version + 1;

            if self
                .store
                .compare_and_swap_window(&next, current.version)
                .await?
            {
                tracing::debug!(
                    workflow_id,
                    node_id = policy.node_id.as_str(),
                    count = current.current_count + 1,
                    window_size = policy.window_size,
                    "event added to batch window"
                );
                return Ok(flushed.map(|events| {
                    self.flushed(workflow_id, &policy.node_id, generation, events, "size")
                }));
            }
        }
        Err(EngineError::Contention(format!(
            "batch window {workflow_id}/{}",
            policy.node_id
        )))
    }

    /// Claim every non-empty window whose deadline passed.
    pub async fn sweep_expired(&self, limit: u32) -> Result<Vec<Flush>, EngineError> {
        let now = self.clock.now();
        let mut flushes = Vec::new();
        for current in self.store.list_expired_windows(now, limit).await? {
            let mut next = current.clone();
            let generation = next.generation;
            let events = take(&mut next);
            next.version = current.version + 1;
            if self
                .store
                .compare_and_swap_window(&next, current.version)
                .await?
            {
                flushes.push(self.flushed(
                    &current.workflow_id,
                    &current.node_id,
                    generation,
                    events,
                    "deadline",
                ));
            } else {
                tracing::debug!(
                    workflow_id = current.workflow_id.as_str(),
                    node_id = current.node_id.as_str(),
                    "batch window changed during sweep, skipping"
                );
            }
        }
        Ok(flushes)
    }

    fn flushed(
        &self,
        workflow_id: &str,
        node_id: &str,
        generation: u64,
        events: Vec<Value>,
        reason: &str,
    ) -> Flush {
        let count = events.len() as u32;
        tracing::info!(workflow_id, node_id, generation, count, reason, "batch window flushed");
        self.events.publish(EngineEvent::BatchFlushed {
            workflow_id: workflow_id.to_string(),
            node_id: node_id.to_string(),
            count,
        });
        Flush {
            workflow_id: workflow_id.to_string(),
            node_id: node_id.to_string(),
            generation,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn policy(size: u32, secs: u64) -> BatchingPolicy {
        BatchingPolicy {
            node_id: "ingest".into(),
            window_size: size,
            window_secs: secs,
        }
    }

    #[tokio::test]
    async fn fifth_event_flushes_exactly_once() {
        let windows = BatchWindows::new(MemoryStore::new(), Clock::new(), EventBus::new(8));
        let p = policy(5, 60);

        let mut flushes = Vec::new();
        for i in 0..7 {
            if let Some(flush) = windows.accumulate("wf", &p, json!(i)).await.unwrap() {
                flushes.push(flush);
            }
        }
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].events, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(flushes[0].generation, 0);
        assert!(windows.sweep_expired(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_appends_flush_once() {
        let windows = BatchWindows::new(MemoryStore::new(), Clock::new(), EventBus::new(8));
        let p = policy(5, 60);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..5 {
            let (windows, p) = (windows.clone(), p.clone());
            tasks.spawn(async move { windows.accumulate("wf", &p, json!(i)).await.unwrap() });
        }
        let mut flushed = Vec::new();
        while let Some(res) = tasks.join_next().await {
            if let Some(flush) = res.unwrap() {
                flushed.push(flush);
            }
        }
        assert_eq!(flushed.len(), 1);
        let mut events: Vec<i64> = flushed[0].events.iter().filter_map(Value::as_i64).collect();
        events.sort_unstable();
        assert_eq!(events, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_sweep_claims_partial_window() {
        let store = MemoryStore::new();
        let windows = BatchWindows::new(store.clone(), Clock::new(), EventBus::new(8));
        let p = policy(10, 30);

        windows.accumulate("wf", &p, json!("a")).await.unwrap();
        windows.accumulate("wf", &p, json!("b")).await.unwrap();
        assert!(windows.sweep_expired(10).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let flushes = windows.sweep_expired(10).await.unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].events, vec![json!("a"), json!("b")]);
        assert!(windows.sweep_expired(10).await.unwrap().is_empty());

        // The next event opens a fresh window.
        windows.accumulate("wf", &p, json!("c")).await.unwrap();
        let window = store.get_window("wf", "ingest").await.unwrap().unwrap();
        assert_eq!(window.generation, 1);
        assert_eq!(window.current_count, 1);
    }
}
