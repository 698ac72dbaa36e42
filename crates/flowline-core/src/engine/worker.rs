//! Background sweeps over persisted suspensions.
//!
//! Nothing the engine waits on lives only in memory: parked executions
//! carry `next_check_at`, dead letters carry `next_retry_at`, batch windows
//! carry `window_closes_at`. The worker polls those rows and hands due work
//! back to the coordinator, so any process running a worker can pick up
//! where a crashed one stopped.

use std::time::Duration;

use flowline_types::execution::Execution;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::repository::EngineStore;

use super::coordinator::{Coordinator, RunMode};

/// Work done by one [`Worker::tick`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub woken: usize,
    pub redelivered: usize,
    pub flushed: usize,
    pub recovered: usize,
    pub purged: u64,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct Worker<S> {
    coordinator: Coordinator<S>,
}

impl<S: EngineStore> Worker<S> {
    pub fn new(coordinator: Coordinator<S>) -> Self {
        Self { coordinator }
    }

    /// Resume waiting executions whose recheck time passed.
    pub async fn wake_waiting(&self) -> Result<usize, EngineError> {
        let now = self.coordinator.clock().now();
        let limit = self.coordinator.config().engine.sweep_batch_size;
        let due = self.coordinator.store().list_due_waiting(now, limit).await?;
        Ok(self.resume_all(due, "waiting").await)
    }

    /// Redeliver due dead letters.
    pub async fn process_dead_letters(&self) -> Result<usize, EngineError> {
        self.coordinator.process_dead_letters().await
    }

    /// Flush batch windows past their deadline.
    pub async fn sweep_batches(&self) -> Result<usize, EngineError> {
        self.coordinator.sweep_batches(RunMode::Background).await
    }

    /// Resume running executions whose driver let its lease lapse.
    pub async fn recover_stalled(&self) -> Result<usize, EngineError> {
        let now = self.coordinator.clock().now();
        let limit = self.coordinator.config().engine.sweep_batch_size;
        let stalled: Vec<Execution> = self
            .coordinator
            .store()
            .list_stalled(now, limit)
            .await?
            .into_iter()
            .filter(|e| !self.coordinator.is_running(e.id))
            .collect();
        Ok(self.resume_all(stalled, "stalled").await)
    }

    pub async fn purge_idempotency(&self) -> Result<u64, EngineError> {
        self.coordinator.purge_idempotency_keys().await
    }

    async fn resume_all(&self, executions: Vec<Execution>, reason: &'static str) -> usize {
        let mut resumes = JoinSet::new();
        for execution in executions {
            let coordinator = self.coordinator.clone();
            resumes.spawn(async move {
                let id = execution.id;
                (id, coordinator.resume_execution(id).await)
            });
        }

        let mut resumed = 0;
        while let Some(joined) = resumes.join_next().await {
            match joined {
                Ok((_, Ok(_))) => resumed += 1,
                Ok((execution_id, Err(e))) => {
                    tracing::warn!(execution_id = %execution_id, reason, error = %e, "resume failed");
                }
                Err(e) => tracing::error!(reason, error = %e, "resume task aborted"),
            }
        }
        resumed
    }

    /// Run every sweep once. A failing sweep is logged and does not stop
    /// the others.
    pub async fn tick(&self) -> SweepReport {
        let mut report = SweepReport::default();
        match self.wake_waiting().await {
            Ok(n) => report.woken = n,
            Err(e) => tracing::warn!(error = %e, "waiting sweep failed"),
        }
        match self.process_dead_letters().await {
            Ok(n) => report.redelivered = n,
            Err(e) => tracing::warn!(error = %e, "dead letter sweep failed"),
        }
        match self.sweep_batches().await {
            Ok(n) => report.flushed = n,
            Err(e) => tracing::warn!(error = %e, "batch sweep failed"),
        }
        match self.recover_stalled().await {
            Ok(n) => report.recovered = n,
            Err(e) => tracing::warn!(error = %e, "stall recovery failed"),
        }
        match self.purge_idempotency().await {
            Ok(n) => report.purged = n,
            Err(e) => tracing::warn!(error = %e, "idempotency purge failed"),
        }
        if !report.is_idle() {
            tracing::info!(
                woken = report.woken,
                redelivered = report.redelivered,
                flushed = report.flushed,
                recovered = report.recovered,
                purged = report.purged,
                "worker sweep"
            );
        }
        report
    }

    /// Tick every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = interval.as_millis() as u64, "worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        tracing::info!("worker stopped");
    }
}
