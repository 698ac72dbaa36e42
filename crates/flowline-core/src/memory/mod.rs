//! In-memory implementation of every repository port.
//!
//! Backs unit tests and `--ephemeral` runs. Each entity lives in a shared
//! `DashMap`; compare-and-swap writes check the stored version under the
//! shard lock, which gives the same single-winner semantics as the SQLite
//! `UPDATE ... WHERE version = ?` path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowline_types::batch::BatchWindow;
use flowline_types::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use flowline_types::environment::{Environment, EnvironmentConfig, Promotion};
use flowline_types::error::RepositoryError;
use flowline_types::execution::{Checkpoint, Execution, ExecutionStatus, NodeExecution, Snapshot};
use flowline_types::resilience::{CircuitBreakerRecord, IdempotencyEntry, RateLimiterRecord};
use flowline_types::workflow::WorkflowDefinition;
use uuid::Uuid;

use crate::repository::{
    BatchWindowRepository, CheckpointRepository, CircuitBreakerRepository, DeadLetterRepository,
    EnvironmentRepository, ExecutionRepository, IdempotencyRepository, NodeExecutionRepository,
    RateLimiterRepository, WorkflowRepository,
};

type PairKey = (String, String);

/// Store that keeps all engine state in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    workflows: Arc<DashMap<String, WorkflowDefinition>>,
    executions: Arc<DashMap<Uuid, Execution>>,
    node_executions: Arc<DashMap<Uuid, Vec<NodeExecution>>>,
    snapshots: Arc<DashMap<Uuid, Vec<Snapshot>>>,
    checkpoints: Arc<DashMap<Uuid, Vec<Checkpoint>>>,
    breakers: Arc<DashMap<PairKey, CircuitBreakerRecord>>,
    buckets: Arc<DashMap<String, RateLimiterRecord>>,
    idempotency: Arc<DashMap<PairKey, IdempotencyEntry>>,
    dead_letters: Arc<DashMap<Uuid, DeadLetterEntry>>,
    windows: Arc<DashMap<PairKey, BatchWindow>>,
    environments: Arc<DashMap<(String, Environment), EnvironmentConfig>>,
    promotions: Arc<DashMap<Uuid, Promotion>>,
    breaker_faults: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored checkpoint in place. Test hook for corruption
    /// scenarios; real stores never mutate checkpoints.
    #[doc(hidden)]
    pub fn tamper_checkpoint(&self, execution_id: &Uuid, f: impl FnOnce(&mut Checkpoint)) {
        if let Some(mut list) = self.checkpoints.get_mut(execution_id) {
            if let Some(last) = list.last_mut() {
                f(last);
            }
        }
    }

    /// Make the next `count` breaker reads fail with a connection error.
    /// Test hook for storage outages.
    #[doc(hidden)]
    pub fn fail_breaker_reads(&self, count: u32) {
        self.breaker_faults.store(count, Ordering::SeqCst);
    }

    fn take_breaker_fault(&self) -> bool {
        self.breaker_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn pair(a: &str, b: &str) -> PairKey {
    (a.to_string(), b.to_string())
}

/// Replace `slot` with `next` if `current_version` matches `expected`.
fn swap_if<T: Clone>(slot: &mut T, current_version: i64, expected: i64, next: &T) -> bool {
    if current_version == expected {
        *slot = next.clone();
        true
    } else {
        false
    }
}

impl WorkflowRepository for MemoryStore {
    async fn save_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.workflows.insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.workflows.get(id).map(|w| w.clone()))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut all: Vec<_> = self.workflows.iter().map(|w| w.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

impl ExecutionRepository for MemoryStore {
    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        match self.executions.entry(execution.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                Ok(())
            }
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn update_execution(
        &self,
        execution: &Execution,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.executions.get_mut(&execution.id) else {
            return Err(RepositoryError::NotFound);
        };
        let current = stored.version;
        Ok(swap_if(&mut *stored, current, expected_version, execution))
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut found: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| workflow_id.is_none_or(|w| e.workflow_id == w))
            .filter(|e| status.is_none_or(|s| e.status == s))
            .map(|e| e.clone())
            .collect();
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn list_due_waiting(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut found: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| {
                e.status == ExecutionStatus::Waiting && e.next_check_at.is_none_or(|t| t <= now)
            })
            .map(|e| e.clone())
            .collect();
        found.sort_by_key(|e| e.next_check_at);
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn list_stalled(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut found: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Running && !e.is_leased(now))
            .map(|e| e.clone())
            .collect();
        found.sort_by_key(|e| e.lease_expires_at);
        found.truncate(limit as usize);
        Ok(found)
    }
}

impl NodeExecutionRepository for MemoryStore {
    async fn create_node_execution(&self, node: &NodeExecution) -> Result<(), RepositoryError> {
        self.node_executions
            .entry(node.execution_id)
            .or_default()
            .push(node.clone());
        Ok(())
    }

    async fn update_node_execution(&self, node: &NodeExecution) -> Result<bool, RepositoryError> {
        let Some(mut list) = self.node_executions.get_mut(&node.execution_id) else {
            return Err(RepositoryError::NotFound);
        };
        let Some(stored) = list.iter_mut().find(|n| n.id == node.id) else {
            return Err(RepositoryError::NotFound);
        };
        if stored.status.is_terminal() {
            return Ok(false);
        }
        *stored = node.clone();
        Ok(true)
    }

    async fn list_node_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        Ok(self
            .node_executions
            .get(execution_id)
            .map(|l| l.clone())
            .unwrap_or_default())
    }

    async fn append_snapshot(&self, snapshot: &Snapshot) -> Result<u64, RepositoryError> {
        let mut list = self.snapshots.entry(snapshot.execution_id).or_default();
        let sequence = list.last().map_or(1, |s| s.sequence_number + 1);
        let mut stored = snapshot.clone();
        stored.sequence_number = sequence;
        list.push(stored);
        Ok(sequence)
    }

    async fn list_snapshots(&self, execution_id: &Uuid) -> Result<Vec<Snapshot>, RepositoryError> {
        Ok(self
            .snapshots
            .get(execution_id)
            .map(|l| l.clone())
            .unwrap_or_default())
    }
}

impl CheckpointRepository for MemoryStore {
    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let mut list = self.checkpoints.entry(checkpoint.execution_id).or_default();
        if let Some(last) = list.last() {
            if checkpoint.sequence_number <= last.sequence_number {
                return Err(RepositoryError::Conflict(format!(
                    "checkpoint sequence {} is not after {}",
                    checkpoint.sequence_number, last.sequence_number
                )));
            }
        }
        list.push(checkpoint.clone());
        Ok(())
    }

    async fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .get(execution_id)
            .and_then(|l| l.last().cloned()))
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .get(execution_id)
            .map(|l| l.clone())
            .unwrap_or_default())
    }
}

impl CircuitBreakerRepository for MemoryStore {
    async fn get_breaker(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Option<CircuitBreakerRecord>, RepositoryError> {
        if self.take_breaker_fault() {
            return Err(RepositoryError::Connection);
        }
        Ok(self.breakers.get(&pair(workflow_id, node_id)).map(|b| b.clone()))
    }

    async fn insert_breaker(&self, record: &CircuitBreakerRecord) -> Result<bool, RepositoryError> {
        match self.breakers.entry(pair(&record.workflow_id, &record.node_id)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn compare_and_swap_breaker(
        &self,
        record: &CircuitBreakerRecord,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self
            .breakers
            .get_mut(&pair(&record.workflow_id, &record.node_id))
        else {
            return Ok(false);
        };
        let current = stored.version;
        Ok(swap_if(&mut *stored, current, expected_version, record))
    }

    async fn list_breakers(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<CircuitBreakerRecord>, RepositoryError> {
        let mut found: Vec<_> = self
            .breakers
            .iter()
            .filter(|b| b.workflow_id == workflow_id)
            .map(|b| b.clone())
            .collect();
        found.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(found)
    }
}

impl RateLimiterRepository for MemoryStore {
    async fn get_bucket(&self, limit_key: &str) -> Result<Option<RateLimiterRecord>, RepositoryError> {
        Ok(self.buckets.get(limit_key).map(|b| b.clone()))
    }

    async fn insert_bucket(&self, record: &RateLimiterRecord) -> Result<bool, RepositoryError> {
        match self.buckets.entry(record.limit_key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn compare_and_swap_bucket(
        &self,
        record: &RateLimiterRecord,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.buckets.get_mut(&record.limit_key) else {
            return Ok(false);
        };
        let current = stored.version;
        Ok(swap_if(&mut *stored, current, expected_version, record))
    }
}

impl IdempotencyRepository for MemoryStore {
    async fn get_idempotency_key(
        &self,
        workflow_id: &str,
        key: &str,
    ) -> Result<Option<IdempotencyEntry>, RepositoryError> {
        Ok(self.idempotency.get(&pair(workflow_id, key)).map(|e| e.clone()))
    }

    async fn insert_idempotency_key(&self, entry: &IdempotencyEntry) -> Result<bool, RepositoryError> {
        match self.idempotency.entry(pair(&entry.workflow_id, &entry.key)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(true)
            }
        }
    }

    async fn compare_and_swap_idempotency_key(
        &self,
        entry: &IdempotencyEntry,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.idempotency.get_mut(&pair(&entry.workflow_id, &entry.key)) else {
            return Ok(false);
        };
        let current = stored.version;
        Ok(swap_if(&mut *stored, current, expected_version, entry))
    }

    async fn delete_idempotency_key(
        &self,
        workflow_id: &str,
        key: &str,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .idempotency
            .remove_if(&pair(workflow_id, key), |_, e| e.version == expected_version)
            .is_some())
    }

    async fn purge_expired_idempotency_keys(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let before = self.idempotency.len();
        self.idempotency.retain(|_, e| e.is_live(now));
        Ok((before - self.idempotency.len()) as u64)
    }
}

impl DeadLetterRepository for MemoryStore {
    async fn get_dead_letter(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<DeadLetterEntry>, RepositoryError> {
        Ok(self.dead_letters.get(execution_id).map(|d| d.clone()))
    }

    async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<bool, RepositoryError> {
        match self.dead_letters.entry(entry.execution_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(true)
            }
        }
    }

    async fn compare_and_swap_dead_letter(
        &self,
        entry: &DeadLetterEntry,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.dead_letters.get_mut(&entry.execution_id) else {
            return Ok(false);
        };
        let current = stored.version;
        Ok(swap_if(&mut *stored, current, expected_version, entry))
    }

    async fn list_due_dead_letters(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let mut found: Vec<_> = self
            .dead_letters
            .iter()
            .filter(|d| d.status == DeadLetterStatus::Pending && d.next_retry_at <= now)
            .map(|d| d.clone())
            .collect();
        found.sort_by_key(|d| d.next_retry_at);
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let mut found: Vec<_> = self
            .dead_letters
            .iter()
            .filter(|d| status.is_none_or(|s| d.status == s))
            .map(|d| d.clone())
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        found.truncate(limit as usize);
        Ok(found)
    }
}

impl BatchWindowRepository for MemoryStore {
    async fn get_window(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Option<BatchWindow>, RepositoryError> {
        Ok(self.windows.get(&pair(workflow_id, node_id)).map(|w| w.clone()))
    }

    async fn insert_window(&self, window: &BatchWindow) -> Result<bool, RepositoryError> {
        match self.windows.entry(pair(&window.workflow_id, &window.node_id)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(window.clone());
                Ok(true)
            }
        }
    }

    async fn compare_and_swap_window(
        &self,
        window: &BatchWindow,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.windows.get_mut(&pair(&window.workflow_id, &window.node_id)) else {
            return Ok(false);
        };
        let current = stored.version;
        Ok(swap_if(&mut *stored, current, expected_version, window))
    }

    async fn list_expired_windows(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<BatchWindow>, RepositoryError> {
        let mut found: Vec<_> = self
            .windows
            .iter()
            .filter(|w| w.is_open() && w.window_closes_at.is_some_and(|t| t <= now))
            .map(|w| w.clone())
            .collect();
        found.sort_by_key(|w| w.window_closes_at);
        found.truncate(limit as usize);
        Ok(found)
    }
}

impl EnvironmentRepository for MemoryStore {
    async fn get_environment(
        &self,
        workflow_id: &str,
        environment: Environment,
    ) -> Result<Option<EnvironmentConfig>, RepositoryError> {
        Ok(self
            .environments
            .get(&(workflow_id.to_string(), environment))
            .map(|c| c.clone()))
    }

    async fn save_environment(&self, config: &EnvironmentConfig) -> Result<(), RepositoryError> {
        self.environments.insert(
            (config.workflow_id.clone(), config.environment),
            config.clone(),
        );
        Ok(())
    }

    async fn delete_environment(
        &self,
        workflow_id: &str,
        environment: Environment,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .environments
            .remove(&(workflow_id.to_string(), environment))
            .is_some())
    }

    async fn save_promotion(&self, promotion: &Promotion) -> Result<(), RepositoryError> {
        self.promotions.insert(promotion.id, promotion.clone());
        Ok(())
    }

    async fn get_promotion(&self, id: &Uuid) -> Result<Option<Promotion>, RepositoryError> {
        Ok(self.promotions.get(id).map(|p| p.clone()))
    }

    async fn list_promotions(&self, workflow_id: &str) -> Result<Vec<Promotion>, RepositoryError> {
        let by_time: BTreeMap<_, _> = self
            .promotions
            .iter()
            .filter(|p| p.workflow_id == workflow_id)
            .map(|p| ((p.promoted_at, p.id), p.clone()))
            .collect();
        Ok(by_time.into_values().rev().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::execution::CheckpointState;
    use flowline_types::workflow::CircuitBreakerPolicy;

    fn checkpoint(execution_id: Uuid, seq: u64) -> Checkpoint {
        Checkpoint {
            execution_id,
            sequence_number: seq,
            node_id: None,
            state: CheckpointState::default(),
            can_resume: true,
            checksum: String::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn checkpoints_are_strictly_ordered() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        store.append_checkpoint(&checkpoint(id, 1)).await.unwrap();
        store.append_checkpoint(&checkpoint(id, 2)).await.unwrap();

        let err = store.append_checkpoint(&checkpoint(id, 2)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let latest = store.latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 2);
    }

    #[tokio::test]
    async fn breaker_cas_rejects_stale_version() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = CircuitBreakerRecord::new("wf", "n", CircuitBreakerPolicy::default(), now);
        assert!(store.insert_breaker(&record).await.unwrap());
        assert!(!store.insert_breaker(&record).await.unwrap());

        let mut next = record.clone();
        next.failure_count = 1;
        next.version = 1;
        assert!(store.compare_and_swap_breaker(&next, 0).await.unwrap());

        let mut stale = record.clone();
        stale.failure_count = 7;
        stale.version = 1;
        assert!(!store.compare_and_swap_breaker(&stale, 0).await.unwrap());

        let stored = store.get_breaker("wf", "n").await.unwrap().unwrap();
        assert_eq!(stored.failure_count, 1);
    }

    fn execution(status: ExecutionStatus) -> Execution {
        let now = Utc::now();
        Execution {
            id: Uuid::now_v7(),
            workflow_id: "wf".into(),
            trigger_type: "manual".into(),
            trigger_data: serde_json::Value::Null,
            status,
            environment: "development".into(),
            idempotency_key: None,
            error: None,
            next_check_at: None,
            owner: None,
            lease_expires_at: None,
            version: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn execution_update_compares_version() {
        let store = MemoryStore::new();
        let mut exec = execution(ExecutionStatus::Running);
        store.create_execution(&exec).await.unwrap();

        // Same status on both sides; only the version decides.
        exec.owner = Some(Uuid::now_v7());
        exec.version = 1;
        assert!(store.update_execution(&exec, 0).await.unwrap());
        exec.owner = Some(Uuid::now_v7());
        assert!(!store.update_execution(&exec, 0).await.unwrap());

        let missing = store.update_execution(&execution(ExecutionStatus::Running), 0).await;
        assert!(matches!(missing, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn stalled_means_running_with_lapsed_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut live = execution(ExecutionStatus::Running);
        live.lease_expires_at = Some(now + chrono::TimeDelta::seconds(30));
        let mut lapsed = execution(ExecutionStatus::Running);
        lapsed.lease_expires_at = Some(now - chrono::TimeDelta::seconds(1));
        let waiting = execution(ExecutionStatus::Waiting);
        for e in [&live, &lapsed, &waiting] {
            store.create_execution(e).await.unwrap();
        }

        let stalled = store.list_stalled(now, 10).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, lapsed.id);
    }

    #[tokio::test]
    async fn breaker_faults_are_consumed() {
        let store = MemoryStore::new();
        store.fail_breaker_reads(1);
        assert!(matches!(
            store.get_breaker("wf", "n").await,
            Err(RepositoryError::Connection)
        ));
        assert!(store.get_breaker("wf", "n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshots_get_sequential_numbers() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        let snap = Snapshot {
            execution_id: id,
            sequence_number: 0,
            node_id: "a".into(),
            attempt: 1,
            duration_ms: 3,
            input_bytes: 10,
            output_bytes: 20,
            outbound_calls: 1,
            outcome: "succeeded".into(),
            recorded_at: Utc::now(),
        };
        assert_eq!(store.append_snapshot(&snap).await.unwrap(), 1);
        assert_eq!(store.append_snapshot(&snap).await.unwrap(), 2);
        assert_eq!(store.list_snapshots(&id).await.unwrap().len(), 2);
    }
}
