//! Durable, append-only execution checkpoints.
//!
//! Every checkpoint carries a SHA-256 checksum of its serialized state.
//! Loading verifies it; a mismatch is a [`EngineError::CheckpointCorruption`],
//! which fails the execution and is never retried.

use flowline_types::error::RepositoryError;
use flowline_types::execution::{Checkpoint, CheckpointState};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::repository::CheckpointRepository;

const MAX_APPEND_ATTEMPTS: u32 = 8;

/// Hex SHA-256 of the canonical JSON form of `state`.
///
/// `CheckpointState` is built from ordered maps, so equal states always
/// serialize to the same bytes.
pub fn checksum(state: &CheckpointState) -> String {
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// Fails with `CheckpointCorruption` unless the stored checksum matches.
pub fn verify(checkpoint: &Checkpoint) -> Result<(), EngineError> {
    let actual = checksum(&checkpoint.state);
    if actual != checkpoint.checksum {
        return Err(EngineError::CheckpointCorruption {
            execution_id: checkpoint.execution_id,
            sequence: checkpoint.sequence_number,
            reason: format!(
                "checksum mismatch (stored {}, computed {actual})",
                checkpoint.checksum
            ),
        });
    }
    Ok(())
}

/// Writes and verifies checkpoints for the coordinator.
#[derive(Clone)]
pub struct CheckpointManager<S> {
    store: S,
    clock: Clock,
}

impl<S: CheckpointRepository> CheckpointManager<S> {
    pub fn new(store: S, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Append a checkpoint with the next sequence number.
    pub async fn write(
        &self,
        execution_id: Uuid,
        node_id: Option<&str>,
        state: &CheckpointState,
        can_resume: bool,
    ) -> Result<Checkpoint, EngineError> {
        let checksum = checksum(state);
        for _ in 0..MAX_APPEND_ATTEMPTS {
            let sequence_number = self
                .store
                .latest_checkpoint(&execution_id)
                .await?
                .map_or(1, |c| c.sequence_number + 1);
            let checkpoint = Checkpoint {
                execution_id,
                sequence_number,
                node_id: node_id.map(str::to_string),
                state: state.clone(),
                can_resume,
                checksum: checksum.clone(),
                created_at: self.clock.now(),
            };
            match self.store.append_checkpoint(&checkpoint).await {
                Ok(()) => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        sequence = sequence_number,
                        node_id = node_id.unwrap_or("-"),
                        can_resume,
                        "checkpoint written"
                    );
                    return Ok(checkpoint);
                }
                Err(RepositoryError::Conflict(reason)) => {
                    tracing::debug!(execution_id = %execution_id, reason, "checkpoint sequence taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Contention(format!("checkpoints of {execution_id}")))
    }

    /// Latest checkpoint, verified.
    pub async fn latest(&self, execution_id: Uuid) -> Result<Option<Checkpoint>, EngineError> {
        let Some(checkpoint) = self.store.latest_checkpoint(&execution_id).await? else {
            return Ok(None);
        };
        if let Err(e) = verify(&checkpoint) {
            tracing::error!(
                execution_id = %execution_id,
                sequence = checkpoint.sequence_number,
                error = %e,
                "checkpoint corruption detected"
            );
            return Err(e);
        }
        Ok(Some(checkpoint))
    }

    pub async fn list(&self, execution_id: Uuid) -> Result<Vec<Checkpoint>, EngineError> {
        Ok(self.store.list_checkpoints(&execution_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use flowline_types::execution::NodeStatus;
    use serde_json::json;

    fn state_after(node: &str) -> CheckpointState {
        let mut state = CheckpointState::default();
        state.node_status.insert(node.into(), NodeStatus::Succeeded);
        state.node_outputs.insert(node.into(), json!({"n": 1}));
        state
    }

    #[tokio::test]
    async fn sequence_numbers_increase() {
        let store = MemoryStore::new();
        let manager = CheckpointManager::new(store, Clock::new());
        let id = Uuid::now_v7();

        let first = manager
            .write(id, None, &CheckpointState::default(), true)
            .await
            .unwrap();
        let second = manager.write(id, Some("a"), &state_after("a"), true).await.unwrap();
        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);

        let latest = manager.latest(id).await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 2);
        assert_eq!(latest.state, state_after("a"));
        assert_eq!(manager.list(id).await.unwrap().len(), 2);
    }

    #[test]
    fn checksum_is_stable_for_equal_states() {
        assert_eq!(checksum(&state_after("a")), checksum(&state_after("a")));
        assert_ne!(checksum(&state_after("a")), checksum(&state_after("b")));
        assert_eq!(checksum(&state_after("a")).len(), 64);
    }

    #[tokio::test]
    async fn tampered_state_is_corruption() {
        let store = MemoryStore::new();
        let manager = CheckpointManager::new(store.clone(), Clock::new());
        let id = Uuid::now_v7();
        manager.write(id, Some("a"), &state_after("a"), true).await.unwrap();

        store.tamper_checkpoint(&id, |c| {
            c.state.node_outputs.insert("a".into(), json!({"n": 2}));
        });
        match manager.latest(id).await {
            Err(EngineError::CheckpointCorruption { sequence, .. }) => assert_eq!(sequence, 1),
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
