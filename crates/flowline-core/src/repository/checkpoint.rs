//! Checkpoint repository trait.

use flowline_types::error::RepositoryError;
use flowline_types::execution::Checkpoint;
use uuid::Uuid;

/// Append-only checkpoint storage.
pub trait CheckpointRepository: Send + Sync {
    /// Append a checkpoint. Fails with [`RepositoryError::Conflict`] unless
    /// its sequence number is greater than every stored one for the
    /// execution.
    fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Ascending by sequence number.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;
}
