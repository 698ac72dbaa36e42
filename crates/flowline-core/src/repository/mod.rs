//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (flowline-infra) implements. The core crate never depends on any
//! specific storage technology.
//!
//! Shared records (breakers, buckets, idempotency keys, dead letters, batch
//! windows) are written with compare-and-swap: the caller passes the version
//! it read, the record carries `expected_version + 1`, and the store applies
//! the write only if the stored version still matches. A `false` return means
//! the caller lost a race and should re-read.

pub mod batch;
pub mod checkpoint;
pub mod dead_letter;
pub mod environment;
pub mod execution;
pub mod resilience;
pub mod workflow;

pub use batch::BatchWindowRepository;
pub use checkpoint::CheckpointRepository;
pub use dead_letter::DeadLetterRepository;
pub use environment::EnvironmentRepository;
pub use execution::{ExecutionRepository, NodeExecutionRepository};
pub use resilience::{CircuitBreakerRepository, IdempotencyRepository, RateLimiterRepository};
pub use workflow::WorkflowRepository;

/// Everything the engine persists, behind one cloneable handle.
///
/// Blanket-implemented for any store implementing every port.
pub trait EngineStore:
    WorkflowRepository
    + ExecutionRepository
    + NodeExecutionRepository
    + CheckpointRepository
    + CircuitBreakerRepository
    + RateLimiterRepository
    + IdempotencyRepository
    + DeadLetterRepository
    + BatchWindowRepository
    + EnvironmentRepository
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> EngineStore for T where
    T: WorkflowRepository
        + ExecutionRepository
        + NodeExecutionRepository
        + CheckpointRepository
        + CircuitBreakerRepository
        + RateLimiterRepository
        + IdempotencyRepository
        + DeadLetterRepository
        + BatchWindowRepository
        + EnvironmentRepository
        + Clone
        + Send
        + Sync
        + 'static
{
}
