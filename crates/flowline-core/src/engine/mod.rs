//! Execution engine: the coordinator that drives a workflow DAG and the
//! components it persists through.
//!
//! The coordinator evaluates the graph, dispatches ready nodes through the
//! resilience pipeline (circuit breaker, rate limiter, idempotency guard,
//! executor), checkpoints progress, and settles every execution into a
//! terminal or parked state. The [`worker::Worker`] sweeps persisted
//! suspensions back into the coordinator.

pub mod batch;
pub mod checkpoint;
pub mod coordinator;
pub mod dead_letter;
mod dispatch;
pub mod environment;
pub mod tracker;
pub mod worker;

#[cfg(test)]
mod tests;

pub use batch::{BatchWindows, Flush};
pub use checkpoint::CheckpointManager;
pub use coordinator::{Coordinator, ExecutionView, Ingested, RunMode, Started, TriggerRequest};
pub use dead_letter::DeadLetterQueue;
pub use environment::{EnvironmentResolver, ResolvedEnvironment};
pub use tracker::NodeTracker;
pub use worker::{SweepReport, Worker};
