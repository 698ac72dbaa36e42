//! Shared domain types for Flowline.
//!
//! This crate contains the records persisted by the workflow engine
//! (executions, checkpoints, breaker and limiter state, dead letters, batch
//! windows, environment configs), the workflow definition IR, engine
//! configuration, and the error types shared by repository ports.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod batch;
pub mod config;
pub mod dead_letter;
pub mod environment;
pub mod error;
pub mod event;
pub mod execution;
pub mod resilience;
pub mod workflow;
