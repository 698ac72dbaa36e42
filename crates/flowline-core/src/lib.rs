//! Workflow engine logic and repository trait definitions for Flowline.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, and the engine built on top of them: the execution
//! coordinator, circuit breakers, rate limiters, the idempotency registry,
//! checkpoints, batch windows, the dead letter queue and environment
//! resolution. It depends only on `flowline-types` -- never on
//! `flowline-infra` or any database/IO crate.
//!
//! [`memory::MemoryStore`] implements every port in-process for tests and
//! ephemeral runs.

pub mod clock;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod memory;
pub mod repository;
pub mod resilience;
pub mod workflow;
