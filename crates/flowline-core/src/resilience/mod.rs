//! Shared resilience primitives: circuit breakers, token buckets and
//! idempotency keys. All state lives in the store so every worker sees the
//! same view.

pub mod circuit_breaker;
pub mod idempotency;
pub mod rate_limiter;

pub use circuit_breaker::{Admission, CircuitBreakers};
pub use idempotency::{Acquisition, IdempotencyRegistry};
pub use rate_limiter::{RateLimiters, TokenGrant};
