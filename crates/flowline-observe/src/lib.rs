//! Observability setup for Flowline: the global tracing subscriber and the
//! optional OpenTelemetry span export.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingOptions, default_filter, init_tracing, shutdown_tracing};
