//! Workflow definitions, the DAG arena and retry timing.

pub mod definition;
pub mod graph;
pub mod retry;

pub use definition::{WorkflowError, load_workflow_file, parse_workflow_json, parse_workflow_yaml};
pub use graph::{Advance, Readiness, WorkflowGraph};
