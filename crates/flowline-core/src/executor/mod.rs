//! Node executor capability.
//!
//! Node types (an HTTP call, a CRM write, a Slack post) are implemented
//! outside the engine. The coordinator only sees [`NodeExecutor`]: given a
//! node type, its input and a timeout, produce an output or a classified
//! error.

pub mod box_executor;
pub mod registry;

use std::time::Duration;

use flowline_types::error::NodeError;
use flowline_types::execution::NodeOutput;
use serde_json::Value;

pub use box_executor::BoxNodeExecutor;
pub use registry::ExecutorRegistry;

/// Capability that runs one node invocation.
///
/// Implementations should honor `timeout` themselves where they can; the
/// coordinator also bounds the call and reports an elapsed timeout as a
/// transient failure.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait NodeExecutor: Send + Sync {
    fn execute(
        &self,
        node_type: &str,
        input: &Value,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<NodeOutput, NodeError>> + Send;
}

/// Returns the node's payload as its output. Registered as `echo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

impl NodeExecutor for EchoExecutor {
    async fn execute(
        &self,
        _node_type: &str,
        input: &Value,
        _timeout: Duration,
    ) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new(input.get("payload").cloned().unwrap_or(Value::Null)))
    }
}
