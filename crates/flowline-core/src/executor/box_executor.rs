//! BoxNodeExecutor -- object-safe dynamic dispatch wrapper for NodeExecutor.
//!
//! 1. Define an object-safe `NodeExecutorDyn` trait with boxed futures
//! 2. Blanket-impl `NodeExecutorDyn` for all `T: NodeExecutor`
//! 3. `BoxNodeExecutor` wraps `Box<dyn NodeExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use flowline_types::error::NodeError;
use flowline_types::execution::NodeOutput;
use serde_json::Value;

use super::NodeExecutor;

/// Object-safe version of [`NodeExecutor`] with boxed futures.
pub trait NodeExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        node_type: &'a str,
        input: &'a Value,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutput, NodeError>> + Send + 'a>>;
}

impl<T: NodeExecutor> NodeExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        node_type: &'a str,
        input: &'a Value,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutput, NodeError>> + Send + 'a>> {
        Box::pin(self.execute(node_type, input, timeout))
    }
}

/// Type-erased node executor for runtime plugin selection.
///
/// Since `NodeExecutor` uses RPITIT, it cannot be used as a trait object
/// directly.
pub struct BoxNodeExecutor {
    inner: Box<dyn NodeExecutorDyn + Send + Sync>,
}

impl BoxNodeExecutor {
    pub fn new<T: NodeExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn execute(
        &self,
        node_type: &str,
        input: &Value,
        timeout: Duration,
    ) -> Result<NodeOutput, NodeError> {
        self.inner.execute_boxed(node_type, input, timeout).await
    }
}

impl std::fmt::Debug for BoxNodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNodeExecutor").finish_non_exhaustive()
    }
}
