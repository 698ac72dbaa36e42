//! Executor registry for runtime node-type lookup.

use std::collections::HashMap;
use std::sync::Arc;

use super::box_executor::BoxNodeExecutor;

/// Registry of node executors, indexed by node type.
///
/// A fallback executor, if set, serves every node type without a specific
/// registration.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<BoxNodeExecutor>>,
    fallback: Option<Arc<BoxNodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a node type, replacing any previous one.
    pub fn register(&mut self, node_type: impl Into<String>, executor: BoxNodeExecutor) {
        self.executors.insert(node_type.into(), Arc::new(executor));
    }

    pub fn set_fallback(&mut self, executor: BoxNodeExecutor) {
        self.fallback = Some(Arc::new(executor));
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<BoxNodeExecutor>> {
        self.executors
            .get(node_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn list_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::executor::EchoExecutor;

    #[tokio::test]
    async fn lookup_and_fallback() {
        let mut registry = ExecutorRegistry::new();
        assert!(registry.get("echo").is_none());

        registry.register("echo", BoxNodeExecutor::new(EchoExecutor));
        let exec = registry.get("echo").unwrap();
        let out = exec
            .execute("echo", &json!({"payload": {"x": 1}}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.output, json!({"x": 1}));

        assert!(registry.get("crm_write").is_none());
        registry.set_fallback(BoxNodeExecutor::new(EchoExecutor));
        assert!(registry.get("crm_write").is_some());
        assert_eq!(registry.list_types(), vec!["echo"]);
    }
}
