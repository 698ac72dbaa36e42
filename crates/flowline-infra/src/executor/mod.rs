//! Node executor plugins backed by infrastructure.

pub mod http;

use flowline_core::executor::{BoxNodeExecutor, EchoExecutor, ExecutorRegistry};
use flowline_types::config::EngineConfig;

pub use http::HttpExecutor;

/// Registry with the built-in `echo` executor plus one HTTP executor per
/// `[executors.<node_type>]` entry in the config.
///
/// Endpoints whose client cannot be built are skipped with a warning; their
/// node type then has no executor and dispatch fails permanently.
pub fn build_registry(config: &EngineConfig) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register("echo", BoxNodeExecutor::new(EchoExecutor));

    for (node_type, endpoint) in &config.executors {
        match HttpExecutor::new(endpoint.clone()) {
            Ok(executor) => {
                tracing::debug!(node_type = node_type.as_str(), url = endpoint.url.as_str(), "registered HTTP executor");
                registry.register(node_type.clone(), BoxNodeExecutor::new(executor));
            }
            Err(err) => {
                tracing::warn!(node_type = node_type.as_str(), error = %err, "failed to build HTTP executor, skipping");
            }
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::config::ExecutorEndpoint;

    #[test]
    fn test_registry_has_echo_and_configured_types() {
        let mut config = EngineConfig::default();
        config.executors.insert(
            "crm_write".into(),
            ExecutorEndpoint {
                url: "http://127.0.0.1:9000/crm".into(),
                headers: Default::default(),
            },
        );

        let registry = build_registry(&config);
        assert_eq!(registry.list_types(), vec!["crm_write", "echo"]);
        assert!(registry.get("slack_post").is_none());
    }
}
