//! HTTP node executor.
//!
//! POSTs `{"node_type", "input", "timeout_ms"}` as JSON to the configured
//! endpoint and expects a `NodeOutput` JSON body back. Failures are
//! classified for the engine:
//!
//! - timeouts, connection errors, 408, 429 and 5xx are transient
//! - every other non-success status and an undecodable body are permanent

use std::time::Duration;

use flowline_core::executor::NodeExecutor;
use flowline_types::config::ExecutorEndpoint;
use flowline_types::error::NodeError;
use flowline_types::execution::NodeOutput;
use serde::Serialize;
use serde_json::Value;

/// Calls a remote executor plugin over HTTP.
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: ExecutorEndpoint,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    node_type: &'a str,
    input: &'a Value,
    timeout_ms: u64,
}

impl HttpExecutor {
    pub fn new(endpoint: ExecutorEndpoint) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, endpoint })
    }

    pub fn url(&self) -> &str {
        &self.endpoint.url
    }
}

/// Map a non-success status to the engine's failure classes.
fn classify_status(status: reqwest::StatusCode, body: &str) -> NodeError {
    let message = format!("HTTP {status}: {body}");
    match status.as_u16() {
        408 | 429 => NodeError::Transient(message),
        s if s >= 500 => NodeError::Transient(message),
        _ => NodeError::Permanent(message),
    }
}

fn classify_transport(err: &reqwest::Error) -> NodeError {
    if err.is_builder() {
        NodeError::Permanent(format!("invalid executor request: {err}"))
    } else if err.is_timeout() {
        NodeError::Transient(format!("executor timed out: {err}"))
    } else {
        NodeError::Transient(format!("executor unreachable: {err}"))
    }
}

impl NodeExecutor for HttpExecutor {
    async fn execute(
        &self,
        node_type: &str,
        input: &Value,
        timeout: Duration,
    ) -> Result<NodeOutput, NodeError> {
        let body = ExecuteRequest {
            node_type,
            input,
            timeout_ms: timeout.as_millis() as u64,
        };

        let mut request = self
            .client
            .post(&self.endpoint.url)
            .timeout(timeout)
            .json(&body);
        for (name, value) in &self.endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = %status,
                node_type,
                url = self.endpoint.url.as_str(),
                "executor returned error status"
            );
            return Err(classify_status(status, &error_body));
        }

        response.json::<NodeOutput>().await.map_err(|e| {
            if e.is_timeout() {
                NodeError::Transient(format!("executor timed out: {e}"))
            } else {
                NodeError::Permanent(format!("executor response is not a node output: {e}"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::json;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn executor(url: String) -> HttpExecutor {
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("x-api-key".to_string(), "k1".to_string());
        HttpExecutor::new(ExecutorEndpoint { url, headers }).unwrap()
    }

    #[tokio::test]
    async fn test_success_returns_node_output() {
        let app = Router::new().route(
            "/run",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let key = headers
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({
                    "output": {"type": body["node_type"], "echo": body["input"]["payload"], "key": key},
                    "branches": ["notify"],
                    "outbound_calls": 2
                }))
            }),
        );
        let base = serve(app).await;

        let out = executor(format!("{base}/run"))
            .execute("crm_write", &json!({"payload": {"id": 7}}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.output["type"], "crm_write");
        assert_eq!(out.output["echo"]["id"], 7);
        assert_eq!(out.output["key"], "k1");
        assert_eq!(out.branches, Some(vec!["notify".to_string()]));
        assert_eq!(out.outbound_calls, 2);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let app = Router::new()
            .route("/busy", post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }))
            .route("/throttled", post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }))
            .route("/bad", post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "missing email") }))
            .route("/garbage", post(|| async { "not json" }));
        let base = serve(app).await;
        let input = json!({"payload": {}});
        let timeout = Duration::from_secs(5);

        let busy = executor(format!("{base}/busy")).execute("x", &input, timeout).await;
        assert!(matches!(busy, Err(NodeError::Transient(_))));

        let throttled = executor(format!("{base}/throttled")).execute("x", &input, timeout).await;
        assert!(matches!(throttled, Err(NodeError::Transient(_))));

        let bad = executor(format!("{base}/bad")).execute("x", &input, timeout).await;
        match bad {
            Err(NodeError::Permanent(m)) => assert!(m.contains("missing email")),
            other => panic!("expected permanent error, got {other:?}"),
        }

        let garbage = executor(format!("{base}/garbage")).execute("x", &input, timeout).await;
        assert!(matches!(garbage, Err(NodeError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out_transiently() {
        let app = Router::new().route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({"output": null}))
            }),
        );
        let base = serve(app).await;

        let result = executor(format!("{base}/slow"))
            .execute("x", &json!({}), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(NodeError::Transient(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = executor(format!("http://{addr}/run"))
            .execute("x", &json!({}), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(NodeError::Transient(_))));
    }
}
