//! Per-node dispatch pipeline.
//!
//! Every attempt passes the same gates in order: cancellation check,
//! circuit breaker, rate limiter, idempotency guard, a second cancellation
//! check, then the executor call bounded by the node timeout. Every wait
//! re-reads the execution status when it ends, so a cancellation written by
//! another process stops the node before it reaches the executor. Transient failures are retried locally with
//! jittered backoff; what survives the retries is classified for the drive
//! loop (park, fail, or dead-letter).

use std::time::Duration;

use flowline_types::config::EngineConfig;
use flowline_types::error::NodeError;
use flowline_types::event::EngineEvent;
use flowline_types::execution::{ExecutionStatus, NodeOutput};
use flowline_types::workflow::{
    CircuitBreakerPolicy, IdempotencyPolicy, InFlightPolicy, NodeDefinition, RateLimitPolicy,
    RetryPolicy, WorkflowDefinition,
};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::EngineError;
use crate::executor::BoxNodeExecutor;
use crate::repository::EngineStore;
use crate::resilience::{Acquisition, Admission, TokenGrant};
use crate::workflow::retry::{node_retry_delay, spread};

use super::coordinator::{Coordinator, RunContext};
use super::environment::ResolvedEnvironment;
use super::tracker::outcome;

// ---------------------------------------------------------------------------
// Policy resolution
// ---------------------------------------------------------------------------

/// Idempotency key guarding one node of one execution.
fn node_key(execution_id: Uuid, node_id: &str) -> String {
    format!("node:{execution_id}:{node_id}")
}

/// Node, then workflow, then engine default.
pub(super) fn retry_policy(
    config: &EngineConfig,
    workflow: &WorkflowDefinition,
    node: &NodeDefinition,
) -> RetryPolicy {
    node.retry.or(workflow.retry).unwrap_or(config.retry)
}

/// Environment override for the node, then node, workflow, engine default.
pub(super) fn breaker_policy(
    config: &EngineConfig,
    workflow: &WorkflowDefinition,
    environment: &ResolvedEnvironment,
    node: &NodeDefinition,
) -> CircuitBreakerPolicy {
    environment
        .circuit_breakers
        .get(&node.id)
        .copied()
        .or(node.circuit_breaker)
        .or(workflow.circuit_breaker)
        .unwrap_or(config.circuit_breaker)
}

/// Buckets are opt-in: a limit key without a policy is unlimited.
pub(super) fn rate_policy(
    workflow: &WorkflowDefinition,
    environment: &ResolvedEnvironment,
    limit_key: &str,
) -> Option<RateLimitPolicy> {
    environment
        .rate_limits
        .get(limit_key)
        .or_else(|| workflow.rate_limits.get(limit_key))
        .copied()
}

fn idempotency_policy(config: &EngineConfig, workflow: &WorkflowDefinition) -> IdempotencyPolicy {
    workflow.idempotency.unwrap_or(config.idempotency)
}

fn node_timeout(config: &EngineConfig, workflow: &WorkflowDefinition, node: &NodeDefinition) -> Duration {
    let secs = node
        .timeout_secs
        .or(workflow.timeout_secs)
        .unwrap_or(config.engine.node_timeout_secs);
    Duration::from_secs(secs)
}

/// Reuse a completed key's stored result.
fn cached_output(result: Option<Value>) -> NodeOutput {
    match result {
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "stored idempotent result is not a node output, using it verbatim");
            NodeOutput::new(value)
        }),
        None => NodeOutput::default(),
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Why a single attempt produced no output.
enum AttemptError {
    /// The executor ran and reported a failure.
    Node(NodeError),
    /// A gate refused the attempt, or the engine itself failed.
    Engine(EngineError),
}

impl From<EngineError> for AttemptError {
    fn from(e: EngineError) -> Self {
        AttemptError::Engine(e)
    }
}

enum Admitted {
    Proceed { guarded: bool },
    Cached(NodeOutput),
}

impl<S: EngineStore> Coordinator<S> {
    /// Dispatch one node with local retries.
    pub(super) async fn run_node(
        &self,
        ctx: &RunContext,
        node: &NodeDefinition,
        input: Value,
    ) -> Result<NodeOutput, EngineError> {
        if let Some(contract) = &node.input_contract {
            if let Err(violations) = contract.validate(&input["payload"]) {
                let message = format!("input contract violated: {}", violations.join("; "));
                let record = self
                    .inner
                    .tracker
                    .begin(ctx.execution_id, node, 1, &input)
                    .await?;
                self.inner.tracker.fail(record, &message).await?;
                self.publish_failure(ctx, node, &message, false);
                tracing::warn!(
                    execution_id = %ctx.execution_id,
                    node_id = node.id.as_str(),
                    error = message.as_str(),
                    "node input rejected"
                );
                return Err(EngineError::PermanentNode {
                    node_id: node.id.clone(),
                    message,
                });
            }
        }

        let executor = self
            .inner
            .executors
            .get(&node.node_type)
            .ok_or_else(|| EngineError::ExecutorNotFound(node.node_type.clone()))?;
        let retry = retry_policy(&self.inner.config, &ctx.workflow, node);
        let max_attempts = retry.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.ensure_active(ctx).await?;
            let error = match self.attempt(ctx, node, &input, attempt, &executor).await {
                Ok(output) => return Ok(output),
                Err(AttemptError::Engine(e)) => return Err(e),
                Err(AttemptError::Node(error)) => error,
            };

            let message = error.message().to_string();
            let will_retry = error.is_transient() && attempt < max_attempts;
            self.publish_failure(ctx, node, &message, will_retry);

            if !error.is_transient() {
                tracing::warn!(
                    execution_id = %ctx.execution_id,
                    node_id = node.id.as_str(),
                    attempt,
                    error = message.as_str(),
                    "node failed permanently"
                );
                return Err(EngineError::PermanentNode {
                    node_id: node.id.clone(),
                    message,
                });
            }
            if !will_retry {
                tracing::warn!(
                    execution_id = %ctx.execution_id,
                    node_id = node.id.as_str(),
                    attempts = attempt,
                    error = message.as_str(),
                    "node retries exhausted"
                );
                return Err(EngineError::RetriesExhausted {
                    node_id: node.id.clone(),
                    attempts: attempt,
                    message,
                });
            }

            let delay = node_retry_delay(&retry, attempt - 1);
            tracing::warn!(
                execution_id = %ctx.execution_id,
                node_id = node.id.as_str(),
                attempt,
                max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = message.as_str(),
                "node failed, retrying"
            );
            self.pause(ctx, delay).await?;
        }
    }

    async fn attempt(
        &self,
        ctx: &RunContext,
        node: &NodeDefinition,
        input: &Value,
        attempt: u32,
        executor: &BoxNodeExecutor,
    ) -> Result<NodeOutput, AttemptError> {
        let inner = &self.inner;
        let workflow_id = ctx.workflow.id.as_str();
        let breaker = breaker_policy(&inner.config, &ctx.workflow, &ctx.environment, node);

        let probe = match inner.breakers.check(workflow_id, &node.id, breaker).await? {
            Admission::Allow => false,
            Admission::Probe => {
                tracing::info!(
                    execution_id = %ctx.execution_id,
                    node_id = node.id.as_str(),
                    "half-open probe admitted"
                );
                true
            }
            Admission::Reject { retry_at } => {
                tracing::debug!(
                    execution_id = %ctx.execution_id,
                    node_id = node.id.as_str(),
                    retry_at = %retry_at,
                    "circuit open, dispatch refused"
                );
                return Err(EngineError::CircuitOpen {
                    node_id: node.id.clone(),
                    retry_at,
                }
                .into());
            }
        };

        // A probe that never reaches the executor hands the lease back.
        let timeout = node_timeout(&inner.config, &ctx.workflow, node);
        let guarded = match self.admit(ctx, node, timeout).await {
            Ok(Admitted::Proceed { guarded }) => guarded,
            Ok(Admitted::Cached(output)) => {
                if probe {
                    inner.breakers.release_probe(workflow_id, &node.id, breaker).await?;
                }
                self.record_cached(ctx, node, input, attempt, &output).await?;
                return Ok(output);
            }
            Err(e) => {
                if probe {
                    inner.breakers.release_probe(workflow_id, &node.id, breaker).await?;
                }
                return Err(e.into());
            }
        };
        // Cancelled while waiting for admission: hand back what was won.
        if let Err(e) = self.ensure_active(ctx).await {
            if guarded {
                inner
                    .idempotency
                    .release(workflow_id, &node_key(ctx.execution_id, &node.id), ctx.execution_id)
                    .await?;
            }
            if probe {
                inner.breakers.release_probe(workflow_id, &node.id, breaker).await?;
            }
            return Err(e.into());
        }

        let record = inner
            .tracker
            .begin(ctx.execution_id, node, attempt, input)
            .await?;
        inner.events.publish(EngineEvent::NodeStarted {
            execution_id: ctx.execution_id,
            node_id: node.id.clone(),
            attempt,
        });
        tracing::debug!(
            execution_id = %ctx.execution_id,
            node_id = node.id.as_str(),
            node_type = node.node_type.as_str(),
            attempt,
            "dispatching node"
        );

        let started = Instant::now();
        let (result, timed_out) =
            match tokio::time::timeout(timeout, executor.execute(&node.node_type, input, timeout))
                .await
            {
                Ok(result) => (result, false),
                Err(_) => (
                    Err(NodeError::Transient(format!(
                        "timed out after {}ms",
                        timeout.as_millis()
                    ))),
                    true,
                ),
            };
        let elapsed = started.elapsed();
        let key = node_key(ctx.execution_id, &node.id);

        match result {
            Ok(output) => {
                inner.tracker.succeed(record, &output).await?;
                inner
                    .tracker
                    .snapshot(
                        ctx.execution_id,
                        &node.id,
                        attempt,
                        elapsed,
                        input,
                        Some(&output),
                        outcome::SUCCEEDED,
                    )
                    .await?;
                inner.breakers.record_success(workflow_id, &node.id, breaker).await?;
                if guarded {
                    let stored = serde_json::to_value(&output).unwrap_or(Value::Null);
                    let ttl = idempotency_policy(&inner.config, &ctx.workflow).ttl_seconds;
                    inner
                        .idempotency
                        .complete(workflow_id, &key, ctx.execution_id, stored, ttl)
                        .await?;
                }
                let duration_ms = elapsed.as_millis() as u64;
                inner.events.publish(EngineEvent::NodeSucceeded {
                    execution_id: ctx.execution_id,
                    node_id: node.id.clone(),
                    duration_ms,
                    cached: false,
                });
                tracing::info!(
                    execution_id = %ctx.execution_id,
                    node_id = node.id.as_str(),
                    attempt,
                    duration_ms,
                    "node succeeded"
                );
                Ok(output)
            }
            Err(error) => {
                let label = if timed_out {
                    outcome::TIMEOUT
                } else if error.is_transient() {
                    outcome::TRANSIENT_ERROR
                } else {
                    outcome::PERMANENT_ERROR
                };
                inner.tracker.fail(record, error.message()).await?;
                inner
                    .tracker
                    .snapshot(ctx.execution_id, &node.id, attempt, elapsed, input, None, label)
                    .await?;
                inner.breakers.record_failure(workflow_id, &node.id, breaker).await?;
                if guarded {
                    inner
                        .idempotency
                        .release(workflow_id, &key, ctx.execution_id)
                        .await?;
                }
                Err(AttemptError::Node(error))
            }
        }
    }

    /// Rate limiter and idempotency gates.
    async fn admit(
        &self,
        ctx: &RunContext,
        node: &NodeDefinition,
        timeout: Duration,
    ) -> Result<Admitted, EngineError> {
        self.acquire_token(ctx, node, timeout).await?;
        if !node.is_guarded() {
            return Ok(Admitted::Proceed { guarded: false });
        }
        Ok(match self.claim_key(ctx, node).await? {
            Some(output) => Admitted::Cached(output),
            None => Admitted::Proceed { guarded: true },
        })
    }

    /// Wait for a token while the wait still fits in the node timeout.
    async fn acquire_token(
        &self,
        ctx: &RunContext,
        node: &NodeDefinition,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let limit_key = node.limit_key();
        let Some(policy) = rate_policy(&ctx.workflow, &ctx.environment, limit_key) else {
            return Ok(());
        };
        let floor = Duration::from_millis(self.inner.config.engine.rate_limit_poll_ms);
        let started = Instant::now();
        loop {
            match self.inner.limiters.try_acquire(limit_key, policy).await? {
                TokenGrant::Granted => return Ok(()),
                TokenGrant::Denied { retry_after } => {
                    let waited = started.elapsed();
                    let delay = spread(retry_after.max(floor));
                    if waited + delay > timeout {
                        tracing::warn!(
                            execution_id = %ctx.execution_id,
                            node_id = node.id.as_str(),
                            limit_key,
                            waited_ms = waited.as_millis() as u64,
                            "rate limit wait would exceed node timeout"
                        );
                        return Err(EngineError::RateLimitExceeded {
                            node_id: node.id.clone(),
                            limit_key: limit_key.to_string(),
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    tracing::debug!(
                        execution_id = %ctx.execution_id,
                        node_id = node.id.as_str(),
                        limit_key,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, deferring"
                    );
                    self.pause(ctx, delay).await?;
                    self.ensure_active(ctx).await?;
                }
            }
        }
    }

    /// Acquire the node's idempotency key. `Some` carries the result of an
    /// earlier completed dispatch.
    async fn claim_key(
        &self,
        ctx: &RunContext,
        node: &NodeDefinition,
    ) -> Result<Option<NodeOutput>, EngineError> {
        let key = node_key(ctx.execution_id, &node.id);
        let policy = idempotency_policy(&self.inner.config, &ctx.workflow);
        let started = Instant::now();
        loop {
            let acquired = self
                .inner
                .idempotency
                .acquire(&ctx.workflow.id, &key, ctx.execution_id)
                .await?;
            let holder = match acquired {
                Acquisition::Proceed => return Ok(None),
                Acquisition::Completed { result, .. } => {
                    return Ok(Some(cached_output(result)));
                }
                Acquisition::InProgress { execution_id, .. } => execution_id,
            };
            match policy.in_flight {
                InFlightPolicy::FailFast => {
                    return Err(EngineError::IdempotencyConflict { key });
                }
                InFlightPolicy::Wait {
                    max_wait_ms,
                    poll_ms,
                } => {
                    if started.elapsed() >= Duration::from_millis(max_wait_ms) {
                        return Err(EngineError::IdempotencyConflict { key });
                    }
                    tracing::debug!(
                        execution_id = %ctx.execution_id,
                        node_id = node.id.as_str(),
                        holder = %holder,
                        "idempotency key in flight, waiting"
                    );
                    self.pause(ctx, spread(Duration::from_millis(poll_ms.max(1))))
                        .await?;
                    self.ensure_active(ctx).await?;
                }
            }
        }
    }

    async fn record_cached(
        &self,
        ctx: &RunContext,
        node: &NodeDefinition,
        input: &Value,
        attempt: u32,
        output: &NodeOutput,
    ) -> Result<(), EngineError> {
        let tracker = &self.inner.tracker;
        let record = tracker.begin(ctx.execution_id, node, attempt, input).await?;
        tracker.succeed(record, output).await?;
        tracker
            .snapshot(
                ctx.execution_id,
                &node.id,
                attempt,
                Duration::ZERO,
                input,
                Some(output),
                outcome::CACHED,
            )
            .await?;
        self.inner.events.publish(EngineEvent::NodeSucceeded {
            execution_id: ctx.execution_id,
            node_id: node.id.clone(),
            duration_ms: 0,
            cached: true,
        });
        tracing::info!(
            execution_id = %ctx.execution_id,
            node_id = node.id.as_str(),
            "side effect already performed, reusing recorded result"
        );
        Ok(())
    }

    fn publish_failure(&self, ctx: &RunContext, node: &NodeDefinition, error: &str, will_retry: bool) {
        self.inner.events.publish(EngineEvent::NodeFailed {
            execution_id: ctx.execution_id,
            node_id: node.id.clone(),
            error: error.to_string(),
            will_retry,
        });
    }

    /// Stop early if the execution was cancelled, here or in the store.
    async fn ensure_active(&self, ctx: &RunContext) -> Result<(), EngineError> {
        if ctx.token.is_cancelled() {
            return Err(EngineError::Cancelled(ctx.execution_id));
        }
        let status = self
            .inner
            .store
            .get_execution(&ctx.execution_id)
            .await?
            .map(|e| e.status);
        if status == Some(ExecutionStatus::Cancelled) {
            ctx.token.cancel();
            return Err(EngineError::Cancelled(ctx.execution_id));
        }
        Ok(())
    }

    /// Sleep unless cancelled first.
    async fn pause(&self, ctx: &RunContext, delay: Duration) -> Result<(), EngineError> {
        tokio::select! {
            _ = ctx.token.cancelled() => Err(EngineError::Cancelled(ctx.execution_id)),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::environment::Environment;
    use serde_json::json;

    fn workflow() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": "wf",
            "name": "wf",
            "circuit_breaker": {"failure_threshold": 7},
            "rate_limits": {"crm": {"rate_per_second": 2.0, "burst_size": 4}},
            "nodes": [
                {"id": "a", "type": "crm", "circuit_breaker": {"failure_threshold": 2}},
                {"id": "b", "type": "http", "depends_on": ["a"], "retry": {"max_attempts": 9}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn breaker_policy_precedence() {
        let config = EngineConfig::default();
        let wf = workflow();
        let mut env = ResolvedEnvironment::empty(Environment::Production);

        let a = wf.node("a").unwrap();
        let b = wf.node("b").unwrap();
        assert_eq!(breaker_policy(&config, &wf, &env, a).failure_threshold, 2);
        assert_eq!(breaker_policy(&config, &wf, &env, b).failure_threshold, 7);

        env.circuit_breakers.insert(
            "a".into(),
            CircuitBreakerPolicy {
                failure_threshold: 11,
                ..CircuitBreakerPolicy::default()
            },
        );
        assert_eq!(breaker_policy(&config, &wf, &env, a).failure_threshold, 11);
    }

    #[test]
    fn retry_falls_back_to_engine_default() {
        let config = EngineConfig::default();
        let wf = workflow();
        assert_eq!(retry_policy(&config, &wf, wf.node("b").unwrap()).max_attempts, 9);
        assert_eq!(
            retry_policy(&config, &wf, wf.node("a").unwrap()),
            config.retry
        );
    }

    #[test]
    fn rate_limits_are_opt_in_and_overridable() {
        let wf = workflow();
        let mut env = ResolvedEnvironment::empty(Environment::Staging);
        assert!(rate_policy(&wf, &env, "http").is_none());
        assert_eq!(rate_policy(&wf, &env, "crm").unwrap().burst_size, 4);

        env.rate_limits.insert(
            "crm".into(),
            RateLimitPolicy {
                rate_per_second: 0.5,
                burst_size: 1,
            },
        );
        assert_eq!(rate_policy(&wf, &env, "crm").unwrap().burst_size, 1);
    }

    #[test]
    fn timeout_prefers_node_then_workflow() {
        let config = EngineConfig::default();
        let mut wf = workflow();
        let b = wf.node("b").unwrap().clone();
        assert_eq!(
            node_timeout(&config, &wf, &b),
            Duration::from_secs(config.engine.node_timeout_secs)
        );

        wf.timeout_secs = Some(20);
        assert_eq!(node_timeout(&config, &wf, &b), Duration::from_secs(20));

        let mut fast = b;
        fast.timeout_secs = Some(2);
        assert_eq!(node_timeout(&config, &wf, &fast), Duration::from_secs(2));
    }

    #[test]
    fn cached_output_tolerates_foreign_values() {
        let stored = serde_json::to_value(NodeOutput::new(json!({"id": 7}))).unwrap();
        assert_eq!(cached_output(Some(stored)).output, json!({"id": 7}));
        assert_eq!(cached_output(Some(json!("raw"))).output, json!("raw"));
        assert_eq!(cached_output(None), NodeOutput::default());
    }
}
