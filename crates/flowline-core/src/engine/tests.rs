//! End-to-end scenarios for the coordinator against the in-memory store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowline_types::config::EngineConfig;
use flowline_types::dead_letter::DeadLetterStatus;
use flowline_types::error::NodeError;
use flowline_types::event::EngineEvent;
use flowline_types::execution::{ExecutionStatus, NodeExecution, NodeOutput, NodeStatus};
use flowline_types::resilience::{CircuitState, IdempotencyEntry, IdempotencyStatus};
use flowline_types::workflow::{RetryPolicy, WorkflowDefinition};
use serde_json::{Value, json};
use uuid::Uuid;

use super::*;
use crate::error::EngineError;
use crate::executor::{BoxNodeExecutor, ExecutorRegistry, NodeExecutor};
use crate::memory::MemoryStore;
use crate::repository::{ExecutionRepository, IdempotencyRepository, NodeExecutionRepository};

/// Executor that replays queued results per node type, then succeeds with
/// `{"seen_by": <type>, "payload": <payload>}`.
#[derive(Clone, Default)]
struct Scripted {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Result<NodeOutput, NodeError>>>>>,
    calls: Arc<Mutex<HashMap<String, u32>>>,
}

impl Scripted {
    fn push(&self, node_type: &str, result: Result<NodeOutput, NodeError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(node_type.to_string())
            .or_default()
            .push_back(result);
    }

    fn calls(&self, node_type: &str) -> u32 {
        self.calls.lock().unwrap().get(node_type).copied().unwrap_or(0)
    }
}

impl NodeExecutor for Scripted {
    async fn execute(
        &self,
        node_type: &str,
        input: &Value,
        _timeout: Duration,
    ) -> Result<NodeOutput, NodeError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(node_type.to_string())
            .or_default() += 1;
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(node_type)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| {
            Ok(NodeOutput::new(json!({
                "seen_by": node_type,
                "payload": input["payload"].clone(),
            })))
        })
    }
}

/// Executor that takes `delay` on every call. Stands in for a slow external
/// side effect shared by several coordinators.
#[derive(Clone)]
struct Slow {
    delay: Duration,
    calls: Arc<AtomicU32>,
}

impl Slow {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeExecutor for Slow {
    async fn execute(
        &self,
        _node_type: &str,
        _input: &Value,
        _timeout: Duration,
    ) -> Result<NodeOutput, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(NodeOutput::new(json!({"sent": true})))
    }
}

/// A coordinator on a shared store, as a second process would have.
fn instance(
    store: &MemoryStore,
    executor: impl NodeExecutor + 'static,
    config: EngineConfig,
) -> Coordinator<MemoryStore> {
    let mut executors = ExecutorRegistry::new();
    executors.set_fallback(BoxNodeExecutor::new(executor));
    Coordinator::new(store.clone(), executors, config)
}

fn slow_send() -> WorkflowDefinition {
    serde_json::from_value(json!({
        "id": "wf",
        "name": "notify",
        "nodes": [{
            "id": "send", "type": "email", "timeout_secs": 600,
            "side_effecting": true, "idempotent": true
        }]
    }))
    .unwrap()
}

async fn setup(definition: Value) -> (Coordinator<MemoryStore>, Scripted) {
    let scripted = Scripted::default();
    let mut executors = ExecutorRegistry::new();
    executors.set_fallback(BoxNodeExecutor::new(scripted.clone()));

    let mut config = EngineConfig::default();
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
    };
    let coordinator = Coordinator::new(MemoryStore::new(), executors, config);
    let def: WorkflowDefinition = serde_json::from_value(definition).unwrap();
    coordinator.register_workflow(def).await.unwrap();
    (coordinator, scripted)
}

fn chain() -> Value {
    json!({
        "id": "wf",
        "name": "chain",
        "nodes": [
            {"id": "a", "type": "a"},
            {"id": "b", "type": "b", "depends_on": ["a"]},
            {"id": "c", "type": "c", "depends_on": ["b"]}
        ]
    })
}

fn diamond() -> Value {
    json!({
        "id": "wf",
        "name": "diamond",
        "nodes": [
            {"id": "a", "type": "a"},
            {"id": "b", "type": "b", "depends_on": ["a"]},
            {"id": "c", "type": "c", "depends_on": ["a"]},
            {"id": "d", "type": "d", "depends_on": ["b", "c"]}
        ]
    })
}

fn trigger(data: Value) -> TriggerRequest {
    TriggerRequest::new("wf", "webhook", data)
}

async fn status(coordinator: &Coordinator<MemoryStore>, id: Uuid) -> ExecutionStatus {
    coordinator.get_execution(id).await.unwrap().execution.status
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn open_breaker_dead_letter_then_half_open_recovery() {
    let mut def = chain();
    def["circuit_breaker"] = json!({"failure_threshold": 3, "timeout_seconds": 30});
    let (coordinator, scripted) = setup(def).await;
    for _ in 0..3 {
        scripted.push("b", Err(NodeError::Transient("503 from upstream".into())));
    }
    let mut rx = coordinator.events().subscribe();

    let started = coordinator.start_execution(trigger(json!({"lead": 1}))).await.unwrap();
    let id = started.execution_id;

    let view = coordinator.get_execution(id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Failed);
    assert!(view.execution.error.unwrap().contains("after 3 attempts"));
    assert_eq!(scripted.calls("b"), 3);
    assert_eq!(scripted.calls("c"), 0);
    let breaker = coordinator.get_circuit("wf", "b").await.unwrap().unwrap();
    assert_eq!(breaker.state, CircuitState::Open);
    let entry = view.dead_letter.unwrap();
    assert_eq!(entry.status, DeadLetterStatus::Pending);
    assert_eq!(entry.attempt_count, 0);

    // While open, direct dispatch is refused without reaching the executor.
    let refused = coordinator.dispatch_node(id, "b").await.unwrap_err();
    assert!(matches!(refused, EngineError::CircuitOpen { .. }));
    assert_eq!(scripted.calls("b"), 3);

    tokio::time::advance(Duration::from_secs(31)).await;
    let worker = Worker::new(coordinator.clone());
    assert_eq!(worker.process_dead_letters().await.unwrap(), 1);

    assert_eq!(scripted.calls("b"), 4);
    assert_eq!(scripted.calls("a"), 1);
    assert_eq!(scripted.calls("c"), 1);
    let view = coordinator.get_execution(id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Completed);
    assert_eq!(view.dead_letter.unwrap().status, DeadLetterStatus::Resolved);
    let breaker = coordinator.get_circuit("wf", "b").await.unwrap().unwrap();
    assert_eq!(breaker.state, CircuitState::Closed);

    let half_opens = drain(&mut rx)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                EngineEvent::CircuitStateChanged {
                    to: CircuitState::HalfOpen,
                    ..
                }
            )
        })
        .count();
    assert_eq!(half_opens, 1);
}

#[tokio::test]
async fn repeated_trigger_key_runs_side_effect_once() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "welcome",
        "nodes": [{"id": "send", "type": "email", "side_effecting": true}]
    }))
    .await;

    let request = trigger(json!({"to": "a@example.com"})).with_idempotency_key("evt-1");
    let first = coordinator.start_execution(request.clone()).await.unwrap();
    let second = coordinator.start_execution(request).await.unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.execution_id, second.execution_id);
    assert_eq!(scripted.calls("email"), 1);
    assert_eq!(
        coordinator.list_executions(Some("wf"), None, 10).await.unwrap().len(),
        1
    );

    // The guarded node's completed key answers a repeat dispatch.
    let output = coordinator
        .dispatch_node(first.execution_id, "send")
        .await
        .unwrap();
    assert_eq!(output.output["payload"], json!({"to": "a@example.com"}));
    assert_eq!(scripted.calls("email"), 1);
    let view = coordinator.get_execution(first.execution_id).await.unwrap();
    assert!(view.snapshots.iter().any(|s| s.outcome == "cached"));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_wait_beyond_timeout_dead_letters() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "sync",
        "rate_limits": {"crm": {"rate_per_second": 0.1, "burst_size": 1}},
        "nodes": [{
            "id": "push", "type": "crm", "timeout_secs": 2,
            "retry": {"max_attempts": 1}
        }]
    }))
    .await;

    let first = coordinator.start_execution(trigger(json!(1))).await.unwrap();
    assert_eq!(status(&coordinator, first.execution_id).await, ExecutionStatus::Completed);

    let second = coordinator.start_execution(trigger(json!(2))).await.unwrap();
    let view = coordinator.get_execution(second.execution_id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Failed);
    assert!(view.execution.error.unwrap().contains("rate limit 'crm'"));
    assert_eq!(view.dead_letter.unwrap().status, DeadLetterStatus::Pending);
    assert_eq!(scripted.calls("crm"), 1);
}

#[tokio::test(start_paused = true)]
async fn parked_execution_resumes_to_same_state() {
    let (coordinator, _) = setup(diamond()).await;
    let data = json!({"order": 42});

    let baseline = coordinator.start_execution(trigger(data.clone())).await.unwrap();
    let expected = coordinator
        .get_execution(baseline.execution_id)
        .await
        .unwrap()
        .checkpoints
        .pop()
        .unwrap()
        .state;

    coordinator
        .force_circuit_state("wf", "c", CircuitState::Open)
        .await
        .unwrap();
    let parked = coordinator.start_execution(trigger(data)).await.unwrap();
    let view = coordinator.get_execution(parked.execution_id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Waiting);
    assert!(view.execution.next_check_at.is_some());
    let last = view.checkpoints.last().unwrap();
    assert!(last.can_resume);
    assert_eq!(last.state.node_status.get("b"), Some(&NodeStatus::Succeeded));
    assert!(!last.state.node_status.contains_key("d"));

    coordinator
        .force_circuit_state("wf", "c", CircuitState::Closed)
        .await
        .unwrap();
    let resumed = coordinator.resume_execution(parked.execution_id).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Completed);

    let actual = coordinator
        .get_execution(parked.execution_id)
        .await
        .unwrap()
        .checkpoints
        .pop()
        .unwrap()
        .state;
    assert_eq!(actual, expected);
}

#[tokio::test(start_paused = true)]
async fn worker_wakes_execution_parked_on_open_breaker() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "single",
        "circuit_breaker": {"timeout_seconds": 30},
        "nodes": [{"id": "a", "type": "a"}]
    }))
    .await;
    coordinator
        .force_circuit_state("wf", "a", CircuitState::Open)
        .await
        .unwrap();

    let started = coordinator.start_execution(trigger(json!({}))).await.unwrap();
    assert_eq!(status(&coordinator, started.execution_id).await, ExecutionStatus::Waiting);

    let worker = Worker::new(coordinator.clone());
    assert_eq!(worker.wake_waiting().await.unwrap(), 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    let report = worker.tick().await;
    assert_eq!(report.woken, 1);
    assert_eq!(status(&coordinator, started.execution_id).await, ExecutionStatus::Completed);
    assert_eq!(scripted.calls("a"), 1);
}

async fn interrupt_after_a(coordinator: &Coordinator<MemoryStore>) -> Uuid {
    let started = coordinator.create_execution(trigger(json!({}))).await.unwrap();
    let id = started.execution_id;
    let now = chrono::Utc::now();
    let record = |node_id: &str, status: NodeStatus, output: Option<Value>| NodeExecution {
        id: Uuid::now_v7(),
        execution_id: id,
        node_id: node_id.to_string(),
        node_type: node_id.to_string(),
        attempt: 1,
        status,
        input: json!({}),
        output,
        branches: None,
        error: None,
        created_at: now,
        started_at: Some(now),
        completed_at: None,
    };
    let store = coordinator.store();
    store
        .create_node_execution(&record("a", NodeStatus::Succeeded, Some(json!({"x": 1}))))
        .await
        .unwrap();
    store
        .create_node_execution(&record("b", NodeStatus::Running, None))
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn interrupted_unsafe_node_fails_instead_of_repeating() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "charge",
        "nodes": [
            {"id": "a", "type": "a"},
            {"id": "b", "type": "b", "depends_on": ["a"], "side_effecting": true, "idempotent": false}
        ]
    }))
    .await;
    let id = interrupt_after_a(&coordinator).await;

    let execution = coordinator.resume_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.unwrap().contains("not safe to repeat"));
    assert_eq!(scripted.calls("a"), 0);
    assert_eq!(scripted.calls("b"), 0);

    let view = coordinator.get_execution(id).await.unwrap();
    assert!(view.dead_letter.is_none());
    assert!(view.nodes.iter().all(|n| n.status != NodeStatus::Running));
}

#[tokio::test]
async fn interrupted_repeatable_node_is_dispatched_again() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "charge",
        "nodes": [
            {"id": "a", "type": "a"},
            {"id": "b", "type": "b", "depends_on": ["a"], "side_effecting": true,
             "idempotent": false, "safe_to_repeat": true}
        ]
    }))
    .await;
    let id = interrupt_after_a(&coordinator).await;

    let execution = coordinator.resume_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(scripted.calls("a"), 0);
    assert_eq!(scripted.calls("b"), 1);

    let state = coordinator
        .get_execution(id)
        .await
        .unwrap()
        .checkpoints
        .pop()
        .unwrap()
        .state;
    assert_eq!(state.node_outputs["b"]["payload"], json!({"x": 1}));
}

#[tokio::test(start_paused = true)]
async fn interrupted_guarded_node_waits_for_its_key_lease() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "charge",
        "nodes": [
            {"id": "a", "type": "a"},
            {"id": "b", "type": "b", "depends_on": ["a"], "side_effecting": true, "idempotent": true}
        ]
    }))
    .await;
    let id = interrupt_after_a(&coordinator).await;
    // The lost attempt still holds the key and may still be calling out.
    let now = coordinator.clock().now();
    let held = IdempotencyEntry {
        workflow_id: "wf".into(),
        key: format!("node:{id}:b"),
        execution_id: id,
        status: IdempotencyStatus::InProgress,
        result: None,
        lease_expires_at: Some(now + chrono::TimeDelta::seconds(300)),
        expires_at: now + chrono::TimeDelta::seconds(300),
        created_at: now,
        version: 0,
    };
    assert!(coordinator.store().insert_idempotency_key(&held).await.unwrap());

    let execution = coordinator.resume_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Waiting);
    assert_eq!(scripted.calls("b"), 0);

    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(Worker::new(coordinator.clone()).wake_waiting().await.unwrap(), 1);
    assert_eq!(status(&coordinator, id).await, ExecutionStatus::Completed);
    assert_eq!(scripted.calls("b"), 1);
}

#[tokio::test]
async fn full_batch_window_starts_one_execution() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "digest",
        "batching": {"node_id": "ingest", "window_size": 5, "window_secs": 60},
        "nodes": [
            {"id": "ingest", "type": "ingest"},
            {"id": "notify", "type": "notify", "depends_on": ["ingest"]}
        ]
    }))
    .await;

    let mut started = Vec::new();
    for i in 0..5 {
        match coordinator
            .ingest_trigger(trigger(json!({"event": i})), RunMode::Inline)
            .await
            .unwrap()
        {
            Ingested::Started(s) => started.push(s),
            Ingested::Buffered { node_id, .. } => assert_eq!(node_id, "ingest"),
        }
    }
    assert_eq!(started.len(), 1);

    let executions = coordinator.list_executions(Some("wf"), None, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.trigger_type, "batch");
    assert_eq!(execution.trigger_data.as_array().unwrap().len(), 5);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(scripted.calls("ingest"), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff() {
    let mut def = chain();
    def["retry"] = json!({"max_attempts": 5, "base_delay_ms": 10_000, "max_delay_ms": 60_000});
    let (coordinator, scripted) = setup(def).await;
    scripted.push("a", Err(NodeError::Transient("connection reset".into())));

    let runner = coordinator.clone();
    let handle = tokio::spawn(async move { runner.start_execution(trigger(json!({}))).await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let running = coordinator
        .list_executions(Some("wf"), Some(ExecutionStatus::Running), 10)
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    let id = running[0].id;

    let cancelled = coordinator.cancel_execution(id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    handle.await.unwrap().unwrap();

    let view = coordinator.get_execution(id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Cancelled);
    assert!(!view.checkpoints.last().unwrap().can_resume);
    assert_eq!(scripted.calls("a"), 1);
    assert_eq!(scripted.calls("b"), 0);
    assert!(matches!(
        coordinator.resume_execution(id).await,
        Err(EngineError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn corrupted_checkpoint_fails_without_running() {
    let (coordinator, scripted) = setup(chain()).await;
    let started = coordinator.create_execution(trigger(json!({}))).await.unwrap();
    let id = started.execution_id;
    coordinator.store().tamper_checkpoint(&id, |checkpoint| {
        checkpoint
            .state
            .variables
            .insert("injected".into(), json!(true));
    });

    for _ in 0..2 {
        let err = coordinator.resume_execution(id).await.unwrap_err();
        assert!(matches!(err, EngineError::CheckpointCorruption { .. }));
    }
    let view = coordinator.get_execution(id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Failed);
    assert!(view.dead_letter.is_none());
    assert_eq!(scripted.calls("a"), 0);
}

#[tokio::test]
async fn routing_skips_unchosen_branch() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "route",
        "nodes": [
            {"id": "a", "type": "a"},
            {"id": "b", "type": "b", "depends_on": ["a"]},
            {"id": "c", "type": "c", "depends_on": ["a"]},
            {"id": "d", "type": "d", "depends_on": ["b", "c"], "join": "any"}
        ]
    }))
    .await;
    scripted.push(
        "a",
        Ok(NodeOutput::new(json!({"tier": "gold"})).with_branches(vec!["b".into()])),
    );

    let started = coordinator.start_execution(trigger(json!({}))).await.unwrap();
    let view = coordinator.get_execution(started.execution_id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Completed);
    assert_eq!(scripted.calls("c"), 0);
    assert_eq!(scripted.calls("d"), 1);
    let skipped: Vec<&str> = view
        .nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Skipped)
        .map(|n| n.node_id.as_str())
        .collect();
    assert_eq!(skipped, vec!["c"]);
}

#[tokio::test]
async fn permanent_failure_is_not_dead_lettered() {
    let (coordinator, scripted) = setup(chain()).await;
    scripted.push("b", Err(NodeError::Permanent("400 invalid email".into())));

    let started = coordinator.start_execution(trigger(json!({}))).await.unwrap();
    let view = coordinator.get_execution(started.execution_id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Failed);
    assert!(view.dead_letter.is_none());
    assert_eq!(scripted.calls("b"), 1);
    assert_eq!(scripted.calls("c"), 0);
}

#[tokio::test]
async fn contract_violation_never_reaches_executor() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "signup",
        "nodes": [{
            "id": "a", "type": "a",
            "input_contract": {"required": ["email"], "properties": {"email": "string"}}
        }]
    }))
    .await;

    let started = coordinator.start_execution(trigger(json!({"name": "x"}))).await.unwrap();
    let view = coordinator.get_execution(started.execution_id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Failed);
    assert!(view.execution.error.unwrap().contains("input contract violated"));
    assert_eq!(scripted.calls("a"), 0);
}

#[tokio::test]
async fn key_held_elsewhere_parks_execution() {
    let (coordinator, scripted) = setup(json!({
        "id": "wf",
        "name": "invoice",
        "idempotency": {"in_flight": {"mode": "fail_fast"}},
        "nodes": [{"id": "bill", "type": "bill", "side_effecting": true}]
    }))
    .await;
    let started = coordinator.create_execution(trigger(json!({}))).await.unwrap();
    let id = started.execution_id;
    let now = chrono::Utc::now();
    coordinator
        .store()
        .insert_idempotency_key(&IdempotencyEntry {
            workflow_id: "wf".into(),
            key: format!("node:{id}:bill"),
            execution_id: Uuid::now_v7(),
            status: IdempotencyStatus::InProgress,
            result: None,
            lease_expires_at: Some(now + chrono::TimeDelta::minutes(5)),
            expires_at: now + chrono::TimeDelta::minutes(5),
            created_at: now,
            version: 0,
        })
        .await
        .unwrap();

    let execution = coordinator.run_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Waiting);
    assert!(execution.error.unwrap().contains("held by another"));
    assert_eq!(scripted.calls("bill"), 0);
}

#[tokio::test]
async fn cancel_pending_execution_seals_checkpoints() {
    let (coordinator, scripted) = setup(chain()).await;
    let started = coordinator.create_execution(trigger(json!({}))).await.unwrap();

    coordinator.cancel_execution(started.execution_id).await.unwrap();
    let again = coordinator.cancel_execution(started.execution_id).await.unwrap();
    assert_eq!(again.status, ExecutionStatus::Cancelled);

    let execution = coordinator.run_execution(started.execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    let view = coordinator.get_execution(started.execution_id).await.unwrap();
    assert_eq!(view.checkpoints.len(), 2);
    assert!(!view.checkpoints[1].can_resume);
    assert_eq!(scripted.calls("a"), 0);
}

#[tokio::test(start_paused = true)]
async fn live_lease_blocks_second_instance() {
    let store = MemoryStore::new();
    let slow = Slow::new(Duration::from_secs(10));
    let a = instance(&store, slow.clone(), EngineConfig::default());
    let b = instance(&store, slow.clone(), EngineConfig::default());
    a.register_workflow(slow_send()).await.unwrap();

    let id = a.create_execution(trigger(json!({}))).await.unwrap().execution_id;
    let driver = tokio::spawn({
        let a = a.clone();
        async move { a.run_execution(id).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let refused = b.resume_execution(id).await.unwrap_err();
    assert!(matches!(refused, EngineError::InvalidTransition(_)));
    assert_eq!(Worker::new(b.clone()).recover_stalled().await.unwrap(), 0);

    let execution = driver.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.owner, Some(a.instance_id()));
    assert!(execution.lease_expires_at.is_none());
    assert_eq!(slow.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn lease_is_renewed_while_a_slow_node_runs() {
    let store = MemoryStore::new();
    let slow = Slow::new(Duration::from_secs(120));
    let mut config = EngineConfig::default();
    config.engine.stall_threshold_secs = 30;
    let a = instance(&store, slow.clone(), config.clone());
    let b = instance(&store, slow.clone(), config);
    a.register_workflow(slow_send()).await.unwrap();

    let id = a.create_execution(trigger(json!({}))).await.unwrap().execution_id;
    let driver = tokio::spawn({
        let a = a.clone();
        async move { a.run_execution(id).await }
    });

    // Well past the lease length, but the driver keeps renewing it.
    tokio::time::sleep(Duration::from_secs(90)).await;
    let worker = Worker::new(b.clone());
    assert_eq!(worker.recover_stalled().await.unwrap(), 0);
    assert!(b.resume_execution(id).await.is_err());

    let execution = driver.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(slow.calls(), 1);
}

#[tokio::test]
async fn lapsed_lease_is_recovered_by_another_instance() {
    let (a, scripted) = setup(chain()).await;
    let b = instance(a.store(), scripted.clone(), EngineConfig::default());
    let id = a.create_execution(trigger(json!({}))).await.unwrap().execution_id;

    // A driver that crashed right after claiming.
    let mut crashed = a.store().get_execution(&id).await.unwrap().unwrap();
    crashed.status = ExecutionStatus::Running;
    crashed.owner = Some(Uuid::now_v7());
    crashed.lease_expires_at = Some(b.clock().now() - chrono::TimeDelta::seconds(1));
    crashed.version += 1;
    assert!(a.store().update_execution(&crashed, crashed.version - 1).await.unwrap());

    assert_eq!(Worker::new(b.clone()).recover_stalled().await.unwrap(), 1);
    let execution = b.get_execution(id).await.unwrap().execution;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.owner, Some(b.instance_id()));
    assert_eq!(scripted.calls("c"), 1);
}

#[tokio::test(start_paused = true)]
async fn driver_stops_after_losing_its_lease() {
    let store = MemoryStore::new();
    let slow = Slow::new(Duration::from_secs(60));
    let mut config = EngineConfig::default();
    config.engine.stall_threshold_secs = 30;
    let a = instance(&store, slow.clone(), config);
    a.register_workflow(slow_send()).await.unwrap();

    let id = a.create_execution(trigger(json!({}))).await.unwrap().execution_id;
    let driver = tokio::spawn({
        let a = a.clone();
        async move { a.run_execution(id).await }
    });
    tokio::time::sleep(Duration::from_secs(5)).await;

    // Another instance claimed it, e.g. after a network partition.
    let rival = Uuid::now_v7();
    let mut taken = store.get_execution(&id).await.unwrap().unwrap();
    taken.owner = Some(rival);
    taken.version += 1;
    assert!(store.update_execution(&taken, taken.version - 1).await.unwrap());

    let execution = driver.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.owner, Some(rival));
    let view = a.get_execution(id).await.unwrap();
    assert!(view.checkpoints.iter().all(|c| c.can_resume));
    assert_eq!(slow.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_from_another_instance_stops_rate_limited_node() {
    let (a, scripted) = setup(json!({
        "id": "wf",
        "name": "sync",
        "rate_limits": {"crm": {"rate_per_second": 0.1, "burst_size": 1}},
        "nodes": [
            {"id": "a", "type": "a", "rate_limit_key": "crm"},
            {"id": "b", "type": "b", "rate_limit_key": "crm", "depends_on": ["a"]}
        ]
    }))
    .await;
    let b = instance(a.store(), scripted.clone(), EngineConfig::default());

    let id = a.create_execution(trigger(json!({}))).await.unwrap().execution_id;
    let driver = tokio::spawn({
        let a = a.clone();
        async move { a.run_execution(id).await }
    });
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(scripted.calls("a"), 1);

    let cancelled = b.cancel_execution(id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    let execution = driver.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(scripted.calls("b"), 0);
    let view = a.get_execution(id).await.unwrap();
    assert!(view.nodes.iter().all(|n| n.node_id != "b"));
    assert!(!view.checkpoints.last().unwrap().can_resume);
}

#[tokio::test(start_paused = true)]
async fn storage_outage_in_a_node_is_dead_lettered() {
    let (coordinator, scripted) = setup(chain()).await;
    coordinator.store().fail_breaker_reads(1);

    let started = coordinator.start_execution(trigger(json!({}))).await.unwrap();
    let view = coordinator.get_execution(started.execution_id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Failed);
    assert!(view.execution.error.unwrap().contains("connection"));
    assert_eq!(view.dead_letter.unwrap().status, DeadLetterStatus::Pending);
    assert_eq!(scripted.calls("a"), 0);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(coordinator.process_dead_letters().await.unwrap(), 1);
    assert_eq!(
        status(&coordinator, started.execution_id).await,
        ExecutionStatus::Completed
    );
    assert_eq!(scripted.calls("a"), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_trigger_waits_for_first_execution_row() {
    let (coordinator, _) = setup(chain()).await;
    let now = coordinator.clock().now();
    let holder = Uuid::now_v7();
    coordinator
        .store()
        .insert_idempotency_key(&IdempotencyEntry {
            workflow_id: "wf".into(),
            key: "trigger:evt-9".into(),
            execution_id: holder,
            status: IdempotencyStatus::InProgress,
            result: None,
            lease_expires_at: Some(now + chrono::TimeDelta::minutes(5)),
            expires_at: now + chrono::TimeDelta::minutes(5),
            created_at: now,
            version: 0,
        })
        .await
        .unwrap();

    // The holder never writes its row: the duplicate is told to retry.
    let request = trigger(json!({})).with_idempotency_key("evt-9");
    let err = coordinator.create_execution(request.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::IdempotencyConflict { .. }));

    // Once the holder's row exists the duplicate resolves to it.
    let other = coordinator.create_execution(trigger(json!({}))).await.unwrap().execution_id;
    let mut row = coordinator.store().get_execution(&other).await.unwrap().unwrap();
    row.id = holder;
    coordinator.store().create_execution(&row).await.unwrap();

    let started = coordinator.create_execution(request).await.unwrap();
    assert!(started.deduplicated);
    assert_eq!(started.execution_id, holder);
}
