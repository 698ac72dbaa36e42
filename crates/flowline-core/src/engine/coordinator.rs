//! Execution coordinator.
//!
//! Owns the lifecycle of every execution: trigger intake (with dedupe and
//! batching), the drive loop that dispatches ready nodes concurrently,
//! checkpointing, and settlement into completed, waiting, failed or
//! cancelled. A run can be resumed from its latest checkpoint on any
//! process; node records are reconciled so that work whose outcome is
//! unknown is only repeated when the node is safe to repeat.
//!
//! # Drive loop
//!
//! 1. Refuse executions another instance holds a live lease on.
//! 2. Load the latest checkpoint and verify its checksum.
//! 3. Claim the execution: status running, owner and lease set, written
//!    over the version that was read.
//! 4. Reconcile node records written after that checkpoint.
//! 5. Repeatedly advance the graph, spawn ready nodes on a `JoinSet`, and
//!    fold their results into the checkpoint state. The lease is renewed
//!    on a timer while nodes are in flight; losing it stops the loop.
//! 6. Settle: complete, park on a deferral, fail (dead-lettering retryable
//!    failures), or acknowledge cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowline_types::config::EngineConfig;
use flowline_types::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use flowline_types::environment::Environment;
use flowline_types::event::EngineEvent;
use flowline_types::execution::{
    Checkpoint, CheckpointState, Execution, ExecutionStatus, NodeExecution, NodeOutput, NodeStatus,
    Snapshot,
};
use flowline_types::resilience::{CircuitBreakerRecord, CircuitState};
use flowline_types::workflow::{CheckpointPolicy, NodeDefinition, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{Clock, seconds};
use crate::error::EngineError;
use crate::event::EventBus;
use crate::executor::ExecutorRegistry;
use crate::repository::EngineStore;
use crate::resilience::{Acquisition, CircuitBreakers, IdempotencyRegistry, RateLimiters};
use crate::workflow::definition::validate_definition;
use crate::workflow::graph::WorkflowGraph;

use super::batch::{BatchWindows, Flush};
use super::checkpoint::CheckpointManager;
use super::dead_letter::DeadLetterQueue;
use super::dispatch;
use super::environment::{EnvironmentResolver, ResolvedEnvironment};
use super::tracker::NodeTracker;

const MAX_CAS_ATTEMPTS: u32 = 32;
/// How long a duplicate trigger waits for the first holder's execution row.
const TRIGGER_DEDUP_WAIT: Duration = Duration::from_secs(2);
const TRIGGER_DEDUP_POLL: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// An incoming trigger event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub workflow_id: String,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_data: Value,
    /// Repeated triggers with the same key map to the first execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Defaults to the engine's configured environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

fn default_trigger_type() -> String {
    "manual".to_string()
}

impl TriggerRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        trigger_type: impl Into<String>,
        trigger_data: Value,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            trigger_type: trigger_type.into(),
            trigger_data,
            idempotency_key: None,
            environment: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn in_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Started {
    pub execution_id: Uuid,
    /// The trigger repeated an earlier idempotency key; nothing new was created.
    pub deduplicated: bool,
}

/// Whether a started execution is driven before the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Inline,
    Background,
}

/// Result of trigger intake.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Ingested {
    Started(Started),
    /// Held in a batch window until it fills or its deadline passes.
    Buffered { workflow_id: String, node_id: String },
}

/// Everything recorded about one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    pub execution: Execution,
    pub nodes: Vec<NodeExecution>,
    pub checkpoints: Vec<Checkpoint>,
    pub snapshots: Vec<Snapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetterEntry>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Per-run context shared with dispatch tasks.
pub(super) struct RunContext {
    pub(super) execution_id: Uuid,
    pub(super) workflow: WorkflowDefinition,
    pub(super) graph: WorkflowGraph,
    pub(super) environment: ResolvedEnvironment,
    pub(super) trigger_data: Value,
    pub(super) token: CancellationToken,
}

pub(super) struct Inner<S> {
    pub(super) store: S,
    pub(super) executors: ExecutorRegistry,
    pub(super) breakers: CircuitBreakers<S>,
    pub(super) limiters: RateLimiters<S>,
    pub(super) idempotency: IdempotencyRegistry<S>,
    pub(super) checkpoints: CheckpointManager<S>,
    pub(super) tracker: NodeTracker<S>,
    pub(super) environments: EnvironmentResolver<S>,
    pub(super) dead_letters: DeadLetterQueue<S>,
    pub(super) batches: BatchWindows<S>,
    pub(super) events: EventBus,
    pub(super) clock: Clock,
    pub(super) config: EngineConfig,
    /// Identity written into the lease of every execution this instance drives.
    instance: Uuid,
    lease: TimeDelta,
    /// Cancellation tokens of executions driven by this process.
    running: DashMap<Uuid, CancellationToken>,
}

/// Drives workflow executions against an [`EngineStore`].
///
/// Cheap to clone; clones share breakers, registries and the set of
/// executions this process is driving.
pub struct Coordinator<S> {
    pub(super) inner: Arc<Inner<S>>,
}

impl<S> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// How a drive loop ended.
enum Outcome {
    Completed,
    Parked(EngineError),
    Failed(EngineError),
    Cancelled,
    /// Another instance took the lease; its driver settles the execution.
    Superseded,
}

impl<S: EngineStore> Coordinator<S> {
    pub fn new(store: S, executors: ExecutorRegistry, config: EngineConfig) -> Self {
        Self::with_clock(store, executors, config, EventBus::default(), Clock::new())
    }

    pub fn with_clock(
        store: S,
        executors: ExecutorRegistry,
        config: EngineConfig,
        events: EventBus,
        clock: Clock,
    ) -> Self {
        let probe_lease = config.engine.probe_lease_seconds;
        let key_lease = config.engine.in_progress_lease_seconds;
        let lease = seconds(config.engine.stall_threshold_secs).min(TimeDelta::days(365));
        let inner = Inner {
            breakers: CircuitBreakers::new(store.clone(), clock, events.clone(), probe_lease),
            limiters: RateLimiters::new(store.clone(), clock),
            idempotency: IdempotencyRegistry::new(store.clone(), clock, key_lease),
            checkpoints: CheckpointManager::new(store.clone(), clock),
            tracker: NodeTracker::new(store.clone(), clock),
            environments: EnvironmentResolver::new(store.clone(), clock),
            dead_letters: DeadLetterQueue::new(
                store.clone(),
                clock,
                events.clone(),
                config.dead_letter,
            ),
            batches: BatchWindows::new(store.clone(), clock, events.clone()),
            store,
            executors,
            events,
            clock,
            config,
            instance: Uuid::now_v7(),
            lease,
            running: DashMap::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    pub fn environments(&self) -> &EnvironmentResolver<S> {
        &self.inner.environments
    }

    /// Whether this process is currently driving the execution.
    pub fn is_running(&self, execution_id: Uuid) -> bool {
        self.inner.running.contains_key(&execution_id)
    }

    /// Owner id this coordinator writes into execution leases.
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    pub async fn register_workflow(
        &self,
        def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        validate_definition(&def)?;
        self.inner.store.save_workflow(&def).await?;
        tracing::info!(
            workflow_id = def.id.as_str(),
            version = def.version,
            nodes = def.nodes.len(),
            "workflow registered"
        );
        Ok(def)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition, EngineError> {
        self.inner
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        Ok(self.inner.store.list_workflows().await?)
    }

    async fn resolve_environment(
        &self,
        workflow_id: &str,
        name: Option<&str>,
    ) -> Result<ResolvedEnvironment, EngineError> {
        let environment = parse_environment(
            name.unwrap_or(&self.inner.config.engine.default_environment),
        )?;
        self.inner.environments.resolve(workflow_id, environment).await
    }

    // -----------------------------------------------------------------------
    // Trigger intake
    // -----------------------------------------------------------------------

    /// Create a pending execution and its start checkpoint without running it.
    pub async fn create_execution(&self, request: TriggerRequest) -> Result<Started, EngineError> {
        let workflow = self.get_workflow(&request.workflow_id).await?;
        let environment = self
            .resolve_environment(&workflow.id, request.environment.as_deref())
            .await?;

        let Some(key) = request.idempotency_key.as_deref() else {
            let execution_id = self
                .insert_execution(Uuid::now_v7(), &request, &environment)
                .await?;
            return Ok(Started {
                execution_id,
                deduplicated: false,
            });
        };

        let trigger_key = format!("trigger:{key}");
        let execution_id = Uuid::now_v7();
        match self
            .inner
            .idempotency
            .acquire(&workflow.id, &trigger_key, execution_id)
            .await?
        {
            Acquisition::Proceed => {}
            Acquisition::Completed {
                execution_id: existing,
                ..
            } => return Ok(duplicate(&workflow.id, key, existing)),
            Acquisition::InProgress {
                execution_id: existing,
                ..
            } => {
                // The first holder may not have written its execution yet.
                if self.await_execution_row(existing).await? {
                    return Ok(duplicate(&workflow.id, key, existing));
                }
                tracing::warn!(
                    workflow_id = workflow.id.as_str(),
                    idempotency_key = key,
                    holder = %existing,
                    "duplicate trigger while the first is still being created"
                );
                return Err(EngineError::IdempotencyConflict { key: trigger_key });
            }
        }

        match self
            .insert_execution(execution_id, &request, &environment)
            .await
        {
            Ok(execution_id) => {
                let ttl = workflow
                    .idempotency
                    .unwrap_or(self.inner.config.idempotency)
                    .ttl_seconds;
                self.inner
                    .idempotency
                    .complete(
                        &workflow.id,
                        &trigger_key,
                        execution_id,
                        json!({ "execution_id": execution_id }),
                        ttl,
                    )
                    .await?;
                Ok(Started {
                    execution_id,
                    deduplicated: false,
                })
            }
            Err(e) => {
                self.inner
                    .idempotency
                    .release(&workflow.id, &trigger_key, execution_id)
                    .await?;
                Err(e)
            }
        }
    }

    /// Poll briefly for an execution row. `false` if it never appeared.
    async fn await_execution_row(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let deadline = Instant::now() + TRIGGER_DEDUP_WAIT;
        loop {
            if self.inner.store.get_execution(&execution_id).await?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(TRIGGER_DEDUP_POLL).await;
        }
    }

    async fn insert_execution(
        &self,
        execution_id: Uuid,
        request: &TriggerRequest,
        environment: &ResolvedEnvironment,
    ) -> Result<Uuid, EngineError> {
        let now = self.inner.clock.now();
        let execution = Execution {
            id: execution_id,
            workflow_id: request.workflow_id.clone(),
            trigger_type: request.trigger_type.clone(),
            trigger_data: request.trigger_data.clone(),
            status: ExecutionStatus::Pending,
            environment: environment.environment.to_string(),
            idempotency_key: request.idempotency_key.clone(),
            error: None,
            next_check_at: None,
            owner: None,
            lease_expires_at: None,
            version: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.inner.store.create_execution(&execution).await?;

        let state = CheckpointState {
            variables: environment.variables.clone(),
            ..CheckpointState::default()
        };
        self.inner
            .checkpoints
            .write(execution_id, None, &state, true)
            .await?;

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = request.workflow_id.as_str(),
            trigger_type = request.trigger_type.as_str(),
            environment = %environment.environment,
            "execution created"
        );
        Ok(execution_id)
    }

    /// Create an execution and drive it to a settled state before returning.
    pub async fn start_execution(&self, request: TriggerRequest) -> Result<Started, EngineError> {
        let started = self.create_execution(request).await?;
        if !started.deduplicated {
            self.run_execution(started.execution_id).await?;
        }
        Ok(started)
    }

    /// Create an execution and drive it on a background task.
    pub async fn submit_execution(&self, request: TriggerRequest) -> Result<Started, EngineError> {
        let started = self.create_execution(request).await?;
        if !started.deduplicated {
            self.spawn_run(started.execution_id);
        }
        Ok(started)
    }

    fn spawn_run(&self, execution_id: Uuid) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_execution(execution_id).await {
                tracing::error!(execution_id = %execution_id, error = %e, "background execution failed");
            }
        });
    }

    async fn launch(&self, request: TriggerRequest, mode: RunMode) -> Result<Started, EngineError> {
        match mode {
            RunMode::Inline => self.start_execution(request).await,
            RunMode::Background => self.submit_execution(request).await,
        }
    }

    /// Accept a trigger event, routing it through the workflow's batch window
    /// when it has one.
    pub async fn ingest_trigger(
        &self,
        request: TriggerRequest,
        mode: RunMode,
    ) -> Result<Ingested, EngineError> {
        let workflow = self.get_workflow(&request.workflow_id).await?;
        let Some(policy) = &workflow.batching else {
            return self.launch(request, mode).await.map(Ingested::Started);
        };

        let flushed = self
            .inner
            .batches
            .accumulate(&workflow.id, policy, request.trigger_data)
            .await?;
        match flushed {
            Some(flush) => self
                .launch(flush_request(flush, request.environment), mode)
                .await
                .map(Ingested::Started),
            None => Ok(Ingested::Buffered {
                workflow_id: workflow.id.clone(),
                node_id: policy.node_id.clone(),
            }),
        }
    }

    /// Flush batch windows whose deadline passed. Returns the number of
    /// executions started.
    pub async fn sweep_batches(&self, mode: RunMode) -> Result<usize, EngineError> {
        let limit = self.inner.config.engine.sweep_batch_size;
        let mut started = 0;
        for flush in self.inner.batches.sweep_expired(limit).await? {
            let (workflow_id, count) = (flush.workflow_id.clone(), flush.events.len());
            match self.launch(flush_request(flush, None), mode).await {
                Ok(_) => started += 1,
                Err(e) => tracing::error!(
                    workflow_id = workflow_id.as_str(),
                    events = count,
                    error = %e,
                    "failed to start execution for flushed batch"
                ),
            }
        }
        Ok(started)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Drive an execution until it settles. A call for an execution this
    /// process is already driving returns its current record.
    pub async fn run_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let token = CancellationToken::new();
        let claimed = match self.inner.running.entry(execution_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                true
            }
        };
        if !claimed {
            tracing::debug!(execution_id = %execution_id, "execution already driven by this process");
            return self.load_execution(execution_id).await;
        }

        let result = self.drive(execution_id, token).await;
        self.inner.running.remove(&execution_id);
        result
    }

    /// Continue a pending, waiting, stalled or failed execution from its
    /// latest checkpoint. A running execution is only taken over once its
    /// driver's lease has lapsed.
    pub async fn resume_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let execution = self.load_execution(execution_id).await?;
        if !execution.status.can_resume() {
            return Err(EngineError::InvalidTransition(format!(
                "execution {execution_id} is {} and cannot be resumed",
                execution.status
            )));
        }
        tracing::info!(execution_id = %execution_id, status = %execution.status, "resuming execution");
        self.run_execution(execution_id).await
    }

    async fn drive(
        &self,
        execution_id: Uuid,
        token: CancellationToken,
    ) -> Result<Execution, EngineError> {
        let mut execution = self.load_execution(execution_id).await?;
        if !execution.status.can_resume() {
            return Ok(execution);
        }
        if execution.is_leased(self.inner.clock.now())
            && execution.owner != Some(self.inner.instance)
        {
            return Err(EngineError::InvalidTransition(format!(
                "execution {execution_id} is being driven by {} until {}",
                execution.owner.map(|o| o.to_string()).unwrap_or_default(),
                execution
                    .lease_expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default()
            )));
        }
        let workflow = self.get_workflow(&execution.workflow_id).await?;
        let graph = WorkflowGraph::build(&workflow)?;
        let environment = self
            .resolve_environment(&workflow.id, Some(&execution.environment))
            .await?;

        let checkpoint = match self.inner.checkpoints.latest(execution_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e @ EngineError::CheckpointCorruption { .. }) => {
                self.fail_corrupted(execution, &e).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let mut state = match checkpoint {
            Some(checkpoint) if !checkpoint.can_resume => {
                return Err(EngineError::InvalidTransition(format!(
                    "latest checkpoint of execution {execution_id} is final"
                )));
            }
            Some(checkpoint) => checkpoint.state,
            None => CheckpointState {
                variables: environment.variables.clone(),
                ..CheckpointState::default()
            },
        };
        retain_succeeded(&mut state);

        let previous = execution.status;
        let now = self.inner.clock.now();
        execution.status = ExecutionStatus::Running;
        execution.error = None;
        execution.next_check_at = None;
        execution.completed_at = None;
        execution.updated_at = now;
        execution.owner = Some(self.inner.instance);
        execution.lease_expires_at = Some(now + self.inner.lease);
        if !self.commit(&mut execution).await? {
            tracing::info!(execution_id = %execution_id, "execution claimed elsewhere, not driving");
            return self.load_execution(execution_id).await;
        }
        if previous == ExecutionStatus::Pending {
            self.inner.events.publish(EngineEvent::ExecutionStarted {
                execution_id,
                workflow_id: workflow.id.clone(),
            });
        }
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = workflow.id.as_str(),
            from = %previous,
            completed_nodes = state.node_status.len(),
            "execution running"
        );

        let ctx = Arc::new(RunContext {
            execution_id,
            trigger_data: execution.trigger_data.clone(),
            workflow,
            graph,
            environment,
            token,
        });

        let reconciled = self.reconcile(&ctx, &mut state).await?;
        let outcome = self
            .dispatch_loop(&ctx, &mut execution, &mut state, reconciled)
            .await?;
        self.settle(&ctx, execution, state, outcome).await
    }

    /// Fold node records written after the checkpoint into `state`.
    ///
    /// Succeeded records are adopted. Attempts left running or pending by a
    /// crashed process are closed as failed; the node is dispatched again if
    /// it is repeatable, otherwise the execution halts. A guarded node's
    /// in-progress key is not released: the new dispatch waits for its lease
    /// to lapse, so the side effect cannot overlap the lost attempt.
    async fn reconcile(
        &self,
        ctx: &RunContext,
        state: &mut CheckpointState,
    ) -> Result<Reconciled, EngineError> {
        let records = self.inner.tracker.list(ctx.execution_id).await?;
        let mut latest: HashMap<&str, &NodeExecution> = HashMap::new();
        for record in &records {
            latest.insert(record.node_id.as_str(), record);
        }

        let mut reconciled = Reconciled::default();
        for (node_id, record) in latest {
            if state.node_status.contains_key(node_id) {
                continue;
            }
            let Some(node) = ctx.graph.node(node_id) else {
                continue;
            };
            match record.status {
                NodeStatus::Succeeded => {
                    state
                        .node_status
                        .insert(node_id.to_string(), NodeStatus::Succeeded);
                    state.node_outputs.insert(
                        node_id.to_string(),
                        record.output.clone().unwrap_or(Value::Null),
                    );
                    if let Some(branches) = &record.branches {
                        state.routes.insert(node_id.to_string(), branches.clone());
                    }
                    tracing::debug!(execution_id = %ctx.execution_id, node_id, "adopted recorded node result");
                }
                NodeStatus::Running | NodeStatus::Pending => {
                    self.inner
                        .tracker
                        .fail(record.clone(), "attempt interrupted")
                        .await?;
                    if node.is_repeatable() {
                        tracing::info!(
                            execution_id = %ctx.execution_id,
                            node_id,
                            attempt = record.attempt,
                            guarded = node.is_guarded(),
                            "interrupted attempt will be dispatched again"
                        );
                    } else {
                        tracing::warn!(
                            execution_id = %ctx.execution_id,
                            node_id,
                            attempt = record.attempt,
                            "interrupted attempt of a node that is not safe to repeat"
                        );
                        state
                            .node_status
                            .insert(node_id.to_string(), NodeStatus::Failed);
                        if reconciled.halt.is_none() {
                            reconciled.halt = Some(EngineError::PermanentNode {
                                node_id: node_id.to_string(),
                                message: "attempt interrupted with unknown outcome; node is not safe to repeat"
                                    .to_string(),
                            });
                        }
                    }
                }
                NodeStatus::Skipped => {
                    reconciled.skips_recorded.insert(node_id.to_string());
                }
                NodeStatus::Failed => {}
            }
        }
        Ok(reconciled)
    }

    async fn dispatch_loop(
        &self,
        ctx: &Arc<RunContext>,
        execution: &mut Execution,
        state: &mut CheckpointState,
        reconciled: Reconciled,
    ) -> Result<Outcome, EngineError> {
        let Reconciled {
            mut halt,
            skips_recorded,
        } = reconciled;
        let mut in_flight: JoinSet<(String, Result<_, EngineError>)> = JoinSet::new();
        let mut completions: u32 = 0;
        let mut cancelled = false;
        let mut superseded = false;
        let period = renewal_period(self.inner.lease);
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if halt.is_none() && !cancelled && !superseded {
                let advance = ctx.graph.advance(state);
                for node_id in advance.skipped {
                    if !skips_recorded.contains(&node_id) {
                        if let Some(node) = ctx.graph.node(&node_id) {
                            self.inner.tracker.skip(ctx.execution_id, node).await?;
                        }
                    }
                    tracing::debug!(execution_id = %ctx.execution_id, node_id = node_id.as_str(), "node skipped");
                    self.inner.events.publish(EngineEvent::NodeSkipped {
                        execution_id: ctx.execution_id,
                        node_id,
                    });
                }
                for node_id in advance.ready {
                    let Some(node) = ctx.graph.node(&node_id).cloned() else {
                        continue;
                    };
                    let input = node_input(ctx, state, &node);
                    state.node_status.insert(node_id, NodeStatus::Running);
                    let (this, ctx) = (self.clone(), Arc::clone(ctx));
                    in_flight.spawn(async move {
                        let result = this.run_node(&ctx, &node, input).await;
                        (node.id, result)
                    });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = ctx.token.cancelled(), if !cancelled => {
                    tracing::info!(execution_id = %ctx.execution_id, "cancellation observed, draining in-flight nodes");
                    cancelled = true;
                }
                _ = renew.tick(), if !superseded => {
                    if !self.heartbeat(ctx, execution).await {
                        superseded = true;
                        ctx.token.cancel();
                    }
                }
                Some(joined) = in_flight.join_next() => {
                    let (node_id, result) = match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(execution_id = %ctx.execution_id, error = %e, "node task aborted");
                            halt = Some(EngineError::PermanentNode {
                                node_id: "<unknown>".to_string(),
                                message: format!("dispatch task aborted: {e}"),
                            });
                            continue;
                        }
                    };
                    match result {
                        Ok(output) => {
                            state.node_status.insert(node_id.clone(), NodeStatus::Succeeded);
                            state.node_outputs.insert(node_id.clone(), output.output);
                            if let Some(branches) = output.branches {
                                state.routes.insert(node_id.clone(), branches);
                            }
                            completions += 1;
                            if !superseded && should_checkpoint(ctx, &node_id, completions) {
                                self.inner
                                    .checkpoints
                                    .write(ctx.execution_id, Some(&node_id), state, true)
                                    .await?;
                            }
                        }
                        Err(EngineError::Cancelled(_)) => {
                            state.node_status.remove(&node_id);
                            cancelled = true;
                        }
                        Err(e) if e.is_deferral() => {
                            state.node_status.remove(&node_id);
                            if halt.is_none() {
                                halt = Some(e);
                            }
                        }
                        Err(e) => {
                            state.node_status.insert(node_id, NodeStatus::Failed);
                            if halt.as_ref().is_none_or(EngineError::is_deferral) {
                                halt = Some(e);
                            }
                        }
                    }
                }
            }
        }

        Ok(if superseded {
            Outcome::Superseded
        } else if cancelled {
            Outcome::Cancelled
        } else if let Some(e) = halt {
            if e.is_deferral() {
                Outcome::Parked(e)
            } else {
                Outcome::Failed(e)
            }
        } else if ctx.graph.is_complete(state) {
            Outcome::Completed
        } else {
            Outcome::Failed(EngineError::InvalidTransition(
                "no dispatchable nodes remain but the workflow is incomplete".to_string(),
            ))
        })
    }

    /// Renew the lease so stall recovery leaves the execution alone.
    /// Returns `false` once another instance owns the execution. A remote
    /// cancellation found here cancels the local token.
    async fn heartbeat(&self, ctx: &RunContext, execution: &mut Execution) -> bool {
        let now = self.inner.clock.now();
        execution.updated_at = now;
        execution.lease_expires_at = Some(now + self.inner.lease);
        match self.commit(execution).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(execution_id = %ctx.execution_id, error = %e, "lease renewal failed");
                return true;
            }
        }

        let current = match self.load_execution(ctx.execution_id).await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(execution_id = %ctx.execution_id, error = %e, "lease renewal failed");
                return true;
            }
        };
        if current.status == ExecutionStatus::Cancelled {
            ctx.token.cancel();
            return true;
        }
        if current.owner != Some(self.inner.instance) {
            tracing::warn!(
                execution_id = %ctx.execution_id,
                owner = ?current.owner,
                "lease lost to another instance, stopping"
            );
            return false;
        }
        execution.version = current.version;
        true
    }

    /// Write `execution` over the version it was read at. On success the
    /// caller's copy carries the new version.
    async fn commit(&self, execution: &mut Execution) -> Result<bool, EngineError> {
        let expected = execution.version;
        execution.version = expected + 1;
        let applied = self.inner.store.update_execution(execution, expected).await;
        if !matches!(applied, Ok(true)) {
            execution.version = expected;
        }
        Ok(applied?)
    }

    async fn settle(
        &self,
        ctx: &RunContext,
        mut execution: Execution,
        state: CheckpointState,
        outcome: Outcome,
    ) -> Result<Execution, EngineError> {
        let execution_id = ctx.execution_id;
        let now = self.inner.clock.now();
        execution.updated_at = now;
        execution.lease_expires_at = None;

        match outcome {
            Outcome::Cancelled => return self.seal_cancelled(execution_id, &state).await,
            Outcome::Superseded => return self.load_execution(execution_id).await,
            Outcome::Completed => {
                self.inner
                    .checkpoints
                    .write(execution_id, None, &state, false)
                    .await?;
                execution.status = ExecutionStatus::Completed;
                execution.completed_at = Some(now);
                if !self.commit(&mut execution).await? {
                    return self.lost_settlement(execution_id, &state).await;
                }
                self.inner.dead_letters.resolve(execution_id).await?;
                self.inner
                    .events
                    .publish(EngineEvent::ExecutionCompleted { execution_id });
                tracing::info!(
                    execution_id = %execution_id,
                    workflow_id = execution.workflow_id.as_str(),
                    duration_ms = (now - execution.started_at).num_milliseconds(),
                    "execution completed"
                );
            }
            Outcome::Parked(reason) => {
                let next_check_at = match &reason {
                    EngineError::CircuitOpen { retry_at, .. } => *retry_at,
                    _ => now + seconds(self.inner.config.engine.conflict_recheck_secs),
                };
                self.inner
                    .checkpoints
                    .write(execution_id, None, &state, true)
                    .await?;
                execution.status = ExecutionStatus::Waiting;
                execution.error = Some(reason.to_string());
                execution.next_check_at = Some(next_check_at);
                if !self.commit(&mut execution).await? {
                    return self.lost_settlement(execution_id, &state).await;
                }
                self.inner.events.publish(EngineEvent::ExecutionWaiting {
                    execution_id,
                    reason: reason.to_string(),
                    next_check_at,
                });
                tracing::warn!(
                    execution_id = %execution_id,
                    reason = %reason,
                    next_check_at = %next_check_at,
                    "execution parked"
                );
            }
            Outcome::Failed(error) => {
                let message = error.to_string();
                let checkpoint = self
                    .inner
                    .checkpoints
                    .write(execution_id, None, &state, true)
                    .await?;
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(message.clone());
                execution.completed_at = Some(now);
                if !self.commit(&mut execution).await? {
                    return self.lost_settlement(execution_id, &state).await;
                }
                self.inner.events.publish(EngineEvent::ExecutionFailed {
                    execution_id,
                    error: message.clone(),
                });
                if error.is_dead_letterable() {
                    tracing::warn!(execution_id = %execution_id, error = %message, "execution failed, dead-lettering");
                    self.inner
                        .dead_letters
                        .enqueue(&execution, &message, Some(checkpoint.sequence_number))
                        .await?;
                } else {
                    tracing::error!(execution_id = %execution_id, error = %message, "execution failed");
                    self.inner.dead_letters.abandon(execution_id, &message).await?;
                }
            }
        }
        Ok(execution)
    }

    /// The status moved underneath the drive loop, normally a cancellation.
    async fn lost_settlement(
        &self,
        execution_id: Uuid,
        state: &CheckpointState,
    ) -> Result<Execution, EngineError> {
        let current = self.load_execution(execution_id).await?;
        if current.status == ExecutionStatus::Cancelled {
            return self.seal_cancelled(execution_id, state).await;
        }
        tracing::warn!(
            execution_id = %execution_id,
            status = %current.status,
            "execution status changed during settlement"
        );
        Ok(current)
    }

    async fn seal_cancelled(
        &self,
        execution_id: Uuid,
        state: &CheckpointState,
    ) -> Result<Execution, EngineError> {
        self.inner
            .checkpoints
            .write(execution_id, None, state, false)
            .await?;
        tracing::info!(execution_id = %execution_id, "execution cancelled");
        self.load_execution(execution_id).await
    }

    /// Fail an execution whose checkpoint chain cannot be trusted. No new
    /// checkpoint is written and the execution is never redelivered.
    async fn fail_corrupted(
        &self,
        mut execution: Execution,
        error: &EngineError,
    ) -> Result<(), EngineError> {
        let now = self.inner.clock.now();
        let message = error.to_string();
        execution.status = ExecutionStatus::Failed;
        execution.error = Some(message.clone());
        execution.next_check_at = None;
        execution.lease_expires_at = None;
        execution.completed_at = Some(now);
        execution.updated_at = now;
        if self.commit(&mut execution).await? {
            self.inner.events.publish(EngineEvent::ExecutionFailed {
                execution_id: execution.id,
                error: message.clone(),
            });
        }
        self.inner.dead_letters.abandon(execution.id, &message).await
    }

    /// Run a single node of an execution outside the drive loop, using the
    /// latest checkpoint for its inputs. The attempt goes through the full
    /// resilience pipeline and is recorded, but the execution's state does
    /// not advance.
    pub async fn dispatch_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<NodeOutput, EngineError> {
        let execution = self.load_execution(execution_id).await?;
        let workflow = self.get_workflow(&execution.workflow_id).await?;
        let graph = WorkflowGraph::build(&workflow)?;
        let node = graph
            .node(node_id)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound {
                workflow_id: workflow.id.clone(),
                node_id: node_id.to_string(),
            })?;
        let environment = self
            .resolve_environment(&workflow.id, Some(&execution.environment))
            .await?;
        let state = self
            .inner
            .checkpoints
            .latest(execution_id)
            .await?
            .map(|c| c.state)
            .unwrap_or_default();
        let token = self
            .inner
            .running
            .get(&execution_id)
            .map(|t| t.value().clone())
            .unwrap_or_default();

        let ctx = RunContext {
            execution_id,
            trigger_data: execution.trigger_data,
            workflow,
            graph,
            environment,
            token,
        };
        let input = node_input(&ctx, &state, &node);
        self.run_node(&ctx, &node, input).await
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Mark an execution cancelled. A drive loop in this process stops
    /// dispatching at once; one elsewhere notices at its next store check.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut execution = self.load_execution(execution_id).await?;
            let previous = execution.status;
            if previous == ExecutionStatus::Cancelled {
                return Ok(execution);
            }
            if !previous.can_transition_to(ExecutionStatus::Cancelled) {
                return Err(EngineError::InvalidTransition(format!(
                    "execution {execution_id} is already {previous}"
                )));
            }

            let now = self.inner.clock.now();
            execution.status = ExecutionStatus::Cancelled;
            execution.next_check_at = None;
            execution.lease_expires_at = None;
            execution.completed_at = Some(now);
            execution.updated_at = now;
            if !self.commit(&mut execution).await? {
                continue;
            }

            let local = self.inner.running.get(&execution_id).map(|t| t.value().clone());
            match local {
                Some(token) => token.cancel(),
                None if previous != ExecutionStatus::Running => {
                    self.seal_idle(execution_id).await?;
                }
                None => {}
            }
            self.inner
                .dead_letters
                .abandon(execution_id, "execution cancelled")
                .await?;
            self.inner
                .events
                .publish(EngineEvent::ExecutionCancelled { execution_id });
            tracing::info!(execution_id = %execution_id, from = %previous, "execution cancellation requested");
            return Ok(execution);
        }
        Err(EngineError::Contention(format!("execution {execution_id}")))
    }

    /// Close the checkpoint chain of an execution nobody is driving.
    async fn seal_idle(&self, execution_id: Uuid) -> Result<(), EngineError> {
        match self.inner.checkpoints.latest(execution_id).await {
            Ok(latest) => {
                let state = latest.map(|c| c.state).unwrap_or_default();
                self.inner
                    .checkpoints
                    .write(execution_id, None, &state, false)
                    .await?;
            }
            Err(e @ EngineError::CheckpointCorruption { .. }) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "not sealing corrupt checkpoint chain");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    /// Redeliver every due dead letter. Returns how many were claimed.
    pub async fn process_dead_letters(&self) -> Result<usize, EngineError> {
        let limit = self.inner.config.engine.sweep_batch_size;
        let due = self.inner.dead_letters.due(limit).await?;
        let mut redeliveries = JoinSet::new();
        for entry in due {
            let this = self.clone();
            redeliveries.spawn(async move { this.redeliver(entry.execution_id, false).await });
        }

        let mut claimed = 0;
        while let Some(joined) = redeliveries.join_next().await {
            match joined {
                Ok(Ok(Some(_))) => claimed += 1,
                Ok(Ok(None)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "dead letter redelivery failed"),
                Err(e) => tracing::error!(error = %e, "dead letter redelivery task aborted"),
            }
        }
        Ok(claimed)
    }

    /// Operator replay: redeliver now, reviving an abandoned entry.
    pub async fn replay_dead_letter(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let entry = self
            .inner
            .dead_letters
            .get(execution_id)
            .await?
            .ok_or_else(|| {
                EngineError::InvalidRequest(format!("execution {execution_id} has no dead letter"))
            })?;
        self.redeliver(execution_id, true).await?.ok_or_else(|| {
            EngineError::InvalidTransition(format!(
                "dead letter of execution {execution_id} is {} and cannot be replayed",
                entry.status
            ))
        })
    }

    /// Claim a dead letter and resume its execution. `None` if nothing was
    /// claimed.
    async fn redeliver(
        &self,
        execution_id: Uuid,
        force: bool,
    ) -> Result<Option<Execution>, EngineError> {
        let execution = self.load_execution(execution_id).await?;
        match execution.status {
            ExecutionStatus::Completed => {
                self.inner.dead_letters.resolve(execution_id).await?;
                return Ok(None);
            }
            ExecutionStatus::Cancelled => {
                self.inner
                    .dead_letters
                    .abandon(execution_id, "execution cancelled")
                    .await?;
                return Ok(None);
            }
            _ => {}
        }

        let Some(entry) = self.inner.dead_letters.claim(execution_id, force).await? else {
            return Ok(None);
        };
        tracing::info!(
            execution_id = %execution_id,
            attempt = entry.attempt_count,
            max_attempts = entry.max_attempts,
            forced = force,
            "redelivering dead letter"
        );

        match self.resume_execution(execution_id).await {
            Ok(execution) => Ok(Some(execution)),
            Err(e @ EngineError::CheckpointCorruption { .. }) => Err(e),
            Err(e) => {
                let execution = self.load_execution(execution_id).await?;
                self.inner
                    .dead_letters
                    .enqueue(&execution, &e.to_string(), None)
                    .await?;
                Err(e)
            }
        }
    }

    /// Drop completed idempotency keys past their TTL.
    pub async fn purge_idempotency_keys(&self) -> Result<u64, EngineError> {
        self.inner.idempotency.purge_expired().await
    }

    pub async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, EngineError> {
        self.inner.dead_letters.list(status, limit).await
    }

    // -----------------------------------------------------------------------
    // Circuit breakers
    // -----------------------------------------------------------------------

    pub async fn get_circuit(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Option<CircuitBreakerRecord>, EngineError> {
        self.inner.breakers.get(workflow_id, node_id).await
    }

    pub async fn list_circuits(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<CircuitBreakerRecord>, EngineError> {
        Ok(self.inner.store.list_breakers(workflow_id).await?)
    }

    /// Operator override. The breaker is created with the node's effective
    /// policy in the default environment if it does not exist yet.
    pub async fn force_circuit_state(
        &self,
        workflow_id: &str,
        node_id: &str,
        state: CircuitState,
    ) -> Result<CircuitBreakerRecord, EngineError> {
        let workflow = self.get_workflow(workflow_id).await?;
        let node = workflow
            .node(node_id)
            .ok_or_else(|| EngineError::NodeNotFound {
                workflow_id: workflow_id.to_string(),
                node_id: node_id.to_string(),
            })?;
        let environment = self.resolve_environment(workflow_id, None).await?;
        let policy = dispatch::breaker_policy(&self.inner.config, &workflow, &environment, node);
        let record = self
            .inner
            .breakers
            .force_state(workflow_id, node_id, state, policy)
            .await?;
        tracing::warn!(workflow_id, node_id, state = %state, "circuit state forced by operator");
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub(super) async fn load_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.inner
            .store
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionView, EngineError> {
        let execution = self.load_execution(execution_id).await?;
        Ok(ExecutionView {
            execution,
            nodes: self.inner.tracker.list(execution_id).await?,
            checkpoints: self.inner.checkpoints.list(execution_id).await?,
            snapshots: self.inner.tracker.snapshots(execution_id).await?,
            dead_letter: self.inner.dead_letters.get(execution_id).await?,
        })
    }

    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> Result<Vec<Execution>, EngineError> {
        Ok(self
            .inner
            .store
            .list_executions(workflow_id, status, limit)
            .await?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Reconciled {
    /// Halt decided during reconciliation; nothing new is dispatched.
    halt: Option<EngineError>,
    /// Nodes that already have a skipped record.
    skips_recorded: HashSet<String>,
}

fn duplicate(workflow_id: &str, key: &str, existing: Uuid) -> Started {
    tracing::info!(
        workflow_id,
        idempotency_key = key,
        execution_id = %existing,
        "duplicate trigger, returning existing execution"
    );
    Started {
        execution_id: existing,
        deduplicated: true,
    }
}

/// Renew a third of the way into the lease, and never busier than 100ms.
fn renewal_period(lease: TimeDelta) -> Duration {
    (lease / 3)
        .to_std()
        .unwrap_or_default()
        .max(Duration::from_millis(100))
}

fn parse_environment(name: &str) -> Result<Environment, EngineError> {
    name.parse().map_err(EngineError::InvalidRequest)
}

/// Only succeeded nodes survive a resume; everything else is re-evaluated.
fn retain_succeeded(state: &mut CheckpointState) {
    state
        .node_status
        .retain(|_, status| *status == NodeStatus::Succeeded);
    let succeeded = &state.node_status;
    state.node_outputs.retain(|id, _| succeeded.contains_key(id));
    state.routes.retain(|id, _| succeeded.contains_key(id));
}

fn should_checkpoint(ctx: &RunContext, node_id: &str, completions: u32) -> bool {
    match ctx.workflow.checkpoint_policy {
        CheckpointPolicy::EveryNode => true,
        CheckpointPolicy::JoinPoints => ctx.graph.is_join(node_id),
        CheckpointPolicy::Interval { every } => completions % every.max(1) == 0,
    }
}

fn flush_request(flush: Flush, environment: Option<String>) -> TriggerRequest {
    TriggerRequest {
        idempotency_key: Some(format!("batch:{}:{}", flush.node_id, flush.generation)),
        workflow_id: flush.workflow_id,
        trigger_type: "batch".to_string(),
        trigger_data: Value::Array(flush.events),
        environment,
    }
}

/// Input handed to a node's executor.
///
/// `payload` is the trigger data for root nodes. Otherwise it is the output
/// of the node's live predecessors: a single predecessor's output as-is, or
/// several merged key by key (non-object outputs nest under the
/// predecessor's id).
pub(super) fn node_input(ctx: &RunContext, state: &CheckpointState, node: &NodeDefinition) -> Value {
    let predecessors: Vec<&str> = ctx.graph.predecessors(&node.id).collect();
    let mut upstream = Map::new();
    for pred in &predecessors {
        let live = state.node_status.get(*pred) == Some(&NodeStatus::Succeeded)
            && state
                .routes
                .get(*pred)
                .is_none_or(|branches| branches.contains(&node.id));
        if let (true, Some(output)) = (live, state.node_outputs.get(*pred)) {
            upstream.insert(pred.to_string(), output.clone());
        }
    }

    let payload = if predecessors.is_empty() {
        ctx.trigger_data.clone()
    } else if upstream.len() == 1 {
        upstream.values().next().cloned().unwrap_or(Value::Null)
    } else {
        let mut merged = Map::new();
        for (pred, output) in &upstream {
            match output {
                Value::Object(fields) => {
                    merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                other => {
                    merged.insert(pred.clone(), other.clone());
                }
            }
        }
        Value::Object(merged)
    };

    json!({
        "payload": payload,
        "upstream": upstream,
        "config": node.config,
        "variables": state.variables,
        "secrets": ctx.environment.secret_refs,
        "execution_id": ctx.execution_id,
        "workflow_id": ctx.workflow.id,
        "node_id": node.id,
    })
}
