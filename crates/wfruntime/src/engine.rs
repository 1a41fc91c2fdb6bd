use crate::config::EngineConfig;
use crate::graph::{successors, Route};
use crate::publisher::ProgressPublisher;
use crate::registry::ExecutorRegistry;
use crate::store::{DefinitionStore, ExecutionFilter, ExecutionHandle, ExecutionStore};
use chrono::Utc;
use futures::future::Future;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wfcore::{
    result_key, Bindings, CheckpointResponse, DefinitionError, EngineError, ErrorKind,
    ExecutionEvent, ExecutionId, ExecutionInstance, ExecutionSnapshot, ExecutionStatus,
    ExecutionSummary, HistoryKind, NodeContext, NodeError, NodeExecutor, NodeId, NodeMetrics,
    NodeOutcome, NodeResult, NodeSpec, NodeType, PendingCheckpoint, RetryPolicy, TimeoutAction,
    WorkflowDefinition,
};

type Result<T> = std::result::Result<T, EngineError>;

/// A snapshot plus every event applied after it.
pub struct ExecutionSubscription {
    pub snapshot: ExecutionSnapshot,
    pub events: UnboundedReceiverStream<ExecutionEvent>,
}

struct Inner {
    registry: ExecutorRegistry,
    definitions: Arc<dyn DefinitionStore>,
    executions: ExecutionStore,
    publisher: ProgressPublisher,
    config: EngineConfig,
}

/// Drives workflow executions. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<Inner>,
}

/// Result of one executor dispatch, before it is applied.
struct NodeRun {
    spec: NodeSpec,
    iteration: u32,
    outcome: std::result::Result<NodeOutcome, NodeError>,
    metrics: NodeMetrics,
}

impl ExecutionEngine {
    pub fn new(
        registry: ExecutorRegistry,
        definitions: Arc<dyn DefinitionStore>,
        config: EngineConfig,
    ) -> Self {
        let executions = ExecutionStore::new(config.archive_dir.clone());
        Self {
            inner: Arc::new(Inner {
                registry,
                definitions,
                executions,
                publisher: ProgressPublisher::new(),
                config,
            }),
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.inner.registry
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.inner.definitions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn publisher(&self) -> &ProgressPublisher {
        &self.inner.publisher
    }

    /// Reloads archived executions and re-arms checkpoint timers.
    pub async fn restore(&self) -> Result<usize> {
        let loaded = self
            .inner
            .executions
            .load_archive(self.inner.definitions.as_ref())
            .await?;
        let paused = ExecutionFilter {
            workflow_id: None,
            status: Some(ExecutionStatus::Paused),
        };
        for summary in self.inner.executions.list(&paused).await {
            let handle = self.inner.executions.get(summary.execution_id).await?;
            let state = handle.state.lock().await;
            self.schedule_expiry(&handle, &state);
        }
        tracing::info!(count = loaded, "Restored archived executions");
        Ok(loaded)
    }

    /// Validates the latest version of `workflow_id` and starts it.
    pub async fn start(&self, workflow_id: &str, inputs: Map<String, Value>) -> Result<ExecutionId> {
        let execution_id = self.create(workflow_id, None, inputs).await?;
        self.launch(execution_id).await?;
        Ok(execution_id)
    }

    pub async fn start_version(
        &self,
        workflow_id: &str,
        version: u32,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionId> {
        let execution_id = self.create(workflow_id, Some(version), inputs).await?;
        self.launch(execution_id).await?;
        Ok(execution_id)
    }

    /// Creates a pending execution without running anything.
    pub async fn create(
        &self,
        workflow_id: &str,
        version: Option<u32>,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionId> {
        let definition = self
            .inner
            .definitions
            .get(workflow_id, version)
            .await
            .ok_or_else(|| DefinitionError::NotFound(workflow_id.to_string()))?;
        self.create_from(definition, inputs).await
    }

    /// Creates a pending execution of a definition that need not be stored.
    pub async fn create_from(
        &self,
        definition: Arc<WorkflowDefinition>,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionId> {
        let graph = Arc::new(self.validate(&definition)?);

        let execution_id = Uuid::new_v4();
        let mut instance = ExecutionInstance::new(execution_id, &definition, inputs);
        let ceiling = self.ceiling_for(&definition, graph.start());
        instance.admit(graph.start(), ceiling)?;
        self.inner.executions.persist(&instance).await?;

        tracing::info!(
            %execution_id,
            workflow_id = %definition.id,
            version = definition.version,
            "Execution created"
        );
        let handle = ExecutionHandle::new(definition, graph, instance);
        self.inner.executions.insert(Arc::new(handle)).await;
        Ok(execution_id)
    }

    /// Checks the graph shape and every node's config.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<crate::graph::WorkflowGraph> {
        let graph = crate::graph::WorkflowGraph::build(definition)?;
        self.inner.registry.validate(definition)?;
        Ok(graph)
    }

    /// Moves a pending execution to running and spawns its driver.
    pub async fn launch(&self, execution_id: ExecutionId) -> Result<()> {
        let handle = self.inner.executions.get(execution_id).await?;
        {
            let mut state = handle.state.lock().await;
            if state.status != ExecutionStatus::Pending {
                return Err(state.invalid_state("launch"));
            }
            state.set_status(ExecutionStatus::Running)?;
            self.commit(&handle, &mut state).await;
        }
        self.spawn_driver(execution_id);
        Ok(())
    }

    fn spawn_driver(&self, execution_id: ExecutionId) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.drive(execution_id).await {
                Ok(status) => {
                    tracing::debug!(%execution_id, %status, "Driver finished");
                }
                Err(e) => {
                    tracing::error!(%execution_id, error = %e, "Driver stopped");
                }
            }
        });
    }

    /// Advances until the execution stops running.
    pub async fn drive(&self, execution_id: ExecutionId) -> Result<ExecutionStatus> {
        loop {
            match self.advance(execution_id).await {
                Ok(ExecutionStatus::Running) => continue,
                Ok(status) => return Ok(status),
                // Cancelled or paused by someone else between steps.
                Err(EngineError::InvalidState { status, .. })
                    if status.is_terminal() || status == ExecutionStatus::Paused =>
                {
                    return Ok(status)
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs one step: every frontier node is dispatched, results are applied
    /// in completion order, then the instance status is settled.
    pub async fn advance(&self, execution_id: ExecutionId) -> Result<ExecutionStatus> {
        let handle = self.inner.executions.get(execution_id).await?;
        let _step_guard = handle.advance_lock.lock().await;

        let (tasks, bindings) = {
            let mut state = handle.state.lock().await;
            match state.status {
                ExecutionStatus::Pending => state.set_status(ExecutionStatus::Running)?,
                ExecutionStatus::Running => {}
                _ => return Err(state.invalid_state("advance")),
            }
            let bindings = Bindings::build(&state, &handle.definition, &self.inner.config.globals);
            let waiting = handle.graph.held_back(&state.current_nodes);
            let mut tasks = Vec::with_capacity(state.current_nodes.len());
            for node_id in state.current_nodes.clone() {
                if waiting.contains(&node_id) {
                    tracing::debug!(%execution_id, node_id = %node_id, "Waiting for converging branches");
                    continue;
                }
                let spec = handle
                    .definition
                    .find_node(&node_id)
                    .ok_or_else(|| DefinitionError::NodeNotFound(node_id.clone()))?
                    .clone();
                let iteration = state.iteration_of(&node_id);
                state.mark_started(&node_id, spec.node_type, iteration);
                tracing::debug!(%execution_id, node_id = %node_id, iteration, "Dispatching node");
                tasks.push((spec, iteration));
            }
            self.commit(&handle, &mut state).await;
            (tasks, bindings)
        };

        let step = handle.cancellation.child_token();
        let max_parallel = self.inner.config.max_parallel_nodes.max(1);
        let mut runs = stream::iter(tasks.into_iter().map(|(spec, iteration)| {
            let ctx = NodeContext::new(execution_id, &spec, iteration, bindings.clone())
                .with_cancellation(step.child_token());
            let executor = self.inner.registry.get(spec.node_type).cloned();
            let timeout = spec
                .timeout_ms()
                .map(Duration::from_millis)
                .or_else(|| self.inner.config.node_timeout());
            async move {
                let started = Instant::now();
                let (outcome, attempts) = match executor {
                    Ok(executor) => {
                        invoke(executor.as_ref(), ctx, spec.retry_policy.as_ref(), timeout).await
                    }
                    Err(e) => (Err(NodeError::Configuration(e.to_string())), 0),
                };
                NodeRun {
                    spec,
                    iteration,
                    outcome,
                    metrics: NodeMetrics {
                        duration_ms: started.elapsed().as_millis() as u64,
                        attempts,
                        custom: Map::new(),
                    },
                }
            }
        }))
        .buffer_unordered(max_parallel);

        let mut pauses: Vec<PendingCheckpoint> = Vec::new();
        while let Some(run) = runs.next().await {
            let mut state = handle.state.lock().await;
            if state.is_terminal() {
                tracing::debug!(%execution_id, node_id = %run.spec.id, "Discarding result of finished execution");
                break;
            }
            let node_id = run.spec.id.clone();
            if let Err(e) = self.apply(&handle, &mut state, run, &step, &mut pauses) {
                tracing::error!(%execution_id, node_id = %node_id, error = %e, "Failed to apply node result");
                if let Err(err) = self.abort(&mut state, Some(&node_id), &e, &step) {
                    tracing::warn!(%execution_id, error = %err, "Failed to end execution");
                }
            }
            self.commit(&handle, &mut state).await;
            if state.is_terminal() {
                break;
            }
        }
        drop(runs);

        let mut state = handle.state.lock().await;
        if !state.is_terminal() {
            if !pauses.is_empty() {
                state.pause(pauses)?;
                tracing::info!(%execution_id, "Execution paused for human input");
                self.schedule_expiry(&handle, &state);
            } else if state.current_nodes.is_empty() {
                if state.reached_end {
                    state.finish(ExecutionStatus::Completed)?;
                    tracing::info!(%execution_id, "Execution completed");
                } else {
                    state.fail(
                        None,
                        ErrorKind::Stalled,
                        "no runnable nodes remain and no end node was reached".to_string(),
                    )?;
                    tracing::warn!(%execution_id, "Execution stalled");
                }
            }
            self.commit(&handle, &mut state).await;
        }
        Ok(state.status)
    }

    fn apply(
        &self,
        handle: &ExecutionHandle,
        state: &mut ExecutionInstance,
        run: NodeRun,
        step: &CancellationToken,
        pauses: &mut Vec<PendingCheckpoint>,
    ) -> Result<()> {
        let NodeRun {
            spec,
            iteration,
            outcome,
            metrics,
        } = run;
        let execution_id = state.execution_id;
        let key = result_key(&spec.id, iteration, handle.graph.is_loop_body(&spec.id));

        match outcome {
            Ok(NodeOutcome::Complete(output)) => {
                let branch = output.branch.clone();
                let metrics = NodeMetrics {
                    custom: output.custom_metrics.clone(),
                    ..metrics
                };
                tracing::info!(
                    %execution_id,
                    node_id = %spec.id,
                    iteration,
                    duration_ms = metrics.duration_ms,
                    "Node completed"
                );
                state.complete_node(
                    &spec.id,
                    iteration,
                    key,
                    NodeResult::from_output(output, metrics),
                    HistoryKind::Completed,
                )?;
                if spec.node_type == NodeType::End {
                    state.reached_end = true;
                    return Ok(());
                }

                let targets = if spec.node_type.routes_by_label() {
                    match branch.as_deref() {
                        Some(label) => successors(&spec, Route::Branch(label), &Bindings::default()),
                        None => Err(NodeError::ExecutionFailed(format!(
                            "{} node produced no branch label",
                            spec.node_type
                        ))),
                    }
                } else {
                    let bindings = if spec.edges.iter().any(|e| e.condition.is_some()) {
                        Bindings::build(state, &handle.definition, &self.inner.config.globals)
                    } else {
                        Bindings::default()
                    };
                    successors(&spec, Route::Success, &bindings)
                };
                match targets {
                    Ok(targets) => self.admit_or_abort(handle, state, &spec.id, &targets, step),
                    Err(source) => {
                        let error = EngineError::Executor {
                            node_id: spec.id.clone(),
                            source,
                        };
                        self.abort(state, Some(&spec.id), &error, step)
                    }
                }
            }
            Ok(NodeOutcome::Pause(request)) => {
                tracing::info!(%execution_id, node_id = %spec.id, iteration, "Checkpoint requested");
                pauses.push(PendingCheckpoint::from_request(
                    spec.id.clone(),
                    iteration,
                    request,
                    self.inner.config.checkpoint_ttl(),
                ));
                Ok(())
            }
            Err(source) => {
                let error = EngineError::Executor {
                    node_id: spec.id.clone(),
                    source,
                };
                state.fail_node(&spec.id, iteration, key, &error, metrics)?;
                if spec.continue_on_error() {
                    tracing::warn!(%execution_id, node_id = %spec.id, error = %error, "Node failed, continuing");
                    let targets = successors(&spec, Route::Failure, &Bindings::default())
                        .map_err(|source| EngineError::Executor {
                            node_id: spec.id.clone(),
                            source,
                        })?;
                    self.admit_or_abort(handle, state, &spec.id, &targets, step)
                } else {
                    tracing::error!(%execution_id, node_id = %spec.id, error = %error, "Node failed");
                    step.cancel();
                    state.finish(ExecutionStatus::Failed)
                }
            }
        }
    }

    fn ceiling_for(&self, definition: &WorkflowDefinition, node_id: &str) -> u32 {
        definition
            .find_node(node_id)
            .and_then(NodeSpec::max_iterations)
            .unwrap_or(self.inner.config.max_iterations_per_node)
    }

    fn admit_or_abort(
        &self,
        handle: &ExecutionHandle,
        state: &mut ExecutionInstance,
        from: &str,
        targets: &[NodeId],
        step: &CancellationToken,
    ) -> Result<()> {
        for target in targets {
            let ceiling = self.ceiling_for(&handle.definition, target);
            if let Err(error) = state.admit(target, ceiling) {
                tracing::error!(
                    execution_id = %state.execution_id,
                    node_id = %target,
                    from = %from,
                    error = %error,
                    "Admission failed"
                );
                return self.abort(state, Some(target), &error, step);
            }
        }
        Ok(())
    }

    /// Records a fatal error, stops in-flight siblings and fails the run.
    fn abort(
        &self,
        state: &mut ExecutionInstance,
        node_id: Option<&str>,
        error: &EngineError,
        step: &CancellationToken,
    ) -> Result<()> {
        step.cancel();
        state.abort(node_id, error)
    }

    /// Publishes pending events and mirrors the status to watchers and the
    /// archive. Called with the state lock held.
    async fn commit(&self, handle: &ExecutionHandle, state: &mut ExecutionInstance) {
        let events = state.take_events();
        self.inner.publisher.publish(&events);
        handle.notify_status(state.status);
        if let Err(e) = self.inner.executions.persist(state).await {
            tracing::warn!(execution_id = %state.execution_id, error = %e, "Failed to archive execution");
        }
        if state.is_terminal() {
            self.inner.publisher.close(state.execution_id);
        }
    }

    /// Answers the pending checkpoint.
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        response: CheckpointResponse,
    ) -> Result<ExecutionStatus> {
        self.resolve(execution_id, response, None).await
    }

    async fn resolve(
        &self,
        execution_id: ExecutionId,
        response: CheckpointResponse,
        expected: Option<(&str, u32)>,
    ) -> Result<ExecutionStatus> {
        let handle = self.inner.executions.get(execution_id).await?;
        let _step_guard = handle.advance_lock.lock().await;
        let mut state = handle.state.lock().await;

        let checkpoint = state.validate_response(&response)?;
        if let Some((node_id, iteration)) = expected {
            if checkpoint.node_id != node_id || checkpoint.iteration != iteration {
                return Ok(state.status);
            }
        }
        let spec = handle
            .definition
            .find_node(&checkpoint.node_id)
            .ok_or_else(|| DefinitionError::NodeNotFound(checkpoint.node_id.clone()))?
            .clone();
        let key = result_key(
            &checkpoint.node_id,
            checkpoint.iteration,
            handle.graph.is_loop_body(&checkpoint.node_id),
        );
        state.resolve_checkpoint(key, &response)?;
        tracing::info!(
            %execution_id,
            node_id = %checkpoint.node_id,
            branch = %response.branch,
            "Checkpoint resolved"
        );

        let outcome = checkpoint
            .outcomes
            .get(&response.branch)
            .copied()
            .filter(|s| matches!(s, ExecutionStatus::Approved | ExecutionStatus::Rejected));
        if let Some(outcome) = outcome {
            state.finish(outcome)?;
        } else {
            let step = handle.cancellation.child_token();
            match successors(&spec, Route::Branch(&response.branch), &Bindings::default()) {
                Ok(targets) => self.admit_or_abort(&handle, &mut state, &spec.id, &targets, &step)?,
                Err(source) => {
                    let error = EngineError::Executor {
                        node_id: spec.id.clone(),
                        source,
                    };
                    self.abort(&mut state, Some(&spec.id), &error, &step)?
                }
            }
            if !state.is_terminal() {
                if state.advance_checkpoint_queue() {
                    self.schedule_expiry(&handle, &state);
                } else {
                    state.set_status(ExecutionStatus::Running)?;
                }
            }
        }
        self.commit(&handle, &mut state).await;

        let status = state.status;
        drop(state);
        if status == ExecutionStatus::Running {
            self.spawn_driver(execution_id);
        }
        Ok(status)
    }

    /// Applies the checkpoint's timeout action if it is still pending.
    pub async fn expire_checkpoint(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        iteration: u32,
    ) -> Result<ExecutionStatus> {
        let handle = self.inner.executions.get(execution_id).await?;
        let action = {
            let state = handle.state.lock().await;
            match &state.pending_checkpoint {
                Some(c) if c.node_id == node_id && c.iteration == iteration => {
                    c.timeout_action.clone()
                }
                _ => return Ok(state.status),
            }
        };
        tracing::warn!(%execution_id, node_id = %node_id, iteration, "Checkpoint expired");
        match action {
            TimeoutAction::Default { branch } => {
                self.resolve(
                    execution_id,
                    CheckpointResponse::branch(branch),
                    Some((node_id, iteration)),
                )
                .await
            }
            TimeoutAction::Fail => {
                let _step_guard = handle.advance_lock.lock().await;
                let mut state = handle.state.lock().await;
                let still_pending = state
                    .pending_checkpoint
                    .as_ref()
                    .is_some_and(|c| c.node_id == node_id && c.iteration == iteration);
                if still_pending {
                    state.fail(
                        Some(node_id),
                        ErrorKind::CheckpointExpired,
                        format!("checkpoint '{}' expired without a response", node_id),
                    )?;
                    self.commit(&handle, &mut state).await;
                }
                Ok(state.status)
            }
        }
    }

    fn schedule_expiry(&self, handle: &ExecutionHandle, state: &ExecutionInstance) {
        let Some(checkpoint) = &state.pending_checkpoint else {
            return;
        };
        let Some(expires_at) = checkpoint.expires_at else {
            return;
        };
        let wait = (expires_at - Utc::now()).to_std().unwrap_or_default();
        let engine = self.clone();
        let token = handle.cancellation.clone();
        let execution_id = state.execution_id;
        let node_id = checkpoint.node_id.clone();
        let iteration = checkpoint.iteration;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if let Err(e) = engine.expire_checkpoint(execution_id, &node_id, iteration).await {
                tracing::warn!(%execution_id, node_id = %node_id, error = %e, "Checkpoint expiry failed");
            }
        });
    }

    /// Cancels a non-terminal execution. In-flight executor calls observe
    /// the cancellation token.
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<ExecutionStatus> {
        let handle = self.inner.executions.get(execution_id).await?;
        let mut state = handle.state.lock().await;
        let cancelled = state.cancel()?;
        handle.cancellation.cancel();
        tracing::info!(%execution_id, nodes = ?cancelled, "Execution cancelled");
        self.commit(&handle, &mut state).await;
        Ok(state.status)
    }

    /// Snapshot and live events, registered atomically.
    pub async fn subscribe(&self, execution_id: ExecutionId) -> Result<ExecutionSubscription> {
        let handle = self.inner.executions.get(execution_id).await?;
        let state = handle.state.lock().await;
        let snapshot = state.snapshot();
        let receiver = if state.is_terminal() {
            let (_, receiver) = mpsc::unbounded_channel();
            receiver
        } else {
            self.inner.publisher.register(execution_id).1
        };
        Ok(ExecutionSubscription {
            snapshot,
            events: UnboundedReceiverStream::new(receiver),
        })
    }

    pub async fn snapshot(&self, execution_id: ExecutionId) -> Result<ExecutionSnapshot> {
        let handle = self.inner.executions.get(execution_id).await?;
        let state = handle.state.lock().await;
        Ok(state.snapshot())
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> Vec<ExecutionSummary> {
        self.inner.executions.list(filter).await
    }

    /// Waits until the execution is neither pending nor running.
    pub async fn wait_settled(&self, execution_id: ExecutionId) -> Result<ExecutionSnapshot> {
        let handle = self.inner.executions.get(execution_id).await?;
        let mut status = handle.watch_status();
        // The sender lives in the handle we hold, so this cannot close.
        let _ = status
            .wait_for(|s| !matches!(s, ExecutionStatus::Pending | ExecutionStatus::Running))
            .await;
        let state = handle.state.lock().await;
        Ok(state.snapshot())
    }
}

/// Calls an executor with per-attempt timeout, retry and cancellation.
async fn invoke(
    executor: &dyn NodeExecutor,
    ctx: NodeContext,
    retry: Option<&RetryPolicy>,
    timeout: Option<Duration>,
) -> (std::result::Result<NodeOutcome, NodeError>, u32) {
    let max_attempts = retry.map(|r| r.max_attempts.max(1)).unwrap_or(1);
    let token = ctx.cancellation.clone();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = token.cancelled() => Err(NodeError::Cancelled),
            result = with_timeout(executor.execute(ctx.clone()), timeout) => result,
        };
        match result {
            Err(e) if attempt < max_attempts && e.is_retryable() => {
                let delay = retry.map(|r| r.delay_after(attempt)).unwrap_or_default();
                tracing::warn!(
                    execution_id = %ctx.execution_id,
                    node_id = %ctx.node_id,
                    attempt,
                    error = %e,
                    "Node attempt failed, retrying in {:?}",
                    delay
                );
                tokio::select! {
                    _ = token.cancelled() => return (Err(NodeError::Cancelled), attempt),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return (other, attempt),
        }
    }
}

async fn with_timeout<F>(call: F, limit: Option<Duration>) -> std::result::Result<NodeOutcome, NodeError>
where
    F: Future<Output = std::result::Result<NodeOutcome, NodeError>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout {
                millis: limit.as_millis() as u64,
            }),
        },
        None => call.await,
    }
}
