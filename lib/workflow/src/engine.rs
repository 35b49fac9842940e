//! Run coordinator.
//!
//! The engine owns the lifecycle of every run it executes:
//! 1. Load the workflow, validate it and plan it
//! 2. Check the input against the start node's declared variables
//! 3. Dispatch every ready node, concurrently within a wave
//! 4. Apply each result as it arrives and checkpoint the run
//! 5. Suspend, fail or complete the run once no work is left
//!
//! A run's state is owned by the task driving it. Readers only ever see
//! the last checkpoint written to the [`RunStore`].

use crate::approval::{ApprovalDecision, ApprovalError, ApprovalService, ApprovalStatus};
use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;
use crate::edge::is_truthy;
use crate::error::{NodeError, ValidationError};
use crate::execution::{NodeResult, RunStatus};
use crate::handler::{HandlerRegistry, NodeContext, NodeOutcome, ResumeState, parse_config};
use crate::handlers::StartConfig;
use crate::interpolate::{LAST_OUTPUT_VAR, Variables, interpolate_str, interpolate_value};
use crate::node::Node;
use crate::run_state::{RunState, Suspension};
use crate::store::{RunStore, StoreError, WorkflowStore};
use crate::validate::{self, ExecutionPlan};
use flowrun_core::{NodeId, WorkflowId, WorkflowRunId};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors from engine operations.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No workflow with this id.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// No run with this id.
    RunNotFound { run_id: WorkflowRunId },
    /// The workflow or the run input is invalid.
    Validation { errors: Vec<ValidationError> },
    /// Persistence failed.
    Store(StoreError),
    /// The approval service failed.
    Approval(ApprovalError),
    /// The run already finished.
    RunAlreadyTerminal {
        run_id: WorkflowRunId,
        status: RunStatus,
    },
    /// Another task is driving the run.
    RunInProgress { run_id: WorkflowRunId },
    /// The run has nothing that could make progress.
    NothingToResume { run_id: WorkflowRunId },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::Validation { errors } => {
                write!(f, "validation failed:")?;
                for e in errors {
                    write!(f, "\n  - {e}")?;
                }
                Ok(())
            }
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Approval(e) => write!(f, "approval error: {e}"),
            Self::RunAlreadyTerminal { run_id, status } => {
                write!(f, "run {run_id} already {status}")
            }
            Self::RunInProgress { run_id } => write!(f, "run {run_id} is already executing"),
            Self::NothingToResume { run_id } => {
                write!(f, "run {run_id} has nothing to resume")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ApprovalError> for EngineError {
    fn from(e: ApprovalError) -> Self {
        Self::Approval(e)
    }
}

#[derive(Debug, Clone)]
struct ActiveRun {
    cancel: CancellationToken,
    finished: CancellationToken,
}

struct EngineInner {
    workflows: Arc<dyn WorkflowStore>,
    runs: Arc<dyn RunStore>,
    approvals: Arc<dyn ApprovalService>,
    registry: HandlerRegistry,
    config: EngineConfig,
    active: Mutex<HashMap<WorkflowRunId, ActiveRun>>,
}

/// The workflow engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine over its collaborators.
    #[must_use]
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        runs: Arc<dyn RunStore>,
        approvals: Arc<dyn ApprovalService>,
        registry: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                workflows,
                runs,
                approvals,
                registry,
                config,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Engine-wide settings.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The registered node handlers.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Validates a stored workflow and returns its plan.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] with every problem found.
    pub async fn validate_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<ExecutionPlan, EngineError> {
        let definition = self.load_workflow(workflow_id).await?;
        self.plan(&definition)
    }

    /// Creates a run and drives it on a background task.
    ///
    /// The workflow and the input are validated before the run exists.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the run cannot be persisted.
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub async fn start_run(
        &self,
        workflow_id: &WorkflowId,
        input: JsonValue,
    ) -> Result<WorkflowRunId, EngineError> {
        let (definition, plan, state) = self.create_run(workflow_id, input).await?;
        let run_id = state.run_id;
        let active = self.admit(&state).await?;

        let engine = self.clone();
        tokio::spawn(async move {
            let result = engine
                .drive(&definition, &plan, state, &active.cancel, HashMap::new())
                .await;
            engine.unregister(run_id, &active).await;
            if let Err(e) = result {
                error!(%run_id, error = %e, "run driver stopped");
            }
        });
        Ok(run_id)
    }

    /// Creates a run and drives it to its next stopping point.
    ///
    /// Returns when the run finishes or suspends.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or persistence fails.
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub async fn execute_run(
        &self,
        workflow_id: &WorkflowId,
        input: JsonValue,
    ) -> Result<RunState, EngineError> {
        let (definition, plan, state) = self.create_run(workflow_id, input).await?;
        let run_id = state.run_id;
        let active = self.admit(&state).await?;
        let result = self
            .drive(&definition, &plan, state, &active.cancel, HashMap::new())
            .await;
        self.unregister(run_id, &active).await;
        result
    }

    /// Returns the last checkpoint of a run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`] for unknown runs.
    pub async fn get_run_status(&self, run_id: WorkflowRunId) -> Result<RunState, EngineError> {
        self.inner
            .runs
            .load_checkpoint(&run_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => EngineError::RunNotFound { run_id },
                other => EngineError::Store(other),
            })
    }

    /// Continues a suspended or failed run from its last checkpoint.
    ///
    /// Resolved approvals re-invoke their node with the decision, nodes
    /// waiting on authorization are invoked again, and failures that a
    /// retry could fix are cleared. Completed nodes never run again. A run
    /// whose approvals are all still pending is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error for finished runs, runs already executing and runs
    /// with nothing to retry.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn resume_run(&self, run_id: WorkflowRunId) -> Result<RunState, EngineError> {
        let active = self.register(run_id).await?;
        let result = self.resume_registered(run_id, &active.cancel).await;
        self.unregister(run_id, &active).await;
        result
    }

    /// Cancels a run.
    ///
    /// An executing run stops scheduling; calls already in flight finish
    /// and their results are dropped. A paused run is marked cancelled
    /// directly.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or finished runs.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: WorkflowRunId) -> Result<RunState, EngineError> {
        let active = self.inner.active.lock().await.get(&run_id).cloned();
        if let Some(active) = active {
            info!("cancelling executing run");
            active.cancel.cancel();
            active.finished.cancelled().await;
            return self.get_run_status(run_id).await;
        }

        let mut state = self.get_run_status(run_id).await?;
        if state.status.is_terminal() {
            return Err(EngineError::RunAlreadyTerminal {
                run_id,
                status: state.status,
            });
        }
        self.withdraw_approvals(&state).await;
        state.cancel();
        self.inner.runs.save_checkpoint(&state).await?;
        info!("cancelled paused run");
        Ok(state)
    }

    /// Withdraws the approval requests a cancelled run leaves behind.
    async fn withdraw_approvals(&self, state: &RunState) {
        for (node, suspension) in &state.suspensions {
            let Suspension::Approval { request_id, .. } = suspension else {
                continue;
            };
            match self.inner.approvals.withdraw(request_id).await {
                Ok(_) => debug!(node_id = %node, %request_id, "approval request withdrawn"),
                Err(ApprovalError::AlreadyResolved { .. }) => {}
                Err(e) => warn!(node_id = %node, %request_id, error = %e, "could not withdraw approval request"),
            }
        }
    }

    async fn load_workflow(&self, workflow_id: &WorkflowId) -> Result<WorkflowDefinition, EngineError> {
        self.inner
            .workflows
            .load_workflow(workflow_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => EngineError::WorkflowNotFound {
                    workflow_id: workflow_id.clone(),
                },
                other => EngineError::Store(other),
            })
    }

    fn plan(&self, definition: &WorkflowDefinition) -> Result<ExecutionPlan, EngineError> {
        validate::plan(definition, &self.inner.registry)
            .map_err(|errors| EngineError::Validation { errors })
    }

    async fn create_run(
        &self,
        workflow_id: &WorkflowId,
        input: JsonValue,
    ) -> Result<(WorkflowDefinition, ExecutionPlan, RunState), EngineError> {
        let definition = self.load_workflow(workflow_id).await?;
        let plan = self.plan(&definition)?;

        let start = definition
            .node(plan.start())
            .ok_or(EngineError::Validation {
                errors: vec![ValidationError::MissingStartNode],
            })?;
        let start_config: StartConfig = parse_config(&start.data).map_err(|reason| {
            EngineError::Validation {
                errors: vec![ValidationError::InvalidNodeConfig {
                    node: start.id.clone(),
                    reason,
                }],
            }
        })?;
        let input = start_config
            .apply(input)
            .map_err(|errors| EngineError::Validation { errors })?;

        let state = RunState::new(WorkflowRunId::new(), workflow_id.clone(), input, &plan);
        Ok((definition, plan, state))
    }

    /// Registers a new run, then writes its first checkpoint.
    async fn admit(&self, state: &RunState) -> Result<ActiveRun, EngineError> {
        let active = self.register(state.run_id).await?;
        if let Err(e) = self.inner.runs.save_checkpoint(state).await {
            self.unregister(state.run_id, &active).await;
            return Err(e.into());
        }
        info!(run_id = %state.run_id, "run created");
        Ok(active)
    }

    async fn register(&self, run_id: WorkflowRunId) -> Result<ActiveRun, EngineError> {
        let mut active = self.inner.active.lock().await;
        if active.contains_key(&run_id) {
            return Err(EngineError::RunInProgress { run_id });
        }
        let run = ActiveRun {
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        active.insert(run_id, run.clone());
        Ok(run)
    }

    async fn unregister(&self, run_id: WorkflowRunId, run: &ActiveRun) {
        self.inner.active.lock().await.remove(&run_id);
        run.finished.cancel();
    }

    async fn resume_registered(
        &self,
        run_id: WorkflowRunId,
        cancel: &CancellationToken,
    ) -> Result<RunState, EngineError> {
        let mut state = self.get_run_status(run_id).await?;
        if matches!(state.status, RunStatus::Succeeded | RunStatus::Cancelled) {
            return Err(EngineError::RunAlreadyTerminal {
                run_id,
                status: state.status,
            });
        }
        let definition = self.load_workflow(&state.workflow_id).await?;
        let plan = self.plan(&definition)?;
        state.attach_plan(&plan);

        let mut resumes = HashMap::new();
        let mut progressed = matches!(state.status, RunStatus::Pending | RunStatus::Running);

        for (node, suspension) in state.suspensions.clone() {
            match suspension {
                Suspension::Approval {
                    request_id,
                    action,
                    continuation,
                } => match self.inner.approvals.resolution(&request_id).await? {
                    ApprovalStatus::Pending => {
                        debug!(node_id = %node, %request_id, "approval still pending");
                    }
                    ApprovalStatus::Approved => {
                        info!(node_id = %node, "approval granted");
                        state.take_suspension(&node);
                        resumes.insert(
                            node,
                            ResumeState {
                                approval: Some(ApprovalDecision::Approved),
                                continuation,
                            },
                        );
                        progressed = true;
                    }
                    ApprovalStatus::Rejected => {
                        info!(node_id = %node, "approval rejected");
                        state.take_suspension(&node);
                        state.mark_node_failed(
                            &node,
                            NodeError::UserRejected {
                                reason: format!("{} was rejected", action.summary),
                            },
                        );
                        progressed = true;
                    }
                    ApprovalStatus::Withdrawn => {
                        warn!(node_id = %node, %request_id, "approval request was withdrawn");
                        state.take_suspension(&node);
                        state.mark_node_failed(
                            &node,
                            NodeError::fatal(format!("approval request {request_id} was withdrawn")),
                        );
                        progressed = true;
                    }
                },
                Suspension::Authorization { continuation, .. } => {
                    state.take_suspension(&node);
                    resumes.insert(
                        node,
                        ResumeState {
                            approval: None,
                            continuation,
                        },
                    );
                    progressed = true;
                }
            }
        }

        if state.status == RunStatus::Failed {
            let retryable: Vec<NodeId> = state
                .failed
                .iter()
                .filter(|n| {
                    state
                        .node_results
                        .get(*n)
                        .and_then(NodeResult::error)
                        .is_some_and(NodeError::retryable_on_resume)
                })
                .cloned()
                .collect();
            for node in retryable {
                let continuation = state
                    .reset_failed_node(&node)
                    .and_then(|e| e.continuation().cloned());
                info!(node_id = %node, "retrying failed node");
                resumes.insert(
                    node,
                    ResumeState {
                        approval: None,
                        continuation,
                    },
                );
                progressed = true;
            }
        }

        if !progressed {
            if state.status.is_suspended() {
                return Ok(state);
            }
            return Err(EngineError::NothingToResume { run_id });
        }
        self.drive(&definition, &plan, state, cancel, resumes).await
    }

    /// Runs the scheduling loop until the run finishes, pauses or is
    /// cancelled.
    #[instrument(skip_all, fields(run_id = %state.run_id))]
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        mut state: RunState,
        cancel: &CancellationToken,
        mut resumes: HashMap<NodeId, ResumeState>,
    ) -> Result<RunState, EngineError> {
        state.start();
        self.inner.runs.save_checkpoint(&state).await?;

        let mut in_flight = FuturesUnordered::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let ready = take_ready(&mut state, plan);
            for node_id in &ready {
                let Some(node) = definition.node(node_id) else {
                    state.mark_node_failed(node_id, NodeError::fatal("node missing from definition"));
                    continue;
                };
                let scope = node_scope(&state, plan, node_id);
                state.mark_node_executing(node_id);
                debug!(node_id = %node_id, "dispatching node");
                in_flight.push(self.run_node(
                    state.run_id,
                    node,
                    scope,
                    resumes.remove(node_id),
                    cancel,
                ));
            }
            if !ready.is_empty() {
                self.inner.runs.save_checkpoint(&state).await?;
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some((node, attempts, result)) = in_flight.next() => {
                    state.record_attempts(&node.id, attempts);
                    self.apply_result(&mut state, plan, node, result).await;
                    self.inner.runs.save_checkpoint(&state).await?;
                }
            }
        }

        if cancel.is_cancelled() {
            let discarded = in_flight.len();
            while in_flight.next().await.is_some() {}
            self.withdraw_approvals(&state).await;
            state.cancel();
            self.inner.runs.save_checkpoint(&state).await?;
            info!(discarded, "run cancelled");
            return Ok(state);
        }

        finalize(&mut state, plan);
        self.inner.runs.save_checkpoint(&state).await?;
        info!(status = %state.status, "run stopped");
        Ok(state)
    }

    /// Executes one node, retrying transient failures with backoff.
    ///
    /// Returns the number of handler calls made.
    async fn run_node<'a>(
        &'a self,
        run_id: WorkflowRunId,
        node: &'a Node,
        scope: Variables,
        mut resume: Option<ResumeState>,
        cancel: &'a CancellationToken,
    ) -> (&'a Node, u32, Result<NodeOutcome, NodeError>) {
        let Some(handler) = self.inner.registry.get(&node.kind) else {
            return (
                node,
                0,
                Err(NodeError::fatal(format!("no handler for node type '{}'", node.kind))),
            );
        };
        let config = match interpolate_value(&node.data, &scope) {
            Ok(config) => config,
            Err(e) => return (node, 0, Err(e.into())),
        };
        let timeout = node
            .timeout_secs()
            .map_or_else(|| self.inner.config.node_timeout(), Duration::from_secs);
        let retry = &self.inner.config.retry;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let ctx = NodeContext {
                run_id,
                node,
                config: config.clone(),
                variables: &scope,
                resume: resume.clone(),
                settings: &self.inner.config,
                timeout,
            };
            let result = if handler.bounds_own_calls() {
                handler.execute(&ctx).await
            } else {
                match tokio::time::timeout(timeout, handler.execute(&ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Timeout {
                        after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                }
            };

            match result {
                Err(err) if err.is_transient() && attempt <= retry.max_retries => {
                    let backoff = retry.delay_for(attempt - 1, err.retry_after_secs());
                    warn!(
                        node_id = %node.id,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient node failure, retrying"
                    );
                    if let Some(continuation) = err.continuation() {
                        resume.get_or_insert_with(ResumeState::default).continuation =
                            Some(continuation.clone());
                    }
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return (node, attempt, Err(err));
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
                other => return (node, attempt, other),
            }
        }
    }

    async fn apply_result(
        &self,
        state: &mut RunState,
        plan: &ExecutionPlan,
        node: &Node,
        result: Result<NodeOutcome, NodeError>,
    ) {
        match result {
            Ok(NodeOutcome::Completed(output)) => {
                let output_key = self
                    .inner
                    .registry
                    .get(&node.kind)
                    .and_then(|h| h.output_key(&node.data));

                let mut scope = state.variables.clone();
                scope.insert(node.id.to_string(), output.value.clone());
                scope.insert(LAST_OUTPUT_VAR.to_string(), output.value.clone());
                if let Some(key) = &output_key {
                    scope.insert(key.clone(), output.value.clone());
                }

                let mut untaken = Vec::new();
                for edge in plan.outgoing(&node.id) {
                    let Some(condition) = &edge.condition else {
                        continue;
                    };
                    match interpolate_str(condition, &scope) {
                        Ok(value) if !is_truthy(&value) => untaken.push(edge.id.clone()),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(node_id = %node.id, edge_id = %edge.id, error = %e, "edge condition failed");
                            state.mark_node_failed(&node.id, e.into());
                            return;
                        }
                    }
                }
                for edge in &untaken {
                    debug!(edge_id = %edge, "edge not taken");
                    state.mark_edge_untaken(edge);
                }
                debug!(node_id = %node.id, side_effects = output.side_effects_performed, "node completed");
                state.mark_node_completed(&node.id, output, output_key);
            }
            Ok(NodeOutcome::ApprovalRequired {
                action,
                continuation,
            }) => {
                match self
                    .inner
                    .approvals
                    .request_approval(state.run_id, &node.id, &action)
                    .await
                {
                    Ok(request_id) => {
                        info!(node_id = %node.id, %request_id, summary = %action.summary, "approval requested");
                        state.suspend_node(
                            &node.id,
                            Suspension::Approval {
                                request_id,
                                action,
                                continuation,
                            },
                        );
                    }
                    Err(e) => {
                        state.mark_node_failed(
                            &node.id,
                            NodeError::fatal(format!("could not request approval: {e}")),
                        );
                    }
                }
            }
            Err(NodeError::AuthRequired {
                tool,
                authorization_url,
                continuation,
            }) => {
                info!(node_id = %node.id, %tool, "authorization required");
                state.suspend_node(
                    &node.id,
                    Suspension::Authorization {
                        tool,
                        authorization_url,
                        continuation,
                    },
                );
            }
            Err(err) => {
                warn!(node_id = %node.id, error = %err, "node failed");
                state.mark_node_failed(&node.id, err);
            }
        }
    }
}

/// Returns the nodes to dispatch next, skipping every ready node whose
/// incoming edges were all not taken.
fn take_ready(state: &mut RunState, plan: &ExecutionPlan) -> Vec<NodeId> {
    loop {
        let mut runnable = Vec::new();
        let mut skipped = false;
        for node in state.ready_nodes() {
            let incoming = plan.incoming(&node);
            if !incoming.is_empty() && incoming.iter().all(|e| state.untaken_edges.contains(&e.id)) {
                debug!(node_id = %node, "skipping node");
                state.mark_node_skipped(&node);
                for edge in plan.outgoing(&node) {
                    state.mark_edge_untaken(&edge.id);
                }
                skipped = true;
            } else {
                runnable.push(node);
            }
        }
        if !skipped {
            plan.sort(&mut runnable);
            return runnable;
        }
    }
}

/// Builds the variables a node sees.
///
/// `lastOutput` is the output of the single upstream node, or an object
/// keyed by node id when several upstream nodes feed this one.
fn node_scope(state: &RunState, plan: &ExecutionPlan, node: &NodeId) -> Variables {
    let mut upstream: Vec<(&NodeId, &JsonValue)> = Vec::new();
    for edge in plan.incoming(node) {
        if state.untaken_edges.contains(&edge.id) || upstream.iter().any(|(id, _)| *id == &edge.source) {
            continue;
        }
        if let Some(output) = state.output_of(&edge.source) {
            upstream.push((&edge.source, output));
        }
    }

    let last_output = match upstream.as_slice() {
        [] => JsonValue::Null,
        [(_, output)] => (*output).clone(),
        many => JsonValue::Object(
            many.iter()
                .map(|(id, output)| (id.to_string(), (*output).clone()))
                .collect::<Map<String, JsonValue>>(),
        ),
    };
    let mut scope = state.variables.clone();
    scope.insert(LAST_OUTPUT_VAR.to_string(), last_output);
    scope
}

/// Picks the final status once no work can be dispatched.
fn finalize(state: &mut RunState, plan: &ExecutionPlan) {
    if let Some(status) = state.suspended_status() {
        state.suspend(status);
        return;
    }
    if let Some(end) = plan.ends().iter().find(|e| state.completed.contains(*e)) {
        let output = state.output_of(end).cloned();
        state.complete(output);
        return;
    }
    let failures: Vec<String> = state
        .failed
        .iter()
        .filter_map(|n| {
            let err = state.node_results.get(n).and_then(NodeResult::error)?;
            Some(format!("{n}: {err}"))
        })
        .collect();
    let mut summary = if failures.is_empty() {
        "no path to an end node was taken".to_string()
    } else {
        format!("no path to an end node completed; {}", failures.join("; "))
    };
    let blocked = state.blocked_nodes();
    if !blocked.is_empty() {
        let blocked: Vec<String> = blocked.iter().map(ToString::to_string).collect();
        summary.push_str(&format!("; blocked: {}", blocked.join(", ")));
    }
    state.fail(summary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::InMemoryApprovals;
    use crate::edge::Edge;
    use crate::handler::{NodeHandler, NodeOutput};
    use crate::handlers::{HttpClient, HttpError, HttpRequest, HttpResponse};
    use crate::node::NodeKind;
    use crate::retry::RetryConfig;
    use crate::store::{InMemoryRunStore, InMemoryWorkflowStore};
    use async_trait::async_trait;
    use flowrun_ai::{LlmBackend, LlmError, LlmReply, LlmRequest, LlmResponse, MessageRole, TokenUsage, ToolCall};
    use flowrun_integration::{ToolInvocation, ToolInvocationError, ToolInvoker, ToolTarget};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Answers 503 for the first `failures` calls.
    struct FlakyHttp {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HttpClient for FlakyHttp {
        async fn send(&self, _request: &HttpRequest) -> Result<HttpResponse, HttpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Ok(HttpResponse::new(503, JsonValue::Null));
            }
            Ok(HttpResponse::new(200, json!({"title": "Rust"})))
        }
    }

    /// Echoes the user prompt. Model `loop` calls `search` forever; model
    /// `post` calls `post` once and stalls on its first answer after that.
    struct ScriptedLlm {
        calls: AtomicU32,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl LlmBackend for ScriptedLlm {
        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let tool_answered = request.messages.iter().any(|m| m.role == MessageRole::Tool);
            let reply = if request.model == "loop" {
                LlmReply::ToolCall {
                    call: ToolCall {
                        id: format!("call_{n}"),
                        name: "search".to_string(),
                        arguments: json!({"q": "more"}),
                    },
                }
            } else if request.model == "post" && !tool_answered {
                LlmReply::ToolCall {
                    call: ToolCall {
                        id: format!("call_{n}"),
                        name: "post".to_string(),
                        arguments: json!({"text": "hi"}),
                    },
                }
            } else if request.model == "post" {
                if !self.stalled.swap(true, Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                }
                LlmReply::Text {
                    text: "posted".to_string(),
                }
            } else {
                let prompt = request
                    .messages
                    .iter()
                    .rfind(|m| m.role == MessageRole::User)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                LlmReply::Text { text: prompt }
            };
            Ok(LlmResponse {
                reply,
                usage: TokenUsage::default(),
                model: request.model.clone(),
            })
        }

        fn provider(&self) -> &str {
            "scripted"
        }
    }

    /// Demands authorization until `authorized` is set.
    struct GatedTools {
        authorized: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ToolInvoker for GatedTools {
        async fn invoke(&self, invocation: &ToolInvocation) -> Result<JsonValue, ToolInvocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.authorized.load(Ordering::SeqCst) {
                return Err(ToolInvocationError::AuthRequired {
                    tool: invocation.target.label(),
                    authorization_url: Some("https://auth.example/start".to_string()),
                    authorization_id: None,
                });
            }
            Ok(json!({"tool": invocation.target.label(), "input": invocation.input}))
        }

        fn supports(&self, _target: &ToolTarget) -> bool {
            true
        }
    }

    /// Sleeps `ms` (or `stallFirstMs` on a node's first attempt), then
    /// emits `value` (or `lastOutput`). Records each finished call.
    #[derive(Default)]
    struct Delay {
        calls: StdMutex<Vec<NodeId>>,
        attempts: StdMutex<HashMap<NodeId, u32>>,
    }

    impl Delay {
        fn calls_for(&self, node: &str) -> usize {
            self.calls
                .lock()
                .expect("lock")
                .iter()
                .filter(|n| n.as_str() == node)
                .count()
        }
    }

    #[async_trait]
    impl NodeHandler for Delay {
        fn kind(&self) -> NodeKind {
            NodeKind::from("delay")
        }

        async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
            let attempt = {
                let mut attempts = self.attempts.lock().expect("lock");
                let n = attempts.entry(ctx.node.id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let stall = ctx.config.get("stallFirstMs").and_then(JsonValue::as_u64);
            let ms = match stall {
                Some(stall) if attempt == 1 => stall,
                _ => ctx.config.get("ms").and_then(JsonValue::as_u64).unwrap_or(0),
            };
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.calls.lock().expect("lock").push(ctx.node.id.clone());
            let value = ctx
                .config
                .get("value")
                .cloned()
                .unwrap_or_else(|| ctx.last_output().clone());
            Ok(NodeOutcome::Completed(NodeOutput::pure(value)))
        }
    }

    struct Harness {
        engine: Engine,
        workflows: Arc<InMemoryWorkflowStore>,
        runs: Arc<InMemoryRunStore>,
        approvals: Arc<InMemoryApprovals>,
        http: Arc<FlakyHttp>,
        llm: Arc<ScriptedLlm>,
        tools: Arc<GatedTools>,
        delay: Arc<Delay>,
    }

    impl Harness {
        fn new() -> Self {
            let workflows = Arc::new(InMemoryWorkflowStore::new());
            let runs = Arc::new(InMemoryRunStore::new());
            let approvals = Arc::new(InMemoryApprovals::new());
            let http = Arc::new(FlakyHttp {
                failures: AtomicU32::new(0),
                calls: AtomicU32::new(0),
            });
            let llm = Arc::new(ScriptedLlm {
                calls: AtomicU32::new(0),
                stalled: AtomicBool::new(false),
            });
            let tools = Arc::new(GatedTools {
                authorized: AtomicBool::new(true),
                calls: AtomicU32::new(0),
            });
            let delay = Arc::new(Delay::default());

            let registry = HandlerRegistry::builtin(llm.clone(), tools.clone(), http.clone())
                .with(delay.clone());
            let config = EngineConfig::default().with_retry(RetryConfig::new(3, Duration::from_millis(1)));
            let engine = Engine::new(
                workflows.clone(),
                runs.clone(),
                approvals.clone(),
                registry,
                config,
            );
            Self {
                engine,
                workflows,
                runs,
                approvals,
                http,
                llm,
                tools,
                delay,
            }
        }

        async fn add(&self, workflow: WorkflowDefinition) -> WorkflowId {
            let id = workflow.id.clone();
            self.workflows.insert(workflow).await;
            id
        }
    }

    fn start() -> Node {
        Node::new("start", NodeKind::Start)
    }

    fn end() -> Node {
        Node::new("end", NodeKind::End)
    }

    fn delay(id: &str, data: JsonValue) -> Node {
        Node::new(id, NodeKind::from("delay")).with_data(data)
    }

    fn chain(id: &str, nodes: Vec<Node>) -> WorkflowDefinition {
        let mut workflow = WorkflowDefinition::new(id, id);
        for pair in nodes.windows(2) {
            workflow = workflow.with_edge(Edge::new(
                format!("{}-{}", pair[0].id, pair[1].id),
                pair[0].id.clone(),
                pair[1].id.clone(),
            ));
        }
        for node in nodes {
            workflow = workflow.with_node(node);
        }
        workflow
    }

    #[tokio::test]
    async fn transient_http_failures_are_retried_invisibly() {
        let h = Harness::new();
        h.http.failures.store(2, Ordering::SeqCst);
        let id = h
            .add(chain(
                "summarize",
                vec![
                    start(),
                    Node::new("fetch", NodeKind::Http).with_data(json!({"url": "https://api.example.com/post"})),
                    Node::new("agent", NodeKind::Agent)
                        .with_data(json!({"model": "echo", "prompt": "Summarize {{fetch.body.title}}"})),
                    end(),
                ],
            ))
            .await;

        let state = h.engine.execute_run(&id, json!({})).await.expect("run");

        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(h.http.calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.node_executions[&NodeId::from("fetch")].attempts, 3);
        assert!(matches!(
            state.node_results[&NodeId::from("fetch")],
            NodeResult::Succeeded { .. }
        ));
        assert_eq!(state.node_results.len(), 4);
        assert_eq!(state.output, Some(json!("Summarize Rust")));
    }

    #[tokio::test(start_paused = true)]
    async fn handler_timeouts_are_retried() {
        let h = Harness::new();
        let id = h
            .add(chain(
                "stall",
                vec![
                    start(),
                    delay("slow", json!({"value": "ok", "stallFirstMs": 1500, "timeoutSecs": 1})),
                    end(),
                ],
            ))
            .await;

        let state = h.engine.execute_run(&id, json!({})).await.expect("run");

        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(state.node_executions[&NodeId::from("slow")].attempts, 2);
        assert!(matches!(
            state.node_results[&NodeId::from("slow")],
            NodeResult::Succeeded { .. }
        ));
        assert_eq!(h.delay.calls_for("slow"), 1);
        assert_eq!(state.output, Some(json!("ok")));
    }

    #[tokio::test(start_paused = true)]
    async fn agent_timeouts_do_not_repeat_completed_tool_calls() {
        let h = Harness::new();
        let id = h
            .add(chain(
                "poster",
                vec![
                    start(),
                    Node::new("agent", NodeKind::Agent).with_data(json!({
                        "model": "post",
                        "prompt": "post a greeting",
                        "timeoutSecs": 1,
                        "tools": [{"type": "arcade", "toolId": "Slack.PostMessage", "name": "post"}],
                    })),
                    end(),
                ],
            ))
            .await;

        let state = h.engine.execute_run(&id, json!({})).await.expect("run");

        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(h.tools.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.node_executions[&NodeId::from("agent")].attempts, 2);
        assert_eq!(state.output, Some(json!("posted")));
    }

    #[tokio::test]
    async fn agent_stops_after_exactly_max_iterations() {
        let h = Harness::new();
        let id = h
            .add(chain(
                "looping",
                vec![
                    start(),
                    Node::new("agent", NodeKind::Agent).with_data(json!({
                        "model": "loop",
                        "prompt": "keep going",
                        "maxIterations": 3,
                        "tools": [{"type": "arcade", "toolId": "Web.Search", "name": "search"}],
                    })),
                    end(),
                ],
            ))
            .await;

        let state = h.engine.execute_run(&id, json!({})).await.expect("run");

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 3);
        let error = state.node_results[&NodeId::from("agent")]
            .error()
            .expect("agent failed");
        let NodeError::IterationLimitExceeded { max, transcript } = error else {
            panic!("expected iteration limit, got {error:?}");
        };
        assert_eq!(*max, 3);
        assert!(!transcript.is_empty());
        assert!(state.error.as_deref().is_some_and(|e| e.contains("agent")));
    }

    #[tokio::test]
    async fn auth_required_suspends_and_resume_skips_upstream() {
        let h = Harness::new();
        h.tools.authorized.store(false, Ordering::SeqCst);
        let id = h
            .add(chain(
                "gmail",
                vec![
                    start(),
                    delay("prep", json!({"value": "prepared"})),
                    Node::new("gmail", NodeKind::Tool)
                        .with_data(json!({"toolId": "Google.Gmail.ReadEmail", "inputs": {"note": "{{prep}}"}, "outputKey": "mail"})),
                    end(),
                ],
            ))
            .await;

        let state = h.engine.execute_run(&id, json!({})).await.expect("run");
        assert_eq!(state.status, RunStatus::AwaitingAuthorization);
        assert!(matches!(
            state.suspensions.get(&NodeId::from("gmail")),
            Some(Suspension::Authorization { authorization_url: Some(_), .. })
        ));
        assert_eq!(h.delay.calls_for("prep"), 1);

        h.tools.authorized.store(true, Ordering::SeqCst);
        let resumed = h.engine.resume_run(state.run_id).await.expect("resume");

        assert_eq!(resumed.status, RunStatus::Succeeded);
        assert_eq!(h.delay.calls_for("prep"), 1);
        assert_eq!(
            resumed.variables["mail"],
            json!({"tool": "Google.Gmail.ReadEmail", "input": {"note": "prepared"}})
        );
        assert!(resumed.suspensions.is_empty());
    }

    #[tokio::test]
    async fn join_waits_for_every_branch() {
        let h = Harness::new();
        let workflow = WorkflowDefinition::new("fan", "fan")
            .with_node(start())
            .with_node(delay("slow", json!({"ms": 60, "value": "S"})))
            .with_node(delay("fast", json!({"ms": 1, "value": "F"})))
            .with_node(delay("join", json!({})))
            .with_node(end())
            .with_edge(Edge::new("e1", "start", "slow"))
            .with_edge(Edge::new("e2", "start", "fast"))
            .with_edge(Edge::new("e3", "slow", "join"))
            .with_edge(Edge::new("e4", "fast", "join"))
            .with_edge(Edge::new("e5", "join", "end"));
        let id = h.add(workflow).await;

        let state = h.engine.execute_run(&id, json!({})).await.expect("run");

        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(h.delay.calls_for("join"), 1);
        assert_eq!(state.output, Some(json!({"slow": "S", "fast": "F"})));
        let calls = h.delay.calls.lock().expect("lock").clone();
        assert_eq!(calls.last(), Some(&NodeId::from("join")));
    }

    #[tokio::test]
    async fn invalid_workflows_never_create_runs() {
        let h = Harness::new();
        let no_start = h
            .add(WorkflowDefinition::new("no-start", "x").with_node(end()))
            .await;
        let dangling = h
            .add(
                chain("dangling", vec![start(), end()])
                    .with_edge(Edge::new("ghost", "end", "nowhere")),
            )
            .await;

        for id in [no_start, dangling] {
            let err = h.engine.start_run(&id, json!({})).await.unwrap_err();
            let EngineError::Validation { errors } = err else {
                panic!("expected validation error, got {err:?}");
            };
            assert!(!errors.is_empty());
        }
        assert!(h.runs.list_runs().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn input_is_checked_against_the_start_node() {
        let h = Harness::new();
        let id = h
            .add(chain(
                "ask",
                vec![
                    start().with_data(json!({"inputVariables": [
                        {"name": "question", "type": "string", "required": true},
                        {"name": "tone", "type": "string", "defaultValue": "plain"},
                    ]})),
                    end(),
                ],
            ))
            .await;

        let err = h.engine.execute_run(&id, json!({})).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::Validation {
                errors: vec![ValidationError::MissingInput {
                    name: "question".to_string()
                }]
            }
        );

        let state = h
            .engine
            .execute_run(&id, json!({"question": "Hi"}))
            .await
            .expect("run");
        assert_eq!(state.output, Some(json!({"question": "Hi", "tone": "plain"})));
    }

    fn approval_workflow() -> WorkflowDefinition {
        chain(
            "post",
            vec![
                start(),
                Node::new("send", NodeKind::Http).with_data(json!({
                    "url": "https://api.example.com/send",
                    "method": "POST",
                    "body": {"text": "{{input.text}}"},
                    "requiresApproval": true,
                })),
                end(),
            ],
        )
    }

    #[tokio::test]
    async fn approved_actions_run_after_resume() {
        let h = Harness::new();
        let id = h.add(approval_workflow()).await;

        let state = h
            .engine
            .execute_run(&id, json!({"text": "hello"}))
            .await
            .expect("run");
        assert_eq!(state.status, RunStatus::AwaitingApproval);
        assert_eq!(h.http.calls.load(Ordering::SeqCst), 0);

        let pending = h.approvals.pending().await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action.payload["body"], json!({"text": "hello"}));

        let unchanged = h.engine.resume_run(state.run_id).await.expect("resume");
        assert_eq!(unchanged.status, RunStatus::AwaitingApproval);
        assert_eq!(h.http.calls.load(Ordering::SeqCst), 0);

        h.approvals
            .resolve(&pending[0].id, ApprovalDecision::Approved)
            .await
            .expect("resolve");
        let resumed = h.engine.resume_run(state.run_id).await.expect("resume");
        assert_eq!(resumed.status, RunStatus::Succeeded);
        assert_eq!(h.http.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            resumed.node_results[&NodeId::from("send")],
            NodeResult::Succeeded {
                side_effects_performed: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rejected_actions_fail_the_node() {
        let h = Harness::new();
        let id = h.add(approval_workflow()).await;
        let state = h
            .engine
            .execute_run(&id, json!({"text": "hello"}))
            .await
            .expect("run");

        let pending = h.approvals.pending().await.expect("pending");
        h.approvals
            .resolve(&pending[0].id, ApprovalDecision::Rejected)
            .await
            .expect("resolve");
        let resumed = h.engine.resume_run(state.run_id).await.expect("resume");

        assert_eq!(resumed.status, RunStatus::Failed);
        assert!(matches!(
            resumed.node_results[&NodeId::from("send")].error(),
            Some(NodeError::UserRejected { .. })
        ));
        assert_eq!(h.http.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            h.engine.resume_run(state.run_id).await,
            Err(EngineError::NothingToResume { .. })
        ));
    }

    #[tokio::test]
    async fn false_conditions_skip_branches() {
        let h = Harness::new();
        let workflow = WorkflowDefinition::new("cond", "cond")
            .with_node(start())
            .with_node(delay("check", json!({"value": {"ok": false}})))
            .with_node(delay("notify", json!({"value": "sent"})))
            .with_node(end())
            .with_edge(Edge::new("e1", "start", "check"))
            .with_edge(Edge::new("e2", "check", "notify").when("{{check.ok}}"))
            .with_edge(Edge::new("e3", "notify", "end"))
            .with_edge(Edge::new("e4", "check", "end"));
        let id = h.add(workflow).await;

        let state = h.engine.execute_run(&id, json!({})).await.expect("run");

        assert_eq!(state.status, RunStatus::Succeeded);
        assert!(state.skipped.contains(&NodeId::from("notify")));
        assert_eq!(h.delay.calls_for("notify"), 0);
        assert_eq!(state.output, Some(json!({"ok": false})));
    }

    #[tokio::test]
    async fn unresolved_templates_fail_the_run() {
        let h = Harness::new();
        let id = h
            .add(chain(
                "broken",
                vec![
                    start(),
                    Node::new("agent", NodeKind::Agent)
                        .with_data(json!({"model": "echo", "prompt": "{{input.missing}}"})),
                    end(),
                ],
            ))
            .await;

        let state = h.engine.execute_run(&id, json!({})).await.expect("run");

        assert_eq!(state.status, RunStatus::Failed);
        assert!(matches!(
            state.node_results[&NodeId::from("agent")].error(),
            Some(NodeError::Template { .. })
        ));
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
        assert!(state.node_results.contains_key(&NodeId::from("start")));
    }

    #[tokio::test]
    async fn failed_runs_retry_transient_failures_on_resume() {
        let h = Harness::new();
        h.http.failures.store(4, Ordering::SeqCst);
        let id = h
            .add(chain(
                "flaky",
                vec![
                    start(),
                    delay("prep", json!({"value": 1})),
                    Node::new("fetch", NodeKind::Http).with_data(json!({"url": "https://api.example.com"})),
                    end(),
                ],
            ))
            .await;

        let state = h.engine.execute_run(&id, json!({})).await.expect("run");
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(h.http.calls.load(Ordering::SeqCst), 4);
        assert!(state.error.as_deref().is_some_and(|e| e.ends_with("; blocked: end")));

        let resumed = h.engine.resume_run(state.run_id).await.expect("resume");
        assert_eq!(resumed.status, RunStatus::Succeeded);
        assert_eq!(h.http.calls.load(Ordering::SeqCst), 5);
        assert_eq!(h.delay.calls_for("prep"), 1);
        assert!(resumed.error.is_none());
    }

    #[tokio::test]
    async fn cancelled_runs_discard_in_flight_work() {
        let h = Harness::new();
        let id = h
            .add(chain(
                "slow",
                vec![
                    start(),
                    delay("slow", json!({"ms": 200})),
                    delay("after", json!({})),
                    end(),
                ],
            ))
            .await;

        let run_id = h.engine.start_run(&id, json!({})).await.expect("start");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = h.engine.cancel_run(run_id).await.expect("cancel");

        assert_eq!(state.status, RunStatus::Cancelled);
        assert!(!state.completed.contains(&NodeId::from("slow")));
        assert_eq!(h.delay.calls_for("after"), 0);
        assert!(matches!(
            h.engine.resume_run(run_id).await,
            Err(EngineError::RunAlreadyTerminal {
                status: RunStatus::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn paused_runs_can_be_cancelled() {
        let h = Harness::new();
        let id = h.add(approval_workflow()).await;
        let state = h
            .engine
            .execute_run(&id, json!({"text": "x"}))
            .await
            .expect("run");

        let request = h.approvals.pending().await.expect("pending")[0].id;

        let cancelled = h.engine.cancel_run(state.run_id).await.expect("cancel");
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(h.approvals.pending().await.expect("pending").is_empty());
        assert_eq!(
            h.approvals.resolution(&request).await.expect("resolution"),
            ApprovalStatus::Withdrawn
        );
        assert!(matches!(
            h.approvals.resolve(&request, ApprovalDecision::Approved).await,
            Err(ApprovalError::AlreadyResolved { .. })
        ));
        assert!(matches!(
            h.engine.cancel_run(state.run_id).await,
            Err(EngineError::RunAlreadyTerminal { .. })
        ));
        assert_eq!(h.http.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn started_runs_can_be_polled() {
        let h = Harness::new();
        let id = h
            .add(chain("poll", vec![start(), delay("work", json!({"ms": 10, "value": 42})), end()]))
            .await;

        let run_id = h.engine.start_run(&id, json!({})).await.expect("start");
        let mut state = h.engine.get_run_status(run_id).await.expect("status");
        for _ in 0..200 {
            if state.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            state = h.engine.get_run_status(run_id).await.expect("status");
        }

        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(state.output, Some(json!(42)));
    }

    /// Counts checkpoints written while their run is not registered.
    #[derive(Default)]
    struct WatchedRuns {
        inner: InMemoryRunStore,
        engine: std::sync::OnceLock<Engine>,
        saves: AtomicU32,
        unregistered_saves: AtomicU32,
    }

    #[async_trait]
    impl RunStore for WatchedRuns {
        async fn save_checkpoint(&self, state: &RunState) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if let Some(engine) = self.engine.get() {
                let registered = engine
                    .inner
                    .active
                    .try_lock()
                    .map_or(true, |active| active.contains_key(&state.run_id));
                if !registered {
                    self.unregistered_saves.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.inner.save_checkpoint(state).await
        }

        async fn load_checkpoint(&self, run_id: &WorkflowRunId) -> Result<RunState, StoreError> {
            self.inner.load_checkpoint(run_id).await
        }

        async fn list_runs(&self) -> Result<Vec<WorkflowRunId>, StoreError> {
            self.inner.list_runs().await
        }
    }

    #[tokio::test]
    async fn new_runs_are_registered_before_their_first_checkpoint() {
        let h = Harness::new();
        let runs = Arc::new(WatchedRuns::default());
        let engine = Engine::new(
            h.workflows.clone(),
            runs.clone(),
            h.approvals.clone(),
            h.engine.registry().clone(),
            h.engine.config().clone(),
        );
        assert!(runs.engine.set(engine.clone()).is_ok());
        let id = h
            .add(chain("watched", vec![start(), delay("work", json!({"value": 1})), end()]))
            .await;

        let state = engine.execute_run(&id, json!({})).await.expect("run");

        assert_eq!(state.status, RunStatus::Succeeded);
        assert!(runs.saves.load(Ordering::SeqCst) > 0);
        assert_eq!(runs.unregistered_saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let h = Harness::new();
        assert!(matches!(
            h.engine.get_run_status(WorkflowRunId::new()).await,
            Err(EngineError::RunNotFound { .. })
        ));
        assert!(matches!(
            h.engine.start_run(&WorkflowId::from("missing"), json!({})).await,
            Err(EngineError::WorkflowNotFound { .. })
        ));
    }
}
