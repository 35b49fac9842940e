//! Persisted state of a workflow run.
//!
//! A [`RunState`] is everything needed to report on a run and to continue
//! it after a pause or a crash: variables, per-node results, the executing
//! frontier and any suspensions. The remaining work graph is derived from
//! these sets and rebuilt with [`RunState::attach_plan`] after loading.

use crate::approval::ProposedAction;
use crate::error::NodeError;
use crate::execution::{NodeExecution, NodeResult, RunStatus};
use crate::handler::NodeOutput;
use crate::interpolate::{INPUT_VAR, LAST_OUTPUT_VAR, Variables};
use crate::remaining_work::RemainingWorkGraph;
use crate::validate::ExecutionPlan;
use chrono::{DateTime, Utc};
use flowrun_core::{ApprovalRequestId, EdgeId, NodeId, WorkflowId, WorkflowRunId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};

/// Why a node is paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suspension {
    /// Waiting for a human to approve `action`.
    Approval {
        request_id: ApprovalRequestId,
        action: ProposedAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continuation: Option<JsonValue>,
    },
    /// Waiting for the user to authorize a tool.
    Authorization {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authorization_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continuation: Option<JsonValue>,
    },
}

/// Complete state of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// The run id.
    pub run_id: WorkflowRunId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// Current status.
    pub status: RunStatus,
    /// Run variables: `input`, `lastOutput`, node outputs and output keys.
    pub variables: Variables,
    /// Nodes dispatched but not yet finished.
    pub frontier: BTreeSet<NodeId>,
    /// Nodes that completed.
    pub completed: BTreeSet<NodeId>,
    /// Nodes that were skipped.
    pub skipped: BTreeSet<NodeId>,
    /// Nodes that failed.
    pub failed: BTreeSet<NodeId>,
    /// One recorded outcome per finished node.
    pub node_results: BTreeMap<NodeId, NodeResult>,
    /// Per-node execution records.
    pub node_executions: BTreeMap<NodeId, NodeExecution>,
    /// Paused nodes.
    pub suspensions: BTreeMap<NodeId, Suspension>,
    /// Edges whose condition evaluated falsy, or whose source was skipped.
    pub untaken_edges: BTreeSet<EdgeId>,
    /// Final output, set when the run succeeds.
    pub output: Option<JsonValue>,
    /// Failure summary, set when the run fails.
    pub error: Option<String>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run first started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    remaining_work: RemainingWorkGraph,
}

impl RunState {
    /// Creates a pending run for a validated plan and input.
    #[must_use]
    pub fn new(
        run_id: WorkflowRunId,
        workflow_id: WorkflowId,
        input: JsonValue,
        plan: &ExecutionPlan,
    ) -> Self {
        let now = Utc::now();
        let mut variables = Variables::new();
        variables.insert(INPUT_VAR.to_string(), input);
        Self {
            run_id,
            workflow_id,
            status: RunStatus::Pending,
            variables,
            frontier: BTreeSet::new(),
            completed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            failed: BTreeSet::new(),
            node_results: BTreeMap::new(),
            node_executions: plan
                .order()
                .iter()
                .map(|id| (id.clone(), NodeExecution::new()))
                .collect(),
            suspensions: BTreeMap::new(),
            untaken_edges: BTreeSet::new(),
            output: None,
            error: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            remaining_work: RemainingWorkGraph::from_plan(plan),
        }
    }

    /// Rebuilds the remaining work graph from the recorded node sets.
    ///
    /// Frontier nodes become ready again: a node that was executing when
    /// the checkpoint was written has no recorded result.
    pub fn attach_plan(&mut self, plan: &ExecutionPlan) {
        let mut work = RemainingWorkGraph::from_plan(plan);
        for node in self.completed.iter().chain(&self.skipped) {
            work.mark_completed(node);
        }
        for node in &self.failed {
            work.mark_failed(node);
        }
        for node in self.suspensions.keys() {
            work.mark_parked(node);
        }
        self.frontier.clear();
        self.remaining_work = work;
    }

    /// Returns nodes that are ready to execute.
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.remaining_work.ready_nodes()
    }

    /// Returns nodes that cannot run because an upstream node failed or
    /// is paused.
    #[must_use]
    pub fn blocked_nodes(&self) -> Vec<NodeId> {
        self.remaining_work.blocked_nodes()
    }

    /// Returns the output a node produced, if it succeeded.
    #[must_use]
    pub fn output_of(&self, node: &NodeId) -> Option<&JsonValue> {
        self.node_results.get(node).and_then(NodeResult::output)
    }

    /// Marks the run as running.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.finished_at = None;
        self.error = None;
        self.touch();
    }

    /// Marks a node as executing.
    pub fn mark_node_executing(&mut self, node: &NodeId) {
        self.remaining_work.mark_executing(node);
        self.frontier.insert(node.clone());
        self.node_executions.entry(node.clone()).or_default().start();
        self.touch();
    }

    /// Adds handler calls to a node's attempt counter.
    pub fn record_attempts(&mut self, node: &NodeId, attempts: u32) {
        self.node_executions
            .entry(node.clone())
            .or_default()
            .record_attempts(attempts);
    }

    /// Records a node's output and publishes it as variables.
    ///
    /// The output is stored under the node id, as `lastOutput`, and under
    /// `output_key` when the node declares one.
    pub fn mark_node_completed(
        &mut self,
        node: &NodeId,
        output: NodeOutput,
        output_key: Option<String>,
    ) {
        self.remaining_work.mark_completed(node);
        self.frontier.remove(node);
        self.completed.insert(node.clone());
        self.variables
            .insert(node.to_string(), output.value.clone());
        self.variables
            .insert(LAST_OUTPUT_VAR.to_string(), output.value.clone());
        if let Some(key) = output_key {
            self.variables.insert(key, output.value.clone());
        }
        self.node_results.insert(
            node.clone(),
            NodeResult::Succeeded {
                output: output.value,
                side_effects_performed: output.side_effects_performed,
                metadata: output.metadata,
            },
        );
        self.node_executions.entry(node.clone()).or_default().complete();
        self.touch();
    }

    /// Records a node failure. Downstream nodes stay blocked.
    pub fn mark_node_failed(&mut self, node: &NodeId, error: NodeError) {
        self.remaining_work.mark_failed(node);
        self.frontier.remove(node);
        self.failed.insert(node.clone());
        self.node_executions
            .entry(node.clone())
            .or_default()
            .fail(error.to_string());
        self.node_results
            .insert(node.clone(), NodeResult::Failed { error });
        self.touch();
    }

    /// Records that a node will not run.
    pub fn mark_node_skipped(&mut self, node: &NodeId) {
        self.remaining_work.mark_skipped(node);
        self.frontier.remove(node);
        self.skipped.insert(node.clone());
        self.node_results.insert(node.clone(), NodeResult::Skipped);
        self.node_executions.entry(node.clone()).or_default().skip();
        self.touch();
    }

    /// Pauses a node until outside input arrives.
    pub fn suspend_node(&mut self, node: &NodeId, suspension: Suspension) {
        self.remaining_work.mark_parked(node);
        self.frontier.remove(node);
        let reason = match &suspension {
            Suspension::Approval { action, .. } => format!("awaiting approval: {}", action.summary),
            Suspension::Authorization { tool, .. } => format!("awaiting authorization for {tool}"),
        };
        self.node_executions
            .entry(node.clone())
            .or_default()
            .suspend(reason);
        self.suspensions.insert(node.clone(), suspension);
        self.touch();
    }

    /// Removes a node's suspension and makes it schedulable again.
    pub fn take_suspension(&mut self, node: &NodeId) -> Option<Suspension> {
        let suspension = self.suspensions.remove(node)?;
        self.remaining_work.release(node);
        self.touch();
        Some(suspension)
    }

    /// Clears a failed node's result so it runs again.
    pub fn reset_failed_node(&mut self, node: &NodeId) -> Option<NodeError> {
        if !self.failed.remove(node) {
            return None;
        }
        self.remaining_work.release(node);
        let error = match self.node_results.remove(node) {
            Some(NodeResult::Failed { error }) => Some(error),
            _ => None,
        };
        self.touch();
        error
    }

    /// Records that an edge will not be followed.
    pub fn mark_edge_untaken(&mut self, edge: &EdgeId) {
        self.untaken_edges.insert(edge.clone());
    }

    /// Returns the paused status matching the current suspensions.
    #[must_use]
    pub fn suspended_status(&self) -> Option<RunStatus> {
        if self
            .suspensions
            .values()
            .any(|s| matches!(s, Suspension::Approval { .. }))
        {
            Some(RunStatus::AwaitingApproval)
        } else if self.suspensions.is_empty() {
            None
        } else {
            Some(RunStatus::AwaitingAuthorization)
        }
    }

    /// Pauses the run.
    pub fn suspend(&mut self, status: RunStatus) {
        self.status = status;
        self.touch();
    }

    /// Finalizes the run as succeeded.
    pub fn complete(&mut self, output: Option<JsonValue>) {
        self.status = RunStatus::Succeeded;
        self.output = output;
        self.finish();
    }

    /// Finalizes the run as failed. Partial results are kept.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.finish();
    }

    /// Finalizes the run as cancelled.
    pub fn cancel(&mut self) {
        self.status = RunStatus::Cancelled;
        self.frontier.clear();
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use crate::edge::Edge;
    use crate::handler::{HandlerRegistry, NodeContext, NodeHandler, NodeOutcome};
    use crate::node::{Node, NodeKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct Noop(NodeKind);

    #[async_trait]
    impl NodeHandler for Noop {
        fn kind(&self) -> NodeKind {
            self.0.clone()
        }

        async fn execute(&self, _ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
            Ok(NodeOutcome::Completed(NodeOutput::pure(JsonValue::Null)))
        }
    }

    fn plan() -> ExecutionPlan {
        let registry = [NodeKind::Start, NodeKind::Http, NodeKind::End]
            .into_iter()
            .fold(HandlerRegistry::new(), |r, k| r.with(Arc::new(Noop(k))));
        let definition = WorkflowDefinition::new("wf", "linear")
            .with_node(Node::new("start", NodeKind::Start))
            .with_node(Node::new("fetch", NodeKind::Http))
            .with_node(Node::new("end", NodeKind::End))
            .with_edge(Edge::new("e1", "start", "fetch"))
            .with_edge(Edge::new("e2", "fetch", "end"));
        crate::validate::plan(&definition, &registry).expect("valid")
    }

    fn id(name: &str) -> NodeId {
        NodeId::from(name)
    }

    #[test]
    fn completed_nodes_publish_variables() {
        let plan = plan();
        let mut state = RunState::new(WorkflowRunId::new(), "wf".into(), json!({"q": 1}), &plan);
        assert_eq!(state.ready_nodes(), vec![id("start")]);

        state.mark_node_executing(&id("start"));
        assert!(state.frontier.contains(&id("start")));
        state.mark_node_completed(&id("start"), NodeOutput::pure(json!({"q": 1})), None);
        state.mark_node_executing(&id("fetch"));
        state.mark_node_completed(
            &id("fetch"),
            NodeOutput::with_side_effects(json!({"status": 200})),
            Some("response".to_string()),
        );

        assert!(state.frontier.is_empty());
        assert_eq!(state.variables["fetch"], json!({"status": 200}));
        assert_eq!(state.variables["response"], json!({"status": 200}));
        assert_eq!(state.variables[LAST_OUTPUT_VAR], json!({"status": 200}));
        assert_eq!(state.variables[INPUT_VAR], json!({"q": 1}));
        assert_eq!(state.ready_nodes(), vec![id("end")]);
    }

    #[test]
    fn checkpoint_restores_remaining_work() {
        let plan = plan();
        let mut state = RunState::new(WorkflowRunId::new(), "wf".into(), json!({}), &plan);
        state.mark_node_completed(&id("start"), NodeOutput::pure(json!({})), None);
        state.mark_node_executing(&id("fetch"));

        let bytes = serde_json::to_vec(&state).expect("serialize");
        let mut restored: RunState = serde_json::from_slice(&bytes).expect("deserialize");
        restored.attach_plan(&plan);

        assert!(restored.frontier.is_empty());
        assert_eq!(restored.ready_nodes(), vec![id("fetch")]);
        assert_eq!(restored.completed, state.completed);
    }

    #[test]
    fn suspension_blocks_until_taken() {
        let plan = plan();
        let mut state = RunState::new(WorkflowRunId::new(), "wf".into(), json!({}), &plan);
        state.mark_node_completed(&id("start"), NodeOutput::pure(json!({})), None);
        state.suspend_node(
            &id("fetch"),
            Suspension::Authorization {
                tool: "Gmail.ListEmails".to_string(),
                authorization_url: Some("https://auth.example".to_string()),
                continuation: None,
            },
        );

        assert!(state.ready_nodes().is_empty());
        assert_eq!(state.blocked_nodes(), vec![id("end")]);
        assert_eq!(state.suspended_status(), Some(RunStatus::AwaitingAuthorization));

        assert!(state.take_suspension(&id("fetch")).is_some());
        assert_eq!(state.suspended_status(), None);
        assert_eq!(state.ready_nodes(), vec![id("fetch")]);
        assert!(state.blocked_nodes().is_empty());
    }

    #[test]
    fn failed_nodes_can_be_reset() {
        let plan = plan();
        let mut state = RunState::new(WorkflowRunId::new(), "wf".into(), json!({}), &plan);
        state.mark_node_completed(&id("start"), NodeOutput::pure(json!({})), None);
        state.mark_node_failed(&id("fetch"), NodeError::transient("503"));
        assert!(state.ready_nodes().is_empty());
        state.fail("fetch failed");
        assert!(state.finished_at.is_some());

        let error = state.reset_failed_node(&id("fetch"));
        assert_eq!(error, Some(NodeError::transient("503")));
        assert!(!state.node_results.contains_key(&id("fetch")));
        assert_eq!(state.ready_nodes(), vec![id("fetch")]);
        assert!(state.reset_failed_node(&id("fetch")).is_none());
    }
}
