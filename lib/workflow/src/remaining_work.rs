//! Remaining work graph for workflow execution.
//!
//! Scheduling works on a shrinking copy of the workflow graph:
//! - Completed and skipped nodes are removed
//! - Failed and suspended nodes get a self-edge (never ready, block downstream)
//! - Nodes with 0 incoming edges that are not executing are ready
//! - Nodes downstream of a failed or suspended node are blocked

use crate::validate::ExecutionPlan;
use flowrun_core::NodeId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeSet, HashMap, HashSet};

/// The remaining work graph tracks which nodes still need to execute.
#[derive(Debug, Clone, Default)]
pub struct RemainingWorkGraph {
    /// Node weights are node ids, edges are dependencies.
    graph: DiGraph<NodeId, ()>,
    /// Map from node id to graph index.
    node_to_index: HashMap<NodeId, NodeIndex>,
    /// Nodes currently executing.
    executing: HashSet<NodeId>,
    /// Nodes that failed (self-edge, block downstream).
    failed: HashSet<NodeId>,
    /// Nodes waiting on approval or authorization (self-edge, block downstream).
    parked: HashSet<NodeId>,
}

impl RemainingWorkGraph {
    /// Creates a graph from node ids and `(source, target)` dependencies.
    ///
    /// Dependencies naming unknown nodes are ignored.
    #[must_use]
    pub fn new<'a>(
        nodes: impl IntoIterator<Item = &'a NodeId>,
        dependencies: impl IntoIterator<Item = (&'a NodeId, &'a NodeId)>,
    ) -> Self {
        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();
        for node in nodes {
            let idx = graph.add_node(node.clone());
            node_to_index.insert(node.clone(), idx);
        }
        for (source, target) in dependencies {
            if let (Some(&s), Some(&t)) = (node_to_index.get(source), node_to_index.get(target)) {
                graph.add_edge(s, t, ());
            }
        }
        Self {
            graph,
            node_to_index,
            executing: HashSet::new(),
            failed: HashSet::new(),
            parked: HashSet::new(),
        }
    }

    /// Creates the initial graph for a plan: every node pending.
    #[must_use]
    pub fn from_plan(plan: &ExecutionPlan) -> Self {
        Self::new(plan.order(), plan.dependencies())
    }

    /// Marks a node as currently executing.
    pub fn mark_executing(&mut self, node_id: &NodeId) {
        if self.node_to_index.contains_key(node_id) {
            self.executing.insert(node_id.clone());
        }
    }

    /// Marks a node as completed and removes it from the graph.
    ///
    /// This unblocks downstream nodes that were waiting for this node.
    pub fn mark_completed(&mut self, node_id: &NodeId) {
        self.executing.remove(node_id);
        self.failed.remove(node_id);
        self.parked.remove(node_id);
        if let Some(idx) = self.node_to_index.remove(node_id) {
            self.graph.remove_node(idx);
            // removal swaps the last node into `idx`
            self.rebuild_index_map();
        }
    }

    /// Marks a node as failed. Its self-edge keeps it and everything
    /// downstream from becoming ready.
    pub fn mark_failed(&mut self, node_id: &NodeId) {
        self.executing.remove(node_id);
        if self.block(node_id) {
            self.failed.insert(node_id.clone());
        }
    }

    /// Marks a node as waiting on outside input. Blocks like a failure.
    pub fn mark_parked(&mut self, node_id: &NodeId) {
        self.executing.remove(node_id);
        if self.block(node_id) {
            self.parked.insert(node_id.clone());
        }
    }

    /// Makes a failed or parked node schedulable again.
    pub fn release(&mut self, node_id: &NodeId) {
        self.failed.remove(node_id);
        self.parked.remove(node_id);
        if let Some(&idx) = self.node_to_index.get(node_id)
            && let Some(edge) = self.graph.find_edge(idx, idx)
        {
            self.graph.remove_edge(edge);
        }
    }

    /// Marks a node as skipped and removes it from the graph.
    ///
    /// Skipped nodes unblock downstream like completed nodes; whether the
    /// downstream nodes run is decided by their incoming edges.
    pub fn mark_skipped(&mut self, node_id: &NodeId) {
        self.mark_completed(node_id);
    }

    fn block(&mut self, node_id: &NodeId) -> bool {
        let Some(&idx) = self.node_to_index.get(node_id) else {
            return false;
        };
        if self.graph.find_edge(idx, idx).is_none() {
            self.graph.add_edge(idx, idx, ());
        }
        true
    }

    /// Returns nodes that are ready to execute (no pending predecessors and
    /// not already executing).
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Incoming).count() == 0)
            .filter_map(|idx| {
                let node_id = self.graph.node_weight(idx)?;
                if self.executing.contains(node_id) {
                    return None;
                }
                Some(node_id.clone())
            })
            .collect()
    }

    /// Returns all nodes downstream of a failed or parked node, sorted.
    #[must_use]
    pub fn blocked_nodes(&self) -> Vec<NodeId> {
        let mut blocked = BTreeSet::new();

        for blocker in self.failed.iter().chain(&self.parked) {
            let Some(&start_idx) = self.node_to_index.get(blocker) else {
                continue;
            };
            let mut to_visit = vec![start_idx];
            while let Some(idx) = to_visit.pop() {
                for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                    let target_idx = edge.target();
                    if target_idx == idx {
                        continue;
                    }
                    if let Some(target_id) = self.graph.node_weight(target_idx)
                        && !self.failed.contains(target_id)
                        && !self.parked.contains(target_id)
                        && blocked.insert(target_id.clone())
                    {
                        to_visit.push(target_idx);
                    }
                }
            }
        }

        blocked.into_iter().collect()
    }

    fn rebuild_index_map(&mut self) {
        self.node_to_index.clear();
        for idx in self.graph.node_indices() {
            if let Some(node_id) = self.graph.node_weight(idx) {
                self.node_to_index.insert(node_id.clone(), idx);
            }
        }
    }
}
