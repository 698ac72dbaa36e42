//! Arena representation of a workflow DAG and join resolution.
//!
//! Nodes live in a flat table indexed by position; edges are adjacency lists
//! of indices. Runtime progress is not stored here: readiness is computed
//! from a [`CheckpointState`], so the same graph serves every execution of a
//! workflow and a resumed execution recomputes exactly the frontier it had.

use std::collections::HashMap;

use flowline_types::execution::{CheckpointState, NodeStatus};
use flowline_types::workflow::{JoinPolicy, NodeDefinition, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;

/// Liveness of one dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    /// Predecessor has not finished.
    Pending,
    /// Predecessor succeeded and routed to this node.
    Live,
    /// Predecessor was skipped, failed, or routed elsewhere.
    Dead,
}

/// Whether a not-yet-dispatched node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Blocked,
    Ready,
    /// The join can no longer be satisfied; the node is skipped.
    Unreachable,
}

/// Result of one frontier computation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Advance {
    pub ready: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<NodeDefinition>,
    index: HashMap<String, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl WorkflowGraph {
    /// Build the arena, rejecting unknown dependencies and cycles.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        let nodes = def.nodes.clone();
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut successors = vec![Vec::new(); nodes.len()];
        let mut predecessors = vec![Vec::new(); nodes.len()];
        let mut graph = DiGraph::<usize, ()>::new();
        let graph_idx: Vec<_> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();

        for (to, node) in nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let from = *index.get(dep.as_str()).ok_or_else(|| {
                    WorkflowError::UnknownDependency(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id, dep
                    ))
                })?;
                if !predecessors[to].contains(&from) {
                    predecessors[to].push(from);
                    successors[from].push(to);
                    graph.add_edge(graph_idx[from], graph_idx[to], ());
                }
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let node_id = &nodes[graph[cycle.node_id()]].id;
            WorkflowError::CycleDetected(format!("cycle detected involving node '{node_id}'"))
        })?;
        let order = sorted.into_iter().map(|idx| graph[idx]).collect();

        Ok(Self {
            nodes,
            index,
            successors,
            predecessors,
            order,
        })
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.order.iter().map(|&i| &self.nodes[i])
    }

    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .filter(|&&i| self.predecessors[i].is_empty())
            .map(|&i| self.nodes[i].id.as_str())
    }

    pub fn predecessors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.index
            .get(id)
            .into_iter()
            .flat_map(|&i| self.predecessors[i].iter())
            .map(|&p| self.nodes[p].id.as_str())
    }

    pub fn successors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.index
            .get(id)
            .into_iter()
            .flat_map(|&i| self.successors[i].iter())
            .map(|&s| self.nodes[s].id.as_str())
    }

    /// A node with more than one predecessor.
    pub fn is_join(&self, id: &str) -> bool {
        self.index
            .get(id)
            .is_some_and(|&i| self.predecessors[i].len() > 1)
    }

    fn status(&self, state: &CheckpointState, i: usize) -> NodeStatus {
        state
            .node_status
            .get(&self.nodes[i].id)
            .copied()
            .unwrap_or(NodeStatus::Pending)
    }

    fn edge_state(&self, state: &CheckpointState, from: usize, to: usize) -> EdgeState {
        match self.status(state, from) {
            NodeStatus::Succeeded => {
                let routed_away = state
                    .routes
                    .get(&self.nodes[from].id)
                    .is_some_and(|branches| !branches.contains(&self.nodes[to].id));
                if routed_away {
                    EdgeState::Dead
                } else {
                    EdgeState::Live
                }
            }
            NodeStatus::Skipped | NodeStatus::Failed => EdgeState::Dead,
            NodeStatus::Pending | NodeStatus::Running => EdgeState::Pending,
        }
    }

    /// Evaluate a node's join policy against its in-edges.
    pub fn readiness(&self, state: &CheckpointState, id: &str) -> Readiness {
        let Some(&i) = self.index.get(id) else {
            return Readiness::Blocked;
        };
        let preds = &self.predecessors[i];
        if preds.is_empty() {
            return Readiness::Ready;
        }

        let edges: Vec<EdgeState> = preds.iter().map(|&p| self.edge_state(state, p, i)).collect();
        match self.nodes[i].join {
            JoinPolicy::All => {
                if edges.contains(&EdgeState::Dead) {
                    Readiness::Unreachable
                } else if edges.iter().all(|e| *e == EdgeState::Live) {
                    Readiness::Ready
                } else {
                    Readiness::Blocked
                }
            }
            JoinPolicy::Any => {
                if edges.contains(&EdgeState::Live) {
                    Readiness::Ready
                } else if edges.iter().all(|e| *e == EdgeState::Dead) {
                    Readiness::Unreachable
                } else {
                    Readiness::Blocked
                }
            }
        }
    }

    /// Compute the dispatch frontier, marking unreachable nodes skipped in
    /// `state`. Skips cascade within one call because nodes are visited in
    /// topological order.
    pub fn advance(&self, state: &mut CheckpointState) -> Advance {
        let mut advance = Advance::default();
        for &i in &self.order {
            if self.status(state, i) != NodeStatus::Pending {
                continue;
            }
            let id = &self.nodes[i].id;
            match self.readiness(state, id) {
                Readiness::Ready => advance.ready.push(id.clone()),
                Readiness::Unreachable => {
                    state.node_status.insert(id.clone(), NodeStatus::Skipped);
                    advance.skipped.push(id.clone());
                }
                Readiness::Blocked => {}
            }
        }
        advance
    }

    /// Every node terminal and none failed.
    pub fn is_complete(&self, state: &CheckpointState) -> bool {
        (0..self.nodes.len()).all(|i| {
            matches!(
                self.status(state, i),
                NodeStatus::Succeeded | NodeStatus::Skipped
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, deps: &[&str], join: JoinPolicy) -> NodeDefinition {
        serde_json::from_value(json!({
            "id": id,
            "type": "noop",
            "depends_on": deps,
            "join": join,
        }))
        .unwrap()
    }

    fn workflow(nodes: Vec<NodeDefinition>) -> WorkflowDefinition {
        let mut def: WorkflowDefinition =
            serde_json::from_value(json!({"id": "wf", "name": "wf", "nodes": []})).unwrap();
        def.nodes = nodes;
        def
    }

    fn succeed(state: &mut CheckpointState, id: &str) {
        state.node_status.insert(id.to_string(), NodeStatus::Succeeded);
    }

    /// a -> (b, c) -> d
    fn diamond(join: JoinPolicy) -> WorkflowGraph {
        WorkflowGraph::build(&workflow(vec![
            node("d", &["b", "c"], join),
            node("b", &["a"], JoinPolicy::All),
            node("c", &["a"], JoinPolicy::All),
            node("a", &[], JoinPolicy::All),
        ]))
        .unwrap()
    }

    #[test]
    fn topological_order_and_shape() {
        let graph = diamond(JoinPolicy::All);
        let order: Vec<_> = graph.nodes().map(|n| n.id.as_str()).collect();
        let pos = |id| order.iter().position(|n| *n == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("c") < pos("d"));
        assert_eq!(graph.roots().collect::<Vec<_>>(), vec!["a"]);
        assert!(graph.is_join("d"));
        assert!(!graph.is_join("b"));
        assert_eq!(graph.successors("a").count(), 2);
    }

    #[test]
    fn all_join_waits_for_every_predecessor() {
        let graph = diamond(JoinPolicy::All);
        let mut state = CheckpointState::default();
        assert_eq!(graph.advance(&mut state).ready, vec!["a"]);

        succeed(&mut state, "a");
        let mut ready = graph.advance(&mut state).ready;
        ready.sort();
        assert_eq!(ready, vec!["b", "c"]);

        succeed(&mut state, "b");
        state.node_status.insert("c".into(), NodeStatus::Running);
        assert!(graph.advance(&mut state).ready.is_empty());

        succeed(&mut state, "c");
        assert_eq!(graph.advance(&mut state).ready, vec!["d"]);
    }

    #[test]
    fn any_join_fires_on_first_live_edge() {
        let graph = diamond(JoinPolicy::Any);
        let mut state = CheckpointState::default();
        succeed(&mut state, "a");
        succeed(&mut state, "b");
        state.node_status.insert("c".into(), NodeStatus::Running);
        assert_eq!(graph.advance(&mut state).ready, vec!["d"]);
    }

    #[test]
    fn routing_skips_dead_branch_and_cascades() {
        // a routes only to b; c is skipped; all-of d becomes unreachable.
        let graph = diamond(JoinPolicy::All);
        let mut state = CheckpointState::default();
        succeed(&mut state, "a");
        state.routes.insert("a".into(), vec!["b".into()]);

        let advance = graph.advance(&mut state);
        assert_eq!(advance.ready, vec!["b"]);
        assert_eq!(advance.skipped, vec!["c", "d"]);
        assert_eq!(graph.readiness(&state, "d"), Readiness::Unreachable);

        succeed(&mut state, "b");
        assert_eq!(graph.advance(&mut state), Advance::default());
        assert!(graph.is_complete(&state));
    }

    #[test]
    fn any_join_survives_one_dead_branch() {
        let graph = diamond(JoinPolicy::Any);
        let mut state = CheckpointState::default();
        succeed(&mut state, "a");
        state.routes.insert("a".into(), vec!["c".into()]);
        graph.advance(&mut state);
        succeed(&mut state, "c");
        assert_eq!(graph.advance(&mut state).ready, vec!["d"]);
    }

    #[test]
    fn failed_node_blocks_completion() {
        let graph = diamond(JoinPolicy::All);
        let mut state = CheckpointState::default();
        succeed(&mut state, "a");
        state.node_status.insert("b".into(), NodeStatus::Failed);
        succeed(&mut state, "c");
        graph.advance(&mut state);
        assert_eq!(state.node_status["d"], NodeStatus::Skipped);
        assert!(!graph.is_complete(&state));
    }
}
