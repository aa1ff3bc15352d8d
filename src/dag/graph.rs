// src/dag/graph.rs

//! In-memory DAG of nodes plus dependency edges.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::dag::node::{Node, NodeSnapshot, NodeStatus, SkipCause};
use crate::dag::step::Step;
use crate::errors::{DagflowError, Result};
use crate::types::RunStatus;

/// Validated, executable DAG of nodes for one run.
///
/// Dependency semantics: a dependency is *satisfied* when it finished
/// `Success` or was `Skipped` by a failed precondition. A dependency that is
/// `Error`, `Cancelled`, or `Skipped` because of an upstream failure makes
/// the dependent unreachable; [`ExecutionGraph::ready_nodes`] marks it
/// `Skipped` (upstream failure) so the propagation is transitive and every
/// node ends in an explicit terminal state.
#[derive(Debug)]
pub struct ExecutionGraph {
    nodes: Vec<Arc<Node>>,
    by_name: HashMap<String, usize>,
    /// `deps[i]` holds the node indices `nodes[i]` depends on.
    deps: Vec<Vec<usize>>,
}

impl ExecutionGraph {
    /// Build a graph from step definitions, validating dependency names and
    /// acyclicity even when the definition already passed config validation
    /// (library callers can hand-build step lists).
    pub fn build(steps: &[Step]) -> Result<Self> {
        let nodes: Vec<Arc<Node>> = steps
            .iter()
            .enumerate()
            .map(|(id, step)| Arc::new(Node::new(step.clone(), id)))
            .collect();
        Self::assemble(nodes)
    }

    /// Rebuild a graph from persisted snapshots (retry re-attach).
    pub fn from_snapshots(snapshots: Vec<NodeSnapshot>) -> Result<Self> {
        let nodes: Vec<Arc<Node>> = snapshots
            .into_iter()
            .enumerate()
            .map(|(id, snap)| Arc::new(Node::from_snapshot(snap, id)))
            .collect();
        Self::assemble(nodes)
    }

    fn assemble(nodes: Vec<Arc<Node>>) -> Result<Self> {
        let mut by_name = HashMap::new();
        for node in nodes.iter() {
            if by_name.insert(node.name().to_string(), node.id()).is_some() {
                return Err(DagflowError::Config(format!(
                    "duplicate step name '{}'",
                    node.name()
                )));
            }
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for node in nodes.iter() {
            for dep in node.step().depends.iter() {
                match by_name.get(dep) {
                    Some(&dep_id) => deps[node.id()].push(dep_id),
                    None => {
                        return Err(DagflowError::UnknownDependency {
                            step: node.name().to_string(),
                            depends_on: dep.clone(),
                        });
                    }
                }
            }
        }

        let mut check: DiGraphMap<usize, ()> = DiGraphMap::new();
        for node in nodes.iter() {
            check.add_node(node.id());
        }
        for (id, node_deps) in deps.iter().enumerate() {
            for &dep_id in node_deps {
                check.add_edge(dep_id, id, ());
            }
        }
        if let Err(cycle) = toposort(&check, None) {
            let name = nodes[cycle.node_id()].name().to_string();
            return Err(DagflowError::Cycle(name));
        }

        Ok(Self {
            nodes,
            by_name,
            deps,
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.by_name.get(name).map(|&id| &self.nodes[id])
    }

    /// Nodes that may launch now: `NotStarted` with every dependency
    /// satisfied.
    ///
    /// As a side effect, nodes whose dependencies resolved to a failure are
    /// marked `Skipped` (upstream failure); calling this repeatedly drains
    /// the whole unreachable region because such skips count as failed
    /// dependencies for their own dependents.
    pub fn ready_nodes(&self) -> Vec<Arc<Node>> {
        let mut ready = Vec::new();
        let mut changed = true;

        while changed {
            changed = false;
            ready.clear();

            for node in self.nodes.iter() {
                if node.status() != NodeStatus::NotStarted {
                    continue;
                }

                match self.dependency_resolution(node.id()) {
                    DepResolution::Satisfied => ready.push(Arc::clone(node)),
                    DepResolution::Pending => {}
                    DepResolution::Failed(upstream) => {
                        debug!(
                            step = %node.name(),
                            upstream = %upstream,
                            "upstream resolved to a failure; skipping step"
                        );
                        node.set_skipped(
                            SkipCause::UpstreamFailure,
                            format!("upstream '{upstream}' did not succeed"),
                        );
                        changed = true;
                    }
                }
            }
        }

        ready
    }

    fn dependency_resolution(&self, id: usize) -> DepResolution {
        for &dep_id in self.deps[id].iter() {
            let dep = &self.nodes[dep_id];
            match dep.status() {
                NodeStatus::Success => {}
                NodeStatus::Skipped => {
                    if dep.skip_cause() == Some(SkipCause::UpstreamFailure) {
                        return DepResolution::Failed(dep.name().to_string());
                    }
                }
                NodeStatus::Error | NodeStatus::Cancelled => {
                    return DepResolution::Failed(dep.name().to_string());
                }
                NodeStatus::NotStarted | NodeStatus::Running => {
                    return DepResolution::Pending;
                }
            }
        }
        DepResolution::Satisfied
    }

    /// True when no node is `Running` and none can still become ready.
    pub fn is_finished(&self) -> bool {
        self.nodes.iter().all(|n| n.status().is_terminal())
    }

    pub fn running_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.status() == NodeStatus::Running)
            .count()
    }

    /// Aggregate the run outcome from terminal node statuses.
    ///
    /// `cancelled` reflects an observed operator cancellation, which
    /// overrides in-flight node results unless every node still succeeded.
    pub fn outcome(&self, cancelled: bool) -> RunStatus {
        let mut successes = 0usize;
        let mut precondition_skips = 0usize;
        let mut errors = 0usize;
        let mut cancels = 0usize;

        for node in self.nodes.iter() {
            match node.status() {
                NodeStatus::Success => successes += 1,
                NodeStatus::Error => errors += 1,
                NodeStatus::Cancelled => cancels += 1,
                NodeStatus::Skipped => {
                    if node.skip_cause() == Some(SkipCause::Precondition) {
                        precondition_skips += 1;
                    }
                    // Upstream-failure skips always coexist with an error or
                    // a cancellation; they never decide the outcome alone.
                }
                NodeStatus::NotStarted | NodeStatus::Running => {}
            }
        }

        let all_succeeded = successes + precondition_skips == self.nodes.len();
        if cancelled && !all_succeeded {
            return RunStatus::Cancelled;
        }
        if errors > 0 {
            return RunStatus::Error;
        }
        if cancels > 0 {
            return RunStatus::Cancelled;
        }
        if precondition_skips > 0 && successes > 0 {
            return RunStatus::PartialSuccess;
        }
        RunStatus::Success
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(|n| n.snapshot()).collect()
    }
}

#[derive(Debug)]
enum DepResolution {
    Satisfied,
    Pending,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, depends: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            command: format!("echo {name}"),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            retry: None,
            repeat: None,
            preconditions: Vec::new(),
        }
    }

    #[test]
    fn build_rejects_unknown_dependency() {
        let err = ExecutionGraph::build(&[step("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, DagflowError::UnknownDependency { .. }));
    }

    #[test]
    fn build_rejects_cycle() {
        let steps = [step("a", &["b"]), step("b", &["a"])];
        let err = ExecutionGraph::build(&steps).unwrap_err();
        assert!(matches!(err, DagflowError::Cycle(_)));
    }

    #[test]
    fn roots_are_ready_first() {
        let steps = [step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let graph = ExecutionGraph::build(&steps).unwrap();

        let ready: Vec<String> = graph
            .ready_nodes()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(ready, vec!["a".to_string()]);
    }

    #[test]
    fn upstream_failure_skips_whole_chain() {
        let steps = [step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let graph = ExecutionGraph::build(&steps).unwrap();

        let a = graph.node_by_name("a").unwrap();
        a.set_running();
        a.set_error("exit 1", Some(1));

        assert!(graph.ready_nodes().is_empty());
        assert_eq!(
            graph.node_by_name("b").unwrap().status(),
            NodeStatus::Skipped
        );
        assert_eq!(
            graph.node_by_name("c").unwrap().status(),
            NodeStatus::Skipped
        );
        assert!(graph.is_finished());
        assert_eq!(graph.outcome(false), RunStatus::Error);
    }

    #[test]
    fn precondition_skip_satisfies_dependents() {
        let steps = [step("a", &[]), step("b", &["a"])];
        let graph = ExecutionGraph::build(&steps).unwrap();

        let a = graph.node_by_name("a").unwrap();
        a.set_skipped(SkipCause::Precondition, "condition unmet");

        let ready: Vec<String> = graph
            .ready_nodes()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(ready, vec!["b".to_string()]);
    }

    #[test]
    fn mixed_success_and_precondition_skip_is_partial() {
        let steps = [step("a", &[]), step("b", &[])];
        let graph = ExecutionGraph::build(&steps).unwrap();

        graph.node_by_name("a").unwrap().set_success();
        graph
            .node_by_name("b")
            .unwrap()
            .set_skipped(SkipCause::Precondition, "condition unmet");

        assert_eq!(graph.outcome(false), RunStatus::PartialSuccess);
    }

    #[test]
    fn cancellation_overrides_partial_results() {
        let steps = [step("a", &[]), step("b", &[])];
        let graph = ExecutionGraph::build(&steps).unwrap();

        graph.node_by_name("a").unwrap().set_success();
        graph.node_by_name("b").unwrap().set_cancelled();

        assert_eq!(graph.outcome(true), RunStatus::Cancelled);
    }

    #[test]
    fn all_success_aggregates_to_success() {
        let steps = [step("a", &[]), step("b", &["a"])];
        let graph = ExecutionGraph::build(&steps).unwrap();

        graph.node_by_name("a").unwrap().set_success();
        graph.node_by_name("b").unwrap().set_success();

        assert_eq!(graph.outcome(false), RunStatus::Success);
    }
}
