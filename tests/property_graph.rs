//! Property tests over randomly generated dependency graphs.

use std::collections::HashSet;

use proptest::prelude::*;

use dagflow::dag::{ExecutionGraph, NodeStatus, Step};
use dagflow::errors::DagflowError;

/// Random acyclic step lists: step N may only depend on steps 0..N.
fn acyclic_steps_strategy(max_steps: usize) -> impl Strategy<Value = Vec<Step>> {
    (1..=max_steps).prop_flat_map(|num_steps| {
        proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_steps),
            num_steps,
        )
        .prop_map(move |raw_deps| {
            raw_deps
                .into_iter()
                .enumerate()
                .map(|(i, potential)| {
                    let mut deps = HashSet::new();
                    for d in potential {
                        if i > 0 {
                            deps.insert(d % i);
                        }
                    }
                    Step {
                        name: format!("step_{i}"),
                        command: format!("echo step_{i}"),
                        depends: deps.into_iter().map(|d| format!("step_{d}")).collect(),
                        retry: None,
                        repeat: None,
                        preconditions: Vec::new(),
                    }
                })
                .collect()
        })
    })
}

proptest! {
    /// Acyclic definitions always build.
    #[test]
    fn acyclic_graphs_build(steps in acyclic_steps_strategy(10)) {
        prop_assert!(ExecutionGraph::build(&steps).is_ok());
    }

    /// Adding one back edge to a chain always produces a cycle error.
    #[test]
    fn back_edge_fails_with_cycle(len in 2..8usize, from in 1..8usize, to in 0..8usize) {
        let from = from.min(len - 1).max(1);
        let to = to % from; // to < from, so the back edge closes a cycle

        let mut steps: Vec<Step> = (0..len)
            .map(|i| Step {
                name: format!("step_{i}"),
                command: "echo".to_string(),
                depends: if i == 0 { vec![] } else { vec![format!("step_{}", i - 1)] },
                retry: None,
                repeat: None,
                preconditions: Vec::new(),
            })
            .collect();
        steps[to].depends.push(format!("step_{from}"));

        let err = ExecutionGraph::build(&steps).unwrap_err();
        prop_assert!(matches!(err, DagflowError::Cycle(_)));
    }

    /// Across any interleaving of completions, a node only starts after
    /// every dependency succeeded, and the simulation always drains to a
    /// fully terminal graph with a consistent outcome.
    #[test]
    fn nodes_only_start_after_their_dependencies(
        steps in acyclic_steps_strategy(10),
        failing in proptest::collection::vec(0..10usize, 0..4),
        pick_order in proptest::collection::vec(any::<usize>(), 0..128),
    ) {
        let graph = ExecutionGraph::build(&steps).unwrap();
        let failing: HashSet<String> = failing
            .iter()
            .filter(|&&i| i < steps.len())
            .map(|&i| format!("step_{i}"))
            .collect();

        let mut executing = Vec::new();
        let mut picks = pick_order.into_iter();
        let mut failed_ran = false;
        let mut iterations = 0;

        loop {
            iterations += 1;
            prop_assert!(iterations < 1000, "simulation did not terminate");

            for node in graph.ready_nodes() {
                // The scheduling invariant: every dependency is terminal
                // and successful at the moment the node starts.
                for dep in node.step().depends.iter() {
                    let dep_node = graph.node_by_name(dep).unwrap();
                    prop_assert_eq!(
                        dep_node.status(),
                        NodeStatus::Success,
                        "node {} started before dependency {} succeeded",
                        node.name(),
                        dep
                    );
                }
                node.set_running();
                executing.push(node);
            }

            if executing.is_empty() {
                break;
            }

            let index = picks.next().unwrap_or(0) % executing.len();
            let node = executing.remove(index);
            if failing.contains(node.name()) {
                failed_ran = true;
                node.set_error("exit code 1", Some(1));
            } else {
                node.set_success();
            }
        }

        prop_assert!(graph.is_finished(), "graph not terminal after simulation");
        for node in graph.nodes() {
            prop_assert!(node.status().is_terminal());
        }

        let outcome = graph.outcome(false);
        if failed_ran {
            prop_assert_eq!(outcome, dagflow::types::RunStatus::Error);
        } else {
            prop_assert_eq!(outcome, dagflow::types::RunStatus::Success);
        }
    }
}
