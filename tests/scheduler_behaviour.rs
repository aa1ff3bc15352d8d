//! Scheduler behaviour: ordering, cascades, ceilings, retry, repeat,
//! cancellation, and lifecycle hooks, all against the fake runner.

mod common;

use std::time::Duration;

use dagflow::dag::NodeStatus;
use dagflow::engine::execute::execute_record;
use dagflow::engine::operations;
use dagflow::types::RunStatus;
use dagflow_test_utils::builders::{DagBuilder, StepBuilder};
use dagflow_test_utils::with_timeout;

use common::{create_run, harness};

#[tokio::test]
async fn linear_chain_runs_in_dependency_order() {
    let h = harness();
    let dag = DagBuilder::new("chain")
        .step("a", StepBuilder::new("run-a").build())
        .step("b", StepBuilder::new("run-b").depends("a").build())
        .step("c", StepBuilder::new("run-c").depends("b").build())
        .build();
    let record = create_run(&h, &dag, "r1");

    let final_record = with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    assert_eq!(final_record.status, RunStatus::Success);
    assert_eq!(h.runner.executions(), vec!["a", "b", "c"]);
    for node in final_record.nodes.iter() {
        assert_eq!(node.status, NodeStatus::Success);
        assert!(node.started_at.is_some());
        assert!(node.finished_at.is_some());
    }
}

#[tokio::test]
async fn failure_skips_downstream_and_fires_failure_hooks_once() {
    let h = harness();
    let dag = DagBuilder::new("cascade")
        .on_success("notify-success")
        .on_failure("notify-failure")
        .on_exit("cleanup")
        .step("a", StepBuilder::new("run-a").build())
        .step("b", StepBuilder::new("run-b").depends("a").build())
        .step("c", StepBuilder::new("run-c").depends("b").build())
        .build();
    h.runner.script("a", &[1]);
    let record = create_run(&h, &dag, "r1");

    let final_record = with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    assert_eq!(final_record.status, RunStatus::Error);
    assert_eq!(final_record.node("a").unwrap().status, NodeStatus::Error);
    assert_eq!(final_record.node("b").unwrap().status, NodeStatus::Skipped);
    assert_eq!(final_record.node("c").unwrap().status, NodeStatus::Skipped);

    assert_eq!(h.runner.execution_count("on_failure"), 1);
    assert_eq!(h.runner.execution_count("on_exit"), 1);
    assert_eq!(h.runner.execution_count("on_success"), 0);
    assert_eq!(h.runner.execution_count("b"), 0);
    assert_eq!(h.runner.execution_count("c"), 0);
}

#[tokio::test]
async fn success_hook_fires_on_success() {
    let h = harness();
    let dag = DagBuilder::new("hooked")
        .on_success("notify-success")
        .on_exit("cleanup")
        .step("a", StepBuilder::new("run-a").build())
        .build();
    let record = create_run(&h, &dag, "r1");

    let final_record = with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    assert_eq!(final_record.status, RunStatus::Success);
    assert_eq!(h.runner.execution_count("on_success"), 1);
    assert_eq!(h.runner.execution_count("on_exit"), 1);
    assert_eq!(final_record.hook_nodes.len(), 2);
}

#[tokio::test]
async fn step_ceiling_is_never_exceeded() {
    let h = harness();
    let mut builder = DagBuilder::new("wide").max_active_steps(2);
    for name in ["s1", "s2", "s3", "s4", "s5"] {
        builder = builder.step(name, StepBuilder::new("run").build());
    }
    let dag = builder.build();
    let record = create_run(&h, &dag, "r1");

    let final_record = with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    assert_eq!(final_record.status, RunStatus::Success);
    assert_eq!(h.runner.executions().len(), 5);
    assert!(
        h.runner.max_observed_concurrency() <= 2,
        "observed {} concurrent executions with a ceiling of 2",
        h.runner.max_observed_concurrency()
    );
}

#[tokio::test]
async fn exhausted_retries_make_exactly_max_plus_one_attempts() {
    let h = harness();
    let dag = DagBuilder::new("retrying")
        .step("flaky", StepBuilder::new("run").retry(3, 1).build())
        .build();
    h.runner.script("flaky", &[1]);
    let record = create_run(&h, &dag, "r1");

    let final_record = with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    assert_eq!(final_record.status, RunStatus::Error);
    let node = final_record.node("flaky").unwrap();
    assert_eq!(node.status, NodeStatus::Error);
    assert_eq!(node.retry_count, 3);
    assert_eq!(h.runner.execution_count("flaky"), 4);
}

#[tokio::test]
async fn retry_succeeds_midway_and_stops_retrying() {
    let h = harness();
    let dag = DagBuilder::new("recovering")
        .step("flaky", StepBuilder::new("run").retry(3, 1).build())
        .build();
    h.runner.script("flaky", &[1, 1, 0]);
    let record = create_run(&h, &dag, "r1");

    let final_record = with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    assert_eq!(final_record.status, RunStatus::Success);
    assert_eq!(h.runner.execution_count("flaky"), 3);
    assert_eq!(final_record.node("flaky").unwrap().retry_count, 2);
}

#[tokio::test]
async fn repeat_policy_runs_to_its_limit() {
    let h = harness();
    let dag = DagBuilder::new("repeating")
        .step("beat", StepBuilder::new("run").repeat(1, Some(3)).build())
        .build();
    let record = create_run(&h, &dag, "r1");

    let final_record = with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    assert_eq!(final_record.status, RunStatus::Success);
    assert_eq!(h.runner.execution_count("beat"), 3);
    assert_eq!(final_record.node("beat").unwrap().done_count, 3);
}

#[tokio::test]
async fn precondition_failure_skips_step_but_not_dependents() {
    let h = harness();
    let dag = DagBuilder::new("gated")
        .step(
            "gate",
            StepBuilder::new("run")
                .precondition("$DAGFLOW_NO_SUCH_VARIABLE", "set")
                .build(),
        )
        .step("after", StepBuilder::new("run").depends("gate").build())
        .build();
    let record = create_run(&h, &dag, "r1");

    let final_record = with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    assert_eq!(final_record.node("gate").unwrap().status, NodeStatus::Skipped);
    assert_eq!(final_record.node("after").unwrap().status, NodeStatus::Success);
    assert_eq!(final_record.status, RunStatus::PartialSuccess);
    assert_eq!(h.runner.execution_count("gate"), 0);
    assert_eq!(h.runner.execution_count("after"), 1);
}

#[tokio::test]
async fn stop_cancels_running_step_and_fires_cancel_hook() {
    let h = harness();
    let dag = DagBuilder::new("stoppable")
        .on_cancel("notify-cancel")
        .on_exit("cleanup")
        .step("block", StepBuilder::new("run").build())
        .step("after", StepBuilder::new("run").depends("block").build())
        .build();
    h.runner.hang("block");
    let record = create_run(&h, &dag, "r1");
    let dag_run = record.dag_run.clone();

    let ctx = h.ctx.clone();
    let execution = tokio::spawn(async move { execute_record(&ctx, record).await });

    // Wait until the run is visibly Running, then stop it.
    with_timeout(async {
        loop {
            if let Ok(latest) = h.ctx.store.read_latest(&dag_run) {
                if latest.status == RunStatus::Running {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    operations::stop(&h.ctx, &dag_run).unwrap();

    let final_record = with_timeout(execution).await.unwrap().unwrap();

    assert_eq!(final_record.status, RunStatus::Cancelled);
    assert_eq!(final_record.node("block").unwrap().status, NodeStatus::Cancelled);
    // The dependent never entered Running.
    assert_eq!(h.runner.execution_count("after"), 0);
    assert_eq!(h.runner.execution_count("on_cancel"), 1);
    assert_eq!(h.runner.execution_count("on_exit"), 1);
}

#[tokio::test]
async fn failing_exit_hook_turns_success_into_error() {
    let h = harness();
    let dag = DagBuilder::new("hook-fails")
        .on_exit("cleanup")
        .step("a", StepBuilder::new("run").build())
        .build();
    h.runner.script("on_exit", &[1]);
    let record = create_run(&h, &dag, "r1");

    let final_record = with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    assert_eq!(final_record.status, RunStatus::Error);
    assert_eq!(final_record.hook_nodes[0].status, NodeStatus::Error);
    assert_eq!(final_record.node("a").unwrap().status, NodeStatus::Success);
}

#[tokio::test]
async fn every_transition_is_persisted_in_order() {
    let h = harness();
    let dag = DagBuilder::new("audited")
        .step("flaky", StepBuilder::new("run").retry(1, 1).build())
        .build();
    h.runner.script("flaky", &[1, 0]);
    let record = create_run(&h, &dag, "r1");
    let dag_run = record.dag_run.clone();

    with_timeout(execute_record(&h.ctx, record)).await.unwrap();

    // History holds the full transition sequence for the node:
    // not_started -> running -> error (retrying) -> running -> success.
    let history = h.ctx.history_statuses(&dag_run);
    assert_eq!(
        history,
        vec![
            NodeStatus::NotStarted,
            NodeStatus::Running,
            NodeStatus::Error,
            NodeStatus::Running,
            NodeStatus::Success,
        ]
    );
}

trait HistoryExt {
    fn history_statuses(&self, dag_run: &dagflow::types::DagRunRef) -> Vec<NodeStatus>;
}

impl HistoryExt for dagflow::engine::EngineContext {
    /// Distinct per-snapshot statuses of the single node of a run, in
    /// append order.
    fn history_statuses(&self, dag_run: &dagflow::types::DagRunRef) -> Vec<NodeStatus> {
        let dir = self.store.run_dir(dag_run).unwrap();
        let contents = std::fs::read_to_string(dir.join("status.jsonl")).unwrap();
        let mut statuses = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let record: dagflow::store::RunRecord = serde_json::from_str(line).unwrap();
            let status = record.nodes[0].status;
            if statuses.last() != Some(&status) {
                statuses.push(status);
            }
        }
        statuses
    }
}
