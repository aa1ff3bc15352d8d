//! Engine operation contracts: start/admission, stop, retry, reschedule,
//! dequeue, suspend, mark, and the status read surface.

mod common;

use std::time::Duration;

use dagflow::dag::NodeStatus;
use dagflow::engine::{Action, ActionOutput, MarkStatus, dispatch, operations};
use dagflow::errors::DagflowError;
use dagflow::types::{DagRunRef, RunStatus};
use dagflow_test_utils::{with_timeout, write_dag_toml};

use common::{dags_dir, harness};

const SIMPLE_DAG: &str = r#"
[step.a]
command = "run-a"

[step.b]
command = "run-b"
depends = ["a"]
"#;

#[tokio::test]
async fn start_runs_to_success_and_is_queryable() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);

    let output = with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "etl".to_string(),
            params: None,
            run_id: Some("r1".to_string()),
        },
    ))
    .await
    .unwrap();

    let ActionOutput::Started(record) = output else {
        panic!("expected Started output");
    };
    assert_eq!(record.status, RunStatus::Success);

    let by_ref = operations::status_by_run(&h.ctx, &DagRunRef::new("etl", "r1")).unwrap();
    assert_eq!(by_ref.status, RunStatus::Success);

    let latest = operations::latest_status(&h.ctx, "etl").unwrap().unwrap();
    assert_eq!(latest.dag_run.run_id, "r1");
}

#[tokio::test]
async fn start_unknown_dag_is_rejected_before_any_mutation() {
    let h = harness();
    let err = with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "ghost".to_string(),
            params: None,
            run_id: None,
        },
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, DagflowError::DagNotFound(_)));
    assert!(operations::latest_status(&h.ctx, "ghost").unwrap().is_none());
}

#[tokio::test]
async fn start_with_finished_run_id_is_idempotent() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);

    let start = Action::Start {
        dag: "etl".to_string(),
        params: None,
        run_id: Some("r1".to_string()),
    };
    with_timeout(dispatch(&h.ctx, start.clone())).await.unwrap();
    let executions_after_first = h.runner.executions().len();

    let output = with_timeout(dispatch(&h.ctx, start)).await.unwrap();
    let ActionOutput::Started(record) = output else {
        panic!("expected Started output");
    };
    assert_eq!(record.status, RunStatus::Success);
    // Nothing re-ran.
    assert_eq!(h.runner.executions().len(), executions_after_first);
}

#[tokio::test]
async fn concurrent_start_with_same_run_id_conflicts() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);
    h.runner.hang("a");

    let ctx = h.ctx.clone();
    let first = tokio::spawn(async move {
        dispatch(
            &ctx,
            Action::Start {
                dag: "etl".to_string(),
                params: None,
                run_id: Some("dup".to_string()),
            },
        )
        .await
    });

    let dag_run = DagRunRef::new("etl", "dup");
    with_timeout(wait_for_status(&h, &dag_run, RunStatus::Running)).await;

    let err = with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "etl".to_string(),
            params: None,
            run_id: Some("dup".to_string()),
        },
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, DagflowError::AlreadyRunning(_)));

    operations::stop(&h.ctx, &dag_run).unwrap();
    with_timeout(first).await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_requires_a_running_run() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);

    with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "etl".to_string(),
            params: None,
            run_id: Some("r1".to_string()),
        },
    ))
    .await
    .unwrap();

    let err = operations::stop(&h.ctx, &DagRunRef::new("etl", "r1")).unwrap_err();
    assert!(matches!(err, DagflowError::NotRunning(_)));
}

#[tokio::test]
async fn retry_reuses_the_run_and_resets_only_failures() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);
    h.runner.script("b", &[1]);

    with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "etl".to_string(),
            params: None,
            run_id: Some("r1".to_string()),
        },
    ))
    .await
    .unwrap();

    let dag_run = DagRunRef::new("etl", "r1");
    let failed = operations::status_by_run(&h.ctx, &dag_run).unwrap();
    assert_eq!(failed.status, RunStatus::Error);

    h.runner.script("b", &[0]);
    let output = with_timeout(dispatch(&h.ctx, Action::Retry { dag_run: dag_run.clone() }))
        .await
        .unwrap();
    let ActionOutput::Started(record) = output else {
        panic!("expected Started output");
    };

    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.dag_run, dag_run);
    // "a" succeeded in the first pass and was not re-run.
    assert_eq!(h.runner.execution_count("a"), 1);
    assert_eq!(h.runner.execution_count("b"), 2);
}

#[tokio::test]
async fn retry_conflicts_while_the_run_is_active() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);
    h.runner.hang("a");

    let ctx = h.ctx.clone();
    let first = tokio::spawn(async move {
        dispatch(
            &ctx,
            Action::Start {
                dag: "etl".to_string(),
                params: None,
                run_id: Some("r1".to_string()),
            },
        )
        .await
    });

    let dag_run = DagRunRef::new("etl", "r1");
    with_timeout(wait_for_status(&h, &dag_run, RunStatus::Running)).await;

    let err = with_timeout(dispatch(&h.ctx, Action::Retry { dag_run: dag_run.clone() }))
        .await
        .unwrap_err();
    assert!(matches!(err, DagflowError::NotRetryable(_)));

    operations::stop(&h.ctx, &dag_run).unwrap();
    with_timeout(first).await.unwrap().unwrap();
}

#[tokio::test]
async fn reschedule_creates_a_fresh_identity_and_preserves_history() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);
    h.runner.script("b", &[1]);

    with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "etl".to_string(),
            params: None,
            run_id: Some("r1".to_string()),
        },
    ))
    .await
    .unwrap();

    h.runner.script("b", &[0]);
    let output = with_timeout(dispatch(
        &h.ctx,
        Action::Reschedule {
            dag_run: DagRunRef::new("etl", "r1"),
            new_run_id: Some("r2".to_string()),
            new_params: None,
            new_dag: None,
        },
    ))
    .await
    .unwrap();
    let ActionOutput::Started(record) = output else {
        panic!("expected Started output");
    };

    assert_eq!(record.dag_run, DagRunRef::new("etl", "r2"));
    assert_eq!(record.status, RunStatus::Success);

    // The original record still shows the failure.
    let original = operations::status_by_run(&h.ctx, &DagRunRef::new("etl", "r1")).unwrap();
    assert_eq!(original.status, RunStatus::Error);

    let history = operations::history(&h.ctx, "etl", 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].dag_run.run_id, "r2");
}

#[tokio::test]
async fn enqueue_is_idempotent_and_dequeue_cancels() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);

    for _ in 0..2 {
        let output = with_timeout(dispatch(
            &h.ctx,
            Action::Enqueue {
                dag: "etl".to_string(),
                params: None,
                run_id: Some("r1".to_string()),
            },
        ))
        .await
        .unwrap();
        assert!(matches!(output, ActionOutput::Queued(_)));
    }
    assert_eq!(h.ctx.queue.len().unwrap(), 1);

    let dag_run = DagRunRef::new("etl", "r1");
    let output = with_timeout(dispatch(&h.ctx, Action::Dequeue { dag_run: dag_run.clone() }))
        .await
        .unwrap();
    assert!(matches!(output, ActionOutput::Dequeued(_)));
    assert_eq!(h.ctx.queue.len().unwrap(), 0);

    let record = operations::status_by_run(&h.ctx, &dag_run).unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);

    let err = with_timeout(dispatch(&h.ctx, Action::Dequeue { dag_run }))
        .await
        .unwrap_err();
    assert!(matches!(err, DagflowError::NotQueued(_)));
}

#[tokio::test]
async fn suspended_dag_rejects_new_runs_until_resumed() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);

    with_timeout(dispatch(
        &h.ctx,
        Action::ToggleSuspend {
            dag: "etl".to_string(),
            suspend: true,
        },
    ))
    .await
    .unwrap();

    let err = with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "etl".to_string(),
            params: None,
            run_id: None,
        },
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, DagflowError::Suspended(_)));

    with_timeout(dispatch(
        &h.ctx,
        Action::ToggleSuspend {
            dag: "etl".to_string(),
            suspend: false,
        },
    ))
    .await
    .unwrap();

    let output = with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "etl".to_string(),
            params: None,
            run_id: None,
        },
    ))
    .await
    .unwrap();
    assert!(matches!(output, ActionOutput::Started(_)));
}

#[tokio::test]
async fn mark_node_patches_terminal_status_on_finished_runs_only() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);
    h.runner.script("b", &[1]);

    with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "etl".to_string(),
            params: None,
            run_id: Some("r1".to_string()),
        },
    ))
    .await
    .unwrap();

    let dag_run = DagRunRef::new("etl", "r1");
    let output = with_timeout(dispatch(
        &h.ctx,
        Action::MarkNode {
            dag_run: dag_run.clone(),
            step: "b".to_string(),
            status: MarkStatus::Success,
        },
    ))
    .await
    .unwrap();
    let ActionOutput::Marked(record) = output else {
        panic!("expected Marked output");
    };
    assert_eq!(record.node("b").unwrap().status, NodeStatus::Success);
    assert_eq!(record.status, RunStatus::Success);

    let err = with_timeout(dispatch(
        &h.ctx,
        Action::MarkNode {
            dag_run,
            step: "ghost".to_string(),
            status: MarkStatus::Error,
        },
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, DagflowError::StepNotFound(_)));
}

#[tokio::test]
async fn step_logs_are_readable_per_run() {
    let h = harness();
    write_dag_toml(&dags_dir(&h), "etl", SIMPLE_DAG);

    with_timeout(dispatch(
        &h.ctx,
        Action::Start {
            dag: "etl".to_string(),
            params: None,
            run_id: Some("r1".to_string()),
        },
    ))
    .await
    .unwrap();

    let dag_run = DagRunRef::new("etl", "r1");
    // The fake runner writes nothing; the path accessor must still resolve
    // inside the run directory.
    let path = h.ctx.store.log_path(&dag_run, "a").unwrap();
    std::fs::write(&path, "captured output\n").unwrap();

    let content = operations::read_step_log(&h.ctx, &dag_run, "a").unwrap();
    assert_eq!(content, "captured output\n");
}

async fn wait_for_status(h: &common::Harness, dag_run: &DagRunRef, status: RunStatus) {
    loop {
        if let Ok(latest) = h.ctx.store.read_latest(dag_run) {
            if latest.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
