// src/engine/operations.rs

//! Implementations of the engine's operator-facing operations.
//!
//! Validation and conflict checks run before any state mutation; conflicts
//! surface verbatim, nothing here retries.

use tracing::info;

use crate::config::{load_and_validate, resolve_dag_path};
use crate::dag::NodeStatus;
use crate::engine::execute::{execute_record, execute_with_lock};
use crate::engine::{ActionOutput, EngineContext, MarkStatus};
use crate::errors::{DagflowError, Result};
use crate::store::{RunLock, RunRecord, active_count_for_dag, held_and_fresh};
use crate::types::{DagRunRef, RunRequest, RunStatus, new_run_id};

/// Start (or, with `queue_only`, enqueue) a run of a DAG.
///
/// A caller-supplied run ID gives "start if not already running": an active
/// run with that ID conflicts, a finished one is returned unchanged.
/// Admission: a suspended DAG rejects; a DAG at its `max_active_runs`
/// ceiling queues instead of running.
pub async fn start(
    ctx: &EngineContext,
    dag: &str,
    params: Option<String>,
    run_id: Option<String>,
    queue_only: bool,
) -> Result<ActionOutput> {
    let path = resolve_dag_path(&ctx.config.dags_dir, dag)?;
    let dag_file = load_and_validate(&path)?;

    if ctx.suspend.is_suspended(&dag_file.name) {
        return Err(DagflowError::Suspended(dag_file.name));
    }

    let run_id = run_id.unwrap_or_else(new_run_id);
    let dag_run = DagRunRef::new(dag_file.name.clone(), run_id.clone());

    if ctx.store.exists(&dag_run)? {
        let latest = ctx.store.read_latest(&dag_run)?;
        if latest.status == RunStatus::Queued && queue_only {
            // Idempotent re-enqueue: at most one entry per (dag, run_id).
            ctx.queue.enqueue(&dag_run)?;
            return Ok(ActionOutput::Queued(dag_run));
        }
        if latest.status.is_active()
            || held_and_fresh(&ctx.config.data_dir, &dag_run, ctx.config.lock_opts)
        {
            return Err(DagflowError::AlreadyRunning(dag_run));
        }
        info!(run = %dag_run, "run ID already completed; start is a no-op");
        return Ok(ActionOutput::Started(latest));
    }

    let params = params.unwrap_or_else(|| dag_file.params.clone());
    let record = RunRecord::new(&dag_file, run_id, params, RunRequest::Manual);
    ctx.store.create(&record)?;

    if queue_only {
        ctx.queue.enqueue(&dag_run)?;
        return Ok(ActionOutput::Queued(dag_run));
    }

    admit_or_queue(ctx, &dag_file, record).await
}

/// Admission control for a freshly created record: take the run's execution
/// right first, then check the DAG's active-run ceiling with that right
/// counted in. Concurrent admissions can both back off into the queue, but
/// the ceiling is never exceeded.
async fn admit_or_queue(
    ctx: &EngineContext,
    dag_file: &crate::config::DagFile,
    record: RunRecord,
) -> Result<ActionOutput> {
    let dag_run = record.dag_run.clone();
    let mut lock = RunLock::new(&ctx.config.data_dir, dag_run.clone(), ctx.config.lock_opts);
    lock.try_acquire()?;

    let active = active_count_for_dag(&ctx.config.data_dir, &dag_file.name, ctx.config.lock_opts);
    if dag_file.max_active_runs > 0 && active > dag_file.max_active_runs as usize {
        info!(
            run = %dag_run,
            active = active - 1,
            max_active_runs = dag_file.max_active_runs,
            "active-run ceiling reached; queuing instead"
        );
        lock.release()?;
        ctx.queue.enqueue(&dag_run)?;
        return Ok(ActionOutput::Queued(dag_run));
    }

    let final_record = execute_with_lock(ctx, record, lock).await?;
    Ok(ActionOutput::Started(final_record))
}

/// Cooperative cancellation of a running run. Works across processes: the
/// cancel marker is observed by the owning scheduler on its next tick.
pub fn stop(ctx: &EngineContext, dag_run: &DagRunRef) -> Result<ActionOutput> {
    let latest = ctx.store.read_latest(dag_run)?;
    if latest.status != RunStatus::Running {
        return Err(DagflowError::NotRunning(dag_run.clone()));
    }
    ctx.store.request_cancel(dag_run)?;
    info!(run = %dag_run, "stop requested");
    Ok(ActionOutput::Stopped(dag_run.clone()))
}

/// Re-enter an existing run: reset every node that did not succeed and run
/// the scheduling loop again, appending to the same history.
pub async fn retry(ctx: &EngineContext, dag_run: &DagRunRef) -> Result<ActionOutput> {
    let mut record = ctx.store.read_latest(dag_run)?;
    if record.status.is_active()
        || held_and_fresh(&ctx.config.data_dir, dag_run, ctx.config.lock_opts)
    {
        return Err(DagflowError::NotRetryable(dag_run.clone()));
    }

    for node in record.nodes.iter_mut() {
        if node.status != NodeStatus::Success {
            let step = node.step.clone();
            *node = crate::dag::NodeSnapshot::fresh(step);
        }
    }
    record.request = RunRequest::Retry;
    record.hook_nodes.clear();
    record.finished_at = None;

    info!(run = %dag_run, "retrying run");
    let final_record = execute_record(ctx, record).await?;
    Ok(ActionOutput::Started(final_record))
}

/// Run again as a brand-new DAG-run with a fresh identity; the original
/// run's history is untouched.
pub async fn reschedule(
    ctx: &EngineContext,
    dag_run: &DagRunRef,
    new_run_id: Option<String>,
    new_params: Option<String>,
    new_dag: Option<String>,
) -> Result<ActionOutput> {
    let original = ctx.store.read_latest(dag_run)?;

    let target = new_dag.unwrap_or_else(|| dag_run.dag.clone());
    let path = resolve_dag_path(&ctx.config.dags_dir, &target)?;
    let dag_file = load_and_validate(&path)?;

    if ctx.suspend.is_suspended(&dag_file.name) {
        return Err(DagflowError::Suspended(dag_file.name));
    }

    let run_id = new_run_id.unwrap_or_else(crate::types::new_run_id);
    let new_ref = DagRunRef::new(dag_file.name.clone(), run_id.clone());
    if ctx.store.exists(&new_ref)? {
        return Err(DagflowError::AlreadyRunning(new_ref));
    }

    let params = new_params.unwrap_or_else(|| original.params.clone());
    let record = RunRecord::new(
        &dag_file,
        run_id,
        params,
        RunRequest::Reschedule {
            of: dag_run.clone(),
        },
    );
    ctx.store.create(&record)?;

    info!(original = %dag_run, new = %new_ref, "rescheduling run");
    admit_or_queue(ctx, &dag_file, record).await
}

/// Operator dequeue: cancel a run before dispatch. The run record is closed
/// out as `Cancelled`.
pub fn dequeue(ctx: &EngineContext, dag_run: &DagRunRef) -> Result<ActionOutput> {
    ctx.queue.remove(dag_run)?;

    let mut record = ctx.store.read_latest(dag_run)?;
    record.status = RunStatus::Cancelled;
    record.finished_at = Some(crate::types::now());
    record.seq += 1;
    ctx.store.append(&record)?;

    Ok(ActionOutput::Dequeued(dag_run.clone()))
}

/// Flip the per-DAG suspend flag; consulted only at the next admission.
pub fn toggle_suspend(ctx: &EngineContext, dag: &str, suspend: bool) -> Result<ActionOutput> {
    ctx.suspend.set_suspended(dag, suspend)?;
    info!(dag = %dag, suspended = suspend, "suspend flag updated");
    Ok(ActionOutput::SuspendSet {
        dag: dag.to_string(),
        suspended: suspend,
    })
}

/// Manual remediation on a non-running run: patch one node's terminal
/// status and recompute the aggregate.
pub fn mark_node(
    ctx: &EngineContext,
    dag_run: &DagRunRef,
    step: &str,
    status: MarkStatus,
) -> Result<ActionOutput> {
    let latest = ctx.store.read_latest(dag_run)?;
    if latest.status.is_active()
        || held_and_fresh(&ctx.config.data_dir, dag_run, ctx.config.lock_opts)
    {
        return Err(DagflowError::AlreadyRunning(dag_run.clone()));
    }

    let (node_status, text) = match status {
        MarkStatus::Success => (NodeStatus::Success, "manually marked successful"),
        MarkStatus::Error => (NodeStatus::Error, "manually marked failed"),
    };
    let record = ctx.store.mark_node_status(dag_run, step, node_status, text)?;
    Ok(ActionOutput::Marked(record))
}

/// Latest status of the most recent run of a DAG.
pub fn latest_status(ctx: &EngineContext, dag: &str) -> Result<Option<RunRecord>> {
    ctx.store.latest_for_dag(dag)
}

/// Status by explicit run ID.
pub fn status_by_run(ctx: &EngineContext, dag_run: &DagRunRef) -> Result<RunRecord> {
    ctx.store.read_latest(dag_run)
}

/// The N most recent runs of a DAG, newest first.
pub fn history(ctx: &EngineContext, dag: &str, limit: usize) -> Result<Vec<RunRecord>> {
    ctx.store.history(dag, limit)
}

/// Captured output of one step of one run.
pub fn read_step_log(ctx: &EngineContext, dag_run: &DagRunRef, step: &str) -> Result<String> {
    ctx.store.read_log(dag_run, step)
}
