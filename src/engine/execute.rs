// src/engine/execute.rs

//! One full execution pass over a run: acquire the execution right, build
//! the graph from the persisted snapshot, drive the scheduler, release.

use tracing::{info, warn};

use crate::dag::{ExecutionGraph, NodeStatus, Scheduler};
use crate::engine::EngineContext;
use crate::errors::Result;
use crate::store::{RunLock, RunRecord};
use crate::types::DagRunRef;

/// Execute a run record to completion. The caller must have created (or
/// re-read) the record; this acquires and holds the run's execution right
/// for the whole pass.
pub async fn execute_record(ctx: &EngineContext, record: RunRecord) -> Result<RunRecord> {
    let mut lock = RunLock::new(
        &ctx.config.data_dir,
        record.dag_run.clone(),
        ctx.config.lock_opts,
    );
    lock.try_acquire()?;
    execute_with_lock(ctx, record, lock).await
}

/// Execute with an execution right the caller already acquired (the
/// admission path holds it while checking the active-run ceiling).
pub async fn execute_with_lock(
    ctx: &EngineContext,
    record: RunRecord,
    mut lock: RunLock,
) -> Result<RunRecord> {
    let dag_run = record.dag_run.clone();
    let result = run_pass(ctx, record, &lock).await;

    if let Err(err) = lock.release() {
        warn!(run = %dag_run, error = %err, "failed to release execution right");
    }
    result
}

async fn run_pass(ctx: &EngineContext, record: RunRecord, lock: &RunLock) -> Result<RunRecord> {
    let graph = ExecutionGraph::from_snapshots(record.nodes.clone())?;
    let scheduler = Scheduler::new(
        graph,
        record,
        ctx.store.clone(),
        ctx.runner.clone(),
        ctx.config.scheduler,
    );
    scheduler.run(lock).await
}

/// Execute a run that already exists in the store (worker dispatch path).
///
/// Idempotent against duplicate dispatch: a run that already reached a
/// terminal status is returned as-is. A run interrupted mid-pass (crashed
/// scheduler, reclaimed lock) has its `Running` nodes reset to `NotStarted`
/// before re-entering the loop; their processes died with the old pass.
pub async fn execute_existing(ctx: &EngineContext, dag_run: &DagRunRef) -> Result<RunRecord> {
    let mut record = ctx.store.read_latest(dag_run)?;

    if !record.status.is_active() {
        info!(run = %dag_run, status = %record.status, "run already terminal; nothing to execute");
        return Ok(record);
    }

    for node in record.nodes.iter_mut() {
        if node.status == NodeStatus::Running {
            warn!(
                run = %dag_run,
                step = %node.step.name,
                "node was running in an interrupted pass; resetting"
            );
            *node = crate::dag::NodeSnapshot::fresh(node.step.clone());
            node.status_text = "recovered after interrupted pass".to_string();
        }
    }

    execute_record(ctx, record).await
}
