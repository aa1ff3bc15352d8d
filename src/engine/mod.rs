// src/engine/mod.rs

//! Operator-facing engine surface.
//!
//! Every mutating operation is a variant of the closed [`Action`] enum,
//! dispatched through one exhaustive match; an unknown action cannot reach
//! business logic, and each variant carries exactly the fields it needs.
//! All state the operations touch hangs off an explicit [`EngineContext`];
//! there is no process-wide mutable state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::dag::SchedulerConfig;
use crate::errors::Result;
use crate::exec::{CommandRunner, ProcessRunner};
use crate::queue::FileQueue;
use crate::store::{FileRunStore, LockOptions, SuspendStore};
use crate::types::DagRunRef;

pub mod execute;
pub mod operations;

pub use operations::{history, latest_status, read_step_log, status_by_run};

/// Engine-wide settings, assembled from CLI flags and env fallbacks.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of all durable state (runs, locks, queue, suspend flags).
    pub data_dir: PathBuf,
    /// Directory of DAG definition files (`<name>.toml`).
    pub dags_dir: PathBuf,
    pub lock_opts: LockOptions,
    pub scheduler: SchedulerConfig,
    /// Grace period between SIGTERM and SIGKILL on cancellation.
    pub cancel_grace: Duration,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>, dags_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            dags_dir: dags_dir.into(),
            lock_opts: LockOptions::default(),
            scheduler: SchedulerConfig::default(),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Handles to the durable stores plus the command runner; shared by the
/// engine operations, the worker fleet, and the coordinator.
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<FileRunStore>,
    pub queue: Arc<FileQueue>,
    pub suspend: Arc<SuspendStore>,
    pub runner: Arc<dyn CommandRunner>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        let runner = Arc::new(ProcessRunner::new(config.cancel_grace));
        Self::with_runner(config, runner)
    }

    /// Construct with a custom runner (tests use a fake that never spawns
    /// processes).
    pub fn with_runner(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            store: Arc::new(FileRunStore::new(&config.data_dir)),
            queue: Arc::new(FileQueue::new(&config.data_dir)),
            suspend: Arc::new(SuspendStore::new(&config.data_dir)),
            runner,
            config,
        }
    }
}

/// Terminal node status an operator may patch a node to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkStatus {
    Success,
    Error,
}

/// Every mutating operation the engine exposes.
#[derive(Debug, Clone)]
pub enum Action {
    /// Run now (or queue when the DAG's active-run ceiling is reached).
    Start {
        dag: String,
        params: Option<String>,
        run_id: Option<String>,
    },
    /// Queue for deferred or remote execution.
    Enqueue {
        dag: String,
        params: Option<String>,
        run_id: Option<String>,
    },
    /// Cooperatively cancel a running run.
    Stop { dag_run: DagRunRef },
    /// Re-enter a finished run, resetting only non-successful nodes.
    Retry { dag_run: DagRunRef },
    /// Run again under a brand-new identity, optionally overriding params
    /// or the target DAG.
    Reschedule {
        dag_run: DagRunRef,
        new_run_id: Option<String>,
        new_params: Option<String>,
        new_dag: Option<String>,
    },
    /// Remove a queued run before dispatch.
    Dequeue { dag_run: DagRunRef },
    /// Flip the per-DAG suspend flag (checked at the next admission only).
    ToggleSuspend { dag: String, suspend: bool },
    /// Manual remediation: patch one node's terminal status on a
    /// non-running run.
    MarkNode {
        dag_run: DagRunRef,
        step: String,
        status: MarkStatus,
    },
}

/// What a dispatched action produced.
#[derive(Debug)]
pub enum ActionOutput {
    Started(crate::store::RunRecord),
    Queued(DagRunRef),
    Stopped(DagRunRef),
    Dequeued(DagRunRef),
    SuspendSet { dag: String, suspended: bool },
    Marked(crate::store::RunRecord),
}

/// Dispatch one action. The match is exhaustive by construction.
pub async fn dispatch(ctx: &EngineContext, action: Action) -> Result<ActionOutput> {
    match action {
        Action::Start {
            dag,
            params,
            run_id,
        } => operations::start(ctx, &dag, params, run_id, false).await,
        Action::Enqueue {
            dag,
            params,
            run_id,
        } => operations::start(ctx, &dag, params, run_id, true).await,
        Action::Stop { dag_run } => operations::stop(ctx, &dag_run),
        Action::Retry { dag_run } => operations::retry(ctx, &dag_run).await,
        Action::Reschedule {
            dag_run,
            new_run_id,
            new_params,
            new_dag,
        } => operations::reschedule(ctx, &dag_run, new_run_id, new_params, new_dag).await,
        Action::Dequeue { dag_run } => operations::dequeue(ctx, &dag_run),
        Action::ToggleSuspend { dag, suspend } => operations::toggle_suspend(ctx, &dag, suspend),
        Action::MarkNode {
            dag_run,
            step,
            status,
        } => operations::mark_node(ctx, &dag_run, &step, status),
    }
}
