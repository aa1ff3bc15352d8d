// src/dag/scheduler.rs

//! The per-run scheduler: drives one DAG-run from `Running` to a terminal
//! status.
//!
//! Shape of a pass:
//! - launch every ready node while the step ceiling has permits;
//! - await node events; every transition is persisted (and acknowledged)
//!   before the owning node proceeds, and readiness is only re-evaluated
//!   after the snapshot hit disk;
//! - on a terminal graph, run the matching lifecycle hook, then `on_exit`,
//!   then persist the final aggregate status.
//!
//! A periodic tick refreshes the execution-right heartbeat and polls the
//! on-disk cancel marker so `stop` reaches a scheduler in another process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::graph::ExecutionGraph;
use crate::dag::node::{Node, NodeStatus, SkipCause};
use crate::dag::step::Step;
use crate::errors::Result;
use crate::exec::{CommandRunner, CommandSpec};
use crate::store::{FileRunStore, RunLock, RunRecord};
use crate::types::RunStatus;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Heartbeat / cancel-marker poll interval.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
        }
    }
}

enum NodeEvent {
    /// A non-terminal transition; the node awaits the ack and does not
    /// proceed until the snapshot is durable.
    Transition {
        ack: oneshot::Sender<()>,
    },
    /// The node reached a terminal status and its task is done.
    Finished,
}

/// Drives exactly one DAG-run. Owns the run's evolving [`RunRecord`]; the
/// caller holds the execution-right lock for the duration of [`Scheduler::run`].
pub struct Scheduler {
    graph: Arc<ExecutionGraph>,
    record: RunRecord,
    store: Arc<FileRunStore>,
    runner: Arc<dyn CommandRunner>,
    cfg: SchedulerConfig,
    cancel: CancellationToken,
    hook_nodes: Vec<Arc<Node>>,
}

impl Scheduler {
    pub fn new(
        graph: ExecutionGraph,
        record: RunRecord,
        store: Arc<FileRunStore>,
        runner: Arc<dyn CommandRunner>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            record,
            store,
            runner,
            cfg,
            cancel: CancellationToken::new(),
            hook_nodes: Vec::new(),
        }
    }

    /// Token observed by every node executor; cancelling it stops the run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the run to completion and return the final record.
    ///
    /// `lock` must already be held; it is heartbeated from the tick so a
    /// crashed scheduler's right becomes reclaimable, never silently kept.
    pub async fn run(mut self, lock: &RunLock) -> Result<RunRecord> {
        let run_ref = self.record.dag_run.clone();
        info!(run = %run_ref, "run execution started");

        // A marker left over from an earlier pass must not cancel this one.
        self.store.clear_cancel(&run_ref)?;

        self.record.status = RunStatus::Running;
        self.record.started_at = Some(crate::types::now());
        self.persist()?;

        let (event_tx, mut event_rx) = mpsc::channel::<NodeEvent>(64);
        let limit = self.record.max_active_steps;
        let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit as usize)));

        let mut tick = tokio::time::interval(self.cfg.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut active: usize = 0;

        loop {
            // A failed durable write stalls the run: cancel what is in
            // flight and surface the error instead of advancing past an
            // unrecorded transition.
            match self.launch_ready(&event_tx, &semaphore) {
                Ok(launched) => active += launched,
                Err(err) => {
                    self.cancel.cancel();
                    return Err(err);
                }
            }

            if active == 0 {
                if self.graph.is_finished() || self.cancel.is_cancelled() {
                    break;
                }
                // Unreachable for a valid DAG: no node running, none ready,
                // graph not finished. Bail out instead of waiting forever.
                warn!(run = %run_ref, "scheduler wedged with no runnable nodes; aborting pass");
                break;
            }

            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(NodeEvent::Transition { ack }) => {
                            if let Err(err) = self.persist() {
                                self.cancel.cancel();
                                return Err(err);
                            }
                            let _ = ack.send(());
                        }
                        Some(NodeEvent::Finished) => {
                            active -= 1;
                            if let Err(err) = self.persist() {
                                self.cancel.cancel();
                                return Err(err);
                            }
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = lock.heartbeat() {
                        warn!(run = %run_ref, error = %err, "failed to refresh execution-right heartbeat");
                    }
                    if !self.cancel.is_cancelled() && self.store.cancel_requested(&run_ref) {
                        info!(run = %run_ref, "cancel marker observed; stopping run");
                        self.cancel.cancel();
                    }
                }
            }
        }

        let mut outcome = self.graph.outcome(self.cancel.is_cancelled());
        self.run_hooks(outcome).await?;
        if outcome != RunStatus::Cancelled
            && self
                .hook_nodes
                .iter()
                .any(|n| n.status() == NodeStatus::Error)
        {
            outcome = RunStatus::Error;
        }

        self.record.status = outcome;
        self.record.finished_at = Some(crate::types::now());
        self.persist()?;
        self.store.clear_cancel(&run_ref)?;

        info!(run = %run_ref, status = %outcome, "run execution finished");
        Ok(self.record)
    }

    /// Launch every currently-ready node that fits under the step ceiling.
    ///
    /// Precondition failures are resolved here (node -> `Skipped`), which can
    /// unblock further dependents within the same call. Running-state
    /// transitions are persisted before any spawned process starts.
    fn launch_ready(
        &mut self,
        event_tx: &mpsc::Sender<NodeEvent>,
        semaphore: &Option<Arc<Semaphore>>,
    ) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Ok(0);
        }

        let terminals_before = self.terminal_count();
        let mut to_spawn: Vec<(Arc<Node>, Option<OwnedSemaphorePermit>)> = Vec::new();

        'launch: loop {
            let ready = self.graph.ready_nodes();
            let mut progressed = false;

            for node in ready {
                if let Some(unmet) = node.step().preconditions.iter().find(|p| !p.is_met()) {
                    info!(
                        run = %self.record.dag_run,
                        step = %node.name(),
                        condition = %unmet.condition,
                        "precondition not met; skipping step"
                    );
                    node.set_skipped(
                        SkipCause::Precondition,
                        format!("precondition not met: '{}'", unmet.condition),
                    );
                    progressed = true;
                    continue;
                }

                let permit = match semaphore {
                    Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        // Ceiling saturated: stop launching, wait for a
                        // completion to free a permit.
                        Err(_) => break 'launch,
                    },
                    None => None,
                };

                let log_file = self
                    .store
                    .log_path(&self.record.dag_run, node.name())?;
                node.set_log_file(log_file);
                node.set_running();
                progressed = true;
                to_spawn.push((node, permit));
            }

            if !progressed {
                break;
            }
        }

        let launched = to_spawn.len();
        if launched > 0 || self.terminal_count() != terminals_before {
            self.persist()?;
        }

        for (node, permit) in to_spawn {
            debug!(run = %self.record.dag_run, step = %node.name(), "step execution started");
            let spec = self.spec_for(&node);
            let runner = Arc::clone(&self.runner);
            let cancel = self.cancel.clone();
            let tx = event_tx.clone();
            tokio::spawn(async move {
                drive_node(node, spec, runner, cancel, tx, permit).await;
            });
        }

        Ok(launched)
    }

    fn spec_for(&self, node: &Node) -> CommandSpec {
        CommandSpec {
            dag: self.record.dag_run.dag.clone(),
            run_id: self.record.dag_run.run_id.clone(),
            step: node.name().to_string(),
            command: node.step().command.clone(),
            params: self.record.params.clone(),
            log_file: node
                .snapshot()
                .log_file
                .unwrap_or_default(),
        }
    }

    fn terminal_count(&self) -> usize {
        self.graph
            .nodes()
            .iter()
            .filter(|n| n.status().is_terminal())
            .count()
    }

    fn persist(&mut self) -> Result<()> {
        self.record.nodes = self.graph.snapshots();
        self.record.hook_nodes = self.hook_nodes.iter().map(|n| n.snapshot()).collect();
        self.record.seq += 1;
        self.store.append(&self.record)
    }

    /// Run the outcome's lifecycle hook, then `on_exit`, each as a
    /// synchronous pseudo-node appended to the record.
    async fn run_hooks(&mut self, outcome: RunStatus) -> Result<()> {
        let hooks = self.record.hooks.clone();
        let matching = match outcome {
            // Partial success still completed its primary work.
            RunStatus::Success | RunStatus::PartialSuccess => hooks.on_success,
            RunStatus::Error => hooks.on_failure,
            RunStatus::Cancelled => hooks.on_cancel,
            RunStatus::Queued | RunStatus::Running => None,
        };

        for step in [matching, hooks.on_exit].into_iter().flatten() {
            self.run_hook_node(step).await?;
        }
        Ok(())
    }

    async fn run_hook_node(&mut self, step: Step) -> Result<()> {
        info!(run = %self.record.dag_run, hook = %step.name, "hook execution started");

        let id = self.graph.nodes().len() + self.hook_nodes.len();
        let node = Arc::new(Node::new(step.clone(), id));
        let log_file = self.store.log_path(&self.record.dag_run, &step.name)?;
        node.set_log_file(log_file.clone());
        node.set_running();
        self.hook_nodes.push(Arc::clone(&node));
        self.persist()?;

        let spec = CommandSpec {
            dag: self.record.dag_run.dag.clone(),
            run_id: self.record.dag_run.run_id.clone(),
            step: step.name.clone(),
            command: step.command.clone(),
            params: self.record.params.clone(),
            log_file,
        };

        // Hooks run to completion even when the run was cancelled, so they
        // get a token of their own.
        match self.runner.run(spec, CancellationToken::new()).await {
            Ok(outcome) if outcome.success() => {
                node.inc_done();
                node.set_success();
            }
            Ok(outcome) => {
                warn!(
                    run = %self.record.dag_run,
                    hook = %step.name,
                    exit_code = outcome.exit_code,
                    "hook execution failed"
                );
                node.set_error(
                    match outcome.exit_code {
                        Some(code) => format!("exit code {code}"),
                        None => "terminated".to_string(),
                    },
                    outcome.exit_code,
                );
            }
            Err(err) => {
                warn!(run = %self.record.dag_run, hook = %step.name, error = %err, "hook execution error");
                node.set_error(err.to_string(), None);
            }
        }

        self.persist()
    }
}

/// Per-node driver task: executes attempts under the step's retry and
/// repeat policies, reporting every transition back for persistence.
async fn drive_node(
    node: Arc<Node>,
    spec: CommandSpec,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
    tx: mpsc::Sender<NodeEvent>,
    permit: Option<OwnedSemaphorePermit>,
) {
    let step = node.step().clone();

    loop {
        let attempt = runner.run(spec.clone(), cancel.child_token()).await;

        let (failed, exit_code, failure_text) = match attempt {
            Ok(outcome) if outcome.cancelled => {
                node.set_cancelled();
                break;
            }
            Ok(outcome) => (
                !outcome.success(),
                outcome.exit_code,
                match outcome.exit_code {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                },
            ),
            Err(err) => (true, None, err.to_string()),
        };

        node.inc_done();

        if failed {
            if cancel.is_cancelled() {
                node.set_cancelled();
                break;
            }

            if let Some(retry) = step.retry {
                if node.retry_count() < retry.max_retries {
                    let delay = retry.delay_for(node.retry_count());
                    warn!(
                        step = %step.name,
                        error = %failure_text,
                        retry = node.retry_count() + 1,
                        max_retries = retry.max_retries,
                        "step execution failed; retrying"
                    );
                    node.set_error_retrying(&failure_text, exit_code);
                    if !notify_transition(&tx).await {
                        return;
                    }
                    if !sleep_unless_cancelled(delay, &cancel).await {
                        node.set_cancelled();
                        break;
                    }
                    node.set_retrying();
                    if !notify_transition(&tx).await {
                        return;
                    }
                    continue;
                }
            }

            // Repeat re-runs regardless of exit code, but only when no retry
            // budget is configured; an exhausted retry budget is terminal.
            if step.retry.is_none() {
                if let Some(repeat) = step.repeat {
                    if repeat.limit.is_none_or(|limit| node.done_count() < limit) {
                        if !sleep_unless_cancelled(repeat.interval(), &cancel).await {
                            node.set_cancelled();
                            break;
                        }
                        node.set_repeating();
                        if !notify_transition(&tx).await {
                            return;
                        }
                        continue;
                    }
                }
            }

            node.set_error(&failure_text, exit_code);
            break;
        }

        // Success path; maybe repeat.
        if let Some(repeat) = step.repeat {
            if repeat.limit.is_none_or(|limit| node.done_count() < limit) {
                if cancel.is_cancelled() {
                    // The execution that just finished succeeded; stop
                    // repeating without discarding that result.
                    node.set_success();
                    break;
                }
                if !sleep_unless_cancelled(repeat.interval(), &cancel).await {
                    node.set_success();
                    break;
                }
                node.set_repeating();
                if !notify_transition(&tx).await {
                    return;
                }
                continue;
            }
        }

        node.set_success();
        break;
    }

    // Free the ceiling permit before reporting completion so the permit is
    // observably available when the scheduler re-evaluates readiness.
    drop(permit);
    let _ = tx.send(NodeEvent::Finished).await;
}

/// Report a non-terminal transition and wait for the durable-write ack.
/// Returns false when the scheduler is gone (run aborted).
async fn notify_transition(tx: &mpsc::Sender<NodeEvent>) -> bool {
    let (ack_tx, ack_rx) = oneshot::channel();
    if tx
        .send(NodeEvent::Transition { ack: ack_tx })
        .await
        .is_err()
    {
        return false;
    }
    ack_rx.await.is_ok()
}

/// Returns false when cancelled before the duration elapsed.
async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
