// src/coord/coordinator.rs

//! The coordinator pairs queued runs with polling workers and tracks worker
//! liveness.
//!
//! It is an in-process service task addressed through a command channel.
//! Workers register with a capacity, heartbeat on an interval, and long-poll
//! for assignments. A claimed queue entry stays claimed until the worker
//! reports completion; a worker whose heartbeat goes stale has all of its
//! in-flight assignments re-queued at the front. Double execution after such
//! a reclaim is prevented by the run's execution-right lock, not by the
//! coordinator's bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{DagflowError, Result};
use crate::queue::{ClaimedEntry, FileQueue};
use crate::types::{DagRunRef, RunStatus};

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Heartbeat age after which a worker lease is considered dead.
    pub stale_after: Duration,
    /// How often dead leases and stale queue claims are swept.
    pub sweep_interval: Duration,
    /// How often the queue is polled for new work while pollers wait.
    pub dispatch_interval: Duration,
    /// Age after which a claim orphaned by a dead coordinator process is
    /// returned to the queue.
    pub claim_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            dispatch_interval: Duration::from_millis(250),
            claim_timeout: Duration::from_secs(120),
        }
    }
}

/// One unit of dispatched work.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub dag_run: DagRunRef,
}

enum Command {
    Register {
        worker_id: String,
        capacity: usize,
    },
    Heartbeat {
        worker_id: String,
    },
    Poll {
        worker_id: String,
        reply: oneshot::Sender<Option<Assignment>>,
    },
    Report {
        worker_id: String,
        dag_run: DagRunRef,
        status: RunStatus,
    },
    Reject {
        worker_id: String,
        dag_run: DagRunRef,
    },
}

/// Client handle used by workers (and the engine) to talk to the
/// coordinator task.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub async fn register(&self, worker_id: &str, capacity: usize) -> Result<()> {
        self.send(Command::Register {
            worker_id: worker_id.to_string(),
            capacity,
        })
        .await
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        self.send(Command::Heartbeat {
            worker_id: worker_id.to_string(),
        })
        .await
    }

    /// Long-poll for an assignment. Resolves with `None` when the
    /// coordinator shuts down.
    pub async fn poll(&self, worker_id: &str) -> Result<Option<Assignment>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Poll {
            worker_id: worker_id.to_string(),
            reply: reply_tx,
        })
        .await?;
        Ok(reply_rx.await.unwrap_or(None))
    }

    pub async fn report(
        &self,
        worker_id: &str,
        dag_run: DagRunRef,
        status: RunStatus,
    ) -> Result<()> {
        self.send(Command::Report {
            worker_id: worker_id.to_string(),
            dag_run,
            status,
        })
        .await
    }

    /// The worker could not take the assignment after all (capacity raced);
    /// the coordinator puts it back at the front.
    pub async fn reject(&self, worker_id: &str, dag_run: DagRunRef) -> Result<()> {
        self.send(Command::Reject {
            worker_id: worker_id.to_string(),
            dag_run,
        })
        .await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DagflowError::Config("coordinator is not running".to_string()))
    }
}

struct WorkerLease {
    capacity: usize,
    last_heartbeat: Instant,
    in_flight: HashMap<DagRunRef, ClaimedEntry>,
}

struct Coordinator {
    queue: Arc<FileQueue>,
    cfg: CoordinatorConfig,
    leases: HashMap<String, WorkerLease>,
    waiting: VecDeque<(String, oneshot::Sender<Option<Assignment>>)>,
}

/// Spawn the coordinator service task. The task exits when every handle is
/// dropped, releasing any still-claimed entries back to the queue.
pub fn spawn_coordinator(
    queue: Arc<FileQueue>,
    cfg: CoordinatorConfig,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let coordinator = Coordinator {
        queue,
        cfg,
        leases: HashMap::new(),
        waiting: VecDeque::new(),
    };
    let join = tokio::spawn(coordinator.run(rx));
    (CoordinatorHandle { tx }, join)
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!("coordinator started");

        // Recover claims orphaned by a previous process before dispatching.
        match self.queue.sweep_stale_claims(self.cfg.claim_timeout) {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "recovered orphaned queue claims"),
            Err(err) => warn!(error = %err, "failed to sweep orphaned queue claims"),
        }

        let mut sweep = tokio::time::interval(self.cfg.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut dispatch = tokio::time::interval(self.cfg.dispatch_interval);
        dispatch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => {
                            self.handle(command);
                            self.dispatch();
                        }
                        None => break,
                    }
                }
                _ = dispatch.tick() => {
                    self.dispatch();
                }
                _ = sweep.tick() => {
                    self.expire_dead_leases();
                    if let Err(err) = self.queue.sweep_stale_claims(self.cfg.claim_timeout) {
                        warn!(error = %err, "stale-claim sweep failed");
                    }
                }
            }
        }

        self.shutdown();
        info!("coordinator stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                worker_id,
                capacity,
            } => match self.leases.get_mut(&worker_id) {
                Some(lease) => {
                    lease.capacity = capacity;
                    lease.last_heartbeat = Instant::now();
                    debug!(worker_id = %worker_id, capacity, "worker lease refreshed");
                }
                None => {
                    info!(worker_id = %worker_id, capacity, "worker registered");
                    self.leases.insert(
                        worker_id,
                        WorkerLease {
                            capacity,
                            last_heartbeat: Instant::now(),
                            in_flight: HashMap::new(),
                        },
                    );
                }
            },
            Command::Heartbeat { worker_id } => match self.leases.get_mut(&worker_id) {
                Some(lease) => lease.last_heartbeat = Instant::now(),
                None => {
                    warn!(worker_id = %worker_id, "heartbeat from unregistered worker; ignoring");
                }
            },
            Command::Poll { worker_id, reply } => {
                self.waiting.push_back((worker_id, reply));
            }
            Command::Report {
                worker_id,
                dag_run,
                status,
            } => {
                info!(worker_id = %worker_id, run = %dag_run, status = %status, "assignment completed");
                if let Some(claim) = self.take_in_flight(&worker_id, &dag_run) {
                    if let Err(err) = claim.commit() {
                        warn!(run = %dag_run, error = %err, "failed to commit completed queue entry");
                    }
                }
            }
            Command::Reject { worker_id, dag_run } => {
                warn!(worker_id = %worker_id, run = %dag_run, "assignment rejected; re-queuing at front");
                if let Some(claim) = self.take_in_flight(&worker_id, &dag_run) {
                    if let Err(err) = claim.release() {
                        warn!(run = %dag_run, error = %err, "failed to release rejected queue entry");
                    }
                }
            }
        }
    }

    fn take_in_flight(&mut self, worker_id: &str, dag_run: &DagRunRef) -> Option<ClaimedEntry> {
        match self
            .leases
            .get_mut(worker_id)
            .and_then(|lease| lease.in_flight.remove(dag_run))
        {
            Some(claim) => Some(claim),
            None => {
                warn!(worker_id = %worker_id, run = %dag_run, "report for unknown assignment");
                None
            }
        }
    }

    /// Pair waiting pollers with queued entries, FIFO on both sides.
    fn dispatch(&mut self) {
        while let Some(position) = self.next_eligible_poller() {
            let claim = match self.queue.dequeue() {
                Ok(Some(claim)) => claim,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "queue dequeue failed");
                    break;
                }
            };

            let Some((worker_id, reply)) = self.waiting.remove(position) else {
                if let Err(err) = claim.release() {
                    warn!(error = %err, "failed to release unassigned queue entry");
                }
                break;
            };
            let dag_run = claim.entry.dag_run.clone();
            let assignment = Assignment {
                dag_run: dag_run.clone(),
            };

            if reply.send(Some(assignment)).is_err() {
                // Poller went away between poll and assignment.
                warn!(worker_id = %worker_id, run = %dag_run, "poller gone; releasing claim");
                if let Err(err) = claim.release() {
                    warn!(run = %dag_run, error = %err, "failed to release unassigned queue entry");
                }
                continue;
            }

            debug!(worker_id = %worker_id, run = %dag_run, "assignment dispatched");
            if let Some(lease) = self.leases.get_mut(&worker_id) {
                lease.in_flight.insert(dag_run, claim);
            } else {
                // Assignment went to a poller that never registered; nothing
                // tracks it, so rely on the claim timeout if it dies.
                warn!(worker_id = %worker_id, "assignment to unregistered worker");
                claim.commit().ok();
            }
        }
    }

    /// First waiting poller whose lease is alive and has spare capacity.
    fn next_eligible_poller(&mut self) -> Option<usize> {
        // Drop pollers whose reply side is gone.
        self.waiting.retain(|(_, reply)| !reply.is_closed());

        let stale_after = self.cfg.stale_after;
        self.waiting.iter().position(|(worker_id, _)| {
            self.leases.get(worker_id).is_some_and(|lease| {
                lease.last_heartbeat.elapsed() <= stale_after
                    && lease.in_flight.len() < lease.capacity
            })
        })
    }

    /// Re-queue every assignment held by a dead worker, at the front so the
    /// reclaimed run does not also pay full queue latency.
    fn expire_dead_leases(&mut self) {
        let stale_after = self.cfg.stale_after;
        let dead: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.last_heartbeat.elapsed() > stale_after)
            .map(|(id, _)| id.clone())
            .collect();

        for worker_id in dead {
            let Some(lease) = self.leases.remove(&worker_id) else {
                continue;
            };
            warn!(
                worker_id = %worker_id,
                in_flight = lease.in_flight.len(),
                "worker lease expired; re-queuing its assignments"
            );
            for (dag_run, claim) in lease.in_flight {
                if let Err(err) = claim.release() {
                    warn!(run = %dag_run, error = %err, "failed to re-queue assignment of dead worker");
                }
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, reply) in self.waiting.drain(..) {
            let _ = reply.send(None);
        }
        for (_, lease) in self.leases.drain() {
            for (dag_run, claim) in lease.in_flight {
                if let Err(err) = claim.release() {
                    warn!(run = %dag_run, error = %err, "failed to release claim on shutdown");
                }
            }
        }
    }
}
