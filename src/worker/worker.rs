// src/worker/worker.rs

//! A worker polls the coordinator for assignments and executes each one as a
//! full scheduler pass against the shared data directory.
//!
//! Capacity is a semaphore: a poll is only issued once a permit is reserved,
//! so the common path never bounces assignments. If capacity disappears
//! between assignment and pickup (shutdown began), the assignment is
//! rejected back to the coordinator for a front re-queue rather than
//! silently dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coord::CoordinatorHandle;
use crate::engine::EngineContext;
use crate::engine::execute;
use crate::errors::{DagflowError, Result};
use crate::types::RunStatus;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: String,
    /// Maximum concurrent assignments.
    pub capacity: usize,
    pub heartbeat_interval: Duration,
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

pub struct Worker {
    cfg: WorkerConfig,
    coordinator: CoordinatorHandle,
    ctx: Arc<EngineContext>,
}

impl Worker {
    pub fn new(cfg: WorkerConfig, coordinator: CoordinatorHandle, ctx: Arc<EngineContext>) -> Self {
        Self {
            cfg,
            coordinator,
            ctx,
        }
    }

    /// Poll-execute-report loop; returns after `shutdown` fires and all
    /// in-flight assignments finished.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let worker_id = self.cfg.id.clone();
        info!(worker_id = %worker_id, capacity = self.cfg.capacity, "worker started");

        self.coordinator
            .register(&worker_id, self.cfg.capacity)
            .await?;

        let heartbeat = spawn_heartbeat(
            self.coordinator.clone(),
            worker_id.clone(),
            self.cfg.capacity,
            self.cfg.heartbeat_interval,
            shutdown.clone(),
        );

        let semaphore = Arc::new(Semaphore::new(self.cfg.capacity));
        let mut executions: JoinSet<()> = JoinSet::new();

        loop {
            // Reserve capacity before polling so assignments are only taken
            // when they can actually start.
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let assignment = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.coordinator.poll(&worker_id) => match polled? {
                    Some(assignment) => assignment,
                    // Coordinator shut down.
                    None => break,
                },
            };

            if shutdown.is_cancelled() {
                // Capacity changed between assignment and pickup.
                let err = DagflowError::AssignmentRejected {
                    worker_id: worker_id.clone(),
                };
                warn!(run = %assignment.dag_run, error = %err, "rejecting assignment");
                self.coordinator
                    .reject(&worker_id, assignment.dag_run)
                    .await?;
                break;
            }

            let ctx = Arc::clone(&self.ctx);
            let coordinator = self.coordinator.clone();
            let id = worker_id.clone();
            executions.spawn(async move {
                let _permit = permit;
                let dag_run = assignment.dag_run.clone();
                debug!(worker_id = %id, run = %dag_run, "assignment picked up");

                let status = match execute::execute_existing(&ctx, &dag_run).await {
                    Ok(record) => record.status,
                    Err(DagflowError::AlreadyRunning(_)) => {
                        // Duplicate dispatch after a lease reclaim; the
                        // execution right already guards the run.
                        warn!(run = %dag_run, "assignment already running elsewhere; skipping");
                        RunStatus::Running
                    }
                    Err(err) => {
                        error!(run = %dag_run, error = %err, "assignment execution failed");
                        RunStatus::Error
                    }
                };

                if let Err(err) = coordinator.report(&id, dag_run.clone(), status).await {
                    warn!(run = %dag_run, error = %err, "failed to report assignment completion");
                }
            });

            // Opportunistically reap finished executions.
            while executions.try_join_next().is_some() {}
        }

        // Let in-flight assignments run to completion before exiting.
        while executions.join_next().await.is_some() {}
        heartbeat.abort();

        info!(worker_id = %worker_id, "worker stopped");
        Ok(())
    }
}

/// Heartbeats re-register (carrying capacity) rather than only touching the
/// lease, so a worker whose lease was expired during a long stall recovers
/// on its next beat instead of polling into the void.
fn spawn_heartbeat(
    coordinator: CoordinatorHandle,
    worker_id: String,
    capacity: usize,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) = coordinator.register(&worker_id, capacity).await {
                        warn!(worker_id = %worker_id, error = %err, "heartbeat failed");
                        break;
                    }
                }
            }
        }
    })
}
