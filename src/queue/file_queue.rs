// src/queue/file_queue.rs

//! File-backed FIFO queue with a front-priority lane.
//!
//! One JSON file per entry, named `item_<prio>_<millis>_<run_id>.json`, so a
//! plain name sort yields dispatch order (front lane first, then FIFO).
//! Dequeue is claim-or-fail: the entry file is atomically renamed into
//! `claimed/` and only deleted when the claimant commits. A claim orphaned
//! by a crash is swept back into the queue after a timeout, so an entry can
//! be re-dispatched but never silently dropped.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{DagflowError, Result};
use crate::types::DagRunRef;

/// Dispatch priority. `Front` sorts before `Normal` and is used for
/// operator-priority enqueues and for reclaimed assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Front,
    Normal,
}

impl Priority {
    fn prefix(self) -> char {
        match self {
            Priority::Front => '0',
            Priority::Normal => '1',
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub dag_run: DagRunRef,
    pub enqueued_at: DateTime<Utc>,
    pub priority: Priority,
}

/// A dequeued entry awaiting commit or release.
///
/// Dropping a claim without calling either leaves the file in `claimed/`;
/// the stale-claim sweep re-queues it after the timeout.
#[derive(Debug)]
pub struct ClaimedEntry {
    pub entry: QueueEntry,
    claimed_path: PathBuf,
    queue_dir: PathBuf,
}

impl ClaimedEntry {
    /// The entry was handed off; remove it for good.
    pub fn commit(self) -> Result<()> {
        match fs::remove_file(&self.claimed_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Hand-off failed; put the entry back at the front of the queue.
    pub fn release(self) -> Result<()> {
        let name = item_file_name(Priority::Front, &self.entry.dag_run.run_id);
        let target = self.queue_dir.join(name);
        let mut entry = self.entry;
        entry.priority = Priority::Front;
        write_entry(&target, &entry)?;
        match fs::remove_file(&self.claimed_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Durable queue rooted at `<data_dir>/queue`.
#[derive(Debug, Clone)]
pub struct FileQueue {
    dir: PathBuf,
}

impl FileQueue {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("queue"),
        }
    }

    /// Add an entry at normal priority. Idempotent per `(dag, run_id)`:
    /// re-enqueuing a pending or claimed run is a no-op. Returns whether a
    /// new entry was written.
    pub fn enqueue(&self, dag_run: &DagRunRef) -> Result<bool> {
        self.enqueue_with(dag_run, Priority::Normal)
    }

    /// Add an entry at front priority (reclaimed or operator-priority work).
    pub fn enqueue_front(&self, dag_run: &DagRunRef) -> Result<bool> {
        self.enqueue_with(dag_run, Priority::Front)
    }

    fn enqueue_with(&self, dag_run: &DagRunRef, priority: Priority) -> Result<bool> {
        fs::create_dir_all(self.claimed_dir())?;

        if self.find_pending(dag_run)?.is_some() || self.find_claimed(dag_run)?.is_some() {
            debug!(run = %dag_run, "already queued; enqueue is a no-op");
            return Ok(false);
        }

        let entry = QueueEntry {
            dag_run: dag_run.clone(),
            enqueued_at: Utc::now(),
            priority,
        };
        let path = self
            .dir
            .join(item_file_name(priority, &dag_run.run_id));
        write_entry(&path, &entry)?;
        info!(run = %dag_run, ?priority, "run queued");
        Ok(true)
    }

    /// Claim the oldest eligible entry, or `None` when the queue is empty.
    pub fn dequeue(&self) -> Result<Option<ClaimedEntry>> {
        fs::create_dir_all(self.claimed_dir())?;

        for path in self.pending_paths()? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            let claimed_path = self.claimed_dir().join(&name);

            // Atomic rename is the claim; losing the race to another
            // claimant just moves on to the next entry.
            match fs::rename(&path, &claimed_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }

            match read_entry(&claimed_path) {
                Ok(entry) => {
                    return Ok(Some(ClaimedEntry {
                        entry,
                        claimed_path,
                        queue_dir: self.dir.clone(),
                    }));
                }
                Err(err) => {
                    warn!(file = %name, error = %err, "unreadable queue entry; discarding");
                    let _ = fs::remove_file(&claimed_path);
                }
            }
        }

        Ok(None)
    }

    /// Operator dequeue: remove a pending entry. `NotQueued` when no pending
    /// entry exists (a claimed entry is already on its way to a worker).
    pub fn remove(&self, dag_run: &DagRunRef) -> Result<()> {
        match self.find_pending(dag_run)? {
            Some(path) => {
                fs::remove_file(path)?;
                info!(run = %dag_run, "run removed from queue");
                Ok(())
            }
            None => Err(DagflowError::NotQueued(dag_run.clone())),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.pending_paths()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Pending entries in dispatch order.
    pub fn list(&self) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for path in self.pending_paths()? {
            match read_entry(&path) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "unreadable queue entry; skipping");
                }
            }
        }
        Ok(entries)
    }

    /// Re-queue claims older than `timeout` (claimant presumed dead).
    /// Returns how many entries were recovered.
    pub fn sweep_stale_claims(&self, timeout: Duration) -> Result<usize> {
        let claimed_dir = self.claimed_dir();
        if !claimed_dir.is_dir() {
            return Ok(0);
        }

        let mut recovered = 0;
        for entry in fs::read_dir(&claimed_dir)? {
            let path = entry?.path();
            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok());
            let Some(age) = age else { continue };
            if age <= timeout {
                continue;
            }

            match read_entry(&path) {
                Ok(entry) => {
                    warn!(run = %entry.dag_run, "stale queue claim; re-queuing at front");
                    let claimed = ClaimedEntry {
                        entry,
                        claimed_path: path,
                        queue_dir: self.dir.clone(),
                    };
                    claimed.release()?;
                    recovered += 1;
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "unreadable stale claim; discarding");
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(recovered)
    }

    fn pending_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("item_") && n.ends_with(".json"))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn find_pending(&self, dag_run: &DagRunRef) -> Result<Option<PathBuf>> {
        let suffix = format!("_{}.json", dag_run.run_id);
        Ok(self
            .pending_paths()?
            .into_iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&suffix))
            }))
    }

    fn find_claimed(&self, dag_run: &DagRunRef) -> Result<Option<PathBuf>> {
        let claimed_dir = self.claimed_dir();
        if !claimed_dir.is_dir() {
            return Ok(None);
        }
        let suffix = format!("_{}.json", dag_run.run_id);
        for entry in fs::read_dir(&claimed_dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    fn claimed_dir(&self) -> PathBuf {
        self.dir.join("claimed")
    }
}

fn item_file_name(priority: Priority, run_id: &str) -> String {
    format!(
        "item_{}_{:020}_{}.json",
        priority.prefix(),
        Utc::now().timestamp_millis(),
        run_id
    )
}

fn write_entry(path: &Path, entry: &QueueEntry) -> Result<()> {
    // Write to a temp file first so a reader never sees a partial entry.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec(entry)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_entry(path: &Path) -> Result<QueueEntry> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
