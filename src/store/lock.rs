// src/store/lock.rs

//! The execution right: a per-run mutual-exclusion lock that survives
//! process crashes.
//!
//! Acquisition is an atomic `create_dir` of `<locks>/<dag>/<run_id>`; the
//! holder writes `owner.json` and refreshes its heartbeat from the
//! scheduler loop. A lock whose heartbeat is older than `stale_after` is
//! treated as abandoned by a crashed scheduler and can be taken over, so a
//! run can never stay "running" forever.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{DagflowError, Result};
use crate::types::DagRunRef;

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OwnerInfo {
    owner_id: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
}

/// Handle to the execution right of one `(dag, run_id)`.
#[derive(Debug)]
pub struct RunLock {
    dir: PathBuf,
    dag_run: DagRunRef,
    owner_id: String,
    opts: LockOptions,
    held: bool,
}

impl RunLock {
    pub fn new(data_dir: impl AsRef<Path>, dag_run: DagRunRef, opts: LockOptions) -> Self {
        let dir = locks_root(data_dir.as_ref())
            .join(&dag_run.dag)
            .join(&dag_run.run_id);
        Self {
            dir,
            dag_run,
            owner_id: uuid::Uuid::new_v4().to_string(),
            opts,
            held: false,
        }
    }

    /// Acquire the execution right, taking over a stale holder if needed.
    /// `AlreadyRunning` when another live holder exists.
    pub fn try_acquire(&mut self) -> Result<()> {
        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent)?;
        }

        for attempt in 0..2 {
            match fs::create_dir(&self.dir) {
                Ok(()) => {
                    self.write_owner()?;
                    self.held = true;
                    debug!(run = %self.dag_run, owner = %self.owner_id, "acquired execution right");
                    return Ok(());
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && self.holder_is_stale() {
                        warn!(
                            run = %self.dag_run,
                            "stale execution right detected; reclaiming"
                        );
                        let _ = fs::remove_dir_all(&self.dir);
                        continue;
                    }
                    return Err(DagflowError::AlreadyRunning(self.dag_run.clone()));
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(DagflowError::AlreadyRunning(self.dag_run.clone()))
    }

    /// Refresh the heartbeat. Called periodically by the holding scheduler.
    pub fn heartbeat(&self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.write_owner()
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    fn write_owner(&self) -> Result<()> {
        let info = OwnerInfo {
            owner_id: self.owner_id.clone(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        let tmp = self.dir.join(".owner.tmp");
        fs::write(&tmp, serde_json::to_vec(&info)?)?;
        fs::rename(&tmp, self.dir.join("owner.json"))?;
        Ok(())
    }

    fn holder_is_stale(&self) -> bool {
        lock_dir_is_stale(&self.dir, self.opts.stale_after)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.held {
            let _ = self.release();
        }
    }
}

/// Whether another scheduler currently holds a fresh lock for this run.
pub fn held_and_fresh(data_dir: &Path, dag_run: &DagRunRef, opts: LockOptions) -> bool {
    let dir = locks_root(data_dir).join(&dag_run.dag).join(&dag_run.run_id);
    dir.is_dir() && !lock_dir_is_stale(&dir, opts.stale_after)
}

/// Number of live (fresh-heartbeat) execution rights held for a DAG. This is
/// the admission-time counter behind `max_active_runs`.
pub fn active_count_for_dag(data_dir: &Path, dag: &str, opts: LockOptions) -> usize {
    let dag_dir = locks_root(data_dir).join(dag);
    let Ok(entries) = fs::read_dir(&dag_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && !lock_dir_is_stale(p, opts.stale_after))
        .count()
}

fn locks_root(data_dir: &Path) -> PathBuf {
    data_dir.join("locks")
}

fn lock_dir_is_stale(dir: &Path, stale_after: Duration) -> bool {
    let owner_path = dir.join("owner.json");
    match fs::read(&owner_path) {
        Ok(bytes) => match serde_json::from_slice::<OwnerInfo>(&bytes) {
            Ok(info) => {
                let age = Utc::now().signed_duration_since(info.heartbeat_at);
                age.to_std().map(|a| a > stale_after).unwrap_or(false)
            }
            Err(_) => dir_mtime_older_than(dir, stale_after),
        },
        // The winner may not have written owner.json yet; only treat the
        // lock as stale once the directory itself is old.
        Err(_) => dir_mtime_older_than(dir, stale_after),
    }
}

fn dir_mtime_older_than(dir: &Path, stale_after: Duration) -> bool {
    fs::metadata(dir)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}
