// src/store/runstore.rs

//! Append-only file store for run status records.
//!
//! One run maps to one directory holding a `status.jsonl`; every state
//! transition appends one full snapshot line (monotonic `seq`), so the last
//! parseable line is the authoritative latest state and earlier lines are
//! the transition history. Aggregate state is never re-derived by collating
//! per-step files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::model::{DagFile, Hooks};
use crate::dag::node::{NodeSnapshot, NodeStatus};
use crate::errors::{DagflowError, Result};
use crate::types::{DagRunRef, RunRequest, RunStatus};

/// One persisted snapshot of a run: identity, aggregate status, and the full
/// node-status array (hook nodes separately, in execution order).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub seq: u64,
    pub dag_run: DagRunRef,
    pub status: RunStatus,
    pub params: String,
    pub request: RunRequest,
    pub max_active_steps: u32,
    pub hooks: Hooks,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeSnapshot>,
    #[serde(default)]
    pub hook_nodes: Vec<NodeSnapshot>,
}

impl RunRecord {
    /// Initial record for a newly triggered run: every node `NotStarted`,
    /// aggregate `Queued`. The step list and hooks are copied in so the run
    /// replays the definition it was created from even if the file changes.
    pub fn new(dag: &DagFile, run_id: String, params: String, request: RunRequest) -> Self {
        Self {
            seq: 0,
            dag_run: DagRunRef::new(dag.name.clone(), run_id),
            status: RunStatus::Queued,
            params,
            request,
            max_active_steps: dag.max_active_steps,
            hooks: dag.hooks.clone(),
            queued_at: Some(Utc::now()),
            started_at: None,
            finished_at: None,
            nodes: dag
                .steps
                .iter()
                .map(|s| NodeSnapshot::fresh(s.clone()))
                .collect(),
            hook_nodes: Vec::new(),
        }
    }

    pub fn node(&self, step: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.step.name == step)
    }
}

/// File-backed run store rooted at `<data_dir>/runs`.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join("runs"),
        }
    }

    /// Create the run directory and write the initial snapshot. Fails if a
    /// directory for this run ID already exists.
    pub fn create(&self, record: &RunRecord) -> Result<PathBuf> {
        if self.find_run_dir(&record.dag_run)?.is_some() {
            return Err(DagflowError::Config(format!(
                "run already exists: {}",
                record.dag_run
            )));
        }

        let stamp = record
            .queued_at
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d_%H%M%S%3f");
        let dir = self
            .root
            .join(&record.dag_run.dag)
            .join(format!("{stamp}_{}", record.dag_run.run_id));
        fs::create_dir_all(dir.join("logs"))?;

        self.append_to(&dir, record)?;
        Ok(dir)
    }

    /// Append one snapshot line. The write is flushed and synced before
    /// returning; a failure here must stall the caller, never be ignored.
    pub fn append(&self, record: &RunRecord) -> Result<()> {
        let dir = self.run_dir(&record.dag_run)?;
        self.append_to(&dir, record)
    }

    fn append_to(&self, dir: &Path, record: &RunRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("status.jsonl"))?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }

    /// Latest snapshot for an explicit run ID.
    pub fn read_latest(&self, dag_run: &DagRunRef) -> Result<RunRecord> {
        let dir = self.run_dir(dag_run)?;
        self.read_latest_in(&dir)
            .ok_or_else(|| DagflowError::RunNotFound(dag_run.clone()))
    }

    /// Whether any record exists for this run ID.
    pub fn exists(&self, dag_run: &DagRunRef) -> Result<bool> {
        Ok(self.find_run_dir(dag_run)?.is_some())
    }

    /// Latest snapshot of the most recent run of a DAG.
    pub fn latest_for_dag(&self, dag: &str) -> Result<Option<RunRecord>> {
        Ok(self.history(dag, 1)?.into_iter().next())
    }

    /// The `limit` most recent runs, newest first.
    pub fn history(&self, dag: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let dag_dir = self.root.join(dag);
        if !dag_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut dirs: Vec<PathBuf> = fs::read_dir(&dag_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        // Directory names start with the queued timestamp, so a name sort is
        // a chronological sort.
        dirs.sort();
        dirs.reverse();

        let mut records = Vec::new();
        for dir in dirs.into_iter() {
            if records.len() >= limit {
                break;
            }
            match self.read_latest_in(&dir) {
                Some(record) => records.push(record),
                None => {
                    warn!(dir = %dir.display(), "run directory without a readable status; skipping");
                }
            }
        }
        Ok(records)
    }

    /// Patch one node's terminal status (operator remediation on a finished
    /// run) and recompute the aggregate, appending a new snapshot.
    ///
    /// The caller is responsible for rejecting the patch on an active run.
    pub fn mark_node_status(
        &self,
        dag_run: &DagRunRef,
        step: &str,
        status: NodeStatus,
        status_text: &str,
    ) -> Result<RunRecord> {
        let mut record = self.read_latest(dag_run)?;

        let node = record
            .nodes
            .iter_mut()
            .find(|n| n.step.name == step)
            .ok_or_else(|| DagflowError::StepNotFound(step.to_string()))?;
        node.status = status;
        node.status_text = status_text.to_string();
        node.skip_cause = None;
        if node.finished_at.is_none() {
            node.finished_at = Some(Utc::now());
        }

        let graph = crate::dag::ExecutionGraph::from_snapshots(record.nodes.clone())?;
        let was_cancelled = record.status == RunStatus::Cancelled;
        record.status = graph.outcome(was_cancelled);
        record.seq += 1;
        self.append(&record)?;
        Ok(record)
    }

    /// Per-step log file path inside the run directory.
    pub fn log_path(&self, dag_run: &DagRunRef, step: &str) -> Result<PathBuf> {
        let dir = self.run_dir(dag_run)?;
        Ok(dir.join("logs").join(format!("{step}.log")))
    }

    pub fn read_log(&self, dag_run: &DagRunRef, step: &str) -> Result<String> {
        Ok(fs::read_to_string(self.log_path(dag_run, step)?)?)
    }

    /// Drop a cancel marker for the run. The owning scheduler notices it on
    /// its next tick, which is how `stop` reaches a scheduler in another
    /// process.
    pub fn request_cancel(&self, dag_run: &DagRunRef) -> Result<()> {
        let dir = self.run_dir(dag_run)?;
        fs::write(dir.join(".cancel"), Utc::now().to_rfc3339())?;
        Ok(())
    }

    pub fn cancel_requested(&self, dag_run: &DagRunRef) -> bool {
        match self.find_run_dir(dag_run) {
            Ok(Some(dir)) => dir.join(".cancel").exists(),
            _ => false,
        }
    }

    pub fn clear_cancel(&self, dag_run: &DagRunRef) -> Result<()> {
        let dir = self.run_dir(dag_run)?;
        let marker = dir.join(".cancel");
        if marker.exists() {
            fs::remove_file(marker)?;
        }
        Ok(())
    }

    pub fn run_dir(&self, dag_run: &DagRunRef) -> Result<PathBuf> {
        self.find_run_dir(dag_run)?
            .ok_or_else(|| DagflowError::RunNotFound(dag_run.clone()))
    }

    fn find_run_dir(&self, dag_run: &DagRunRef) -> Result<Option<PathBuf>> {
        let dag_dir = self.root.join(&dag_run.dag);
        if !dag_dir.is_dir() {
            return Ok(None);
        }
        let suffix = format!("_{}", dag_run.run_id);
        for entry in fs::read_dir(&dag_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() && name.ends_with(&suffix) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    fn read_latest_in(&self, dir: &Path) -> Option<RunRecord> {
        let file = File::open(dir.join("status.jsonl")).ok()?;
        let reader = BufReader::new(file);

        // A crash can leave a truncated final line; fall back to the last
        // parseable snapshot.
        let mut latest = None;
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(&line) {
                Ok(record) => latest = Some(record),
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "unreadable status line; keeping previous snapshot");
                }
            }
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::Hooks;
    use crate::dag::step::Step;

    fn dag_file(name: &str, steps: &[&str]) -> DagFile {
        DagFile {
            name: name.to_string(),
            params: String::new(),
            max_active_runs: 1,
            max_active_steps: 0,
            steps: steps
                .iter()
                .map(|s| Step {
                    name: s.to_string(),
                    command: format!("echo {s}"),
                    depends: Vec::new(),
                    retry: None,
                    repeat: None,
                    preconditions: Vec::new(),
                })
                .collect(),
            hooks: Hooks::default(),
        }
    }

    #[test]
    fn create_then_read_latest_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(tmp.path());
        let dag = dag_file("etl", &["a", "b"]);

        let record = RunRecord::new(&dag, "run-1".to_string(), String::new(), RunRequest::Manual);
        store.create(&record).unwrap();

        let latest = store.read_latest(&record.dag_run).unwrap();
        assert_eq!(latest.status, RunStatus::Queued);
        assert_eq!(latest.nodes.len(), 2);
    }

    #[test]
    fn append_advances_latest_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(tmp.path());
        let dag = dag_file("etl", &["a"]);

        let mut record =
            RunRecord::new(&dag, "run-1".to_string(), String::new(), RunRequest::Manual);
        store.create(&record).unwrap();

        record.seq += 1;
        record.status = RunStatus::Running;
        record.started_at = Some(Utc::now());
        store.append(&record).unwrap();

        let latest = store.read_latest(&record.dag_run).unwrap();
        assert_eq!(latest.seq, 1);
        assert_eq!(latest.status, RunStatus::Running);
    }

    #[test]
    fn history_is_reverse_chronological_and_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(tmp.path());
        let dag = dag_file("etl", &["a"]);

        for i in 0..3i64 {
            let mut record = RunRecord::new(
                &dag,
                format!("run-{i}"),
                String::new(),
                RunRequest::Manual,
            );
            // Distinct queued timestamps so directory names sort.
            record.queued_at = Some(Utc::now() + chrono::Duration::milliseconds(i * 10));
            store.create(&record).unwrap();
        }

        let history = store.history("etl", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].dag_run.run_id, "run-2");
        assert_eq!(history[1].dag_run.run_id, "run-1");
    }

    #[test]
    fn mark_node_status_recomputes_aggregate() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(tmp.path());
        let dag = dag_file("etl", &["a", "b"]);

        let mut record =
            RunRecord::new(&dag, "run-1".to_string(), String::new(), RunRequest::Manual);
        for node in record.nodes.iter_mut() {
            node.status = NodeStatus::Success;
        }
        record.nodes[1].status = NodeStatus::Error;
        record.status = RunStatus::Error;
        store.create(&record).unwrap();

        let patched = store
            .mark_node_status(&record.dag_run, "b", NodeStatus::Success, "marked by operator")
            .unwrap();
        assert_eq!(patched.status, RunStatus::Success);
        assert_eq!(patched.node("b").unwrap().status, NodeStatus::Success);
    }

    #[test]
    fn missing_run_is_run_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(tmp.path());
        let err = store
            .read_latest(&DagRunRef::new("etl", "nope"))
            .unwrap_err();
        assert!(matches!(err, DagflowError::RunNotFound(_)));
    }
}
