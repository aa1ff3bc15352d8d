// src/types.rs

//! Shared identifier and status types used across the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one DAG-run: `(dag name, run ID)`.
///
/// The run ID is either caller-supplied (idempotent "start if not already
/// running") or generated with [`new_run_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DagRunRef {
    pub dag: String,
    pub run_id: String,
}

impl DagRunRef {
    pub fn new(dag: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            dag: dag.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for DagRunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dag, self.run_id)
    }
}

/// Generate a fresh run ID.
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Provenance of a DAG-run: what created it.
///
/// `Retry` is recorded on snapshots appended by a retry pass re-attaching to
/// an existing run; `Reschedule` points at the run it was cloned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunRequest {
    Manual,
    Retry,
    Reschedule { of: DagRunRef },
}

/// Status of a whole DAG-run.
///
/// Aside from `Queued` (pre-dispatch) and `Cancelled` (operator-initiated),
/// this is always the aggregation of terminal node statuses computed by
/// [`crate::dag::graph::ExecutionGraph::outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Error,
    Cancelled,
    PartialSuccess,
}

impl RunStatus {
    /// Whether the run still owns (or awaits) an execution right.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "finished",
            RunStatus::Error => "failed",
            RunStatus::Cancelled => "canceled",
            RunStatus::PartialSuccess => "partially finished",
        };
        f.write_str(s)
    }
}

/// Timestamp helper: everything persisted uses UTC.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
