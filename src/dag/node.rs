// src/dag/node.rs

//! Per-run execution state of one step.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::step::Step;

/// Execution status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    NotStarted,
    Running,
    Success,
    Error,
    Cancelled,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Error | NodeStatus::Cancelled | NodeStatus::Skipped
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::NotStarted => "not started",
            NodeStatus::Running => "running",
            NodeStatus::Success => "finished",
            NodeStatus::Error => "failed",
            NodeStatus::Cancelled => "canceled",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a node was skipped.
///
/// The distinction matters for readiness: a precondition skip satisfies
/// dependents, an upstream-failure skip propagates to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    Precondition,
    UpstreamFailure,
}

/// Serializable point-in-time state of a node, as persisted in run records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub step: Step,
    pub status: NodeStatus,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub skip_cause: Option<SkipCause>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub done_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_file: Option<PathBuf>,
    pub exit_code: Option<i32>,
}

impl NodeSnapshot {
    pub fn fresh(step: Step) -> Self {
        Self {
            step,
            status: NodeStatus::NotStarted,
            status_text: String::new(),
            skip_cause: None,
            retry_count: 0,
            done_count: 0,
            started_at: None,
            finished_at: None,
            log_file: None,
            exit_code: None,
        }
    }
}

#[derive(Debug)]
struct NodeState {
    status: NodeStatus,
    status_text: String,
    skip_cause: Option<SkipCause>,
    retry_count: u32,
    done_count: u32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    log_file: Option<PathBuf>,
    exit_code: Option<i32>,
}

/// Runtime wrapper of one step for one run.
///
/// The scheduler task driving the node is the only writer; other tasks only
/// take snapshots. Terminal states are never overwritten except by an
/// explicit operator patch, which goes through the store, not through here.
#[derive(Debug)]
pub struct Node {
    step: Step,
    id: usize,
    state: Mutex<NodeState>,
}

impl Node {
    pub fn new(step: Step, id: usize) -> Self {
        let state = NodeState {
            status: NodeStatus::NotStarted,
            status_text: String::new(),
            skip_cause: None,
            retry_count: 0,
            done_count: 0,
            started_at: None,
            finished_at: None,
            log_file: None,
            exit_code: None,
        };
        Self {
            step,
            id,
            state: Mutex::new(state),
        }
    }

    /// Rebuild a node from a persisted snapshot (retry re-attach).
    pub fn from_snapshot(snapshot: NodeSnapshot, id: usize) -> Self {
        let state = NodeState {
            status: snapshot.status,
            status_text: snapshot.status_text,
            skip_cause: snapshot.skip_cause,
            retry_count: snapshot.retry_count,
            done_count: snapshot.done_count,
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
            log_file: snapshot.log_file,
            exit_code: snapshot.exit_code,
        };
        Self {
            step: snapshot.step,
            id,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }

    pub fn status(&self) -> NodeStatus {
        self.state.lock().expect("node state poisoned").status
    }

    pub fn skip_cause(&self) -> Option<SkipCause> {
        self.state.lock().expect("node state poisoned").skip_cause
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().expect("node state poisoned").retry_count
    }

    pub fn done_count(&self) -> u32 {
        self.state.lock().expect("node state poisoned").done_count
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.lock().expect("node state poisoned");
        NodeSnapshot {
            step: self.step.clone(),
            status: state.status,
            status_text: state.status_text.clone(),
            skip_cause: state.skip_cause,
            retry_count: state.retry_count,
            done_count: state.done_count,
            started_at: state.started_at,
            finished_at: state.finished_at,
            log_file: state.log_file.clone(),
            exit_code: state.exit_code,
        }
    }

    pub fn set_log_file(&self, path: PathBuf) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.log_file = Some(path);
    }

    pub fn set_running(&self) {
        let mut state = self.state.lock().expect("node state poisoned");
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        state.status = NodeStatus::Running;
        state.status_text.clear();
    }

    /// `Error -> Running` edge: retry after backoff.
    pub fn set_retrying(&self) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.retry_count += 1;
        state.status = NodeStatus::Running;
        state.status_text = format!("retry {}", state.retry_count);
    }

    /// `Running -> Running` edge: another repeat execution starting.
    pub fn set_repeating(&self) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.status = NodeStatus::Running;
        state.status_text = format!("repeat {}", state.done_count + 1);
    }

    pub fn inc_done(&self) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.done_count += 1;
    }

    pub fn set_success(&self) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.status = NodeStatus::Success;
        state.finished_at = Some(Utc::now());
    }

    /// Non-terminal failure: retries remain, recorded before the backoff
    /// sleep so the `Running -> Error -> Running` sequence is visible in
    /// history.
    pub fn set_error_retrying(&self, text: impl Into<String>, exit_code: Option<i32>) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.status = NodeStatus::Error;
        state.status_text = text.into();
        state.exit_code = exit_code;
    }

    pub fn set_error(&self, text: impl Into<String>, exit_code: Option<i32>) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.status = NodeStatus::Error;
        state.status_text = text.into();
        state.exit_code = exit_code;
        state.finished_at = Some(Utc::now());
    }

    pub fn set_cancelled(&self) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.status = NodeStatus::Cancelled;
        state.finished_at = Some(Utc::now());
    }

    pub fn set_skipped(&self, cause: SkipCause, text: impl Into<String>) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.status = NodeStatus::Skipped;
        state.skip_cause = Some(cause);
        state.status_text = text.into();
        state.finished_at = Some(Utc::now());
    }

    /// Reset to `NotStarted` for a retry pass. Keeps the log file reference
    /// from the previous attempt until a new one is allocated.
    pub fn reset_for_retry(&self) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.status = NodeStatus::NotStarted;
        state.status_text.clear();
        state.skip_cause = None;
        state.retry_count = 0;
        state.done_count = 0;
        state.started_at = None;
        state.finished_at = None;
        state.exit_code = None;
    }
}
