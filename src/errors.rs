// src/errors.rs

//! Crate-wide error type and helpers.
//!
//! Conflict variants (`AlreadyRunning`, `NotRunning`, `NotQueued`,
//! `NotRetryable`, `AssignmentRejected`) surface to the caller unchanged and
//! are never retried internally. Infrastructure variants (`Io`, `Json`)
//! returned from a persistence write stall the scheduler rather than letting
//! it advance past an unrecorded transition.

use thiserror::Error;

use crate::types::DagRunRef;

#[derive(Error, Debug)]
pub enum DagflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DAG not found: {0}")]
    DagNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(DagRunRef),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("DAG is suspended: {0}")]
    Suspended(String),

    #[error("cycle detected in DAG involving step '{0}'")]
    Cycle(String),

    #[error("step '{step}' depends on unknown step '{depends_on}'")]
    UnknownDependency { step: String, depends_on: String },

    #[error("run is already being executed: {0}")]
    AlreadyRunning(DagRunRef),

    #[error("run is not running: {0}")]
    NotRunning(DagRunRef),

    #[error("run is not queued: {0}")]
    NotQueued(DagRunRef),

    #[error("run cannot be retried while it is active: {0}")]
    NotRetryable(DagRunRef),

    #[error("worker '{worker_id}' rejected the assignment")]
    AssignmentRejected { worker_id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DagflowError>;
