// src/exec/backend.rs

//! Pluggable command-runner abstraction.
//!
//! Production code uses [`super::ProcessRunner`]; tests provide their own
//! implementation that, for example, records which steps ran and resolves
//! with scripted exit codes.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::errors::Result;

/// Everything a runner needs to execute one step attempt.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub dag: String,
    pub run_id: String,
    pub step: String,
    pub command: String,
    /// Whitespace-separated `KEY=VALUE` pairs exported into the child
    /// environment.
    pub params: String,
    /// Captured-output file; attempts append to the same per-step file.
    pub log_file: PathBuf,
}

/// Result of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    /// True when the attempt ended because of the cancellation token.
    pub cancelled: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// Trait abstracting how a single step attempt is executed.
///
/// Implementations observe `cancel` cooperatively: on cancellation the
/// attempt gets a bounded grace period to exit before it is forced, and the
/// outcome comes back with `cancelled = true`.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        spec: CommandSpec,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ExecOutcome>> + Send + '_>>;
}
