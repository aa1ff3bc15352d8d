// src/exec/command.rs

//! Production command runner: one OS process per step attempt.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::exec::backend::{CommandRunner, CommandSpec, ExecOutcome};

/// Runs step commands through the platform shell, captures combined
/// stdout/stderr into the step's log file, and implements cooperative
/// cancellation: SIGTERM, a bounded grace period, then SIGKILL.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
}

impl ProcessRunner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        spec: CommandSpec,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ExecOutcome>> + Send + '_>> {
        let grace = self.grace_period;
        Box::pin(async move { run_attempt(spec, cancel, grace).await })
    }
}

async fn run_attempt(
    spec: CommandSpec,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<ExecOutcome> {
    info!(
        dag = %spec.dag,
        run_id = %spec.run_id,
        step = %spec.step,
        cmd = %spec.command,
        "starting step process"
    );

    if let Some(parent) = spec.log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_file)?;
    let log_err = log.try_clone()?;

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&spec.command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&spec.command);
        c
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .env("DAGFLOW_DAG", &spec.dag)
        .env("DAGFLOW_RUN_ID", &spec.run_id)
        .env("DAGFLOW_STEP", &spec.step)
        .env("DAGFLOW_LOG_FILE", &spec.log_file)
        .kill_on_drop(true);

    for (key, value) in parse_params(&spec.params) {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            let code = status.code();
            info!(
                dag = %spec.dag,
                run_id = %spec.run_id,
                step = %spec.step,
                exit_code = code,
                success = status.success(),
                "step process exited"
            );
            Ok(ExecOutcome { exit_code: code, cancelled: false })
        }

        _ = cancel.cancelled() => {
            info!(
                dag = %spec.dag,
                run_id = %spec.run_id,
                step = %spec.step,
                "cancellation requested; terminating step process"
            );
            terminate_with_grace(&mut child, &spec, grace).await;
            Ok(ExecOutcome { exit_code: None, cancelled: true })
        }
    }
}

/// SIGTERM first, then SIGKILL once the grace period runs out.
async fn terminate_with_grace(child: &mut Child, spec: &CommandSpec, grace: Duration) {
    send_term(child, spec);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(step = %spec.step, ?status, "step exited within grace period");
        }
        Ok(Err(err)) => {
            warn!(step = %spec.step, error = %err, "waiting for terminated step failed");
        }
        Err(_elapsed) => {
            warn!(step = %spec.step, "grace period expired; killing step process");
            if let Err(err) = child.kill().await {
                warn!(step = %spec.step, error = %err, "failed to kill step process");
            }
        }
    }
}

#[cfg(unix)]
fn send_term(child: &Child, spec: &CommandSpec) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(step = %spec.step, error = %err, "failed to deliver SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn send_term(_child: &Child, _spec: &CommandSpec) {
    // No SIGTERM equivalent; the grace-period timeout falls through to kill.
}

fn parse_params(params: &str) -> Vec<(String, String)> {
    params
        .split_whitespace()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}
