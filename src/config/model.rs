// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::dag::step::{Backoff, Precondition, RepeatPolicy, RetryPolicy, Step};

/// Top-level DAG definition as read from a TOML file, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDagFile {
    /// DAG name; defaults to the file stem when omitted.
    #[serde(default)]
    pub name: Option<String>,

    /// Default parameter string passed to every run (`KEY=VALUE` pairs,
    /// whitespace separated). Overridable per run.
    #[serde(default)]
    pub params: Option<String>,

    /// Concurrency ceiling across runs of this DAG. `0` means unlimited.
    #[serde(default)]
    pub max_active_runs: Option<u32>,

    /// Concurrency ceiling within one run. `0` means unlimited.
    #[serde(default)]
    pub max_active_steps: Option<u32>,

    /// Lifecycle hook steps from `[hooks]`.
    #[serde(default)]
    pub hooks: RawHooks,

    /// All steps from `[step.<name>]`. Keys are the step names.
    #[serde(default)]
    pub step: BTreeMap<String, RawStep>,
}

/// `[step.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStep {
    /// Shell command to execute.
    pub command: String,

    /// Names of steps this one waits for.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Optional retry policy for failed executions.
    #[serde(default)]
    pub retry: Option<RawRetry>,

    /// Optional repeat policy: re-run on an interval regardless of exit
    /// code, until the limit (or cancellation).
    #[serde(default)]
    pub repeat: Option<RawRepeat>,

    /// Preconditions gating execution; any mismatch skips the step.
    #[serde(default)]
    pub preconditions: Vec<RawPrecondition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRetry {
    pub max_retries: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub interval_ms: u64,

    /// `"fixed"` (default) or `"exponential"`.
    #[serde(default)]
    pub backoff: RawBackoff,
}

fn default_retry_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawBackoff {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRepeat {
    pub interval_ms: u64,

    /// Maximum number of executions; `None` repeats until cancelled.
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPrecondition {
    /// Value to test; `$VAR` references are expanded from the run
    /// environment before comparison.
    pub condition: String,

    /// Expected value after expansion.
    pub expected: String,
}

/// `[hooks]` section: lifecycle pseudo-steps run when the graph reaches a
/// terminal state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawHooks {
    #[serde(default)]
    pub on_success: Option<RawHookStep>,
    #[serde(default)]
    pub on_failure: Option<RawHookStep>,
    #[serde(default)]
    pub on_cancel: Option<RawHookStep>,
    #[serde(default)]
    pub on_exit: Option<RawHookStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHookStep {
    pub command: String,
}

/// Validated DAG definition. Construct via
/// `DagFile::try_from(RawDagFile)` (see [`super::validate`]) or the loader.
#[derive(Debug, Clone)]
pub struct DagFile {
    pub name: String,
    pub params: String,
    pub max_active_runs: u32,
    pub max_active_steps: u32,
    pub steps: Vec<Step>,
    pub hooks: Hooks,
}

/// Validated lifecycle hook steps, already in executable [`Step`] form.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct Hooks {
    pub on_success: Option<Step>,
    pub on_failure: Option<Step>,
    pub on_cancel: Option<Step>,
    pub on_exit: Option<Step>,
}

impl DagFile {
    /// Construct without re-running validation. Used by the
    /// `TryFrom<RawDagFile>` impl after checks pass.
    pub(crate) fn new_unchecked(name: String, raw: RawDagFile) -> Self {
        let steps = raw
            .step
            .iter()
            .map(|(step_name, rs)| step_from_raw(step_name, rs))
            .collect();

        let hook = |h: &Option<RawHookStep>, name: &str| {
            h.as_ref().map(|hs| Step {
                name: name.to_string(),
                command: hs.command.clone(),
                depends: Vec::new(),
                retry: None,
                repeat: None,
                preconditions: Vec::new(),
            })
        };

        let hooks = Hooks {
            on_success: hook(&raw.hooks.on_success, "on_success"),
            on_failure: hook(&raw.hooks.on_failure, "on_failure"),
            on_cancel: hook(&raw.hooks.on_cancel, "on_cancel"),
            on_exit: hook(&raw.hooks.on_exit, "on_exit"),
        };

        Self {
            name: raw.name.unwrap_or(name),
            params: raw.params.unwrap_or_default(),
            max_active_runs: raw.max_active_runs.unwrap_or(1),
            max_active_steps: raw.max_active_steps.unwrap_or(0),
            steps,
            hooks,
        }
    }
}

fn step_from_raw(name: &str, raw: &RawStep) -> Step {
    Step {
        name: name.to_string(),
        command: raw.command.clone(),
        depends: raw.depends.clone(),
        retry: raw.retry.as_ref().map(|r| RetryPolicy {
            max_retries: r.max_retries,
            interval_ms: r.interval_ms,
            backoff: match r.backoff {
                RawBackoff::Fixed => Backoff::Fixed,
                RawBackoff::Exponential => Backoff::Exponential,
            },
        }),
        repeat: raw.repeat.as_ref().map(|r| RepeatPolicy {
            interval_ms: r.interval_ms,
            limit: r.limit,
        }),
        preconditions: raw
            .preconditions
            .iter()
            .map(|p| Precondition {
                condition: p.condition.clone(),
                expected: p.expected.clone(),
            })
            .collect(),
    }
}
