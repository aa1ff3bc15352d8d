// src/dag/step.rs

//! Static step definition and its execution policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One step of a DAG: a shell command plus scheduling policy.
///
/// Immutable once a run starts; the run record persists the step list it ran
/// with, so a later edit of the definition file never changes history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub repeat: Option<RepeatPolicy>,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
}

/// Retry policy for failed executions: `max_retries` additional attempts
/// after the first, separated by the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval_ms: u64,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based: the delay after the
    /// first failure is `delay_for(0)`). Exponential doubles per retry.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = Duration::from_millis(self.interval_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => base.saturating_mul(2u32.saturating_pow(retry)),
        }
    }
}

/// Repeat policy: re-run on a fixed interval regardless of exit code,
/// bounded by `limit` executions, or indefinitely until cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepeatPolicy {
    pub interval_ms: u64,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl RepeatPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// A boolean gate evaluated before a step may run.
///
/// `condition` is expanded against the process environment (`$VAR`
/// references) and compared to `expected`; a mismatch routes the node to
/// `Skipped` instead of `Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precondition {
    pub condition: String,
    pub expected: String,
}

impl Precondition {
    pub fn is_met(&self) -> bool {
        expand_env(&self.condition) == expand_env(&self.expected)
    }
}

/// Expand `$NAME` references from the process environment. Unknown
/// variables expand to the empty string.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let mut name = String::new();
        while let Some(&(_, nc)) = chars.peek() {
            if nc.is_ascii_alphanumeric() || nc == '_' {
                name.push(nc);
                chars.next();
            } else {
                break;
            }
        }

        if name.is_empty() {
            out.push('$');
        } else if let Ok(value) = std::env::var(&name) {
            out.push_str(&value);
        }
    }

    out
}
