#![allow(dead_code)]

use std::collections::BTreeMap;

use dagflow::config::model::{
    RawBackoff, RawDagFile, RawHookStep, RawHooks, RawPrecondition, RawRepeat, RawRetry, RawStep,
};
use dagflow::config::{DagFile, into_dag_file};

/// Builder for [`DagFile`] to simplify test setup; goes through the same
/// validation path as loading a definition file.
pub struct DagBuilder {
    name: String,
    raw: RawDagFile,
}

impl DagBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            raw: RawDagFile {
                name: None,
                params: None,
                max_active_runs: None,
                max_active_steps: None,
                hooks: RawHooks::default(),
                step: BTreeMap::new(),
            },
        }
    }

    pub fn params(mut self, params: &str) -> Self {
        self.raw.params = Some(params.to_string());
        self
    }

    pub fn max_active_runs(mut self, n: u32) -> Self {
        self.raw.max_active_runs = Some(n);
        self
    }

    pub fn max_active_steps(mut self, n: u32) -> Self {
        self.raw.max_active_steps = Some(n);
        self
    }

    pub fn on_success(mut self, command: &str) -> Self {
        self.raw.hooks.on_success = Some(RawHookStep {
            command: command.to_string(),
        });
        self
    }

    pub fn on_failure(mut self, command: &str) -> Self {
        self.raw.hooks.on_failure = Some(RawHookStep {
            command: command.to_string(),
        });
        self
    }

    pub fn on_cancel(mut self, command: &str) -> Self {
        self.raw.hooks.on_cancel = Some(RawHookStep {
            command: command.to_string(),
        });
        self
    }

    pub fn on_exit(mut self, command: &str) -> Self {
        self.raw.hooks.on_exit = Some(RawHookStep {
            command: command.to_string(),
        });
        self
    }

    pub fn step(mut self, name: &str, step: RawStep) -> Self {
        self.raw.step.insert(name.to_string(), step);
        self
    }

    pub fn build(self) -> DagFile {
        into_dag_file(&self.name, self.raw).expect("builder produced an invalid DAG")
    }

    pub fn try_build(self) -> dagflow::errors::Result<DagFile> {
        into_dag_file(&self.name, self.raw)
    }
}

/// Builder for one step definition.
pub struct StepBuilder {
    raw: RawStep,
}

impl StepBuilder {
    pub fn new(command: &str) -> Self {
        Self {
            raw: RawStep {
                command: command.to_string(),
                depends: Vec::new(),
                retry: None,
                repeat: None,
                preconditions: Vec::new(),
            },
        }
    }

    pub fn depends(mut self, dep: &str) -> Self {
        self.raw.depends.push(dep.to_string());
        self
    }

    pub fn retry(mut self, max_retries: u32, interval_ms: u64) -> Self {
        self.raw.retry = Some(RawRetry {
            max_retries,
            interval_ms,
            backoff: RawBackoff::Fixed,
        });
        self
    }

    pub fn retry_exponential(mut self, max_retries: u32, interval_ms: u64) -> Self {
        self.raw.retry = Some(RawRetry {
            max_retries,
            interval_ms,
            backoff: RawBackoff::Exponential,
        });
        self
    }

    pub fn repeat(mut self, interval_ms: u64, limit: Option<u32>) -> Self {
        self.raw.repeat = Some(RawRepeat { interval_ms, limit });
        self
    }

    pub fn precondition(mut self, condition: &str, expected: &str) -> Self {
        self.raw.preconditions.push(RawPrecondition {
            condition: condition.to_string(),
            expected: expected.to_string(),
        });
        self
    }

    pub fn build(self) -> RawStep {
        self.raw
    }
}
