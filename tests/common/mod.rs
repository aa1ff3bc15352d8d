#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use dagflow::config::DagFile;
use dagflow::dag::SchedulerConfig;
use dagflow::engine::{EngineConfig, EngineContext};
use dagflow::store::RunRecord;
use dagflow::types::RunRequest;
use dagflow_test_utils::fake_runner::FakeRunner;

/// A temp data dir, an engine context wired to a fake runner, and the
/// runner handle for scripting/inspection.
pub struct Harness {
    pub tmp: TempDir,
    pub ctx: Arc<EngineContext>,
    pub runner: Arc<FakeRunner>,
}

pub fn harness() -> Harness {
    dagflow_test_utils::init_tracing();

    let tmp = TempDir::new().expect("create temp dir");
    let mut config = EngineConfig::new(tmp.path().join("data"), tmp.path().join("dags"));
    // Fast ticks so stop/cancel tests resolve quickly.
    config.scheduler = SchedulerConfig {
        tick_interval: Duration::from_millis(50),
    };

    let runner = FakeRunner::with_delay(Duration::from_millis(10));
    let ctx = Arc::new(EngineContext::with_runner(config, runner.clone()));
    Harness { tmp, ctx, runner }
}

/// Create the initial run record in the store, as a trigger would.
pub fn create_run(harness: &Harness, dag: &DagFile, run_id: &str) -> RunRecord {
    let record = RunRecord::new(
        dag,
        run_id.to_string(),
        dag.params.clone(),
        RunRequest::Manual,
    );
    harness.ctx.store.create(&record).expect("create run record");
    record
}

pub fn dags_dir(harness: &Harness) -> std::path::PathBuf {
    harness.ctx.config.dags_dir.clone()
}
