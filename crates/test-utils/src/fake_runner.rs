use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dagflow::errors::Result;
use dagflow::exec::{CommandRunner, CommandSpec, ExecOutcome};

/// A fake command runner that never spawns processes.
///
/// - Records every execution (step name, in start order).
/// - Resolves with scripted exit codes per step (default 0); a script is
///   consumed one entry per execution, sticking to its last entry after.
/// - Tracks the concurrency high-water mark for ceiling assertions.
/// - Steps registered with [`FakeRunner::hang`] block until cancelled.
pub struct FakeRunner {
    delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<i32>>>,
    hanging: Mutex<HashSet<String>>,
    executed: Mutex<Vec<String>>,
    current: AtomicUsize,
    high_water: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(10))
    }

    /// Each simulated execution takes `delay` before resolving.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            scripts: Mutex::new(HashMap::new()),
            hanging: Mutex::new(HashSet::new()),
            executed: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        })
    }

    /// Script exit codes for a step: one per execution, last one repeats.
    pub fn script(&self, step: &str, exit_codes: &[i32]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(step.to_string(), exit_codes.iter().copied().collect());
    }

    /// Make a step block until its cancellation token fires.
    pub fn hang(&self, step: &str) {
        self.hanging.lock().unwrap().insert(step.to_string());
    }

    /// Step names in start order.
    pub fn executions(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn execution_count(&self, step: &str) -> usize {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.as_str() == step)
            .count()
    }

    /// Highest number of simultaneously running executions observed.
    pub fn max_observed_concurrency(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    fn next_exit_code(&self, step: &str) -> i32 {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(step) {
            Some(codes) => {
                if codes.len() > 1 {
                    codes.pop_front().unwrap_or(0)
                } else {
                    codes.front().copied().unwrap_or(0)
                }
            }
            None => 0,
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run(
        &self,
        spec: CommandSpec,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ExecOutcome>> + Send + '_>> {
        Box::pin(async move {
            self.executed.lock().unwrap().push(spec.step.clone());

            let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(current, Ordering::SeqCst);

            let hangs = self.hanging.lock().unwrap().contains(&spec.step);
            let outcome = if hangs {
                cancel.cancelled().await;
                ExecOutcome {
                    exit_code: None,
                    cancelled: true,
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => ExecOutcome {
                        exit_code: Some(self.next_exit_code(&spec.step)),
                        cancelled: false,
                    },
                    _ = cancel.cancelled() => ExecOutcome {
                        exit_code: None,
                        cancelled: true,
                    },
                }
            };

            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(outcome)
        })
    }
}
