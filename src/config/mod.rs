// src/config/mod.rs

//! DAG definition files and their validation.
//!
//! A DAG is defined in a TOML file:
//!
//! ```toml
//! params = "ENV=prod"
//! max_active_runs = 1
//! max_active_steps = 2
//!
//! [hooks]
//! on_failure = { command = "notify-failure" }
//! on_exit = { command = "cleanup" }
//!
//! [step.extract]
//! command = "run-extract"
//!
//! [step.load]
//! command = "run-load"
//! depends = ["extract"]
//! retry = { max_retries = 3, interval_ms = 500, backoff = "exponential" }
//! ```
//!
//! [`loader`] reads and deserializes, [`validate`] turns the raw form into a
//! [`DagFile`] after checking dependency names and acyclicity.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, resolve_dag_path};
pub use model::{DagFile, Hooks, RawDagFile, RawStep};
pub use validate::into_dag_file;
