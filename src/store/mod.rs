// src/store/mod.rs

//! Durable state: run status records, execution-right locks, suspend flags.
//!
//! Everything lives under one data directory:
//!
//! ```text
//! <data_dir>/runs/<dag>/<started>_<run_id>/status.jsonl   run snapshots
//! <data_dir>/runs/<dag>/<started>_<run_id>/logs/<step>.log
//! <data_dir>/locks/<dag>/<run_id>/owner.json              execution right
//! <data_dir>/suspend/<dag>                                suspend flag
//! <data_dir>/queue/                                       see crate::queue
//! ```

pub mod lock;
pub mod runstore;
pub mod suspend;

pub use lock::{LockOptions, RunLock, active_count_for_dag, held_and_fresh};
pub use runstore::{FileRunStore, RunRecord};
pub use suspend::SuspendStore;
