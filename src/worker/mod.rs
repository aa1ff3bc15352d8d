// src/worker/mod.rs

//! Remote execution agent: polls the coordinator and runs assignments.

pub mod worker;

pub use worker::{Worker, WorkerConfig};
