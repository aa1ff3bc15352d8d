// src/queue/mod.rs

//! Durable queue of pending run requests.

pub mod file_queue;

pub use file_queue::{ClaimedEntry, FileQueue, Priority, QueueEntry};
