// src/exec/mod.rs

//! Step command execution.
//!
//! The scheduler talks to a [`CommandRunner`] instead of spawning processes
//! directly. Production uses [`ProcessRunner`]; tests plug in a fake runner
//! that scripts outcomes without touching the OS.

pub mod backend;
pub mod command;

pub use backend::{CommandRunner, CommandSpec, ExecOutcome};
pub use command::ProcessRunner;
