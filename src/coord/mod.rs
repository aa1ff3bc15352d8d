// src/coord/mod.rs

//! Rendezvous between the queue and the worker fleet.

pub mod coordinator;

pub use coordinator::{
    Assignment, CoordinatorConfig, CoordinatorHandle, spawn_coordinator,
};
