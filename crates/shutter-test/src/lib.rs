//! ShutterSync Test Harness - multi-session scenarios
//!
//! This crate provides:
//! - A scenario builder that wires N sessions onto one in-memory mesh
//! - Convergence waits over session snapshots
//! - End-to-end color rounds with per-node results

pub mod scenario;
pub mod integration;

pub use scenario::*;
pub use integration::*;
