//! ShutterSync Transport Layer - proximity discovery and delivery contract
//!
//! This crate provides:
//! - The `Transport` trait a platform binding implements
//! - Transport notifications (`TransportEvent`) and their channel types
//! - An in-memory mesh transport for tests and demos

pub mod transport;
pub mod memory;

pub use transport::*;
pub use memory::{MemoryMesh, MemoryTransport};
