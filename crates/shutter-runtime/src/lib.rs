//! ShutterSync Runtime - peer broadcast session
//!
//! This crate implements the session that sits between a UI and a proximity
//! transport:
//! 1. Advertise and browse under a service namespace
//! 2. Admit peers (invite discovered ones, answer invitations)
//! 3. Track link state reported by the transport
//! 4. Broadcast the local color selection to connected peers
//! 5. Apply color selections received from peers
//! 6. Publish whole-state snapshots and a failure-aware event stream

pub mod config;
pub mod observability;
pub mod registry;
pub mod session;
pub mod snapshot;

pub use config::*;
pub use observability::init_logging;
pub use registry::{LinkTransition, PeerRegistry};
pub use session::*;
pub use snapshot::*;
