//! ShutterSync Core - Fundamental types and primitives
//!
//! This crate defines the core types shared by every ShutterSync layer:
//! - Identifiers (PeerIdentity, ServiceNamespace)
//! - The color selection and its wire token
//! - Peer link connection states
//! - Error taxonomy

pub mod id;
pub mod color;
pub mod link;
pub mod error;

pub use id::*;
pub use color::*;
pub use link::*;
pub use error::*;
