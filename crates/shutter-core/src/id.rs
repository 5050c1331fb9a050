//! Identity types for ShutterSync
//!
//! A peer is named by what the user sees (the device name) plus a random
//! instance tag, so two devices called "iPad" stay distinct on the wire.

use std::fmt;

use crate::{ShutterError, ShutterResult};

/// Device instance identity. Created once per process, compared by value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity {
    name: String,
    tag: u64,
}

impl PeerIdentity {
    /// Build an identity with an explicit instance tag
    pub fn new(name: impl Into<String>, tag: u64) -> Self {
        PeerIdentity {
            name: name.into(),
            tag,
        }
    }

    /// Build an identity with a random instance tag
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(name, rand::random())
    }

    /// Human-readable display name
    #[inline]
    pub fn display_name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({}#{:016x})", self.name, self.tag)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.name, self.tag)
    }
}

/// Service namespace - which peers may discover one another
///
/// Format follows the service-type rules proximity frameworks enforce:
/// 1-15 characters of `[a-z0-9-]`, no leading, trailing or doubled hyphen.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ServiceNamespace(String);

impl ServiceNamespace {
    pub const MAX_LEN: usize = 15;
    pub const DEFAULT: &'static str = "shuttersync";

    pub fn new(namespace: impl Into<String>) -> ShutterResult<Self> {
        let namespace = namespace.into();
        let valid = !namespace.is_empty()
            && namespace.len() <= Self::MAX_LEN
            && namespace
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            && !namespace.starts_with('-')
            && !namespace.ends_with('-')
            && !namespace.contains("--");

        if valid {
            Ok(ServiceNamespace(namespace))
        } else {
            Err(ShutterError::InvalidNamespace(namespace))
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceNamespace {
    fn default() -> Self {
        ServiceNamespace(Self::DEFAULT.to_string())
    }
}

impl fmt::Debug for ServiceNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", self.0)
    }
}

impl fmt::Display for ServiceNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
