//! Peer link connection states

use std::fmt;

/// Connection state of a link to a remote peer, as last reported by the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    #[inline]
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }

    /// Connecting or connected links count against a capacity bound
    #[inline]
    pub fn is_active(self) -> bool {
        self != LinkState::Disconnected
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(name)
    }
}
