//! Observable session state
//!
//! Observers never see a half-applied update: every mutation produces a new
//! `SessionSnapshot` value, published whole.

use std::collections::BTreeSet;

use shutter_core::{ColorSelection, PeerIdentity};

/// Read-only view of the session for UI collaborators
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connected_peers: BTreeSet<PeerIdentity>,
    /// Last selection broadcast locally or received from a peer
    pub last_selection: Option<ColorSelection>,
    /// Discovery is active
    pub running: bool,
}

impl SessionSnapshot {
    pub fn is_connected_to(&self, peer: &PeerIdentity) -> bool {
        self.connected_peers.contains(peer)
    }

    pub fn peer_names(&self) -> Vec<&str> {
        self.connected_peers
            .iter()
            .map(PeerIdentity::display_name)
            .collect()
    }
}

/// Where a selection came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectionOrigin {
    Local,
    Remote(PeerIdentity),
}

/// Session notifications, including the non-fatal failures
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    SelectionChanged {
        selection: ColorSelection,
        origin: SelectionOrigin,
    },
    PeerConnected(PeerIdentity),
    PeerDisconnected(PeerIdentity),
    SendFailed {
        peer: PeerIdentity,
        reason: String,
    },
    DecodeFailed {
        peer: PeerIdentity,
        token: String,
    },
    AdvertiseFailed(String),
    BrowseFailed(String),
}
