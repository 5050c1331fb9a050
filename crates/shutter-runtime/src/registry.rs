//! Peer link registry
//!
//! Holds the last transport-reported state of every known link. A link
//! reported as disconnected is dropped, so the registry never carries a
//! stale connected entry.

use std::collections::{BTreeSet, HashMap};

use shutter_core::{LinkState, PeerIdentity};

/// Effect of applying a state report to the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkTransition {
    /// Peer entered the connected set
    Connected,
    /// Peer left the connected set
    Disconnected,
    /// Connected set unchanged
    Unchanged,
}

#[derive(Clone, Debug, Default)]
pub struct PeerRegistry {
    links: HashMap<PeerIdentity, LinkState>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the transport's latest report for `peer`
    pub fn apply(&mut self, peer: &PeerIdentity, state: LinkState) -> LinkTransition {
        let was_connected = self.state_of(peer).is_connected();

        if state == LinkState::Disconnected {
            self.links.remove(peer);
        } else {
            self.links.insert(peer.clone(), state);
        }

        match (was_connected, state.is_connected()) {
            (false, true) => LinkTransition::Connected,
            (true, false) => LinkTransition::Disconnected,
            _ => LinkTransition::Unchanged,
        }
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.links.contains_key(peer)
    }

    /// Last reported state, `Disconnected` for unknown peers
    pub fn state_of(&self, peer: &PeerIdentity) -> LinkState {
        self.links.get(peer).copied().unwrap_or_default()
    }

    pub fn connected(&self) -> BTreeSet<PeerIdentity> {
        self.links
            .iter()
            .filter(|(_, state)| state.is_connected())
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.links.values().filter(|s| s.is_connected()).count()
    }

    /// Connecting or connected links, not counting `peer`
    pub fn active_count_excluding(&self, peer: &PeerIdentity) -> usize {
        self.links
            .iter()
            .filter(|(id, state)| *id != peer && state.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
