//! Transport contract
//!
//! Every method returns without waiting on the network. Outcomes that the
//! platform only learns later (peer connected, advertising refused, a send
//! that could not reach a peer) come back as `TransportEvent`s.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use shutter_core::{LinkState, PeerIdentity, ServiceNamespace, ShutterResult};

/// Handle to a running advertise or browse activity
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveryHandle(pub u64);

impl fmt::Debug for DiscoveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Discovery({})", self.0)
    }
}

/// Delivery mode for `Transport::send`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Reliability {
    /// In order, guaranteed once sent over an established link
    #[default]
    Reliable,
    /// Best effort
    Unreliable,
}

/// Notification from the transport to the session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link to a peer changed state
    PeerStateChanged { peer: PeerIdentity, state: LinkState },
    /// Payload received from a connected peer
    DataReceived { peer: PeerIdentity, payload: Bytes },
    /// Browsing found an advertising peer
    PeerFound(PeerIdentity),
    /// A previously found peer stopped advertising or went out of range
    PeerLost(PeerIdentity),
    /// A browsing peer invited us to connect
    InvitationReceived(PeerIdentity),
    /// Advertising could not start
    AdvertiseFailed(String),
    /// Browsing could not start
    BrowseFailed(String),
    /// A payload could not be delivered to one peer
    SendFailed { peer: PeerIdentity, reason: String },
}

impl TransportEvent {
    /// Peer this notification is about, if any
    pub fn peer(&self) -> Option<&PeerIdentity> {
        match self {
            TransportEvent::PeerStateChanged { peer, .. }
            | TransportEvent::DataReceived { peer, .. }
            | TransportEvent::SendFailed { peer, .. } => Some(peer),
            TransportEvent::PeerFound(peer)
            | TransportEvent::PeerLost(peer)
            | TransportEvent::InvitationReceived(peer) => Some(peer),
            TransportEvent::AdvertiseFailed(_) | TransportEvent::BrowseFailed(_) => None,
        }
    }
}

/// Notification sender channel
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Notification receiver channel
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create a notification channel
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Proximity transport capabilities the session depends on
///
/// Connection establishment must be idempotent: two peers that invite each
/// other at the same time end up with a single link.
pub trait Transport: Send + Sync {
    /// Announce local presence under `namespace`
    fn start_advertising(&self, namespace: &ServiceNamespace) -> ShutterResult<DiscoveryHandle>;

    fn stop_advertising(&self, handle: DiscoveryHandle);

    /// Search for peers advertising `namespace`
    fn start_browsing(&self, namespace: &ServiceNamespace) -> ShutterResult<DiscoveryHandle>;

    fn stop_browsing(&self, handle: DiscoveryHandle);

    /// Ask a discovered peer to connect. Unanswered invitations lapse after `timeout`.
    fn invite(&self, peer: &PeerIdentity, timeout: Duration);

    /// Answer an invitation received from `peer`
    fn respond_to_invitation(&self, peer: &PeerIdentity, accept: bool);

    /// Queue `payload` for every peer in `peers`.
    ///
    /// `Err` means nothing was queued. Per-peer failures are reported later
    /// as `TransportEvent::SendFailed`.
    fn send(&self, payload: Bytes, peers: &[PeerIdentity], reliability: Reliability)
        -> ShutterResult<()>;
}
