//! In-memory mesh transport
//!
//! Every endpoint created from one `MemoryMesh` is "in range" of every other.
//! Discovery is scoped by namespace, links are symmetric, and delivery over a
//! link is in order. Unreliable sends to unlinked peers are dropped without a
//! `SendFailed` report. Invitation timeouts are checked lazily on the next mesh
//! operation (or an explicit `expire_invitations`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use shutter_core::{LinkState, PeerIdentity, ServiceNamespace, ShutterError, ShutterResult};

use crate::transport::{
    event_channel, DiscoveryHandle, EventReceiver, EventSender, Reliability, Transport,
    TransportEvent,
};

struct Endpoint {
    /// Distinguishes this attachment from earlier ones with the same identity
    attachment: u64,
    events: EventSender,
    advertising: Option<(DiscoveryHandle, ServiceNamespace)>,
    browsing: Option<(DiscoveryHandle, ServiceNamespace)>,
    fail_advertising: bool,
    fail_browsing: bool,
}

struct Invitation {
    from: PeerIdentity,
    to: PeerIdentity,
    deadline: Instant,
}

/// Unordered pair of peers
#[derive(Clone, PartialEq, Eq, Hash)]
struct LinkKey(PeerIdentity, PeerIdentity);

impl LinkKey {
    fn new(a: &PeerIdentity, b: &PeerIdentity) -> Self {
        if a <= b {
            LinkKey(a.clone(), b.clone())
        } else {
            LinkKey(b.clone(), a.clone())
        }
    }
}

#[derive(Default)]
struct MeshState {
    endpoints: HashMap<PeerIdentity, Endpoint>,
    links: HashSet<LinkKey>,
    invitations: Vec<Invitation>,
    next_handle: u64,
    next_attachment: u64,
}

impl MeshState {
    fn emit(&self, to: &PeerIdentity, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(to) {
            if endpoint.events.send(event).is_err() {
                tracing::trace!(peer = %to, "mesh event dropped, receiver closed");
            }
        }
    }

    fn next_handle(&mut self) -> DiscoveryHandle {
        self.next_handle += 1;
        DiscoveryHandle(self.next_handle)
    }

    fn is_attached(&self, local: &PeerIdentity, attachment: u64) -> bool {
        self.endpoints
            .get(local)
            .is_some_and(|e| e.attachment == attachment)
    }

    /// The endpoint behind one specific attachment
    fn attached_mut(&mut self, local: &PeerIdentity, attachment: u64) -> Option<&mut Endpoint> {
        self.endpoints
            .get_mut(local)
            .filter(|e| e.attachment == attachment)
    }

    fn is_linked(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.links.contains(&LinkKey::new(a, b))
    }

    fn advertisers_in(&self, namespace: &ServiceNamespace) -> Vec<PeerIdentity> {
        self.endpoints
            .iter()
            .filter(|(_, e)| matches!(&e.advertising, Some((_, ns)) if ns == namespace))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn browsers_in(&self, namespace: &ServiceNamespace) -> Vec<PeerIdentity> {
        self.endpoints
            .iter()
            .filter(|(_, e)| matches!(&e.browsing, Some((_, ns)) if ns == namespace))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn is_advertising(&self, peer: &PeerIdentity) -> bool {
        self.endpoints
            .get(peer)
            .is_some_and(|e| e.advertising.is_some())
    }

    fn connect(&mut self, a: &PeerIdentity, b: &PeerIdentity) {
        if !self.links.insert(LinkKey::new(a, b)) {
            return;
        }
        self.invitations
            .retain(|inv| LinkKey::new(&inv.from, &inv.to) != LinkKey::new(a, b));

        for (local, remote) in [(a, b), (b, a)] {
            self.emit(
                local,
                TransportEvent::PeerStateChanged {
                    peer: remote.clone(),
                    state: LinkState::Connecting,
                },
            );
            self.emit(
                local,
                TransportEvent::PeerStateChanged {
                    peer: remote.clone(),
                    state: LinkState::Connected,
                },
            );
        }
        tracing::debug!(a = %a, b = %b, "mesh link established");
    }

    fn disconnect(&mut self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        if !self.links.remove(&LinkKey::new(a, b)) {
            return false;
        }
        for (local, remote) in [(a, b), (b, a)] {
            self.emit(
                local,
                TransportEvent::PeerStateChanged {
                    peer: remote.clone(),
                    state: LinkState::Disconnected,
                },
            );
        }
        tracing::debug!(a = %a, b = %b, "mesh link severed");
        true
    }

    /// Drop invitations past their deadline and tell the inviters
    fn expire_invitations(&mut self, now: Instant) {
        let (expired, pending): (Vec<_>, Vec<_>) = self
            .invitations
            .drain(..)
            .partition(|inv| inv.deadline <= now);
        self.invitations = pending;

        for inv in expired {
            if self.is_linked(&inv.from, &inv.to) {
                continue;
            }
            tracing::debug!(from = %inv.from, to = %inv.to, "mesh invitation timed out");
            self.emit(
                &inv.from,
                TransportEvent::PeerStateChanged {
                    peer: inv.to,
                    state: LinkState::Disconnected,
                },
            );
        }
    }

    fn remove_endpoint(&mut self, local: &PeerIdentity) {
        let linked: Vec<PeerIdentity> = self
            .links
            .iter()
            .filter_map(|LinkKey(a, b)| {
                if a == local {
                    Some(b.clone())
                } else if b == local {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        for remote in &linked {
            self.disconnect(local, remote);
        }

        if let Some(endpoint) = self.endpoints.remove(local) {
            if let Some((_, namespace)) = endpoint.advertising {
                for browser in self.browsers_in(&namespace) {
                    self.emit(&browser, TransportEvent::PeerLost(local.clone()));
                }
            }
        }
        self.invitations
            .retain(|inv| &inv.from != local && &inv.to != local);
    }
}

/// Shared in-process "radio range" that `MemoryTransport` endpoints attach to
#[derive(Clone, Default)]
pub struct MemoryMesh {
    state: Arc<Mutex<MeshState>>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint for `local`. Replaces any endpoint with the same
    /// identity; the replaced `MemoryTransport` goes inert.
    pub fn endpoint(&self, local: PeerIdentity) -> (MemoryTransport, EventReceiver) {
        let (tx, rx) = event_channel();
        let mut state = self.state.lock();
        state.remove_endpoint(&local);
        state.next_attachment += 1;
        let attachment = state.next_attachment;
        state.endpoints.insert(
            local.clone(),
            Endpoint {
                attachment,
                events: tx,
                advertising: None,
                browsing: None,
                fail_advertising: false,
                fail_browsing: false,
            },
        );
        drop(state);

        let transport = MemoryTransport {
            mesh: self.clone(),
            local,
            attachment,
        };
        (transport, rx)
    }

    /// Make the next advertising attempt of `peer` fail
    pub fn fail_advertising(&self, peer: &PeerIdentity) {
        if let Some(endpoint) = self.state.lock().endpoints.get_mut(peer) {
            endpoint.fail_advertising = true;
        }
    }

    /// Make the next browsing attempt of `peer` fail
    pub fn fail_browsing(&self, peer: &PeerIdentity) {
        if let Some(endpoint) = self.state.lock().endpoints.get_mut(peer) {
            endpoint.fail_browsing = true;
        }
    }

    /// Sever the link between two peers. Returns false if they were not linked.
    pub fn disconnect(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.state.lock().disconnect(a, b)
    }

    pub fn is_linked(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.state.lock().is_linked(a, b)
    }

    /// Number of established links
    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Number of invitations still waiting for an answer
    pub fn pending_invitations(&self) -> usize {
        self.state.lock().invitations.len()
    }

    pub fn expire_invitations(&self) {
        self.state.lock().expire_invitations(Instant::now());
    }
}

/// One peer's attachment to a `MemoryMesh`
///
/// Dropping it takes the peer out of range: links are severed and browsers
/// see the peer as lost.
pub struct MemoryTransport {
    mesh: MemoryMesh,
    local: PeerIdentity,
    attachment: u64,
}

impl MemoryTransport {
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn mesh(&self) -> &MemoryMesh {
        &self.mesh
    }
}

impl Transport for MemoryTransport {
    fn start_advertising(&self, namespace: &ServiceNamespace) -> ShutterResult<DiscoveryHandle> {
        let mut state = self.mesh.state.lock();
        state.expire_invitations(Instant::now());
        let handle = state.next_handle();

        let endpoint = state
            .attached_mut(&self.local, self.attachment)
            .ok_or_else(|| ShutterError::Transport("endpoint detached".into()))?;

        if std::mem::take(&mut endpoint.fail_advertising) {
            state.emit(
                &self.local,
                TransportEvent::AdvertiseFailed(
                    ShutterError::AdvertiseStartFailure("refused by mesh".into()).to_string(),
                ),
            );
            return Ok(handle);
        }
        endpoint.advertising = Some((handle, namespace.clone()));

        for browser in state.browsers_in(namespace) {
            if browser != self.local {
                state.emit(&browser, TransportEvent::PeerFound(self.local.clone()));
            }
        }
        Ok(handle)
    }

    fn stop_advertising(&self, handle: DiscoveryHandle) {
        let mut state = self.mesh.state.lock();
        let Some(endpoint) = state.attached_mut(&self.local, self.attachment) else {
            return;
        };
        let active = matches!(&endpoint.advertising, Some((h, _)) if *h == handle);
        let namespace = if active {
            endpoint.advertising.take().map(|(_, ns)| ns)
        } else {
            None
        };

        if let Some(namespace) = namespace {
            for browser in state.browsers_in(&namespace) {
                if browser != self.local {
                    state.emit(&browser, TransportEvent::PeerLost(self.local.clone()));
                }
            }
        }
    }

    fn start_browsing(&self, namespace: &ServiceNamespace) -> ShutterResult<DiscoveryHandle> {
        let mut state = self.mesh.state.lock();
        state.expire_invitations(Instant::now());
        let handle = state.next_handle();

        let endpoint = state
            .attached_mut(&self.local, self.attachment)
            .ok_or_else(|| ShutterError::Transport("endpoint detached".into()))?;

        if std::mem::take(&mut endpoint.fail_browsing) {
            state.emit(
                &self.local,
                TransportEvent::BrowseFailed(
                    ShutterError::BrowseStartFailure("refused by mesh".into()).to_string(),
                ),
            );
            return Ok(handle);
        }
        endpoint.browsing = Some((handle, namespace.clone()));

        for advertiser in state.advertisers_in(namespace) {
            if advertiser != self.local {
                state.emit(&self.local, TransportEvent::PeerFound(advertiser));
            }
        }
        Ok(handle)
    }

    fn stop_browsing(&self, handle: DiscoveryHandle) {
        let mut state = self.mesh.state.lock();
        if let Some(endpoint) = state.attached_mut(&self.local, self.attachment) {
            if matches!(endpoint.browsing, Some((active, _)) if active == handle) {
                endpoint.browsing = None;
            }
        }
    }

    fn invite(&self, peer: &PeerIdentity, timeout: Duration) {
        let mut state = self.mesh.state.lock();
        let now = Instant::now();
        state.expire_invitations(now);

        if !state.is_attached(&self.local, self.attachment) || state.is_linked(&self.local, peer) {
            return;
        }
        if state
            .invitations
            .iter()
            .any(|inv| inv.from == self.local && &inv.to == peer)
        {
            return;
        }

        state.invitations.push(Invitation {
            from: self.local.clone(),
            to: peer.clone(),
            deadline: now + timeout,
        });
        state.emit(
            &self.local,
            TransportEvent::PeerStateChanged {
                peer: peer.clone(),
                state: LinkState::Connecting,
            },
        );

        // Only an advertising peer hears invitations; otherwise it lapses
        if state.is_advertising(peer) {
            state.emit(peer, TransportEvent::InvitationReceived(self.local.clone()));
        }
    }

    fn respond_to_invitation(&self, peer: &PeerIdentity, accept: bool) {
        let mut state = self.mesh.state.lock();
        state.expire_invitations(Instant::now());
        if !state.is_attached(&self.local, self.attachment) {
            return;
        }

        let Some(pos) = state
            .invitations
            .iter()
            .position(|inv| &inv.from == peer && inv.to == self.local)
        else {
            tracing::debug!(peer = %peer, "no pending invitation to answer");
            return;
        };
        state.invitations.remove(pos);

        if accept {
            state.connect(peer, &self.local);
        } else if !state.is_linked(peer, &self.local) {
            state.emit(
                peer,
                TransportEvent::PeerStateChanged {
                    peer: self.local.clone(),
                    state: LinkState::Disconnected,
                },
            );
        }
    }

    fn send(
        &self,
        payload: Bytes,
        peers: &[PeerIdentity],
        reliability: Reliability,
    ) -> ShutterResult<()> {
        let state = self.mesh.state.lock();
        if !state.is_attached(&self.local, self.attachment) {
            return Err(ShutterError::Transport("endpoint detached".into()));
        }

        for peer in peers {
            if state.is_linked(&self.local, peer) {
                state.emit(
                    peer,
                    TransportEvent::DataReceived {
                        peer: self.local.clone(),
                        payload: payload.clone(),
                    },
                );
            } else if reliability == Reliability::Reliable {
                state.emit(
                    &self.local,
                    TransportEvent::SendFailed {
                        peer: peer.clone(),
                        reason: "peer not connected".into(),
                    },
                );
            }
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.mesh.state.lock();
        if state.is_attached(&self.local, self.attachment) {
            state.remove_endpoint(&self.local);
        }
    }
}
