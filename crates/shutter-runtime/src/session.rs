//! Peer broadcast session
//!
//! Every instance both advertises and browses, so two instances in range
//! invite each other. Collapsing the crossed invitations into one link is
//! the transport's job; the session does no dedup of its own.
//!
//! All state changes go through one lock. The transport is never called
//! while it is held.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use shutter_core::{ColorSelection, LinkState, PeerIdentity, ShutterError};
use shutter_transport::{DiscoveryHandle, EventReceiver, Reliability, Transport, TransportEvent};

use crate::config::SessionConfig;
use crate::registry::{LinkTransition, PeerRegistry};
use crate::snapshot::{SelectionOrigin, SessionEvent, SessionSnapshot};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub broadcasts: u64,
    pub sends_requested: u64,
    pub send_failures: u64,
    pub messages_received: u64,
    pub decode_failures: u64,
    pub invitations_sent: u64,
    pub invitations_accepted: u64,
    pub invitations_rejected: u64,
    pub state_changes: u64,
    pub discovery_failures: u64,
}

#[derive(Default)]
struct Discovery {
    running: bool,
    advertise: Option<DiscoveryHandle>,
    browse: Option<DiscoveryHandle>,
}

#[derive(Clone, Copy)]
enum Activity {
    Advertise,
    Browse,
}

#[derive(Default)]
struct SessionState {
    registry: PeerRegistry,
    last_selection: Option<ColorSelection>,
    discovery: Discovery,
    /// Bumped by every start and stop
    generation: u64,
    stats: SessionStats,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connected_peers: self.registry.connected(),
            last_selection: self.last_selection,
            running: self.discovery.running,
        }
    }

    /// Late notifications about peers we never tracked are dropped once stopped
    fn ignores(&self, peer: &PeerIdentity) -> bool {
        !self.discovery.running && !self.registry.contains(peer)
    }
}

struct Shared {
    local: PeerIdentity,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Shared {
    /// Publish the current state. Called with the state lock held so
    /// snapshots go out in mutation order.
    fn publish(&self, state: &SessionState) {
        self.snapshot_tx.send_replace(state.snapshot());
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn admits(&self, registry: &PeerRegistry, peer: &PeerIdentity) -> bool {
        self.config.admission.permits(peer)
            && self
                .config
                .max_peers
                .map_or(true, |max| registry.active_count_excluding(peer) < max)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Keep a freshly started discovery handle. Returns false if a later
    /// start or stop superseded the call that produced it.
    fn claim(&self, generation: u64, activity: Activity, handle: DiscoveryHandle) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        match activity {
            Activity::Advertise => state.discovery.advertise = Some(handle),
            Activity::Browse => state.discovery.browse = Some(handle),
        }
        true
    }

    fn record_send_failure(&self, state: &mut SessionState, peer: PeerIdentity, reason: String) {
        state.stats.send_failures += 1;
        let error = ShutterError::SendFailure {
            peer: peer.clone(),
            reason: reason.clone(),
        };
        tracing::warn!(%error, "color send failed");
        self.emit(SessionEvent::SendFailed { peer, reason });
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let discovery = std::mem::take(&mut self.state.get_mut().discovery);
        if let Some(handle) = discovery.advertise {
            self.transport.stop_advertising(handle);
        }
        if let Some(handle) = discovery.browse {
            self.transport.stop_browsing(handle);
        }
    }
}

/// Discovery lifecycle plus broadcast of the current color to connected peers
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct PeerBroadcastSession {
    shared: Arc<Shared>,
}

impl PeerBroadcastSession {
    pub fn new(local: PeerIdentity, transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));

        PeerBroadcastSession {
            shared: Arc::new(Shared {
                local,
                config,
                transport,
                state: Mutex::new(SessionState::default()),
                snapshot_tx,
                events_tx,
            }),
        }
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.shared.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().discovery.running
    }

    /// Start advertising and browsing. No-op when already started.
    pub fn start(&self) {
        let shared = &self.shared;
        let generation = {
            let mut state = shared.state.lock();
            if state.discovery.running {
                return;
            }
            state.discovery.running = true;
            state.generation += 1;
            shared.publish(&state);
            state.generation
        };
        tracing::info!(
            peer = %shared.local,
            namespace = %shared.config.namespace,
            "starting discovery"
        );

        match shared.transport.start_advertising(&shared.config.namespace) {
            Ok(handle) => {
                if !shared.claim(generation, Activity::Advertise, handle) {
                    // stop() ran while we were starting
                    shared.transport.stop_advertising(handle);
                    return;
                }
            }
            Err(e) => self.on_advertise_failed(e.to_string()),
        }
        if !shared.is_current(generation) {
            return;
        }

        match shared.transport.start_browsing(&shared.config.namespace) {
            Ok(handle) => {
                if !shared.claim(generation, Activity::Browse, handle) {
                    shared.transport.stop_browsing(handle);
                }
            }
            Err(e) => self.on_browse_failed(e.to_string()),
        }
    }

    /// Stop advertising and browsing. Existing links are left to the transport.
    pub fn stop(&self) {
        let shared = &self.shared;
        let discovery = {
            let mut state = shared.state.lock();
            if !state.discovery.running {
                return;
            }
            let discovery = std::mem::take(&mut state.discovery);
            state.generation += 1;
            shared.publish(&state);
            discovery
        };
        tracing::info!(peer = %shared.local, "stopping discovery");

        if let Some(handle) = discovery.advertise {
            shared.transport.stop_advertising(handle);
        }
        if let Some(handle) = discovery.browse {
            shared.transport.stop_browsing(handle);
        }
    }

    /// Select a color locally and send it to every connected peer
    ///
    /// The local selection is updated even with no peers. Delivery is best
    /// effort per peer; failures surface as `SessionEvent::SendFailed`.
    pub fn broadcast(&self, selection: ColorSelection) {
        let shared = &self.shared;
        let peers: Vec<PeerIdentity> = {
            let mut state = shared.state.lock();
            state.last_selection = Some(selection);
            state.stats.broadcasts += 1;
            let peers: Vec<PeerIdentity> = state.registry.connected().into_iter().collect();
            state.stats.sends_requested += peers.len() as u64;
            shared.publish(&state);
            shared.emit(SessionEvent::SelectionChanged {
                selection,
                origin: SelectionOrigin::Local,
            });
            peers
        };

        tracing::debug!(color = %selection, peers = peers.len(), "broadcasting color");
        if peers.is_empty() {
            return;
        }

        let payload = Bytes::from_static(selection.encode());
        if let Err(e) = shared.transport.send(payload, &peers, Reliability::Reliable) {
            let reason = e.to_string();
            let mut state = shared.state.lock();
            for peer in peers {
                shared.record_send_failure(&mut state, peer, reason.clone());
            }
        }
    }

    /// Transport reported a link state change
    pub fn on_peer_state_changed(&self, peer: &PeerIdentity, new_state: LinkState) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.ignores(peer) {
            tracing::debug!(peer = %peer, state = %new_state, "ignoring state change for unknown peer");
            return;
        }

        state.stats.state_changes += 1;
        let transition = state.registry.apply(peer, new_state);
        tracing::info!(peer = %peer, state = %new_state, "peer link changed");

        match transition {
            LinkTransition::Connected => {
                shared.publish(&state);
                shared.emit(SessionEvent::PeerConnected(peer.clone()));
            }
            LinkTransition::Disconnected => {
                shared.publish(&state);
                shared.emit(SessionEvent::PeerDisconnected(peer.clone()));
            }
            LinkTransition::Unchanged => {}
        }
    }

    /// Transport delivered a payload. Malformed payloads are logged and dropped.
    pub fn on_message_received(&self, peer: &PeerIdentity, payload: &[u8]) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.ignores(peer) {
            tracing::debug!(peer = %peer, "ignoring data from unknown peer");
            return;
        }
        state.stats.messages_received += 1;

        match ColorSelection::decode(payload) {
            Ok(selection) => {
                tracing::info!(peer = %peer, color = %selection, "received color");
                state.last_selection = Some(selection);
                shared.publish(&state);
                shared.emit(SessionEvent::SelectionChanged {
                    selection,
                    origin: SelectionOrigin::Remote(peer.clone()),
                });
            }
            Err(ShutterError::UnknownColorToken(token)) => {
                state.stats.decode_failures += 1;
                tracing::warn!(peer = %peer, token = %token, "undecodable color payload");
                shared.emit(SessionEvent::DecodeFailed {
                    peer: peer.clone(),
                    token,
                });
            }
            Err(e) => {
                state.stats.decode_failures += 1;
                tracing::warn!(peer = %peer, "undecodable color payload: {}", e);
                shared.emit(SessionEvent::DecodeFailed {
                    peer: peer.clone(),
                    token: e.to_string(),
                });
            }
        }
    }

    /// A browsing peer invited us (advertising role)
    pub fn on_incoming_connection_request(&self, peer: &PeerIdentity) {
        let shared = &self.shared;
        let accept = {
            let mut state = shared.state.lock();
            if state.ignores(peer) {
                tracing::debug!(peer = %peer, "ignoring invitation after stop");
                return;
            }
            let accept = shared.admits(&state.registry, peer);
            if accept {
                state.stats.invitations_accepted += 1;
            } else {
                state.stats.invitations_rejected += 1;
            }
            accept
        };

        tracing::info!(peer = %peer, accept, "invitation received");
        shared.transport.respond_to_invitation(peer, accept);
    }

    /// Browsing found an advertising peer
    pub fn on_peer_discovered(&self, peer: &PeerIdentity) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if state.ignores(peer) {
                tracing::debug!(peer = %peer, "ignoring discovery after stop");
                return;
            }
            if !shared.admits(&state.registry, peer) {
                tracing::debug!(peer = %peer, "discovered peer not admitted");
                return;
            }
            state.stats.invitations_sent += 1;
        }

        tracing::info!(peer = %peer, "found peer, inviting");
        shared.transport.invite(peer, shared.config.invite_timeout);
    }

    /// Browsing lost sight of a peer. Links only change on state reports.
    pub fn on_peer_lost(&self, peer: &PeerIdentity) {
        tracing::info!(peer = %peer, "lost peer");
    }

    pub fn on_advertise_failed(&self, reason: String) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.stats.discovery_failures += 1;
        tracing::error!(peer = %shared.local, reason = %reason, "advertising did not start");
        shared.emit(SessionEvent::AdvertiseFailed(reason));
    }

    pub fn on_browse_failed(&self, reason: String) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.stats.discovery_failures += 1;
        tracing::error!(peer = %shared.local, reason = %reason, "browsing did not start");
        shared.emit(SessionEvent::BrowseFailed(reason));
    }

    /// Asynchronous per-peer send result
    pub fn on_send_failed(&self, peer: PeerIdentity, reason: String) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        shared.record_send_failure(&mut state, peer, reason);
    }

    /// Route one transport notification
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerStateChanged { peer, state } => {
                self.on_peer_state_changed(&peer, state)
            }
            TransportEvent::DataReceived { peer, payload } => {
                self.on_message_received(&peer, &payload)
            }
            TransportEvent::PeerFound(peer) => self.on_peer_discovered(&peer),
            TransportEvent::PeerLost(peer) => self.on_peer_lost(&peer),
            TransportEvent::InvitationReceived(peer) => self.on_incoming_connection_request(&peer),
            TransportEvent::AdvertiseFailed(reason) => self.on_advertise_failed(reason),
            TransportEvent::BrowseFailed(reason) => self.on_browse_failed(reason),
            TransportEvent::SendFailed { peer, reason } => self.on_send_failed(peer, reason),
        }
    }

    /// Drain transport notifications into this session on a background task
    ///
    /// The task ends when the channel closes or the last session handle is dropped.
    pub fn spawn_event_loop(&self, mut events: EventReceiver) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                tracing::trace!(peer = ?event.peer(), "transport event");
                PeerBroadcastSession { shared }.handle_event(event);
            }
            tracing::debug!("transport event loop finished");
        })
    }

    /// Current state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Watch state snapshots
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Stream of session events from now on
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;
    use shutter_core::{ServiceNamespace, ShutterResult};

    use crate::config::AdmissionPolicy;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        StartAdvertising,
        StopAdvertising(DiscoveryHandle),
        StartBrowsing,
        StopBrowsing(DiscoveryHandle),
        Invite(PeerIdentity, Duration),
        Respond(PeerIdentity, bool),
        Send(Bytes, Vec<PeerIdentity>),
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
        refuse_advertising: bool,
        refuse_browsing: bool,
        refuse_send: bool,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn sends(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Send(..)))
                .count()
        }
    }

    impl Transport for RecordingTransport {
        fn start_advertising(&self, _: &ServiceNamespace) -> ShutterResult<DiscoveryHandle> {
            self.calls.lock().push(Call::StartAdvertising);
            if self.refuse_advertising {
                return Err(ShutterError::AdvertiseStartFailure("radio off".into()));
            }
            Ok(DiscoveryHandle(1))
        }

        fn stop_advertising(&self, handle: DiscoveryHandle) {
            self.calls.lock().push(Call::StopAdvertising(handle));
        }

        fn start_browsing(&self, _: &ServiceNamespace) -> ShutterResult<DiscoveryHandle> {
            self.calls.lock().push(Call::StartBrowsing);
            if self.refuse_browsing {
                return Err(ShutterError::BrowseStartFailure("radio off".into()));
            }
            Ok(DiscoveryHandle(2))
        }

        fn stop_browsing(&self, handle: DiscoveryHandle) {
            self.calls.lock().push(Call::StopBrowsing(handle));
        }

        fn invite(&self, peer: &PeerIdentity, timeout: Duration) {
            self.calls.lock().push(Call::Invite(peer.clone(), timeout));
        }

        fn respond_to_invitation(&self, peer: &PeerIdentity, accept: bool) {
            self.calls.lock().push(Call::Respond(peer.clone(), accept));
        }

        fn send(
            &self,
            payload: Bytes,
            peers: &[PeerIdentity],
            _reliability: Reliability,
        ) -> ShutterResult<()> {
            self.calls.lock().push(Call::Send(payload, peers.to_vec()));
            if self.refuse_send {
                return Err(ShutterError::Transport("session closed".into()));
            }
            Ok(())
        }
    }

    /// Hands out distinct handles and tracks which are still active. The
    /// first advertise call restarts the installed session from inside.
    #[derive(Default)]
    struct RestartingTransport {
        next: AtomicU64,
        advertising: Mutex<BTreeSet<u64>>,
        browsing: Mutex<BTreeSet<u64>>,
        restart: Mutex<Option<PeerBroadcastSession>>,
    }

    impl RestartingTransport {
        fn next_handle(&self) -> u64 {
            self.next.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    impl Transport for RestartingTransport {
        fn start_advertising(&self, _: &ServiceNamespace) -> ShutterResult<DiscoveryHandle> {
            let handle = self.next_handle();
            self.advertising.lock().insert(handle);

            let restart = self.restart.lock().take();
            if let Some(session) = restart {
                session.stop();
                session.start();
            }
            Ok(DiscoveryHandle(handle))
        }

        fn stop_advertising(&self, handle: DiscoveryHandle) {
            self.advertising.lock().remove(&handle.0);
        }

        fn start_browsing(&self, _: &ServiceNamespace) -> ShutterResult<DiscoveryHandle> {
            let handle = self.next_handle();
            self.browsing.lock().insert(handle);
            Ok(DiscoveryHandle(handle))
        }

        fn stop_browsing(&self, handle: DiscoveryHandle) {
            self.browsing.lock().remove(&handle.0);
        }

        fn invite(&self, _: &PeerIdentity, _: Duration) {}

        fn respond_to_invitation(&self, _: &PeerIdentity, _: bool) {}

        fn send(&self, _: Bytes, _: &[PeerIdentity], _: Reliability) -> ShutterResult<()> {
            Ok(())
        }
    }

    fn peer(n: u64) -> PeerIdentity {
        PeerIdentity::new(format!("peer-{n}"), n)
    }

    fn session_with(
        transport: RecordingTransport,
        config: SessionConfig,
    ) -> (PeerBroadcastSession, Arc<RecordingTransport>) {
        let transport = Arc::new(transport);
        let session = PeerBroadcastSession::new(peer(0), transport.clone(), config);
        (session, transport)
    }

    fn started() -> (PeerBroadcastSession, Arc<RecordingTransport>) {
        let (session, transport) =
            session_with(RecordingTransport::default(), SessionConfig::default());
        session.start();
        (session, transport)
    }

    #[test]
    fn test_start_is_idempotent() {
        let (session, transport) = started();
        session.start();

        assert!(session.is_running());
        assert_eq!(transport.calls(), vec![Call::StartAdvertising, Call::StartBrowsing]);
    }

    #[test]
    fn test_stop_twice_reaches_transport_once() {
        let (session, transport) = started();
        session.stop();
        session.stop();

        assert!(!session.is_running());
        assert_eq!(
            transport.calls(),
            vec![
                Call::StartAdvertising,
                Call::StartBrowsing,
                Call::StopAdvertising(DiscoveryHandle(1)),
                Call::StopBrowsing(DiscoveryHandle(2)),
            ]
        );
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let (session, transport) =
            session_with(RecordingTransport::default(), SessionConfig::default());
        session.stop();
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_broadcast_without_peers_updates_locally_only() {
        let (session, transport) = started();
        session.broadcast(ColorSelection::Green);

        assert_eq!(session.snapshot().last_selection, Some(ColorSelection::Green));
        assert_eq!(transport.sends(), 0);
        assert_eq!(session.stats().broadcasts, 1);
    }

    #[test]
    fn test_broadcast_sends_token_to_connected_peers() {
        let (session, transport) = started();
        session.on_peer_state_changed(&peer(1), LinkState::Connected);
        session.on_peer_state_changed(&peer(2), LinkState::Connecting);

        session.broadcast(ColorSelection::Red);

        let sends: Vec<Call> = transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Send(..)))
            .collect();
        assert_eq!(
            sends,
            vec![Call::Send(Bytes::from_static(b"red"), vec![peer(1)])]
        );
    }

    #[test]
    fn test_rejected_send_keeps_local_selection() {
        let transport = RecordingTransport {
            refuse_send: true,
            ..Default::default()
        };
        let (session, _transport) = session_with(transport, SessionConfig::default());
        session.start();
        session.on_peer_state_changed(&peer(1), LinkState::Connected);
        session.on_peer_state_changed(&peer(2), LinkState::Connected);
        let mut events = session.events();

        session.broadcast(ColorSelection::Blue);

        assert_eq!(session.snapshot().last_selection, Some(ColorSelection::Blue));
        assert_eq!(session.stats().send_failures, 2);

        let mut failed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::SendFailed { peer, .. } = event {
                failed.push(peer);
            }
        }
        assert_eq!(failed, vec![peer(1), peer(2)]);
    }

    #[test]
    fn test_received_token_updates_selection() {
        let (session, _) = started();
        session.on_peer_state_changed(&peer(1), LinkState::Connected);

        session.on_message_received(&peer(1), b"blue");
        assert_eq!(session.snapshot().last_selection, Some(ColorSelection::Blue));
    }

    #[test]
    fn test_unknown_token_leaves_selection_unchanged() {
        let (session, _) = started();
        session.on_peer_state_changed(&peer(1), LinkState::Connected);
        session.on_message_received(&peer(1), b"green");
        let mut events = session.events();

        session.on_message_received(&peer(1), b"purple");

        assert_eq!(session.snapshot().last_selection, Some(ColorSelection::Green));
        assert_eq!(session.stats().decode_failures, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::DecodeFailed {
                peer: peer(1),
                token: "purple".into(),
            }
        );
    }

    #[test]
    fn test_disconnect_removes_peer() {
        let (session, _) = started();
        session.on_peer_state_changed(&peer(1), LinkState::Connected);
        assert!(session.snapshot().is_connected_to(&peer(1)));

        session.on_peer_state_changed(&peer(1), LinkState::Disconnected);
        assert!(session.snapshot().connected_peers.is_empty());
    }

    #[test]
    fn test_unknown_peer_after_stop_is_noop() {
        let (session, transport) = started();
        session.on_peer_state_changed(&peer(1), LinkState::Connected);
        session.broadcast(ColorSelection::Red);
        session.stop();

        let before = session.snapshot();
        let stats_before = session.stats();
        let calls_before = transport.calls().len();

        session.on_peer_state_changed(&peer(7), LinkState::Connected);
        session.on_message_received(&peer(7), b"blue");
        session.on_peer_discovered(&peer(7));
        session.on_incoming_connection_request(&peer(7));

        assert_eq!(session.snapshot(), before);
        assert_eq!(session.stats(), stats_before);
        assert_eq!(transport.calls().len(), calls_before);
    }

    #[test]
    fn test_known_peer_disconnect_after_stop_still_applies() {
        let (session, _) = started();
        session.on_peer_state_changed(&peer(1), LinkState::Connected);
        session.stop();

        session.on_peer_state_changed(&peer(1), LinkState::Disconnected);
        assert!(session.snapshot().connected_peers.is_empty());
    }

    #[test]
    fn test_default_policy_accepts_and_invites() {
        let (session, transport) = started();
        session.on_incoming_connection_request(&peer(1));
        session.on_peer_discovered(&peer(2));

        let calls = transport.calls();
        assert!(calls.contains(&Call::Respond(peer(1), true)));
        assert!(calls.contains(&Call::Invite(peer(2), Duration::from_secs(120))));
    }

    #[test]
    fn test_allow_list_rejects_strangers() {
        let config = SessionConfig {
            admission: AdmissionPolicy::allow_list(["peer-1"]),
            ..Default::default()
        };
        let (session, transport) = session_with(RecordingTransport::default(), config);
        session.start();

        session.on_incoming_connection_request(&peer(1));
        session.on_incoming_connection_request(&peer(2));
        session.on_peer_discovered(&peer(3));

        let calls = transport.calls();
        assert!(calls.contains(&Call::Respond(peer(1), true)));
        assert!(calls.contains(&Call::Respond(peer(2), false)));
        assert!(!calls.iter().any(|c| matches!(c, Call::Invite(..))));
        assert_eq!(session.stats().invitations_rejected, 1);
    }

    #[test]
    fn test_capacity_bound() {
        let config = SessionConfig {
            max_peers: Some(1),
            ..Default::default()
        };
        let (session, transport) = session_with(RecordingTransport::default(), config);
        session.start();
        session.on_peer_state_changed(&peer(1), LinkState::Connected);

        session.on_incoming_connection_request(&peer(2));
        session.on_incoming_connection_request(&peer(1));

        let calls = transport.calls();
        assert!(calls.contains(&Call::Respond(peer(2), false)));
        assert!(calls.contains(&Call::Respond(peer(1), true)));
    }

    #[test]
    fn test_advertise_failure_is_not_fatal() {
        let transport = RecordingTransport {
            refuse_advertising: true,
            ..Default::default()
        };
        let (session, transport) = session_with(transport, SessionConfig::default());
        let mut events = session.events();
        session.start();

        assert!(session.is_running());
        assert_eq!(session.stats().discovery_failures, 1);
        assert!(matches!(events.try_recv(), Ok(SessionEvent::AdvertiseFailed(_))));

        session.stop();
        // Only browsing had a handle to stop
        assert_eq!(
            transport.calls().last(),
            Some(&Call::StopBrowsing(DiscoveryHandle(2)))
        );
    }

    #[test]
    fn test_browse_failure_is_not_fatal() {
        let transport = RecordingTransport {
            refuse_browsing: true,
            ..Default::default()
        };
        let (session, transport) = session_with(transport, SessionConfig::default());
        let mut events = session.events();
        session.start();

        assert!(session.is_running());
        assert_eq!(session.stats().discovery_failures, 1);
        assert!(matches!(events.try_recv(), Ok(SessionEvent::BrowseFailed(_))));

        session.stop();
        // Only advertising had a handle to stop
        assert_eq!(
            transport.calls().last(),
            Some(&Call::StopAdvertising(DiscoveryHandle(1)))
        );
    }

    #[test]
    fn test_restart_during_start_leaves_no_stray_handles() {
        let transport = Arc::new(RestartingTransport::default());
        let session = PeerBroadcastSession::new(peer(0), transport.clone(), SessionConfig::default());
        *transport.restart.lock() = Some(session.clone());

        session.start();

        // The superseded advertise handle was released right away
        assert!(session.is_running());
        assert_eq!(transport.advertising.lock().len(), 1);
        assert_eq!(transport.browsing.lock().len(), 1);

        session.start();
        session.stop();

        assert!(transport.advertising.lock().is_empty());
        assert!(transport.browsing.lock().is_empty());
    }

    #[test]
    fn test_snapshot_watchers_see_updates() {
        let (session, _) = started();
        let mut rx = session.subscribe();
        rx.borrow_and_update();

        session.broadcast(ColorSelection::Green);

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().last_selection, Some(ColorSelection::Green));
    }

    #[test]
    fn test_handle_event_dispatch() {
        let (session, _) = started();
        session.handle_event(TransportEvent::PeerStateChanged {
            peer: peer(1),
            state: LinkState::Connected,
        });
        session.handle_event(TransportEvent::DataReceived {
            peer: peer(1),
            payload: Bytes::from_static(b"red"),
        });
        session.handle_event(TransportEvent::SendFailed {
            peer: peer(1),
            reason: "gone".into(),
        });

        let snapshot = session.snapshot();
        assert!(snapshot.is_connected_to(&peer(1)));
        assert_eq!(snapshot.last_selection, Some(ColorSelection::Red));
        assert_eq!(session.stats().send_failures, 1);
    }

    #[tokio::test]
    async fn test_event_loop_drains_channel() {
        let (session, _) = started();
        let (tx, rx) = shutter_transport::event_channel();
        let task = session.spawn_event_loop(rx);

        tx.send(TransportEvent::PeerStateChanged {
            peer: peer(1),
            state: LinkState::Connected,
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(session.snapshot().is_connected_to(&peer(1)));
    }

    #[test]
    fn test_drop_stops_discovery() {
        let (session, transport) = started();
        drop(session);

        assert_eq!(
            &transport.calls()[2..],
            &[
                Call::StopAdvertising(DiscoveryHandle(1)),
                Call::StopBrowsing(DiscoveryHandle(2)),
            ]
        );
    }

    fn link_state() -> impl Strategy<Value = LinkState> {
        prop_oneof![
            Just(LinkState::Disconnected),
            Just(LinkState::Connecting),
            Just(LinkState::Connected),
        ]
    }

    proptest! {
        #[test]
        fn snapshot_tracks_latest_link_reports(
            reports in proptest::collection::vec((1u64..6, link_state()), 0..64)
        ) {
            let (session, _) = started();
            let mut latest: HashMap<u64, LinkState> = HashMap::new();

            for (n, state) in &reports {
                session.on_peer_state_changed(&peer(*n), *state);
                latest.insert(*n, *state);
            }

            let expected: BTreeSet<PeerIdentity> = latest
                .iter()
                .filter(|(_, s)| s.is_connected())
                .map(|(n, _)| peer(*n))
                .collect();
            prop_assert_eq!(session.snapshot().connected_peers, expected);
        }
    }
}
