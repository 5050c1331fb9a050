//! Mesh scenario builder for multi-session testing

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use shutter_core::PeerIdentity;
use shutter_runtime::{PeerBroadcastSession, SessionConfig, SessionSnapshot};
use shutter_transport::MemoryMesh;

/// Polling interval for convergence waits
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// One session attached to the scenario mesh
pub struct ScenarioNode {
    pub identity: PeerIdentity,
    pub session: PeerBroadcastSession,
    event_loop: JoinHandle<()>,
}

impl Drop for ScenarioNode {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// N sessions sharing one in-memory mesh
pub struct MeshScenario {
    mesh: MemoryMesh,
    nodes: Vec<ScenarioNode>,
}

impl MeshScenario {
    pub fn mesh(&self) -> &MemoryMesh {
        &self.mesh
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &PeerBroadcastSession {
        &self.nodes[index].session
    }

    pub fn identity(&self, index: usize) -> &PeerIdentity {
        &self.nodes[index].identity
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerBroadcastSession> {
        self.nodes.iter().map(|n| &n.session)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions().map(PeerBroadcastSession::snapshot).collect()
    }

    pub fn start_all(&self) {
        for session in self.sessions() {
            session.start();
        }
    }

    pub fn stop_all(&self) {
        for session in self.sessions() {
            session.stop();
        }
    }

    /// Sever the mesh link between two nodes
    pub fn disconnect(&self, a: usize, b: usize) -> bool {
        self.mesh.disconnect(self.identity(a), self.identity(b))
    }

    /// Take a node out of range. Its session and transport are dropped.
    pub fn remove(&mut self, index: usize) -> PeerIdentity {
        let node = self.nodes.remove(index);
        node.identity.clone()
    }

    /// Poll `predicate` against the scenario until it holds or `timeout` passes
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&MeshScenario) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Every node sees every other node as connected
    pub fn fully_connected(&self) -> bool {
        self.nodes.iter().all(|node| {
            let snapshot = node.session.snapshot();
            self.nodes
                .iter()
                .filter(|other| other.identity != node.identity)
                .all(|other| snapshot.is_connected_to(&other.identity))
        })
    }

    pub async fn wait_fully_connected(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, MeshScenario::fully_connected).await
    }
}

/// Scenario builder
pub struct ScenarioBuilder {
    names: Vec<String>,
    config: SessionConfig,
    overrides: HashMap<usize, SessionConfig>,
    auto_start: bool,
}

impl ScenarioBuilder {
    pub fn new() -> Self {
        ScenarioBuilder {
            names: Vec::new(),
            config: SessionConfig::default(),
            overrides: HashMap::new(),
            auto_start: true,
        }
    }

    /// Add nodes named `node-0`, `node-1`, ...
    pub fn with_nodes(mut self, count: usize) -> Self {
        self.names = (0..count).map(|i| format!("node-{i}")).collect();
        self
    }

    /// Add nodes with explicit display names
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Session config shared by all nodes
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Session config for one node
    pub fn with_node_config(mut self, index: usize, config: SessionConfig) -> Self {
        self.overrides.insert(index, config);
        self
    }

    /// Leave sessions stopped after build
    pub fn stopped(mut self) -> Self {
        self.auto_start = false;
        self
    }

    /// Build the scenario. Must run inside a tokio runtime.
    pub fn build(self) -> MeshScenario {
        let mesh = MemoryMesh::new();
        let mut nodes = Vec::with_capacity(self.names.len());

        for (i, name) in self.names.into_iter().enumerate() {
            let identity = PeerIdentity::new(name, i as u64);
            let (transport, events) = mesh.endpoint(identity.clone());
            let config = self
                .overrides
                .get(&i)
                .cloned()
                .unwrap_or_else(|| self.config.clone());

            let session = PeerBroadcastSession::new(identity.clone(), Arc::new(transport), config);
            let event_loop = session.spawn_event_loop(events);
            nodes.push(ScenarioNode {
                identity,
                session,
                event_loop,
            });
        }

        let scenario = MeshScenario { mesh, nodes };
        if self.auto_start {
            scenario.start_all();
        }
        tracing::debug!(nodes = scenario.len(), "mesh scenario built");
        scenario
    }
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new()
    }
}
