//! ShutterSync Demo Application
//!
//! Runs several sessions on one in-memory mesh and lets you pick colors for
//! them from the terminal:
//! - Symmetric discovery and connection
//! - Color broadcast to connected peers
//! - Link loss and snapshot updates
//!
//! Configuration comes from `SHUTTERSYNC_*` environment variables.
//!
//!   cargo run -p shutter-demo -- --nodes 3

mod ui;

use std::sync::Arc;

use shutter_core::PeerIdentity;
use shutter_runtime::{init_logging, PeerBroadcastSession, RuntimeConfig};
use shutter_transport::MemoryMesh;

use ui::DemoUI;

const DEFAULT_NODES: usize = 3;
const NODE_NAMES: [&str; 6] = ["director", "camera-a", "camera-b", "camera-c", "monitor", "tablet"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RuntimeConfig::from_env()?;
    init_logging(&config.logging)?;

    let args: Vec<String> = std::env::args().collect();
    let count = parse_arg(&args, "--nodes")
        .unwrap_or(DEFAULT_NODES)
        .clamp(1, NODE_NAMES.len());

    tracing::info!(
        nodes = count,
        namespace = %config.session.namespace,
        "starting demo mesh"
    );

    let mesh = MemoryMesh::new();
    let mut sessions = Vec::with_capacity(count);
    for name in NODE_NAMES.iter().take(count) {
        let identity = PeerIdentity::generate(*name);
        let (transport, events) = mesh.endpoint(identity.clone());
        let session =
            PeerBroadcastSession::new(identity, Arc::new(transport), config.session.clone());
        session.spawn_event_loop(events);
        session.start();
        sessions.push(session);
    }

    let mut ui = DemoUI::new(mesh, sessions);
    ui.run().await?;

    println!("Goodbye!");
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}
