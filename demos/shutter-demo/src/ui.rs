//! Demo UI - line-based terminal interface

use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use shutter_core::ColorSelection;
use shutter_runtime::{PeerBroadcastSession, SelectionOrigin, SessionEvent};
use shutter_transport::MemoryMesh;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// `<node> <color>`
    Pick(usize, ColorSelection),
    Peers,
    Drop(usize, usize),
    Stop(usize),
    Start(usize),
    Stats,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let index = |s: &str| {
            s.parse::<usize>()
                .map_err(|_| format!("not a node index: {s}"))
        };

        match parts.as_slice() {
            ["peers"] | ["p"] => Ok(Command::Peers),
            ["stats"] => Ok(Command::Stats),
            ["help"] | ["?"] => Ok(Command::Help),
            ["quit"] | ["q"] | ["exit"] => Ok(Command::Quit),
            ["drop", a, b] => Ok(Command::Drop(index(*a)?, index(*b)?)),
            ["stop", n] => Ok(Command::Stop(index(*n)?)),
            ["start", n] => Ok(Command::Start(index(*n)?)),
            [n, color] => {
                let color = color
                    .parse::<ColorSelection>()
                    .map_err(|e| e.to_string())?;
                Ok(Command::Pick(index(*n)?, color))
            }
            _ => Err(format!("unknown command: {line}")),
        }
    }
}

pub struct DemoUI {
    mesh: MemoryMesh,
    sessions: Vec<PeerBroadcastSession>,
}

impl DemoUI {
    pub fn new(mesh: MemoryMesh, sessions: Vec<PeerBroadcastSession>) -> Self {
        Self { mesh, sessions }
    }

    /// Run the main UI loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let watchers: Vec<_> = self
            .sessions
            .iter()
            .enumerate()
            .map(|(i, session)| {
                let mut events = session.events();
                tokio::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) => print_event(i, &event),
                            Err(RecvError::Lagged(skipped)) => {
                                println!("\n[{i}] skipped {skipped} events");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                })
            })
            .collect();

        print_help();
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        prompt();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                prompt();
                continue;
            }

            match Command::parse(line) {
                Ok(Command::Quit) => break,
                Ok(command) => self.execute(command),
                Err(e) => println!("{e}"),
            }
            prompt();
        }

        for watcher in watchers {
            watcher.abort();
        }
        for session in &self.sessions {
            session.stop();
        }
        Ok(())
    }

    fn session(&self, index: usize) -> Option<&PeerBroadcastSession> {
        let session = self.sessions.get(index);
        if session.is_none() {
            println!("no node {index} (0..{})", self.sessions.len());
        }
        session
    }

    fn execute(&self, command: Command) {
        match command {
            Command::Pick(n, color) => {
                if let Some(session) = self.session(n) {
                    session.broadcast(color);
                }
            }
            Command::Peers => self.print_peers(),
            Command::Drop(a, b) => {
                if let (Some(sa), Some(sb)) = (self.session(a), self.session(b)) {
                    if !self.mesh.disconnect(sa.local_identity(), sb.local_identity()) {
                        println!("{a} and {b} were not linked");
                    }
                }
            }
            Command::Stop(n) => {
                if let Some(session) = self.session(n) {
                    session.stop();
                }
            }
            Command::Start(n) => {
                if let Some(session) = self.session(n) {
                    session.start();
                }
            }
            Command::Stats => {
                for (i, session) in self.sessions.iter().enumerate() {
                    println!("[{i}] {:?}", session.stats());
                }
            }
            Command::Help => print_help(),
            Command::Quit => {}
        }
    }

    fn print_peers(&self) {
        for (i, session) in self.sessions.iter().enumerate() {
            let snapshot = session.snapshot();
            let identity = session.local_identity();
            let color = snapshot
                .last_selection
                .map(swatch)
                .unwrap_or_else(|| "-".to_string());
            println!(
                "[{i}] {:<10} #{:04x} {:<6} {} connected: {:?}",
                identity.display_name(),
                identity.tag() & 0xffff,
                color,
                if snapshot.running { "discovering" } else { "stopped    " },
                snapshot.peer_names(),
            );
        }
    }
}

fn print_event(node: usize, event: &SessionEvent) {
    match event {
        SessionEvent::SelectionChanged {
            selection,
            origin: SelectionOrigin::Remote(from),
        } => println!("\n[{node}] now {selection} (from {})", from.display_name()),
        SessionEvent::SelectionChanged { .. } => return,
        SessionEvent::PeerConnected(peer) => {
            println!("\n[{node}] connected to {}", peer.display_name())
        }
        SessionEvent::PeerDisconnected(peer) => {
            println!("\n[{node}] lost {}", peer.display_name())
        }
        SessionEvent::SendFailed { peer, reason } => {
            println!("\n[{node}] send to {} failed: {reason}", peer.display_name())
        }
        SessionEvent::DecodeFailed { peer, token } => {
            println!("\n[{node}] bad color {token:?} from {}", peer.display_name())
        }
        SessionEvent::AdvertiseFailed(reason) => println!("\n[{node}] advertising failed: {reason}"),
        SessionEvent::BrowseFailed(reason) => println!("\n[{node}] browsing failed: {reason}"),
    }
    prompt();
}

/// Color name printed in its own tint
fn swatch(color: ColorSelection) -> String {
    let (r, g, b) = color.rgb();
    format!("\x1b[38;2;{r};{g};{b}m{color}\x1b[0m")
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn print_help() {
    println!("Commands:");
    println!("  <node> red|green|blue  pick a color on a node");
    println!("  peers                  show every node's state");
    println!("  drop <a> <b>           sever the link between two nodes");
    println!("  stop <n> / start <n>   toggle discovery on a node");
    println!("  stats                  show session counters");
    println!("  quit                   exit");
}
