//! Node fixture: one coordinator with its local game and session.
//!
//! A host node owns a UDP socket standing in for the game server; a client
//! node owns one standing in for the game client, bound to the port its
//! config names as `client_port`. Each node gets its own block of tunnel ports
//! so tests can run concurrently.
//!
//! # Example
//!
//! ```no_run
//! use coplay_core::JoinFilter;
//! use coplay_integration_tests::fixtures::{Node, drive};
//! use coplay_transport::{MemoryRelay, PeerIdentity};
//!
//! let relay = MemoryRelay::new();
//! let mut host = Node::host(&relay, PeerIdentity::new(1), JoinFilter::Everyone);
//! let mut guest = Node::client(&relay, PeerIdentity::new(2));
//! host.coordinator.start_hosting().unwrap();
//! guest.join(&host.join_command());
//! assert!(drive(&mut [&mut host, &mut guest], |n| n[1].tunnel_endpoint().is_some()));
//! ```

use super::directory::DirectoryHub;
use crate::test_helpers::{ci_timeout, game_socket, try_recv, POLL_INTERVAL};
use coplay_core::{
    CoplayConfig, FriendLookup, JoinFilter, LocalSession, Role, RoleCoordinator, StaticSession,
};
use coplay_transport::{MemoryRelay, PeerIdentity, PortRange};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Tunnel ports handed to each node
const PORTS_PER_NODE: u16 = 16;

/// Global port block allocator for concurrent test execution
static NEXT_PORT: AtomicU16 = AtomicU16::new(48000);

fn allocate_port_range() -> PortRange {
    let start = NEXT_PORT.fetch_add(PORTS_PER_NODE, Ordering::SeqCst);
    PortRange::new(start, start + PORTS_PER_NODE - 1).expect("valid test port range")
}

/// Default test configuration: fast ticks and a fresh port block.
pub fn test_config(filter: JoinFilter) -> CoplayConfig {
    CoplayConfig {
        port_range: allocate_port_range(),
        tick_hz: 1000,
        join_filter: filter,
        auto_open: false,
        presence_interval_ms: 20,
        ..CoplayConfig::default()
    }
}

/// One participant of an end-to-end test.
pub struct Node {
    /// Peer identity on the relay
    pub identity: PeerIdentity,
    /// The engine under test
    pub coordinator: RoleCoordinator,
    /// Local game session
    pub session: Arc<StaticSession>,
    /// Game server (hosts) or game client (clients) socket
    pub game: UdpSocket,
    hub: Option<DirectoryHub>,
}

impl Node {
    /// A node running a game server, not yet hosting.
    pub fn host(relay: &MemoryRelay, identity: PeerIdentity, filter: JoinFilter) -> Self {
        Self::host_with(relay, identity, test_config(filter), Arc::new(|_: PeerIdentity| false))
    }

    /// A hosting node with explicit config and friend list.
    pub fn host_with(
        relay: &MemoryRelay,
        identity: PeerIdentity,
        config: CoplayConfig,
        friends: Arc<dyn FriendLookup>,
    ) -> Self {
        let game = game_socket();
        let server = game.local_addr().expect("game server address");
        let session = Arc::new(StaticSession::hosting(server));
        Self::build(relay, identity, config, session, game, friends)
    }

    /// A node with an idle game client.
    pub fn client(relay: &MemoryRelay, identity: PeerIdentity) -> Self {
        Self::client_with(relay, identity, test_config(JoinFilter::Off))
    }

    /// A client node with explicit config; `client_port` is overridden.
    pub fn client_with(
        relay: &MemoryRelay,
        identity: PeerIdentity,
        mut config: CoplayConfig,
    ) -> Self {
        let game = game_socket();
        config.client_port = game.local_addr().expect("game client address").port();
        let session = Arc::new(StaticSession::idle());
        Self::build(
            relay,
            identity,
            config,
            session,
            game,
            Arc::new(|_: PeerIdentity| false),
        )
    }

    fn build(
        relay: &MemoryRelay,
        identity: PeerIdentity,
        config: CoplayConfig,
        session: Arc<StaticSession>,
        game: UdpSocket,
        friends: Arc<dyn FriendLookup>,
    ) -> Self {
        let mut coordinator = RoleCoordinator::new(
            config,
            Arc::new(relay.endpoint(identity)),
            session.clone(),
            friends,
        )
        .expect("valid test config");
        coordinator.tick();
        Self {
            identity,
            coordinator,
            session,
            game,
            hub: None,
        }
    }

    /// Attach a shared directory; its events are delivered on [`Node::tick`].
    pub fn with_directory(mut self, hub: &DirectoryHub) -> Self {
        self.coordinator = self.coordinator.with_directory(hub.directory(self.identity));
        self.hub = Some(hub.clone());
        self
    }

    /// Deliver directory events, then run one coordinator tick.
    pub fn tick(&mut self) {
        if let Some(hub) = &self.hub {
            for event in hub.take_events(self.identity) {
                if let Err(e) = self.coordinator.handle_directory_event(event) {
                    tracing::debug!(error = %e, "directory event failed");
                }
            }
        }
        self.coordinator.tick();
    }

    /// Current role
    pub fn role(&self) -> Role {
        self.coordinator.role()
    }

    /// The host's join command as a string.
    pub fn join_command(&self) -> String {
        self.coordinator
            .join_command()
            .expect("node is hosting")
            .to_string()
    }

    /// Run a join command on this node.
    pub fn join(&mut self, command: &str) {
        self.coordinator
            .run_join_command(command)
            .expect("join command accepted");
    }

    /// Where the game client was pointed, once the tunnel is up.
    pub fn tunnel_endpoint(&self) -> Option<SocketAddr> {
        if self.role() == Role::Client {
            self.session.server_addr()
        } else {
            None
        }
    }

    /// Whether the game client has been pointed at a tunnel.
    pub fn is_tunnelled(&self) -> bool {
        self.tunnel_endpoint().is_some()
    }
}

/// Tick every node until `done` holds or the timeout passes.
///
/// Returns whether `done` was reached.
pub fn drive(nodes: &mut [&mut Node], mut done: impl FnMut(&[&mut Node]) -> bool) -> bool {
    let deadline = Instant::now() + ci_timeout(Duration::from_secs(3));
    loop {
        for node in nodes.iter_mut() {
            node.tick();
        }
        if done(nodes) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Send `payload` from the client's game socket through the tunnel until the
/// host's game server sees it, ticking every node meanwhile.
///
/// Returns the address the host server saw the datagram come from, which is
/// the host-side tunnel endpoint for this client.
pub fn send_to_host(
    nodes: &mut [&mut Node],
    client: usize,
    host: usize,
    payload: &[u8],
) -> Option<SocketAddr> {
    let mut seen = None;
    drive(nodes, |n| {
        if let Some(endpoint) = n[client].tunnel_endpoint() {
            let _ = n[client].game.send_to(payload, endpoint);
        }
        while let Some((data, from)) = try_recv(&n[host].game) {
            if data == payload {
                seen = Some(from);
            }
        }
        seen.is_some()
    });
    seen
}

/// Send `payload` from the host's game server to `endpoint` and wait for the
/// client's game socket to receive it.
pub fn send_to_client(
    nodes: &mut [&mut Node],
    host: usize,
    client: usize,
    endpoint: SocketAddr,
    payload: &[u8],
) -> bool {
    let mut sent = false;
    drive(nodes, |n| {
        if !sent {
            sent = n[host].game.send_to(payload, endpoint).is_ok();
        }
        let mut got = false;
        while let Some((data, _)) = try_recv(&n[client].game) {
            got |= data == payload;
        }
        got
    })
}
