//! The local game session the tunnel serves.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// The engine-side session: what the local game is doing and how to steer it.
pub trait LocalSession: Send + Sync {
    /// Whether the game is currently connected to a server.
    fn is_active(&self) -> bool;

    /// Whether that server runs on this machine.
    fn is_loopback(&self) -> bool;

    /// Address of the server the game is connected to; the local server's
    /// listening address when hosting.
    fn server_addr(&self) -> Option<SocketAddr>;

    /// Point the local game client at a tunnel endpoint.
    fn connect_to(&self, addr: SocketAddr);

    /// Ordinary server connect for a non-relayed address (`host:port`).
    fn connect_remote(&self, target: &str);

    /// Leave the current server.
    fn disconnect(&self);

    /// Server name advertised to others.
    fn host_name(&self) -> String {
        String::new()
    }

    /// Current map, advertised to others.
    fn map_name(&self) -> String {
        String::new()
    }

    /// Player slots on the local server.
    fn max_players(&self) -> u32 {
        2
    }
}

/// A `LocalSession` driven by explicit calls.
///
/// Used by the loopback command and by tests in place of a game engine. Connect
/// requests are recorded and can be read back with [`StaticSession::connects`].
#[derive(Debug, Default)]
pub struct StaticSession {
    active: AtomicBool,
    loopback: AtomicBool,
    server: Mutex<Option<SocketAddr>>,
    host_name: Mutex<String>,
    map_name: Mutex<String>,
    max_players: AtomicU32,
    connects: Mutex<Vec<String>>,
}

impl StaticSession {
    /// A session that is not connected anywhere.
    #[must_use]
    pub fn idle() -> Self {
        Self::default()
    }

    /// A session hosting a local server at `server`.
    #[must_use]
    pub fn hosting(server: SocketAddr) -> Self {
        let session = Self::default();
        session.start_local_server(server);
        session
    }

    /// Mark the session as running a local server at `server`.
    pub fn start_local_server(&self, server: SocketAddr) {
        *lock(&self.server) = Some(server);
        self.loopback.store(true, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    /// Mark the session as stopped.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.loopback.store(false, Ordering::SeqCst);
        *lock(&self.server) = None;
    }

    /// Set the advertised server and map names.
    pub fn set_names(&self, host_name: &str, map_name: &str) {
        *lock(&self.host_name) = host_name.to_owned();
        *lock(&self.map_name) = map_name.to_owned();
    }

    /// Set the player slots of the local server; zero means the default of two.
    pub fn set_max_players(&self, slots: u32) {
        self.max_players.store(slots, Ordering::SeqCst);
    }

    fn join(&self, server: Option<SocketAddr>) {
        let loopback = server.is_some_and(|addr| addr.ip().is_loopback());
        *lock(&self.server) = server;
        self.loopback.store(loopback, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    /// Connect targets requested so far, oldest first.
    #[must_use]
    pub fn connects(&self) -> Vec<String> {
        lock(&self.connects).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl LocalSession for StaticSession {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn is_loopback(&self) -> bool {
        self.loopback.load(Ordering::SeqCst)
    }

    fn server_addr(&self) -> Option<SocketAddr> {
        *lock(&self.server)
    }

    fn connect_to(&self, addr: SocketAddr) {
        lock(&self.connects).push(addr.to_string());
        self.join(Some(addr));
    }

    fn connect_remote(&self, target: &str) {
        lock(&self.connects).push(target.to_owned());
        self.join(target.parse().ok());
    }

    fn disconnect(&self) {
        self.stop();
    }

    fn host_name(&self) -> String {
        lock(&self.host_name).clone()
    }

    fn map_name(&self) -> String {
        lock(&self.map_name).clone()
    }

    fn max_players(&self) -> u32 {
        match self.max_players.load(Ordering::SeqCst) {
            0 => 2,
            slots => slots,
        }
    }
}
