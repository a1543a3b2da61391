//! Per-peer packet forwarder.
//!
//! A [`Forwarder`] copies datagrams between one local UDP socket and one relayed
//! connection. It runs on its own thread and is owned by a [`RelayedConnection`]
//! on the main side; the two share nothing but a [`StopSignal`], an atomic
//! that records the reason the connection is closed with. The thread sleeps
//! between ticks with `park_timeout`, so requesting deletion (which unparks it)
//! takes effect without waiting out the tick.
//!
//! The forwarder is the only owner of its transport handle and closes it
//! exactly once when the loop exits.

use crate::Role;
use crate::config::CoplayConfig;
use crate::error::{CoplayError, Result};
use crate::handshake::{ClientHandshake, HandshakeStep};
use crate::passcode::Passcode;
use crate::session::LocalSession;
use coplay_transport::{
    ConnectionHandle, EndReason, LocalSocket, PeerIdentity, PortAllocator, RelayTransport,
    SendMode,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Loop parameters shared by every forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderSettings {
    /// Messages drained per direction per tick
    pub max_packets_per_tick: usize,
    /// Inactivity timeout
    pub idle_timeout: Duration,
    /// Time a client has to receive `OK`
    pub handshake_timeout: Duration,
    /// Sleep between ticks
    pub tick_interval: Duration,
}

impl ForwarderSettings {
    /// Settings derived from the engine configuration.
    #[must_use]
    pub fn from_config(config: &CoplayConfig) -> Self {
        Self {
            max_packets_per_tick: config.max_packets_per_tick,
            idle_timeout: config.idle_timeout(),
            handshake_timeout: config.handshake_timeout(),
            tick_interval: config.tick_interval(),
        }
    }
}

/// Traffic counters of one forwarder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Datagrams read from the local socket and sent on the relay
    pub to_relay_packets: u64,
    /// Bytes of `to_relay_packets`
    pub to_relay_bytes: u64,
    /// Relay messages written to the sendback address
    pub to_local_packets: u64,
    /// Bytes of `to_local_packets`
    pub to_local_bytes: u64,
    /// Packets dropped because the handshake had not finished
    pub dropped: u64,
    /// Failed sends in either direction
    pub send_errors: u64,
    /// Transient local receive errors
    pub recv_errors: u64,
}

impl ForwarderStats {
    /// Record a datagram forwarded onto the relay
    pub fn record_to_relay(&mut self, bytes: usize) {
        self.to_relay_bytes += bytes as u64;
        self.to_relay_packets += 1;
    }

    /// Record a message written to the local game
    pub fn record_to_local(&mut self, bytes: usize) {
        self.to_local_bytes += bytes as u64;
        self.to_local_packets += 1;
    }

    /// Record a dropped packet
    pub fn record_dropped(&mut self) {
        self.dropped += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}

/// Where relayed traffic is written for `role`.
///
/// Clients deliver to the local game client's fixed port. Hosts deliver to the
/// local server's port, or the default server port if the session has none.
#[must_use]
pub fn sendback_address(
    role: Role,
    session: &dyn LocalSession,
    config: &CoplayConfig,
) -> SocketAddr {
    let port = match role {
        Role::Client => config.client_port,
        _ => session
            .server_addr()
            .map(|addr| addr.port())
            .filter(|port| *port != 0)
            .unwrap_or(config.default_server_port),
    };
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Transient errors a UDP socket reports after an ICMP unreachable.
fn is_transient_socket_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Deletion request shared by a forwarder and its owner.
///
/// Holds the reason code of the first request; zero means still running.
/// Later requests never overwrite the first reason.
#[derive(Debug, Default)]
pub struct StopSignal(AtomicU16);

impl StopSignal {
    /// Ask to stop with `reason`. Returns true for the first request.
    pub fn request(&self, reason: EndReason) -> bool {
        self.0
            .compare_exchange(0, reason.code(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) != 0
    }

    /// Reason of the first request, `Finished` if none was made.
    #[must_use]
    pub fn reason(&self) -> EndReason {
        EndReason::from_code(self.0.load(Ordering::SeqCst)).unwrap_or(EndReason::Finished)
    }
}

/// The forwarding loop state. Lives on the forwarder thread.
pub struct Forwarder {
    handle: ConnectionHandle,
    remote: PeerIdentity,
    socket: LocalSocket,
    sendback: SocketAddr,
    transport: Arc<dyn RelayTransport>,
    session: Arc<dyn LocalSession>,
    stop: Arc<StopSignal>,
    settings: ForwarderSettings,
    handshake: ClientHandshake,
    started_at: Instant,
    last_activity: Instant,
    stats: ForwarderStats,
}

impl Forwarder {
    /// Create a forwarder for an established connection.
    ///
    /// `handshake` is `ClientHandshake::Ready` on the host side.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: ConnectionHandle,
        remote: PeerIdentity,
        socket: LocalSocket,
        sendback: SocketAddr,
        transport: Arc<dyn RelayTransport>,
        session: Arc<dyn LocalSession>,
        settings: ForwarderSettings,
        handshake: ClientHandshake,
    ) -> Self {
        let now = Instant::now();
        Self {
            handle,
            remote,
            socket,
            sendback,
            transport,
            session,
            stop: Arc::new(StopSignal::default()),
            settings,
            handshake,
            started_at: now,
            last_activity: now,
            stats: ForwarderStats::default(),
        }
    }

    /// Run one tick at time `now`. Returns whether the loop should continue.
    pub fn pump(&mut self, now: Instant) -> bool {
        if self.is_deletion_requested() {
            return false;
        }
        if !self.handle.is_valid() {
            self.fail(EndReason::RemoteIssue, "invalid connection handle");
            return false;
        }

        let carried = match (self.drain_local(), self.drain_relay()) {
            (Ok(local), Ok(relay)) => local || relay,
            (Err(e), _) | (_, Err(e)) => {
                self.fail(EndReason::RemoteIssue, &e);
                return false;
            }
        };

        if carried || self.session.is_active() {
            self.last_activity = now;
        }

        if !self.handshake.is_ready()
            && now.saturating_duration_since(self.started_at) > self.settings.handshake_timeout
        {
            self.fail(EndReason::Timeout, "host never confirmed the connection");
            return false;
        }
        if now.saturating_duration_since(self.last_activity) > self.settings.idle_timeout {
            self.fail(EndReason::Timeout, "idle timeout");
            return false;
        }
        true
    }

    /// Local socket to relay. Returns whether anything was read.
    fn drain_local(&mut self) -> std::result::Result<bool, String> {
        let mut carried = false;
        for _ in 0..self.settings.max_packets_per_tick {
            let payload = match self.socket.try_recv() {
                Ok(Some((payload, _from))) => payload,
                Ok(None) => break,
                Err(e) if is_transient_socket_error(&e) => {
                    self.stats.record_recv_error();
                    continue;
                }
                Err(e) => return Err(format!("local socket failed: {e}")),
            };
            carried = true;

            if !self.handshake.is_ready() {
                self.stats.record_dropped();
                continue;
            }
            let len = payload.len();
            match self
                .transport
                .send(self.handle, payload, SendMode::UnreliableNoNagle)
            {
                Ok(_) => self.stats.record_to_relay(len),
                Err(e) if e.is_dead_handle() => return Err(format!("relay send failed: {e}")),
                Err(e) => {
                    trace!(handle = %self.handle, error = %e, "relay send failed");
                    self.stats.record_send_error();
                }
            }
        }
        Ok(carried)
    }

    /// Relay to sendback address. Returns whether anything was received.
    fn drain_relay(&mut self) -> std::result::Result<bool, String> {
        let messages = self
            .transport
            .receive(self.handle, self.settings.max_packets_per_tick)
            .map_err(|e| format!("relay receive failed: {e}"))?;
        let carried = !messages.is_empty();

        for message in messages {
            if !self.handshake.is_ready() {
                self.advance_handshake(&message);
                continue;
            }
            match self.socket.send_to(&message, self.sendback) {
                Ok(_) => self.stats.record_to_local(message.len()),
                Err(e) => {
                    trace!(sendback = %self.sendback, error = %e, "local send failed");
                    self.stats.record_send_error();
                }
            }
        }
        Ok(carried)
    }

    fn advance_handshake(&mut self, message: &[u8]) {
        match self.handshake.on_message(message) {
            HandshakeStep::Reply(secret) => {
                debug!(handle = %self.handle, peer = %self.remote, "host requested passcode");
                if let Err(e) = self
                    .transport
                    .send(self.handle, &secret, SendMode::ReliableNoNagle)
                {
                    debug!(handle = %self.handle, error = %e, "passcode reply failed");
                }
            }
            HandshakeStep::Ready => {
                info!(handle = %self.handle, peer = %self.remote, "host admitted connection");
            }
            HandshakeStep::Ignored => self.stats.record_dropped(),
        }
    }

    fn fail(&mut self, reason: EndReason, detail: &str) {
        debug!(
            handle = %self.handle,
            peer = %self.remote,
            reason = %reason,
            detail,
            "forwarder stopping"
        );
        self.stop.request(reason);
    }

    /// Whether the loop has been asked to stop.
    #[must_use]
    pub fn is_deletion_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Signal shared with the owner of this forwarder.
    #[must_use]
    pub fn stop_signal(&self) -> Arc<StopSignal> {
        Arc::clone(&self.stop)
    }

    /// Last time traffic moved or the session was active.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Reason the connection will be closed with.
    #[must_use]
    pub fn exit_reason(&self) -> EndReason {
        self.stop.reason()
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> ForwarderStats {
        self.stats
    }

    /// Port of the local socket.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.socket.port()
    }

    /// Address the local game should send to.
    #[must_use]
    pub fn local_endpoint(&self) -> SocketAddr {
        self.socket.bound_addr()
    }

    /// Loop until deletion is requested, then release everything.
    pub fn run(mut self) -> ForwarderStats {
        info!(
            handle = %self.handle,
            peer = %self.remote,
            port = self.socket.port(),
            sendback = %self.sendback,
            "forwarder started"
        );
        while !self.is_deletion_requested() {
            thread::park_timeout(self.settings.tick_interval);
            self.pump(Instant::now());
        }
        self.finish()
    }

    /// Close the local socket and the relayed connection.
    pub fn finish(self) -> ForwarderStats {
        let Self {
            handle,
            remote,
            socket,
            transport,
            stop,
            stats,
            ..
        } = self;
        let exit_reason = stop.reason();
        let port = socket.port();
        drop(socket);

        let linger = exit_reason == EndReason::Finished;
        if let Err(e) = transport.close(handle, exit_reason, exit_reason.debug_str(), linger) {
            debug!(handle = %handle, error = %e, "connection already released");
        }
        info!(
            handle = %handle,
            peer = %remote,
            port,
            reason = %exit_reason,
            to_relay = stats.to_relay_packets,
            to_local = stats.to_local_packets,
            "forwarder stopped"
        );
        stats
    }
}

/// Everything needed to open a forwarder for a new connection.
#[derive(Clone)]
pub struct ForwarderContext {
    /// Relay transport
    pub transport: Arc<dyn RelayTransport>,
    /// Local game session
    pub session: Arc<dyn LocalSession>,
    /// Local socket allocator
    pub allocator: PortAllocator,
    /// Loop parameters
    pub settings: ForwarderSettings,
    /// Engine configuration, for sendback ports
    pub config: CoplayConfig,
}

impl ForwarderContext {
    /// Context for `config` over the given collaborators.
    #[must_use]
    pub fn new(
        config: &CoplayConfig,
        transport: Arc<dyn RelayTransport>,
        session: Arc<dyn LocalSession>,
    ) -> Self {
        Self {
            transport,
            session,
            allocator: PortAllocator::new(config.bind_addr, config.port_range),
            settings: ForwarderSettings::from_config(config),
            config: config.clone(),
        }
    }
}

/// Main-side record of a running forwarder.
pub struct RelayedConnection {
    handle: ConnectionHandle,
    remote: PeerIdentity,
    local_endpoint: SocketAddr,
    sendback: SocketAddr,
    started_at: Instant,
    stop: Arc<StopSignal>,
    thread: Option<JoinHandle<ForwarderStats>>,
    exited: Receiver<()>,
}

impl RelayedConnection {
    /// Allocate a local socket and start forwarding `handle` for `role`.
    ///
    /// A client forwarder holds game traffic until the host's `OK` and answers a
    /// password request with `password`.
    ///
    /// # Errors
    /// Returns `CoplayError::Transport` when no local port is free and
    /// `CoplayError::Thread` when the thread cannot be started. The transport
    /// handle is left open for the caller to close in both cases.
    pub fn open(
        handle: ConnectionHandle,
        remote: PeerIdentity,
        role: Role,
        ctx: &ForwarderContext,
        password: Option<Passcode>,
    ) -> Result<Self> {
        let socket = ctx.allocator.acquire()?;
        let sendback = sendback_address(role, ctx.session.as_ref(), &ctx.config);
        let handshake = match role {
            Role::Client => ClientHandshake::awaiting(password),
            _ => ClientHandshake::Ready,
        };
        let forwarder = Forwarder::new(
            handle,
            remote,
            socket,
            sendback,
            Arc::clone(&ctx.transport),
            Arc::clone(&ctx.session),
            ctx.settings,
            handshake,
        );
        Self::spawn(forwarder)
    }

    /// Start `forwarder` on its own thread.
    ///
    /// # Errors
    /// Returns `CoplayError::Thread` when the thread cannot be started.
    pub fn spawn(forwarder: Forwarder) -> Result<Self> {
        let handle = forwarder.handle;
        let remote = forwarder.remote;
        let local_endpoint = forwarder.local_endpoint();
        let sendback = forwarder.sendback;
        let stop = forwarder.stop_signal();
        let (exit_tx, exited) = bounded::<()>(0);

        let thread = thread::Builder::new()
            .name(format!("coplay-fwd-{}", local_endpoint.port()))
            .spawn(move || {
                let _exit = exit_tx;
                forwarder.run()
            })
            .map_err(|e| CoplayError::Thread(e.to_string().into()))?;

        Ok(Self {
            handle,
            remote,
            local_endpoint,
            sendback,
            started_at: Instant::now(),
            stop,
            thread: Some(thread),
            exited,
        })
    }

    /// Relayed connection handle.
    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Peer on the other end.
    #[must_use]
    pub fn remote(&self) -> PeerIdentity {
        self.remote
    }

    /// Local UDP port the game talks to.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_endpoint.port()
    }

    /// Local endpoint the game talks to.
    #[must_use]
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    /// Where relayed traffic is written.
    #[must_use]
    pub fn sendback(&self) -> SocketAddr {
        self.sendback
    }

    /// When the forwarder started.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Ask the forwarder to stop and close with `Finished`.
    /// Returns true the first time.
    pub fn request_deletion(&self) -> bool {
        self.request_deletion_with(EndReason::Finished)
    }

    /// Ask the forwarder to stop, close its connection with `reason` and wake
    /// it. Returns true the first time; a later reason is ignored.
    pub fn request_deletion_with(&self, reason: EndReason) -> bool {
        let first = self.stop.request(reason);
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
        first
    }

    /// Whether deletion has been requested, by either side.
    #[must_use]
    pub fn is_deletion_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Whether the forwarder thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the thread to exit and collect its stats.
    ///
    /// # Errors
    /// Hands the record back if the thread is still running at the deadline.
    /// It keeps running and still closes its own socket and connection.
    pub fn join(mut self, timeout: Duration) -> std::result::Result<ForwarderStats, Self> {
        if let Err(RecvTimeoutError::Timeout) = self.exited.recv_timeout(timeout) {
            return Err(self);
        }
        let Some(thread) = self.thread.take() else {
            return Ok(ForwarderStats::default());
        };
        thread.join().or_else(|_| {
            warn!(handle = %self.handle, "forwarder thread panicked");
            Ok(ForwarderStats::default())
        })
    }
}

impl Drop for RelayedConnection {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.request_deletion();
        }
    }
}

impl std::fmt::Debug for RelayedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedConnection")
            .field("handle", &self.handle)
            .field("remote", &self.remote)
            .field("local_endpoint", &self.local_endpoint)
            .field("sendback", &self.sendback)
            .finish_non_exhaustive()
    }
}
