//! Connection lifecycle manager.
//!
//! Turns transport status events into admission decisions, pending passcode
//! checks, forwarder promotion and teardown. Everything here runs on the main
//! tick; forwarder threads only ever see their own deletion flag.

use crate::Role;
use crate::admission::{self, Admission, AdmissionMode, FriendLookup, JoinFilter};
use crate::directory::{Directory, LobbyId};
use crate::error::{CoplayError, Result};
use crate::forwarder::{ForwarderContext, ForwarderStats, RelayedConnection};
use crate::handshake::{NEED_PASSWORD, OK};
use crate::passcode::Passcode;
use crate::pending::{PendingConnection, PendingRegistry};
use coplay_transport::{
    ConnectionHandle, ConnectionState, EndReason, ListenHandle, PeerIdentity, SendMode,
    TransportEvent,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// What the coordinator has to do after an event or tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Nothing beyond what the manager already did
    Handled,
    /// The current role cannot continue; go back to `Inactive`
    RoleLost,
}

/// Owner of every relayed and pending connection of this process.
pub struct ConnectionLifecycleManager {
    ctx: ForwarderContext,
    friends: Arc<dyn FriendLookup>,
    directory: Option<Arc<dyn Directory>>,
    role: Role,
    join_filter: JoinFilter,
    admission: AdmissionMode,
    listen: Option<ListenHandle>,
    passcode: Option<Passcode>,
    lobby: Option<LobbyId>,
    connections: HashMap<PeerIdentity, RelayedConnection>,
    retiring: Vec<RelayedConnection>,
    pending: PendingRegistry,
    outbound: Option<ConnectionHandle>,
    host_password: Option<Passcode>,
    refusal: Option<EndReason>,
}

impl ConnectionLifecycleManager {
    /// Create a manager in the `Unavailable` role.
    #[must_use]
    pub fn new(ctx: ForwarderContext, friends: Arc<dyn FriendLookup>) -> Self {
        let join_filter = ctx.config.join_filter;
        let admission = ctx.config.admission;
        Self {
            ctx,
            friends,
            directory: None,
            role: Role::Unavailable,
            join_filter,
            admission,
            listen: None,
            passcode: None,
            lobby: None,
            connections: HashMap::new(),
            retiring: Vec::new(),
            pending: PendingRegistry::new(),
            outbound: None,
            host_password: None,
            refusal: None,
        }
    }

    /// Attach a lobby directory.
    pub fn set_directory(&mut self, directory: Arc<dyn Directory>) {
        self.directory = Some(directory);
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current join filter.
    #[must_use]
    pub fn join_filter(&self) -> JoinFilter {
        self.join_filter
    }

    /// Passcode or lobby admission.
    #[must_use]
    pub fn admission(&self) -> AdmissionMode {
        self.admission
    }

    /// Current passcode, while hosting in passcode mode.
    #[must_use]
    pub fn passcode(&self) -> Option<&Passcode> {
        self.passcode.as_ref()
    }

    /// Lobby hosted or joined.
    #[must_use]
    pub fn lobby(&self) -> Option<LobbyId> {
        self.lobby
    }

    /// Record the lobby hosted or joined.
    pub fn set_lobby(&mut self, lobby: Option<LobbyId>) {
        self.lobby = lobby;
    }

    /// Number of running forwarders, not counting retiring ones.
    #[must_use]
    pub fn active_connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections waiting for a passcode.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The forwarder serving `peer`.
    #[must_use]
    pub fn connection(&self, peer: PeerIdentity) -> Option<&RelayedConnection> {
        self.connections.get(&peer)
    }

    /// Leave `Unavailable` once the relay is reachable.
    pub fn mark_available(&mut self) {
        if self.role == Role::Unavailable {
            info!("relay network available");
            self.role = Role::Inactive;
        }
    }

    /// Change who may connect. Updates the lobby visibility when hosting one.
    pub fn set_join_filter(&mut self, filter: JoinFilter) {
        self.join_filter = filter;
        if let (Some(lobby), Some(directory)) = (self.lobby, &self.directory) {
            if self.role == Role::Host {
                directory.set_lobby_visibility(lobby, filter.lobby_visibility());
            }
        }
        info!(filter = %filter, "join filter changed");
    }

    /// Replace the passcode. Connections already admitted are unaffected.
    pub fn rerandomize_passcode(&mut self) {
        self.passcode = Some(Passcode::generate());
        info!("passcode regenerated");
    }

    /// Open the listen endpoint and take the `Host` role.
    ///
    /// # Errors
    /// Returns `CoplayError::NoDirectory` in lobby mode without a directory and
    /// `CoplayError::Transport` when the listen endpoint cannot be created.
    pub fn open_host(&mut self) -> Result<()> {
        if self.admission == AdmissionMode::Lobby && self.directory.is_none() {
            return Err(CoplayError::NoDirectory);
        }
        let listen = self.ctx.transport.create_listen_endpoint()?;
        self.listen = Some(listen);
        self.role = Role::Host;

        match self.admission {
            AdmissionMode::Passcode => {
                self.passcode = Some(Passcode::generate());
            }
            AdmissionMode::Lobby => {
                if let Some(directory) = &self.directory {
                    let slots = self.ctx.session.max_players().max(2);
                    directory.create_lobby(self.join_filter.lobby_visibility(), slots);
                }
            }
        }
        info!(filter = %self.join_filter, admission = ?self.admission, "hosting");
        Ok(())
    }

    /// Connect to `peer` and take the `Client` role.
    ///
    /// `password` is submitted if the host asks for one.
    ///
    /// # Errors
    /// Returns `CoplayError::Transport` when the relay refuses the connect.
    pub fn connect(
        &mut self,
        peer: PeerIdentity,
        password: Option<Passcode>,
    ) -> Result<ConnectionHandle> {
        let handle = self.ctx.transport.connect(peer)?;
        self.role = Role::Client;
        self.outbound = Some(handle);
        self.host_password = password;
        self.refusal = None;
        info!(handle = %handle, peer = %peer, "connecting to host");
        Ok(handle)
    }

    /// Why the host turned this client away, once. Cleared by the next
    /// [`ConnectionLifecycleManager::connect`].
    pub fn take_refusal(&mut self) -> Option<CoplayError> {
        self.refusal.take().map(CoplayError::Rejected)
    }

    /// React to one transport status change.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) -> EventOutcome {
        trace!(
            handle = %event.handle,
            peer = %event.remote,
            from = %event.old_state,
            to = %event.new_state,
            "transport event"
        );
        match self.role {
            Role::Host => self.on_host_event(event, now),
            Role::Client => self.on_client_event(event),
            Role::Inactive | Role::Unavailable => {
                self.on_stray_event(event);
                EventOutcome::Handled
            }
        }
    }

    fn on_host_event(&mut self, event: TransportEvent, now: Instant) -> EventOutcome {
        let TransportEvent { handle, remote, .. } = event;
        match event.new_state {
            ConnectionState::Connecting => {
                if !self.ctx.session.is_active() {
                    debug!(handle = %handle, peer = %remote, "no local server, refusing");
                    self.close(handle, EndReason::NotOpen, "notopen");
                    return EventOutcome::RoleLost;
                }
                match self.admit(remote) {
                    Admission::Accept => {
                        if let Err(e) = self.ctx.transport.accept(handle) {
                            debug!(handle = %handle, error = %e, "accept failed");
                            self.close(handle, EndReason::RemoteIssue, "acceptfailed");
                        }
                    }
                    Admission::Reject(reason) => {
                        debug!(
                            handle = %handle,
                            peer = %remote,
                            reason = %reason,
                            "connection rejected"
                        );
                        self.close(handle, reason, reason.debug_str());
                    }
                    Admission::RequirePassword => match self.ctx.transport.accept(handle) {
                        Ok(()) => {
                            debug!(handle = %handle, peer = %remote, "awaiting passcode");
                            self.pending
                                .insert(PendingConnection::new(handle, remote, now));
                        }
                        Err(e) => {
                            debug!(handle = %handle, error = %e, "accept failed");
                            self.close(handle, EndReason::RemoteIssue, "acceptfailed");
                        }
                    },
                }
            }
            ConnectionState::Connected => {
                if self.pending.contains(handle) {
                    if let Err(e) =
                        self.ctx
                            .transport
                            .send(handle, NEED_PASSWORD, SendMode::ReliableNoNagle)
                    {
                        debug!(handle = %handle, error = %e, "passcode request failed");
                    }
                } else if !self.owns(handle) && self.is_live(handle) {
                    // Promotion failure already closed the handle.
                    let _ = self.promote(handle, remote, None);
                }
            }
            ConnectionState::ProblemDetectedLocally => {
                self.on_closed(handle, EndReason::Timeout, "problemdetectedlocally");
            }
            ConnectionState::ClosedByPeer => {
                self.on_closed(handle, EndReason::ClosedByPeer, "closedbypeer");
            }
            ConnectionState::None | ConnectionState::FindingRoute => {}
        }
        EventOutcome::Handled
    }

    fn on_client_event(&mut self, event: TransportEvent) -> EventOutcome {
        let TransportEvent { handle, remote, .. } = event;
        let ours = self.outbound == Some(handle) || self.owns(handle);
        if !ours {
            self.on_stray_event(event);
            return EventOutcome::Handled;
        }

        match event.new_state {
            ConnectionState::Connecting => {
                if let Err(e) = self.ctx.transport.accept(handle) {
                    debug!(handle = %handle, error = %e, "accept failed");
                }
                EventOutcome::Handled
            }
            ConnectionState::Connected => {
                if self.owns(handle) {
                    return EventOutcome::Handled;
                }
                self.outbound = None;
                let password = self.host_password.clone();
                match self.promote(handle, remote, password) {
                    Ok(endpoint) => {
                        self.ctx.session.connect_to(endpoint);
                        EventOutcome::Handled
                    }
                    Err(_) => EventOutcome::RoleLost,
                }
            }
            ConnectionState::ProblemDetectedLocally => {
                info!(handle = %handle, peer = %remote, "lost route to host");
                self.on_closed(handle, EndReason::Timeout, "problemdetectedlocally");
                EventOutcome::RoleLost
            }
            ConnectionState::ClosedByPeer => {
                let reason = self
                    .ctx
                    .transport
                    .connection_info(handle)
                    .and_then(|info| info.end_reason);
                info!(
                    handle = %handle,
                    peer = %remote,
                    reason = ?reason,
                    "host closed the connection"
                );
                self.refusal = reason.filter(|r| r.is_refusal());
                self.on_closed(handle, EndReason::ClosedByPeer, "closedbypeer");
                EventOutcome::RoleLost
            }
            ConnectionState::None | ConnectionState::FindingRoute => EventOutcome::Handled,
        }
    }

    /// Events for handles no role claims: refuse new ones, release dead ones.
    fn on_stray_event(&mut self, event: TransportEvent) {
        match event.new_state {
            ConnectionState::Connecting if !self.owns(event.handle) => {
                debug!(handle = %event.handle, peer = %event.remote, "not hosting, refusing");
                self.close(event.handle, EndReason::NotOpen, "notopen");
            }
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                self.on_closed(event.handle, EndReason::Timeout, "stray");
            }
            _ => {}
        }
    }

    fn admit(&self, peer: PeerIdentity) -> Admission {
        match self.admission {
            AdmissionMode::Passcode => {
                admission::decide(self.join_filter, peer, self.friends.as_ref())
            }
            AdmissionMode::Lobby => {
                let member = match (self.lobby, &self.directory) {
                    (Some(lobby), Some(directory)) => directory.is_member(lobby, peer),
                    _ => false,
                };
                admission::decide_in_lobby(self.lobby, member)
            }
        }
    }

    /// A connection ended: release it, or tell its forwarder to stop and close
    /// it with `reason`.
    fn on_closed(&mut self, handle: ConnectionHandle, reason: EndReason, detail: &str) {
        if self.pending.remove(handle).is_some() {
            debug!(handle = %handle, "pending connection closed");
            self.close(handle, reason, detail);
            return;
        }
        if let Some(conn) = self.connections.values().find(|c| c.handle() == handle) {
            conn.request_deletion_with(reason);
            return;
        }
        if self.retiring.iter().any(|c| c.handle() == handle) {
            return;
        }
        if self.outbound == Some(handle) {
            self.outbound = None;
        }
        self.close(handle, reason, detail);
    }

    /// Start a forwarder for `handle`, retiring any previous one for `remote`.
    fn promote(
        &mut self,
        handle: ConnectionHandle,
        remote: PeerIdentity,
        password: Option<Passcode>,
    ) -> Result<SocketAddr> {
        if let Some(previous) = self.connections.remove(&remote) {
            info!(peer = %remote, old = %previous.handle(), new = %handle, "replacing connection");
            previous.request_deletion();
            self.retiring.push(previous);
        }

        match RelayedConnection::open(handle, remote, self.role, &self.ctx, password) {
            Ok(conn) => {
                if self.role == Role::Host {
                    if let Err(e) = self.ctx.transport.send(handle, OK, SendMode::ReliableNoNagle) {
                        debug!(handle = %handle, error = %e, "OK send failed");
                    }
                }
                let endpoint = conn.local_endpoint();
                info!(
                    handle = %handle,
                    peer = %remote,
                    port = endpoint.port(),
                    sendback = %conn.sendback(),
                    "connection established"
                );
                self.connections.insert(remote, conn);
                Ok(endpoint)
            }
            Err(e) => {
                warn!(
                    handle = %handle,
                    peer = %remote,
                    error = %e,
                    "could not open local endpoint"
                );
                self.close(handle, EndReason::RemoteIssue, "failedlocalconnection");
                Err(e)
            }
        }
    }

    /// Housekeeping on the main tick: reap exited forwarders and, while
    /// hosting, resolve pending passcodes.
    pub fn tick(&mut self, now: Instant) -> EventOutcome {
        let mut outcome = EventOutcome::Handled;

        let finished: Vec<PeerIdentity> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_finished())
            .map(|(peer, _)| *peer)
            .collect();
        for peer in finished {
            let Some(conn) = self.connections.remove(&peer) else {
                continue;
            };
            match conn.join(Duration::ZERO) {
                Ok(stats) => log_reaped(peer, &stats),
                Err(conn) => {
                    self.connections.insert(peer, conn);
                    continue;
                }
            }
            if self.role == Role::Client {
                outcome = EventOutcome::RoleLost;
            }
        }

        let retiring = std::mem::take(&mut self.retiring);
        for conn in retiring {
            if !conn.is_finished() {
                self.retiring.push(conn);
                continue;
            }
            let peer = conn.remote();
            match conn.join(Duration::ZERO) {
                Ok(stats) => log_reaped(peer, &stats),
                Err(conn) => self.retiring.push(conn),
            }
        }

        if self.role == Role::Host && !self.pending.is_empty() {
            let report = self.pending.sweep(
                now,
                self.ctx.settings.handshake_timeout,
                self.ctx.transport.as_ref(),
                self.passcode.as_ref(),
            );
            for entry in report.admitted {
                // Promotion failure already closed the handle.
                let _ = self.promote(entry.handle, entry.remote, None);
            }
        }

        outcome
    }

    /// Release everything the current role holds and fall back to `Inactive`.
    ///
    /// Forwarders are asked to stop and then joined against one shared
    /// deadline; any that overrun stay tracked and are reaped by a later tick.
    /// Calling this twice is harmless.
    pub fn teardown(&mut self) {
        for entry in self.pending.drain() {
            self.close(entry.handle, EndReason::NotOpen, "hostclosed");
        }
        if let Some(handle) = self.outbound.take() {
            self.close(handle, EndReason::Finished, "disconnect");
        }

        let stopping: Vec<RelayedConnection> = self
            .connections
            .drain()
            .map(|(_, conn)| conn)
            .chain(self.retiring.drain(..))
            .collect();
        for conn in &stopping {
            conn.request_deletion();
        }
        let deadline = Instant::now() + self.ctx.config.join_timeout();
        for conn in stopping {
            let peer = conn.remote();
            match conn.join(deadline.saturating_duration_since(Instant::now())) {
                Ok(stats) => log_reaped(peer, &stats),
                Err(conn) => {
                    warn!(handle = %conn.handle(), peer = %peer, "forwarder did not stop in time");
                    self.retiring.push(conn);
                }
            }
        }

        if let Some(listen) = self.listen.take() {
            if let Err(e) = self.ctx.transport.close_listen_endpoint(listen) {
                debug!(error = %e, "listen endpoint already closed");
            }
        }
        if let Some(lobby) = self.lobby.take() {
            if let Some(directory) = &self.directory {
                directory.leave_lobby(lobby);
            }
        }
        self.passcode = None;
        self.host_password = None;

        if matches!(self.role, Role::Host | Role::Client) {
            info!(role = %self.role, "role released");
            self.role = Role::Inactive;
        }
    }

    fn owns(&self, handle: ConnectionHandle) -> bool {
        self.connections.values().any(|c| c.handle() == handle)
            || self.retiring.iter().any(|c| c.handle() == handle)
    }

    fn is_live(&self, handle: ConnectionHandle) -> bool {
        self.ctx
            .transport
            .connection_info(handle)
            .is_some_and(|info| info.state == ConnectionState::Connected)
    }

    fn close(&self, handle: ConnectionHandle, reason: EndReason, detail: &str) {
        if let Err(e) = self.ctx.transport.close(handle, reason, detail, false) {
            trace!(handle = %handle, error = %e, "close on released handle");
        }
    }
}

impl Drop for ConnectionLifecycleManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn log_reaped(peer: PeerIdentity, stats: &ForwarderStats) {
    info!(
        peer = %peer,
        to_relay_packets = stats.to_relay_packets,
        to_relay_bytes = stats.to_relay_bytes,
        to_local_packets = stats.to_local_packets,
        to_local_bytes = stats.to_local_bytes,
        dropped = stats.dropped,
        send_errors = stats.send_errors,
        "connection reaped"
    );
}

impl std::fmt::Debug for ConnectionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLifecycleManager")
            .field("role", &self.role)
            .field("join_filter", &self.join_filter)
            .field("admission", &self.admission)
            .field("connections", &self.connections.len())
            .field("retiring", &self.retiring.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
