//! Role coordinator.
//!
//! The single entry point a game integration talks to. It owns the lifecycle
//! manager, moves between `Unavailable`, `Inactive`, `Host` and `Client`,
//! feeds transport and directory events to the right place, and publishes
//! rich presence. Every method runs on the caller's main tick.

use crate::Role;
use crate::admission::{AdmissionMode, FriendLookup, JoinFilter};
use crate::config::CoplayConfig;
use crate::directory::{Directory, DirectoryEvent, LobbyId, LobbySummary};
use crate::error::{CoplayError, Result};
use crate::forwarder::ForwarderContext;
use crate::join::{JoinCommand, JoinTarget, PLAIN_CONNECT_COMMAND};
use crate::lifecycle::{ConnectionLifecycleManager, EventOutcome};
use crate::passcode::Passcode;
use crate::session::LocalSession;
use coplay_transport::{PeerIdentity, RelayTransport, TransportEvent};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Rich-presence key holding the join string.
pub const PRESENCE_CONNECT: &str = "connect";

/// Rich-presence key holding the player count.
pub const PRESENCE_PLAYER_COUNT: &str = "coplay_playercount";

/// Lobby data key for the server name.
pub const LOBBY_HOSTNAME: &str = "hostname";

/// Lobby data key for the current map.
pub const LOBBY_MAP: &str = "map";

/// Snapshot of the coordinator for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Current role
    pub role: Role,
    /// Running forwarders
    pub connections: usize,
    /// Connections waiting for a passcode
    pub pending: usize,
    /// Current join filter
    pub join_filter: JoinFilter,
}

/// Top-level state machine over the lifecycle manager.
pub struct RoleCoordinator {
    config: CoplayConfig,
    manager: ConnectionLifecycleManager,
    transport: Arc<dyn RelayTransport>,
    session: Arc<dyn LocalSession>,
    directory: Option<Arc<dyn Directory>>,
    events: Receiver<TransportEvent>,
    queued: Option<JoinCommand>,
    last_presence: Option<Instant>,
    lobby_list: Vec<LobbySummary>,
    last_error: Option<CoplayError>,
}

impl RoleCoordinator {
    /// Create a coordinator in the `Unavailable` role.
    ///
    /// # Errors
    /// Returns `CoplayError::InvalidConfig` if `config` does not validate.
    pub fn new(
        config: CoplayConfig,
        transport: Arc<dyn RelayTransport>,
        session: Arc<dyn LocalSession>,
        friends: Arc<dyn FriendLookup>,
    ) -> Result<Self> {
        config.validate()?;
        let events = transport.subscribe();
        let ctx = ForwarderContext::new(&config, Arc::clone(&transport), Arc::clone(&session));
        let manager = ConnectionLifecycleManager::new(ctx, friends);
        Ok(Self {
            config,
            manager,
            transport,
            session,
            directory: None,
            events,
            queued: None,
            last_presence: None,
            lobby_list: Vec::new(),
            last_error: None,
        })
    }

    /// Attach a lobby directory and rich-presence service.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.manager.set_directory(Arc::clone(&directory));
        self.directory = Some(directory);
        self
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.manager.role()
    }

    /// Number of running forwarders.
    #[must_use]
    pub fn active_connection_count(&self) -> usize {
        self.manager.active_connection_count()
    }

    /// Current passcode, while hosting in passcode mode.
    #[must_use]
    pub fn passcode(&self) -> Option<&Passcode> {
        self.manager.passcode()
    }

    /// Lobby hosted or joined.
    #[must_use]
    pub fn lobby(&self) -> Option<LobbyId> {
        self.manager.lobby()
    }

    /// Last lobby list received.
    #[must_use]
    pub fn lobby_list(&self) -> &[LobbySummary] {
        &self.lobby_list
    }

    /// Why the last connect ended without a tunnel: a host refusal, or a
    /// queued connect that failed. Cleared by the next connect or hosting start.
    #[must_use]
    pub fn last_error(&self) -> Option<&CoplayError> {
        self.last_error.as_ref()
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &CoplayConfig {
        &self.config
    }

    /// Snapshot for display.
    #[must_use]
    pub fn status(&self) -> Status {
        Status {
            role: self.manager.role(),
            connections: self.manager.active_connection_count(),
            pending: self.manager.pending_count(),
            join_filter: self.manager.join_filter(),
        }
    }

    /// Start hosting the local server, restarting if already hosting.
    ///
    /// A restart drops every connection and picks a new passcode.
    ///
    /// # Errors
    /// - `CoplayError::RelayUnavailable` before the relay is reachable
    /// - `CoplayError::NoLocalSession` without an active loopback server
    /// - whatever opening the listen endpoint or lobby fails with
    pub fn start_hosting(&mut self) -> Result<()> {
        if self.manager.role() == Role::Unavailable {
            return Err(CoplayError::RelayUnavailable);
        }
        if !self.session.is_active() {
            return Err(CoplayError::NoLocalSession("no server is running".into()));
        }
        if !self.session.is_loopback() {
            return Err(CoplayError::NoLocalSession(
                "the server is not running on this machine".into(),
            ));
        }

        self.go_inactive();
        self.last_error = None;
        if let Err(e) = self.manager.open_host() {
            warn!(error = %e, "could not start hosting");
            self.manager.teardown();
            return Err(e);
        }
        Ok(())
    }

    /// Stop hosting. Does nothing when not hosting.
    pub fn stop_hosting(&mut self) {
        if self.manager.role() == Role::Host {
            self.go_inactive();
        } else {
            debug!(role = %self.manager.role(), "stop_hosting while not hosting");
        }
    }

    /// Connect to a host, a lobby, or a plain server address.
    ///
    /// Relayed targets requested before the relay is reachable are queued and
    /// run once it is; a newer request replaces a queued one. `password` is
    /// only submitted to a relayed peer; lobbies and plain addresses ignore it.
    ///
    /// # Errors
    /// - `CoplayError::InvalidJoinCommand` when `target` is this process
    /// - `CoplayError::NoDirectory` for a lobby without a directory
    /// - `CoplayError::Transport` when the relay refuses the connect
    pub fn connect_to_peer(&mut self, target: JoinTarget, password: Option<String>) -> Result<()> {
        self.last_error = None;
        match target {
            JoinTarget::Address(addr) => {
                self.go_inactive();
                info!(target = %addr, "connecting directly");
                self.session.connect_remote(&addr);
                Ok(())
            }
            target if self.manager.role() == Role::Unavailable => {
                info!(target = %target, "relay unavailable, connect queued");
                self.queued = Some(JoinCommand { target, password });
                Ok(())
            }
            JoinTarget::Peer(peer) => self.connect_peer(peer, password.map(Passcode::new)),
            JoinTarget::Lobby(lobby) => {
                let Some(directory) = self.directory.clone() else {
                    return Err(CoplayError::NoDirectory);
                };
                self.go_inactive();
                info!(lobby = %lobby, "joining lobby");
                directory.join_lobby(lobby);
                Ok(())
            }
        }
    }

    /// Parse `input` as a join command and run it.
    ///
    /// # Errors
    /// As [`JoinCommand::parse`] and [`RoleCoordinator::connect_to_peer`].
    pub fn run_join_command(&mut self, input: &str) -> Result<()> {
        let command = JoinCommand::parse(input)?;
        self.connect_to_peer(command.target, command.password)
    }

    fn connect_peer(&mut self, peer: PeerIdentity, password: Option<Passcode>) -> Result<()> {
        if self.transport.local_identity() == Some(peer) {
            return Err(CoplayError::invalid_join("cannot connect to yourself"));
        }
        self.go_inactive();
        if self.session.is_active() {
            self.session.disconnect();
        }
        if let Err(e) = self.manager.connect(peer, password) {
            warn!(peer = %peer, error = %e, "connect failed");
            self.go_inactive();
            return Err(e);
        }
        Ok(())
    }

    /// The command others run to join this host.
    ///
    /// # Errors
    /// Returns `CoplayError::NotHosting` unless hosting, and
    /// `CoplayError::InvalidState` while the lobby is still being created.
    pub fn join_command(&self) -> Result<JoinCommand> {
        if self.manager.role() != Role::Host {
            return Err(CoplayError::NotHosting);
        }
        match self.manager.admission() {
            AdmissionMode::Lobby => self
                .manager
                .lobby()
                .map(JoinCommand::lobby)
                .ok_or(CoplayError::invalid_state("lobby not created yet")),
            AdmissionMode::Passcode => {
                let identity = self
                    .transport
                    .local_identity()
                    .ok_or(CoplayError::RelayUnavailable)?;
                let password = match self.manager.join_filter() {
                    JoinFilter::Controlled => self.manager.passcode().map(Passcode::as_str),
                    _ => None,
                };
                Ok(JoinCommand::peer(identity, password))
            }
        }
    }

    /// Pick a new passcode. Admitted peers stay connected.
    ///
    /// # Errors
    /// Returns `CoplayError::NotHosting` unless hosting and
    /// `CoplayError::InvalidState` in lobby mode.
    pub fn rerandomize_passcode(&mut self) -> Result<()> {
        if self.manager.role() != Role::Host {
            return Err(CoplayError::NotHosting);
        }
        if self.manager.admission() == AdmissionMode::Lobby {
            return Err(CoplayError::invalid_state("lobby hosting has no passcode"));
        }
        self.manager.rerandomize_passcode();
        Ok(())
    }

    /// Change who may connect.
    pub fn set_join_filter(&mut self, filter: JoinFilter) {
        self.manager.set_join_filter(filter);
        self.last_presence = None;
    }

    /// Ask the directory for lobbies; the answer arrives as
    /// [`DirectoryEvent::LobbyList`].
    ///
    /// # Errors
    /// Returns `CoplayError::NoDirectory` without a directory.
    pub fn request_lobby_list(&self) -> Result<()> {
        let directory = self.directory.as_ref().ok_or(CoplayError::NoDirectory)?;
        directory.request_lobby_list();
        Ok(())
    }

    /// The local session started: open hosting if configured to.
    ///
    /// # Errors
    /// As [`RoleCoordinator::start_hosting`] when auto-open applies.
    pub fn on_session_started(&mut self) -> Result<()> {
        let auto = self.manager.role() == Role::Inactive
            && self.config.auto_open
            && self.manager.join_filter().is_open()
            && self.session.is_loopback();
        if auto {
            info!("local server started, opening to peers");
            self.start_hosting()?;
        }
        self.last_presence = None;
        Ok(())
    }

    /// The local session stopped: drop whatever role is held.
    pub fn on_session_stopped(&mut self) {
        if matches!(self.manager.role(), Role::Host | Role::Client) {
            info!(role = %self.manager.role(), "local session stopped");
            self.go_inactive();
        }
        self.last_presence = None;
    }

    /// React to a directory notification.
    ///
    /// # Errors
    /// Propagates failures of the connect a lobby entry or presence join
    /// triggers, and rejects malformed presence strings.
    pub fn handle_directory_event(&mut self, event: DirectoryEvent) -> Result<()> {
        let Some(directory) = self.directory.clone() else {
            return Err(CoplayError::NoDirectory);
        };
        match event {
            DirectoryEvent::LobbyCreated { lobby } => {
                let wanted = self.manager.role() == Role::Host
                    && self.manager.admission() == AdmissionMode::Lobby
                    && self.manager.lobby().is_none();
                if wanted {
                    info!(lobby = %lobby, "lobby created");
                    self.manager.set_lobby(Some(lobby));
                    self.last_presence = None;
                } else {
                    debug!(lobby = %lobby, "leaving unexpected lobby");
                    directory.leave_lobby(lobby);
                }
                Ok(())
            }
            DirectoryEvent::LobbyEntered { lobby, success } => {
                if !success {
                    warn!(lobby = %lobby, "could not enter lobby");
                    return Ok(());
                }
                if self.manager.lobby() == Some(lobby) {
                    return Ok(());
                }
                let Some(owner) = directory.lobby_owner(lobby) else {
                    directory.leave_lobby(lobby);
                    return Err(CoplayError::invalid_state("lobby has no owner"));
                };
                if self.transport.local_identity() == Some(owner) {
                    return Ok(());
                }
                info!(lobby = %lobby, owner = %owner, "entered lobby, connecting to owner");
                self.connect_peer(owner, None)?;
                self.manager.set_lobby(Some(lobby));
                Ok(())
            }
            DirectoryEvent::JoinRequested { lobby } => {
                self.connect_to_peer(JoinTarget::Lobby(lobby), None)
            }
            DirectoryEvent::PresenceJoinRequested { connect } => {
                let command = JoinCommand::from_presence(&connect)?;
                self.connect_to_peer(command.target, command.password)
            }
            DirectoryEvent::LobbyList(list) => {
                debug!(count = list.len(), "lobby list received");
                self.lobby_list = list;
                Ok(())
            }
        }
    }

    /// Run one main tick now.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Run one main tick at `now`.
    pub fn tick_at(&mut self, now: Instant) {
        if self.manager.role() == Role::Unavailable && self.transport.availability().is_available()
        {
            self.manager.mark_available();
            if let Some(command) = self.queued.take() {
                info!(target = %command.target, "running queued connect");
                if let Err(e) = self.connect_to_peer(command.target, command.password) {
                    warn!(error = %e, transient = e.is_transient(), "queued connect failed");
                    self.last_error = Some(e);
                }
            }
        }

        let mut lost = false;
        while let Ok(event) = self.events.try_recv() {
            if self.manager.handle_event(event, now) == EventOutcome::RoleLost {
                lost = true;
            }
        }
        if let Some(refusal) = self.manager.take_refusal() {
            info!(error = %refusal, "host refused the connection");
            self.last_error = Some(refusal);
        }
        if self.manager.tick(now) == EventOutcome::RoleLost {
            lost = true;
        }
        if lost && matches!(self.manager.role(), Role::Host | Role::Client) {
            info!(role = %self.manager.role(), "role lost");
            self.go_inactive();
        }

        let due = self.last_presence.is_none_or(|last| {
            now.saturating_duration_since(last) >= self.config.presence_interval()
        });
        if due {
            self.publish_presence();
            self.last_presence = Some(now);
        }
    }

    fn publish_presence(&self) {
        let Some(directory) = &self.directory else {
            return;
        };
        let role = self.manager.role();
        let filter = self.manager.join_filter();

        let (connect, players) = match role {
            Role::Host if filter.is_open() && filter != JoinFilter::Controlled => {
                match self.join_command() {
                    Ok(command) => (
                        format!("+{command}"),
                        (self.manager.active_connection_count() + 1).to_string(),
                    ),
                    Err(_) => (String::new(), String::new()),
                }
            }
            Role::Inactive if self.session.is_active() && !self.session.is_loopback() => {
                match self.session.server_addr() {
                    Some(addr) => (format!("+{PLAIN_CONNECT_COMMAND} {addr}"), String::new()),
                    None => (String::new(), String::new()),
                }
            }
            _ => (String::new(), String::new()),
        };
        directory.set_presence(PRESENCE_CONNECT, &connect);
        directory.set_presence(PRESENCE_PLAYER_COUNT, &players);

        if role == Role::Host && self.manager.admission() == AdmissionMode::Lobby {
            if let Some(lobby) = self.manager.lobby() {
                directory.set_lobby_data(lobby, LOBBY_HOSTNAME, &self.session.host_name());
                directory.set_lobby_data(lobby, LOBBY_MAP, &self.session.map_name());
                directory.set_lobby_member_limit(lobby, self.session.max_players().max(2));
            }
        }
    }

    /// Release every role resource and clear presence.
    pub fn shutdown(&mut self) {
        self.queued = None;
        self.manager.teardown();
        if let Some(directory) = &self.directory {
            directory.set_presence(PRESENCE_CONNECT, "");
            directory.set_presence(PRESENCE_PLAYER_COUNT, "");
        }
        info!("coordinator shut down");
    }

    fn go_inactive(&mut self) {
        self.manager.teardown();
        self.last_presence = None;
    }
}

impl std::fmt::Debug for RoleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleCoordinator")
            .field("manager", &self.manager)
            .field("queued", &self.queued)
            .finish_non_exhaustive()
    }
}
