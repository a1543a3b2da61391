//! Relay transport abstraction.
//!
//! This module defines the `RelayTransport` trait that abstracts over a
//! NAT-traversing, message-oriented relay network (a Steam-style networking
//! sockets API). Connections are addressed by opaque handles and report their
//! lifecycle through `TransportEvent`s delivered on a channel, so callers drain
//! them on their own tick instead of receiving re-entrant callbacks.

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Every port in the configured range is taken
    #[error("No free UDP port in range {start}-{end}")]
    NoPortAvailable {
        /// First port of the scanned range
        start: u16,
        /// Last port of the scanned range (inclusive)
        end: u16,
    },

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The handle does not name a connection owned by this endpoint
    #[error("Invalid connection handle: {0}")]
    InvalidHandle(ConnectionHandle),

    /// The connection exists but is not in the connected state
    #[error("Connection {0} is not connected")]
    NotConnected(ConnectionHandle),

    /// The relay network is not reachable yet
    #[error("Relay network unavailable")]
    RelayUnavailable,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error means the handle can no longer carry traffic.
    #[must_use]
    pub fn is_dead_handle(&self) -> bool {
        matches!(self, Self::InvalidHandle(_) | Self::NotConnected(_))
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Stable identity of a participant on the relay network.
///
/// Zero is reserved and never names a real peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity(u64);

impl PeerIdentity {
    /// Wrap a raw identity value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identity value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this identity can name a real peer.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u64 = s
            .trim()
            .parse()
            .map_err(|_| TransportError::Other(format!("not a peer identity: {s:?}")))?;
        let id = Self(raw);
        if !id.is_valid() {
            return Err(TransportError::Other("peer identity 0 is reserved".into()));
        }
        Ok(id)
    }
}

/// Opaque identifier of one relayed connection, local to the endpoint that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u32);

impl ConnectionHandle {
    /// The handle value no live connection ever receives.
    pub const INVALID: Self = Self(0);

    /// Wrap a raw handle value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether this is not [`ConnectionHandle::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a listen endpoint that accepts inbound relayed connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenHandle(u32);

impl ListenHandle {
    /// Wrap a raw listen handle value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw listen handle value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Transport-assigned number of a sent message.
pub type MessageId = u64;

/// Lifecycle state of a relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection, or the handle was already released
    #[default]
    None,
    /// Handshake in progress; inbound connections wait here for `accept`
    Connecting,
    /// Relay route is being negotiated
    FindingRoute,
    /// Both ends accepted; messages flow
    Connected,
    /// The remote end closed the connection
    ClosedByPeer,
    /// The local end gave up on the connection (timeout, route failure)
    ProblemDetectedLocally,
}

impl ConnectionState {
    /// Whether the connection has ended and only awaits release.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ClosedByPeer | Self::ProblemDetectedLocally)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Connecting => "connecting",
            Self::FindingRoute => "finding-route",
            Self::Connected => "connected",
            Self::ClosedByPeer => "closed-by-peer",
            Self::ProblemDetectedLocally => "problem-detected-locally",
        };
        f.write_str(name)
    }
}

/// Reason code attached when a connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EndReason {
    /// Normal, requested shutdown
    Finished = 1000,
    /// The host is not accepting connections
    NotOpen = 1001,
    /// The host has no room left
    ServerFull = 1002,
    /// Something failed on the closing side
    RemoteIssue = 1003,
    /// Released after the remote end closed
    ClosedByPeer = 1004,
    /// Rejected by the friends-only filter
    NotFriend = 1005,
    /// The submitted passcode did not match
    BadPassword = 1006,
    /// Inactivity or handshake timeout
    Timeout = 5001,
}

impl EndReason {
    /// Numeric reason code carried on the wire.
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Map a wire reason code back to a known reason.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1000 => Self::Finished,
            1001 => Self::NotOpen,
            1002 => Self::ServerFull,
            1003 => Self::RemoteIssue,
            1004 => Self::ClosedByPeer,
            1005 => Self::NotFriend,
            1006 => Self::BadPassword,
            5001 => Self::Timeout,
            _ => return None,
        })
    }

    /// Whether the host turned the connection away rather than losing it.
    #[must_use]
    pub const fn is_refusal(self) -> bool {
        matches!(
            self,
            Self::NotOpen | Self::ServerFull | Self::NotFriend | Self::BadPassword
        )
    }

    /// Short debug string sent alongside the reason code.
    #[must_use]
    pub const fn debug_str(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::NotOpen => "notopen",
            Self::ServerFull => "serverfull",
            Self::RemoteIssue => "remoteissue",
            Self::ClosedByPeer => "closedbypeer",
            Self::NotFriend => "notfriend",
            Self::BadPassword => "badpassword",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.debug_str(), self.code())
    }
}

/// Delivery mode for a relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SendMode {
    /// Unreliable, may be batched with later messages
    Unreliable,
    /// Unreliable and flushed immediately
    #[default]
    UnreliableNoNagle,
    /// Reliable and ordered, may be batched
    Reliable,
    /// Reliable, ordered and flushed immediately
    ReliableNoNagle,
}

impl SendMode {
    /// Whether the transport retransmits the message until acknowledged.
    #[must_use]
    pub const fn is_reliable(self) -> bool {
        matches!(self, Self::Reliable | Self::ReliableNoNagle)
    }
}

/// Reachability of the relay network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RelayAvailability {
    /// Nothing known yet
    #[default]
    Unknown,
    /// Initialisation in progress
    Attempting,
    /// Relays are reachable and connections can be made
    Current,
    /// The relay network could not be reached
    Failed,
}

impl RelayAvailability {
    /// Whether connections can be created right now.
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Current)
    }
}

/// Snapshot of one connection as seen by its owning endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The peer on the other end
    pub remote: PeerIdentity,
    /// Current state
    pub state: ConnectionState,
    /// Why the connection ended, once it has
    pub end_reason: Option<EndReason>,
    /// Free-form debug string sent with the close
    pub end_debug: String,
}

/// Connection status change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportEvent {
    /// The connection whose state changed
    pub handle: ConnectionHandle,
    /// State before the change
    pub old_state: ConnectionState,
    /// State after the change
    pub new_state: ConnectionState,
    /// The peer on the other end
    pub remote: PeerIdentity,
}

/// Relayed, message-oriented transport.
///
/// Every method is non-blocking. Implementations must be shareable across the
/// main tick and forwarder threads; a connection handle is only ever used by
/// one of them at a time.
pub trait RelayTransport: Send + Sync {
    /// Current reachability of the relay network.
    fn availability(&self) -> RelayAvailability;

    /// Identity of this endpoint, once the relay network knows it.
    fn local_identity(&self) -> Option<PeerIdentity>;

    /// Start accepting inbound connections.
    ///
    /// # Errors
    /// Returns `TransportError` if the relay is unavailable.
    fn create_listen_endpoint(&self) -> TransportResult<ListenHandle>;

    /// Stop accepting inbound connections.
    ///
    /// # Errors
    /// Returns `TransportError` if the handle is unknown.
    fn close_listen_endpoint(&self, listen: ListenHandle) -> TransportResult<()>;

    /// Open a connection to `peer`. Progress is reported through events.
    ///
    /// # Errors
    /// Returns `TransportError` if the relay is unavailable or `peer` is invalid.
    fn connect(&self, peer: PeerIdentity) -> TransportResult<ConnectionHandle>;

    /// Accept an inbound connection that is in the `Connecting` state.
    ///
    /// # Errors
    /// Returns `TransportError` if the handle is unknown or not connecting.
    fn accept(&self, handle: ConnectionHandle) -> TransportResult<()>;

    /// Close a connection and release its handle.
    ///
    /// With `linger`, reliable messages already queued are still delivered.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidHandle` if the handle was already released.
    fn close(
        &self,
        handle: ConnectionHandle,
        reason: EndReason,
        debug: &str,
        linger: bool,
    ) -> TransportResult<()>;

    /// Send one message.
    ///
    /// # Errors
    /// Returns `TransportError` if the connection is not connected.
    fn send(
        &self,
        handle: ConnectionHandle,
        payload: &[u8],
        mode: SendMode,
    ) -> TransportResult<MessageId>;

    /// Take up to `max` received messages, oldest first.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidHandle` if the handle is unknown.
    fn receive(&self, handle: ConnectionHandle, max: usize) -> TransportResult<Vec<Vec<u8>>>;

    /// Snapshot of a connection owned by this endpoint.
    fn connection_info(&self, handle: ConnectionHandle) -> Option<ConnectionInfo>;

    /// Subscribe to connection status changes of this endpoint.
    fn subscribe(&self) -> Receiver<TransportEvent>;
}
