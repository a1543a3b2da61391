//! Lobby directory and rich presence.
//!
//! Directory requests are fire-and-forget; their results come back as
//! [`DirectoryEvent`]s that the caller feeds to the coordinator on its tick.

use coplay_transport::PeerIdentity;
use std::fmt;
use std::str::FromStr;

/// Identifier of a directory lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LobbyId(u64);

impl LobbyId {
    /// Wrap a raw lobby id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw lobby id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LobbyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LobbyId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Who can see and join a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LobbyVisibility {
    /// Invite only
    Private,
    /// Friends of members
    FriendsOnly,
    /// Listed publicly
    Public,
}

/// One entry of a lobby list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbySummary {
    /// The lobby
    pub lobby: LobbyId,
    /// `hostname` lobby data
    pub host_name: String,
    /// `map` lobby data
    pub map: String,
    /// Current member count
    pub members: u32,
    /// Member limit
    pub max_members: u32,
}

/// Result notifications from the directory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// A lobby we asked for was created
    LobbyCreated {
        /// The new lobby
        lobby: LobbyId,
    },
    /// We entered a lobby (or failed to)
    LobbyEntered {
        /// The lobby
        lobby: LobbyId,
        /// Whether the join succeeded
        success: bool,
    },
    /// The user accepted an invite to a lobby
    JoinRequested {
        /// The lobby to join
        lobby: LobbyId,
    },
    /// The user accepted a rich-presence join
    PresenceJoinRequested {
        /// The `connect` presence value of the friend
        connect: String,
    },
    /// Answer to a lobby list request
    LobbyList(Vec<LobbySummary>),
}

/// Lobby matchmaking and rich presence service.
pub trait Directory: Send + Sync {
    /// Request a new lobby; answered by [`DirectoryEvent::LobbyCreated`].
    fn create_lobby(&self, visibility: LobbyVisibility, max_members: u32);

    /// Request to join; answered by [`DirectoryEvent::LobbyEntered`].
    fn join_lobby(&self, lobby: LobbyId);

    /// Leave a lobby.
    fn leave_lobby(&self, lobby: LobbyId);

    /// Owner of a lobby we are in.
    fn lobby_owner(&self, lobby: LobbyId) -> Option<PeerIdentity>;

    /// Whether `peer` is a member of `lobby`.
    fn is_member(&self, lobby: LobbyId, peer: PeerIdentity) -> bool;

    /// Set a lobby data key.
    fn set_lobby_data(&self, lobby: LobbyId, key: &str, value: &str);

    /// Change lobby visibility.
    fn set_lobby_visibility(&self, lobby: LobbyId, visibility: LobbyVisibility);

    /// Change lobby member limit.
    fn set_lobby_member_limit(&self, lobby: LobbyId, max_members: u32);

    /// Request the lobby list; answered by [`DirectoryEvent::LobbyList`].
    fn request_lobby_list(&self);

    /// Publish a rich-presence key; an empty value clears it.
    fn set_presence(&self, key: &str, value: &str);
}
