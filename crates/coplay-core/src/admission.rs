//! Admission control for inbound relayed connections.
//!
//! Deciding whether a peer may connect is a pure function of the join filter,
//! the peer identity and a friend lookup. The lifecycle manager acts on the
//! returned [`Admission`]; nothing here touches the transport.

use crate::directory::{LobbyId, LobbyVisibility};
use crate::error::{CoplayError, Result};
use coplay_transport::{EndReason, PeerIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who may connect while hosting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinFilter {
    /// Nobody; every inbound connection is refused
    #[default]
    Off,
    /// Anyone holding the current passcode
    Controlled,
    /// Established friends of the host
    FriendsOnly,
    /// Anyone
    Everyone,
}

impl JoinFilter {
    /// Lobby visibility matching this filter.
    #[must_use]
    pub const fn lobby_visibility(self) -> LobbyVisibility {
        match self {
            Self::Off | Self::Controlled => LobbyVisibility::Private,
            Self::FriendsOnly => LobbyVisibility::FriendsOnly,
            Self::Everyone => LobbyVisibility::Public,
        }
    }

    /// Whether the filter lets anybody in at all.
    #[must_use]
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl fmt::Display for JoinFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Controlled => "controlled",
            Self::FriendsOnly => "friends-only",
            Self::Everyone => "everyone",
        };
        f.write_str(name)
    }
}

impl FromStr for JoinFilter {
    type Err = CoplayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "-1" => Ok(Self::Off),
            "controlled" | "password" | "0" => Ok(Self::Controlled),
            "friends-only" | "friends" | "1" => Ok(Self::FriendsOnly),
            "everyone" | "anyone" | "2" => Ok(Self::Everyone),
            other => Err(CoplayError::InvalidConfig(
                format!("unknown join filter {other:?}").into(),
            )),
        }
    }
}

/// How the host admits peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionMode {
    /// Join filter plus a random passcode for the `Controlled` filter
    #[default]
    Passcode,
    /// Membership of a directory lobby; the lobby enforces the filter
    Lobby,
}

/// Outcome of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Accept and promote once connected
    Accept,
    /// Refuse with the given close reason
    Reject(EndReason),
    /// Accept at the transport level and wait for the passcode
    RequirePassword,
}

/// Answers whether a peer is an established friend of the local user.
pub trait FriendLookup: Send + Sync {
    /// Whether `peer` is a friend.
    fn is_friend(&self, peer: PeerIdentity) -> bool;
}

impl<F> FriendLookup for F
where
    F: Fn(PeerIdentity) -> bool + Send + Sync,
{
    fn is_friend(&self, peer: PeerIdentity) -> bool {
        self(peer)
    }
}

/// Decide whether `peer` may connect under `filter`.
///
/// # Examples
/// ```
/// use coplay_core::admission::{Admission, JoinFilter, decide};
/// use coplay_transport::{EndReason, PeerIdentity};
///
/// let friends = |peer: PeerIdentity| peer.as_u64() == 7;
/// assert_eq!(decide(JoinFilter::FriendsOnly, PeerIdentity::new(7), &friends), Admission::Accept);
/// assert_eq!(
///     decide(JoinFilter::FriendsOnly, PeerIdentity::new(8), &friends),
///     Admission::Reject(EndReason::NotFriend)
/// );
/// ```
pub fn decide(filter: JoinFilter, peer: PeerIdentity, friends: &dyn FriendLookup) -> Admission {
    match filter {
        JoinFilter::Off => Admission::Reject(EndReason::NotOpen),
        JoinFilter::Everyone => Admission::Accept,
        JoinFilter::FriendsOnly => {
            if friends.is_friend(peer) {
                Admission::Accept
            } else {
                Admission::Reject(EndReason::NotFriend)
            }
        }
        JoinFilter::Controlled => Admission::RequirePassword,
    }
}

/// Decide admission in lobby mode: only members of the host's lobby get in.
pub fn decide_in_lobby(lobby: Option<LobbyId>, is_member: bool) -> Admission {
    match lobby {
        Some(_) if is_member => Admission::Accept,
        _ => Admission::Reject(EndReason::NotOpen),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nobody(_: PeerIdentity) -> bool {
        false
    }

    #[test]
    fn test_off_rejects_everyone() {
        let everybody = |_: PeerIdentity| true;
        assert_eq!(
            decide(JoinFilter::Off, PeerIdentity::new(1), &everybody),
            Admission::Reject(EndReason::NotOpen)
        );
    }

    #[test]
    fn test_everyone_accepts() {
        assert_eq!(
            decide(JoinFilter::Everyone, PeerIdentity::new(42), &nobody),
            Admission::Accept
        );
    }

    #[test]
    fn test_friends_only() {
        let friends = |peer: PeerIdentity| peer == PeerIdentity::new(5);
        assert_eq!(
            decide(JoinFilter::FriendsOnly, PeerIdentity::new(5), &friends),
            Admission::Accept
        );
        assert_eq!(
            decide(JoinFilter::FriendsOnly, PeerIdentity::new(6), &friends),
            Admission::Reject(EndReason::NotFriend)
        );
    }

    #[test]
    fn test_controlled_requires_password() {
        assert_eq!(
            decide(JoinFilter::Controlled, PeerIdentity::new(9), &nobody),
            Admission::RequirePassword
        );
    }

    #[test]
    fn test_lobby_admission() {
        let lobby = Some(LobbyId::new(77));
        assert_eq!(decide_in_lobby(lobby, true), Admission::Accept);
        assert_eq!(
            decide_in_lobby(lobby, false),
            Admission::Reject(EndReason::NotOpen)
        );
        assert_eq!(
            decide_in_lobby(None, true),
            Admission::Reject(EndReason::NotOpen)
        );
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!("everyone".parse::<JoinFilter>().unwrap(), JoinFilter::Everyone);
        assert_eq!("Friends".parse::<JoinFilter>().unwrap(), JoinFilter::FriendsOnly);
        assert_eq!("0".parse::<JoinFilter>().unwrap(), JoinFilter::Controlled);
        assert_eq!("-1".parse::<JoinFilter>().unwrap(), JoinFilter::Off);
        assert!("sometimes".parse::<JoinFilter>().is_err());

        for filter in [
            JoinFilter::Off,
            JoinFilter::Controlled,
            JoinFilter::FriendsOnly,
            JoinFilter::Everyone,
        ] {
            assert_eq!(filter.to_string().parse::<JoinFilter>().unwrap(), filter);
        }
    }

    #[test]
    fn test_lobby_visibility() {
        assert_eq!(JoinFilter::Everyone.lobby_visibility(), LobbyVisibility::Public);
        assert_eq!(
            JoinFilter::FriendsOnly.lobby_visibility(),
            LobbyVisibility::FriendsOnly
        );
        assert_eq!(JoinFilter::Controlled.lobby_visibility(), LobbyVisibility::Private);
        assert_eq!(JoinFilter::Off.lobby_visibility(), LobbyVisibility::Private);
    }
}
