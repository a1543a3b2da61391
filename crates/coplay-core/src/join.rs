//! Join command strings.
//!
//! Hosts hand out `coplay_connect <identity> [passcode]` (or
//! `coplay_connect lobby:<id>` in lobby mode). The same parser accepts plain
//! `host:port` server addresses, which bypass the relay entirely, and validates
//! rich-presence join strings received from friends before acting on them.

use crate::directory::LobbyId;
use crate::error::{CoplayError, Result};
use coplay_transport::PeerIdentity;
use std::fmt;

/// Command word of a relayed join
pub const CONNECT_COMMAND: &str = "coplay_connect";

/// Command word of an ordinary server join
pub const PLAIN_CONNECT_COMMAND: &str = "connect";

const LOBBY_PREFIX: &str = "lobby:";

/// Characters never accepted in a rich-presence join string.
const FORBIDDEN: &[char] = &['\'', '"', '\\', '/', ';'];

/// Where a join command points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    /// A host reachable through the relay
    Peer(PeerIdentity),
    /// A directory lobby whose owner is the host
    Lobby(LobbyId),
    /// An ordinary server address, connected to directly
    Address(String),
}

impl fmt::Display for JoinTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(id) => write!(f, "{id}"),
            Self::Lobby(lobby) => write!(f, "{LOBBY_PREFIX}{lobby}"),
            Self::Address(addr) => f.write_str(addr),
        }
    }
}

/// A parsed join command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCommand {
    /// Destination
    pub target: JoinTarget,
    /// Passcode to submit when the host asks for one
    pub password: Option<String>,
}

impl JoinCommand {
    /// Command for a relayed peer.
    #[must_use]
    pub fn peer(id: PeerIdentity, password: Option<&str>) -> Self {
        Self {
            target: JoinTarget::Peer(id),
            password: password.map(str::to_owned),
        }
    }

    /// Command for a lobby.
    #[must_use]
    pub fn lobby(lobby: LobbyId) -> Self {
        Self {
            target: JoinTarget::Lobby(lobby),
            password: None,
        }
    }

    /// Parse a command, with or without its command word.
    ///
    /// # Examples
    /// ```
    /// use coplay_core::join::{JoinCommand, JoinTarget};
    ///
    /// let cmd = JoinCommand::parse("coplay_connect 76561198000000001 s3cret").unwrap();
    /// assert!(matches!(cmd.target, JoinTarget::Peer(_)));
    /// assert_eq!(cmd.password.as_deref(), Some("s3cret"));
    ///
    /// let cmd = JoinCommand::parse("192.0.2.4:27015").unwrap();
    /// assert_eq!(cmd.target, JoinTarget::Address("192.0.2.4:27015".into()));
    /// ```
    ///
    /// # Errors
    /// Returns `CoplayError::InvalidJoinCommand` for empty input, extra
    /// arguments, a target that is neither an identity, a lobby nor an address,
    /// or a passcode given for anything but a relayed peer.
    pub fn parse(input: &str) -> Result<Self> {
        let mut words = input.split_whitespace().peekable();
        if let Some(first) = words.peek() {
            if *first == CONNECT_COMMAND || *first == PLAIN_CONNECT_COMMAND {
                words.next();
            }
        }

        let target = words
            .next()
            .ok_or(CoplayError::invalid_join("no connect target given"))?;
        let password = words.next().map(str::to_owned);
        if words.next().is_some() {
            return Err(CoplayError::invalid_join("too many arguments"));
        }

        let target = parse_target(target)?;
        if password.is_some() && !matches!(target, JoinTarget::Peer(_)) {
            return Err(CoplayError::invalid_join(
                "a passcode only applies to a relayed host",
            ));
        }
        Ok(Self { target, password })
    }

    /// Validate and parse a rich-presence join string.
    ///
    /// Only `+coplay_connect …` and `+connect …` are accepted, and quoting,
    /// command separators and path characters are refused outright.
    ///
    /// # Errors
    /// Returns `CoplayError::InvalidJoinCommand` for anything else.
    pub fn from_presence(connect: &str) -> Result<Self> {
        let Some(command) = connect.strip_prefix('+') else {
            return Err(CoplayError::invalid_join("presence string must start with '+'"));
        };
        let word = command.split_whitespace().next().unwrap_or_default();
        if word != CONNECT_COMMAND && word != PLAIN_CONNECT_COMMAND {
            return Err(CoplayError::InvalidJoinCommand(
                format!("unexpected presence command {word:?}").into(),
            ));
        }
        if command.contains(FORBIDDEN) {
            return Err(CoplayError::invalid_join(
                "presence string contains forbidden characters",
            ));
        }
        Self::parse(command)
    }
}

impl fmt::Display for JoinCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            JoinTarget::Address(addr) => write!(f, "{PLAIN_CONNECT_COMMAND} {addr}")?,
            target => write!(f, "{CONNECT_COMMAND} {target}")?,
        }
        if let Some(password) = &self.password {
            write!(f, " {password}")?;
        }
        Ok(())
    }
}

fn parse_target(word: &str) -> Result<JoinTarget> {
    if let Some(raw) = word.strip_prefix(LOBBY_PREFIX) {
        let lobby = raw
            .parse::<LobbyId>()
            .map_err(|_| CoplayError::InvalidJoinCommand(format!("bad lobby id {raw:?}").into()))?;
        return Ok(JoinTarget::Lobby(lobby));
    }
    if word.contains(['.', ':']) || word.eq_ignore_ascii_case("localhost") {
        return Ok(JoinTarget::Address(word.to_owned()));
    }
    word.parse::<PeerIdentity>()
        .map(JoinTarget::Peer)
        .map_err(|_| CoplayError::InvalidJoinCommand(format!("bad connect target {word:?}").into()))
}
