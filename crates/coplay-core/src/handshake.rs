//! Host/client handshake carried over a fresh relayed connection.
//!
//! Under the `Controlled` filter the host sends [`NEED_PASSWORD`] to a pending
//! connection, the client answers with the raw passcode, and the host confirms
//! admission with [`OK`]. Under every other filter the host sends [`OK`] right
//! away. A client forwards no game traffic before it has seen [`OK`].

use crate::passcode::Passcode;

/// Host asks a pending client for the passcode
pub const NEED_PASSWORD: &[u8] = b"NeedPass";

/// Host confirms the client was admitted
pub const OK: &[u8] = b"OK";

/// Control message recognised by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Password request
    NeedPassword,
    /// Admission confirmed
    Ok,
}

impl HandshakeMessage {
    /// Recognise a control message, tolerating one trailing NUL.
    #[must_use]
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let trimmed = payload.strip_suffix(&[0]).unwrap_or(payload);
        if trimmed == NEED_PASSWORD {
            Some(Self::NeedPassword)
        } else if trimmed == OK {
            Some(Self::Ok)
        } else {
            None
        }
    }

    /// Wire encoding.
    #[must_use]
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::NeedPassword => NEED_PASSWORD,
            Self::Ok => OK,
        }
    }
}

/// What the forwarder should do with a message received before `OK`.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send these bytes back reliably
    Reply(Vec<u8>),
    /// Handshake finished; start forwarding
    Ready,
    /// Not a handshake message; drop it
    Ignored,
}

/// Client side of the handshake.
#[derive(Debug)]
pub enum ClientHandshake {
    /// Waiting for the host's `OK`
    AwaitingOk {
        /// Secret to answer a password request with
        password: Option<Passcode>,
        /// Whether the single password reply has been sent
        answered: bool,
    },
    /// Admitted; traffic flows
    Ready,
}

impl ClientHandshake {
    /// A client that has not been admitted yet.
    #[must_use]
    pub fn awaiting(password: Option<Passcode>) -> Self {
        Self::AwaitingOk {
            password,
            answered: false,
        }
    }

    /// Whether game traffic may be forwarded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Feed one message received from the host.
    pub fn on_message(&mut self, payload: &[u8]) -> HandshakeStep {
        let Self::AwaitingOk { password, answered } = self else {
            return HandshakeStep::Ignored;
        };
        match HandshakeMessage::parse(payload) {
            Some(HandshakeMessage::Ok) => {
                *self = Self::Ready;
                HandshakeStep::Ready
            }
            Some(HandshakeMessage::NeedPassword) if !*answered => {
                *answered = true;
                let reply = password
                    .as_ref()
                    .map(|p| p.as_bytes().to_vec())
                    .unwrap_or_default();
                HandshakeStep::Reply(reply)
            }
            _ => HandshakeStep::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens() {
        assert_eq!(
            HandshakeMessage::parse(b"NeedPass"),
            Some(HandshakeMessage::NeedPassword)
        );
        assert_eq!(
            HandshakeMessage::parse(b"NeedPass\0"),
            Some(HandshakeMessage::NeedPassword)
        );
        assert_eq!(HandshakeMessage::parse(b"OK\0"), Some(HandshakeMessage::Ok));
        assert_eq!(HandshakeMessage::parse(b"ok"), None);
        assert_eq!(HandshakeMessage::parse(b""), None);
    }

    #[test]
    fn test_password_flow() {
        let mut hs = ClientHandshake::awaiting(Some(Passcode::new("abc")));
        assert!(!hs.is_ready());

        assert_eq!(
            hs.on_message(NEED_PASSWORD),
            HandshakeStep::Reply(b"abc".to_vec())
        );
        // Only one attempt is ever made.
        assert_eq!(hs.on_message(NEED_PASSWORD), HandshakeStep::Ignored);

        assert_eq!(hs.on_message(OK), HandshakeStep::Ready);
        assert!(hs.is_ready());
        assert_eq!(hs.on_message(OK), HandshakeStep::Ignored);
    }

    #[test]
    fn test_no_password_sends_empty_reply() {
        let mut hs = ClientHandshake::awaiting(None);
        assert_eq!(hs.on_message(NEED_PASSWORD), HandshakeStep::Reply(Vec::new()));
    }

    #[test]
    fn test_game_traffic_before_ok_is_ignored() {
        let mut hs = ClientHandshake::awaiting(None);
        assert_eq!(hs.on_message(b"\xff\xff\xff\xffTSource"), HandshakeStep::Ignored);
        assert!(!hs.is_ready());
    }
}
