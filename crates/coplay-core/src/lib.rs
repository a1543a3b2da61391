//! # Coplay Core
//!
//! Connection lifecycle engine for relayed game sessions.
//!
//! This crate provides:
//! - Admission control and the passcode handshake
//! - Per-peer forwarders that copy datagrams between a local UDP socket and a
//!   relayed connection, each on its own thread
//! - The pending registry and lifecycle manager that drive connections from
//!   transport events to teardown
//! - The role coordinator, the single entry point a game integration talks to
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       RoleCoordinator                           │
//! │   (Unavailable / Inactive / Host / Client, presence, lobbies)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  ConnectionLifecycleManager                     │
//! │   (admission, pending passcodes, promotion, teardown)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     RelayedConnection                           │
//! │   (one forwarder thread per peer: local UDP <-> relay)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod forwarder;
pub mod handshake;
pub mod join;
pub mod lifecycle;
pub mod passcode;
pub mod pending;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

pub use admission::{Admission, AdmissionMode, FriendLookup, JoinFilter};
pub use config::CoplayConfig;
pub use coordinator::{RoleCoordinator, Status};
pub use directory::{Directory, DirectoryEvent, LobbyId, LobbySummary, LobbyVisibility};
pub use error::{CoplayError, Result};
pub use forwarder::{ForwarderContext, ForwarderSettings, ForwarderStats, RelayedConnection};
pub use join::{JoinCommand, JoinTarget};
pub use lifecycle::{ConnectionLifecycleManager, EventOutcome};
pub use passcode::Passcode;
pub use pending::{PendingConnection, PendingRegistry};
pub use session::{LocalSession, StaticSession};

/// What this process is currently doing on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// The relay network is not reachable yet
    #[default]
    Unavailable,
    /// Reachable, neither hosting nor joined
    Inactive,
    /// Accepting peers into the local server
    Host,
    /// Connected to a remote host
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unavailable => "unavailable",
            Self::Inactive => "inactive",
            Self::Host => "host",
            Self::Client => "client",
        };
        f.write_str(name)
    }
}
