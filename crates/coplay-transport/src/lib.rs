//! # Coplay Transport
//!
//! Transport layer for Coplay.
//!
//! This crate provides:
//! - The relay transport abstraction (`RelayTransport`) and its vocabulary:
//!   peer identities, connection handles, states, end reasons and status events
//! - Non-blocking local UDP sockets for the game-facing side of a tunnel
//! - Deterministic port allocation within a configured range
//! - An in-process relay network used for loopback runs and tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod port;
pub mod relay;
pub mod udp;

pub use memory::{MemoryRelay, MemoryTransport};
pub use port::{PortAllocator, PortRange};
pub use relay::{
    ConnectionHandle, ConnectionInfo, ConnectionState, EndReason, ListenHandle, MessageId,
    PeerIdentity, RelayAvailability, RelayTransport, SendMode, TransportError, TransportEvent,
    TransportResult,
};
pub use udp::LocalSocket;
