//! Error types for the lifecycle engine
//!
//! Errors are categorized to let callers decide between retrying later and
//! reporting a problem to the user.
//!
//! # Error Categories
//!
//! - **Transient**: the relay or a local resource is temporarily unavailable
//! - **Admission**: a peer was turned away by policy; expected in normal operation
//! - **Permanent**: configuration or state errors that need intervention
//!
//! # Example
//!
//! ```no_run
//! use coplay_core::CoplayError;
//!
//! fn report(err: &CoplayError) {
//!     if err.is_admission() {
//!         println!("Host refused: {}", err);
//!     } else if err.is_transient() {
//!         println!("Try again shortly: {}", err);
//!     } else {
//!         println!("Cannot continue: {}", err);
//!     }
//! }
//! ```

use coplay_transport::{EndReason, TransportError};
use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by the coordinator, lifecycle manager and forwarders
#[derive(Debug, Error)]
pub enum CoplayError {
    // ============ Transport Errors ============
    /// Relay transport or local socket failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The relay network is not reachable yet
    #[error("Relay network unavailable")]
    RelayUnavailable,

    // ============ Admission Errors ============
    /// The host refused this client
    #[error("Admission rejected: {0}")]
    Rejected(EndReason),

    // ============ Session Errors ============
    /// Hosting needs an active, loopback-bound local session
    #[error("No suitable local session: {0}")]
    NoLocalSession(Cow<'static, str>),

    /// The operation needs the Host role
    #[error("Not hosting")]
    NotHosting,

    /// Lobby features need a directory service
    #[error("No directory service configured")]
    NoDirectory,

    /// A join command or rich-presence string could not be used
    #[error("Invalid join command: {0}")]
    InvalidJoinCommand(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// A forwarder thread could not be started
    #[error("Thread spawn failed: {0}")]
    Thread(Cow<'static, str>),
}

impl CoplayError {
    /// Returns true if the same request may succeed later without changes
    ///
    /// Transient errors include:
    /// - The relay network not being reachable yet
    /// - Port exhaustion
    /// - Thread spawn failures under resource pressure
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoplayError::RelayUnavailable
                | CoplayError::Thread(_)
                | CoplayError::Transport(
                    TransportError::RelayUnavailable | TransportError::NoPortAvailable { .. }
                )
        )
    }

    /// Returns true if a host turned this client away by policy
    #[must_use]
    pub fn is_admission(&self) -> bool {
        matches!(self, CoplayError::Rejected(_))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        CoplayError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        CoplayError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a join-command error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_join(context: &'static str) -> Self {
        CoplayError::InvalidJoinCommand(Cow::Borrowed(context))
    }
}

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, CoplayError>;
