//! Connections waiting for their passcode.
//!
//! Under the `Controlled` filter an inbound connection is accepted at the
//! transport level and parked here. Each sweep either expires it, rejects it,
//! or hands it back for promotion. A connection gets exactly one attempt.

use crate::passcode::Passcode;
use coplay_transport::{ConnectionHandle, EndReason, PeerIdentity, RelayTransport};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One connection awaiting its passcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConnection {
    /// Transport handle, owned by the registry until resolved
    pub handle: ConnectionHandle,
    /// Peer the connection was admitted for
    pub remote: PeerIdentity,
    /// When the connection was parked
    pub created_at: Instant,
}

impl PendingConnection {
    /// Park `handle` for `remote` at `created_at`.
    #[must_use]
    pub fn new(handle: ConnectionHandle, remote: PeerIdentity, created_at: Instant) -> Self {
        Self {
            handle,
            remote,
            created_at,
        }
    }

    /// Whether the handshake window has closed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= timeout
    }
}

/// Result of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Connections that submitted the right passcode
    pub admitted: Vec<PendingConnection>,
    /// Connections closed for a wrong passcode
    pub rejected: usize,
    /// Connections closed for taking too long
    pub expired: usize,
}

/// The set of pending connections.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    entries: Vec<PendingConnection>,
}

impl PendingRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a connection, replacing any entry for the same handle.
    pub fn insert(&mut self, entry: PendingConnection) {
        self.entries.retain(|e| e.handle != entry.handle);
        self.entries.push(entry);
    }

    /// Remove the entry for `handle`.
    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<PendingConnection> {
        let index = self.entries.iter().position(|e| e.handle == handle)?;
        Some(self.entries.remove(index))
    }

    /// Whether `handle` is pending.
    #[must_use]
    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.entries.iter().any(|e| e.handle == handle)
    }

    /// Number of pending connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<PendingConnection> {
        std::mem::take(&mut self.entries)
    }

    /// Resolve what can be resolved at `now`.
    ///
    /// Expired entries are closed with `Timeout`. Entries with a message are
    /// admitted if it equals `passcode` exactly and closed with `BadPassword`
    /// otherwise. Admitted entries are returned still open; the caller owns
    /// their handles from then on.
    pub fn sweep(
        &mut self,
        now: Instant,
        timeout: Duration,
        transport: &dyn RelayTransport,
        passcode: Option<&Passcode>,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        for entry in std::mem::take(&mut self.entries) {
            if entry.is_expired(now, timeout) {
                debug!(
                    handle = %entry.handle,
                    peer = %entry.remote,
                    "pending connection timed out"
                );
                close(transport, entry.handle, EndReason::Timeout, "pendingtimeout");
                report.expired += 1;
                continue;
            }

            let submitted = match transport.receive(entry.handle, 1) {
                Ok(mut messages) => messages.pop(),
                Err(e) => {
                    debug!(handle = %entry.handle, error = %e, "pending connection vanished");
                    continue;
                }
            };
            let Some(submitted) = submitted else {
                self.entries.push(entry);
                continue;
            };

            if passcode.is_some_and(|p| p.matches(&submitted)) {
                info!(handle = %entry.handle, peer = %entry.remote, "passcode accepted");
                report.admitted.push(entry);
            } else {
                debug!(handle = %entry.handle, peer = %entry.remote, "wrong passcode");
                close(transport, entry.handle, EndReason::BadPassword, "badpassword");
                report.rejected += 1;
            }
        }

        report
    }
}

fn close(transport: &dyn RelayTransport, handle: ConnectionHandle, reason: EndReason, debug: &str) {
    if let Err(e) = transport.close(handle, reason, debug, false) {
        debug!(handle = %handle, error = %e, "close failed");
    }
}
