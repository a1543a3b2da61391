//! Deterministic local port allocation.

use crate::relay::{TransportError, TransportResult};
use crate::udp::LocalSocket;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Inclusive range of local UDP ports available to tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First candidate port
    pub start: u16,
    /// Last candidate port (inclusive)
    pub end: u16,
}

impl PortRange {
    /// Create a range; `start` must not exceed `end`.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` for an empty range or port 0.
    pub fn new(start: u16, end: u16) -> TransportResult<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// Check the range is non-empty and does not include the wildcard port.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` describing the problem.
    pub fn validate(&self) -> TransportResult<()> {
        if self.start == 0 {
            return Err(TransportError::InvalidConfig(
                "port range must not start at 0".into(),
            ));
        }
        if self.start > self.end {
            return Err(TransportError::InvalidConfig(format!(
                "port range start {} exceeds end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Whether `port` lies in the range.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Number of candidate ports.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    /// Whether the range has no candidates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Candidate ports in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 3600,
            end: 3700,
        }
    }
}

/// Binds local sockets for new tunnels.
///
/// The scan always starts at the bottom of the range and walks upwards, so the
/// port a new tunnel receives depends only on which ports are currently taken.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    bind_ip: IpAddr,
    range: PortRange,
}

impl PortAllocator {
    /// Allocator that binds `bind_ip` on ports from `range`.
    #[must_use]
    pub fn new(bind_ip: IpAddr, range: PortRange) -> Self {
        Self { bind_ip, range }
    }

    /// Allocator on the IPv4 loopback interface.
    #[must_use]
    pub fn loopback(range: PortRange) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), range)
    }

    /// The configured range.
    #[must_use]
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Bind the lowest free port in the range.
    ///
    /// # Errors
    /// Returns `TransportError::NoPortAvailable` once every candidate failed,
    /// or `TransportError::InvalidConfig` for a malformed range.
    pub fn acquire(&self) -> TransportResult<LocalSocket> {
        self.range.validate()?;

        for port in self.range.iter() {
            let addr = SocketAddr::new(self.bind_ip, port);
            match LocalSocket::bind(addr) {
                Ok(socket) => {
                    tracing::debug!(port, "bound local tunnel socket");
                    return Ok(socket);
                }
                Err(e) => {
                    tracing::trace!(port, error = %e, "port unavailable");
                }
            }
        }

        tracing::warn!(
            start = self.range.start,
            end = self.range.end,
            "no free port for tunnel"
        );
        Err(TransportError::NoPortAvailable {
            start: self.range.start,
            end: self.range.end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    /// Find `len` consecutive ports that are free right now and hold them.
    fn hold_block(len: u16) -> (u16, Vec<UdpSocket>) {
        'base: for base in (42000..60000).step_by(usize::from(len) + 7) {
            let mut held = Vec::new();
            for offset in 0..len {
                match UdpSocket::bind(("127.0.0.1", base + offset)) {
                    Ok(s) => held.push(s),
                    Err(_) => continue 'base,
                }
            }
            return (base, held);
        }
        panic!("no free port block");
    }

    #[test]
    fn test_range_validation() {
        assert!(PortRange::new(3600, 3700).is_ok());
        assert!(PortRange::new(3600, 3600).is_ok());
        assert!(PortRange::new(3700, 3600).is_err());
        assert!(PortRange::new(0, 10).is_err());
    }

    #[test]
    fn test_range_len_and_contains() {
        let range = PortRange::new(3600, 3602).unwrap();
        assert_eq!(range.len(), 3);
        assert!(range.contains(3600));
        assert!(range.contains(3602));
        assert!(!range.contains(3603));
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![3600, 3601, 3602]);
    }

    #[test]
    fn test_acquire_lowest_free_port() {
        let (base, mut held) = hold_block(4);
        // Free the second port only; the scan must skip the first and take it.
        held.remove(1);

        let allocator = PortAllocator::loopback(PortRange::new(base, base + 3).unwrap());
        let socket = allocator.acquire().unwrap();
        assert_eq!(socket.port(), base + 1);
    }

    #[test]
    fn test_acquire_is_deterministic() {
        let (base, held) = hold_block(3);
        drop(held);

        let allocator = PortAllocator::loopback(PortRange::new(base, base + 2).unwrap());
        let first = allocator.acquire().unwrap();
        let second = allocator.acquire().unwrap();
        assert_eq!(first.port(), base);
        assert_eq!(second.port(), base + 1);

        drop(first);
        let third = allocator.acquire().unwrap();
        assert_eq!(third.port(), base);
    }

    #[test]
    fn test_acquire_exhausted() {
        let (base, _held) = hold_block(3);

        let allocator = PortAllocator::loopback(PortRange::new(base, base + 2).unwrap());
        let err = allocator.acquire().unwrap_err();
        assert!(matches!(
            err,
            TransportError::NoPortAvailable { start, end } if start == base && end == base + 2
        ));
    }
}
