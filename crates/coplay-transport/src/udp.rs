//! Local UDP sockets for the game-facing side of a tunnel.
//!
//! Each relayed connection owns one `LocalSocket` on the loopback interface.
//! The game talks plain UDP to it; the forwarder drains it without blocking.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Largest datagram the socket reads in one call.
pub const MAX_DATAGRAM: usize = 65536;

const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Non-blocking UDP socket with a reusable receive buffer.
pub struct LocalSocket {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
    addr: SocketAddr,
}

impl LocalSocket {
    /// Bind a non-blocking socket to `addr`.
    ///
    /// Address reuse is left off so that a port held by another process (or
    /// another tunnel) makes the bind fail instead of silently sharing it.
    ///
    /// # Examples
    /// ```no_run
    /// use coplay_transport::udp::LocalSocket;
    /// use std::net::SocketAddr;
    ///
    /// let addr: SocketAddr = "127.0.0.1:3600".parse().unwrap();
    /// let socket = LocalSocket::bind(addr).unwrap();
    /// assert_eq!(socket.port(), 3600);
    /// ```
    pub fn bind<A: Into<SocketAddr>>(addr: A) -> io::Result<Self> {
        let addr = addr.into();

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket2 = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_nonblocking(true)?;

        // Best effort: the kernel may clamp or refuse larger buffers.
        let _ = socket2.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
        let _ = socket2.set_send_buffer_size(SOCKET_BUFFER_SIZE);

        socket2.bind(&addr.into())?;

        let socket: UdpSocket = socket2.into();
        let addr = socket.local_addr()?;

        Ok(Self {
            socket,
            recv_buf: vec![0u8; MAX_DATAGRAM],
            addr,
        })
    }

    /// Receive one datagram, mapping `WouldBlock` to `None`.
    pub fn try_recv(&mut self) -> io::Result<Option<(&[u8], SocketAddr)>> {
        match self.socket.recv_from(&mut self.recv_buf) {
            Ok((len, from)) => Ok(Some((&self.recv_buf[..len], from))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Send one datagram to `addr`.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    /// The bound local address, as reported by the OS.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The address recorded at bind time.
    pub fn bound_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The bound local port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl std::fmt::Debug for LocalSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSocket").field("addr", &self.addr).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_reports_port() {
        let socket = LocalSocket::bind(loopback()).unwrap();
        let bound = socket.local_addr().unwrap();
        assert_ne!(socket.port(), 0);
        assert_eq!(bound, socket.bound_addr());
        assert!(bound.is_ipv4());
    }

    #[test]
    fn test_bind_refuses_taken_port() {
        let first = LocalSocket::bind(loopback()).unwrap();
        let taken: SocketAddr = format!("127.0.0.1:{}", first.port()).parse().unwrap();

        let second = LocalSocket::bind(taken);
        assert!(second.is_err());
    }

    #[test]
    fn test_send_recv() {
        let mut server = LocalSocket::bind(loopback()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = LocalSocket::bind(loopback()).unwrap();

        let sent = client.send_to(b"status query", server_addr).unwrap();
        assert_eq!(sent, 12);

        std::thread::sleep(Duration::from_millis(10));

        let client_addr = client.local_addr().unwrap();
        let (payload, from) = server.try_recv().unwrap().unwrap();
        assert_eq!(payload, b"status query");
        assert_eq!(from, client_addr);
    }

    #[test]
    fn test_nonblocking_recv() {
        let mut socket = LocalSocket::bind(loopback()).unwrap();

        assert!(socket.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_empty_datagram() {
        let mut server = LocalSocket::bind(loopback()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = LocalSocket::bind(loopback()).unwrap();

        assert_eq!(client.send_to(&[], server_addr).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(10));

        let (payload, _) = server.try_recv().unwrap().unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_large_datagram() {
        let mut server = LocalSocket::bind(loopback()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = LocalSocket::bind(loopback()).unwrap();

        let data = vec![0xBB; 60_000];
        client.send_to(&data, server_addr).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let (payload, _) = server.try_recv().unwrap().unwrap();
        assert_eq!(payload, &data[..]);
    }
}
