//! Shared unit-test fixtures.

use coplay_transport::{
    ConnectionHandle, MemoryRelay, MemoryTransport, PeerIdentity, RelayTransport,
};
use std::sync::Arc;

pub(crate) const HOST: PeerIdentity = PeerIdentity::new(1);
pub(crate) const GUEST: PeerIdentity = PeerIdentity::new(2);

/// Both ends of one accepted connection between `HOST` and `GUEST`.
pub(crate) struct Pair {
    pub host: Arc<MemoryTransport>,
    pub host_handle: ConnectionHandle,
    pub guest: Arc<MemoryTransport>,
    pub guest_handle: ConnectionHandle,
}

pub(crate) fn connected_pair(relay: &MemoryRelay) -> Pair {
    let host = Arc::new(relay.endpoint(HOST));
    let guest = Arc::new(relay.endpoint(GUEST));
    let events = host.subscribe();
    host.create_listen_endpoint().unwrap();
    let guest_handle = guest.connect(HOST).unwrap();
    let host_handle = events.try_recv().unwrap().handle;
    host.accept(host_handle).unwrap();
    Pair {
        host,
        host_handle,
        guest,
        guest_handle,
    }
}
