//! In-process relay network.
//!
//! `MemoryRelay` connects any number of `MemoryTransport` endpoints inside one
//! process with the connection semantics of a real relay: inbound connections
//! wait in `Connecting` until accepted, closing one end moves the other to
//! `ClosedByPeer`, and connecting to a peer that is not listening ends in
//! `ProblemDetectedLocally`. Messages are delivered instantly and in order,
//! and each remembers the [`SendMode`] it was sent with so tests can check it.

use crate::relay::{
    ConnectionHandle, ConnectionInfo, ConnectionState, EndReason, ListenHandle, MessageId,
    PeerIdentity, RelayAvailability, RelayTransport, SendMode, TransportError, TransportEvent,
    TransportResult,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

struct Link {
    owner: PeerIdentity,
    remote: PeerIdentity,
    peer: Option<ConnectionHandle>,
    inbound: bool,
    state: ConnectionState,
    inbox: VecDeque<(Vec<u8>, SendMode)>,
    end_reason: Option<EndReason>,
    end_debug: String,
}

struct Network {
    availability: RelayAvailability,
    next_handle: u32,
    next_listen: u32,
    next_message: MessageId,
    listeners: HashMap<PeerIdentity, ListenHandle>,
    links: HashMap<ConnectionHandle, Link>,
    subscribers: HashMap<PeerIdentity, Vec<Sender<TransportEvent>>>,
}

impl Network {
    fn allocate_handle(&mut self) -> ConnectionHandle {
        self.next_handle += 1;
        ConnectionHandle::new(self.next_handle)
    }

    fn owned_link(
        &mut self,
        owner: PeerIdentity,
        handle: ConnectionHandle,
    ) -> TransportResult<&mut Link> {
        match self.links.get_mut(&handle) {
            Some(link) if link.owner == owner => Ok(link),
            _ => Err(TransportError::InvalidHandle(handle)),
        }
    }

    fn set_state(&mut self, handle: ConnectionHandle, state: ConnectionState) {
        let Some(link) = self.links.get_mut(&handle) else {
            return;
        };
        let old_state = link.state;
        if old_state == state {
            return;
        }
        link.state = state;
        let event = TransportEvent {
            handle,
            old_state,
            new_state: state,
            remote: link.remote,
        };
        let owner = link.owner;
        self.notify(owner, event);
    }

    fn notify(&mut self, owner: PeerIdentity, event: TransportEvent) {
        if let Some(senders) = self.subscribers.get_mut(&owner) {
            senders.retain(|tx| tx.send(event).is_ok());
        }
    }
}

/// A process-local relay network.
///
/// Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct MemoryRelay {
    network: Arc<Mutex<Network>>,
}

impl MemoryRelay {
    /// Create an empty network that is immediately available.
    #[must_use]
    pub fn new() -> Self {
        Self::with_availability(RelayAvailability::Current)
    }

    /// Create an empty network in the given availability state.
    #[must_use]
    pub fn with_availability(availability: RelayAvailability) -> Self {
        Self {
            network: Arc::new(Mutex::new(Network {
                availability,
                next_handle: 0,
                next_listen: 0,
                next_message: 0,
                listeners: HashMap::new(),
                links: HashMap::new(),
                subscribers: HashMap::new(),
            })),
        }
    }

    /// An endpoint on this network with the given identity.
    #[must_use]
    pub fn endpoint(&self, identity: PeerIdentity) -> MemoryTransport {
        MemoryTransport {
            identity,
            relay: self.clone(),
        }
    }

    /// Change the reachability every endpoint reports.
    pub fn set_availability(&self, availability: RelayAvailability) {
        self.lock().availability = availability;
    }

    /// Number of handles not yet released, across all endpoints.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.lock().links.len()
    }

    fn lock(&self) -> MutexGuard<'_, Network> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.network
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`MemoryRelay`].
#[derive(Clone)]
pub struct MemoryTransport {
    identity: PeerIdentity,
    relay: MemoryRelay,
}

impl MemoryTransport {
    /// The identity this endpoint was created with.
    #[must_use]
    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    /// Handles currently owned by this endpoint, in ascending order.
    #[must_use]
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        let net = self.relay.lock();
        let mut handles: Vec<_> = net
            .links
            .iter()
            .filter(|(_, link)| link.owner == self.identity)
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    /// Like [`RelayTransport::receive`], keeping the mode each message was
    /// sent with.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidHandle` if the handle is unknown.
    pub fn receive_with_mode(
        &self,
        handle: ConnectionHandle,
        max: usize,
    ) -> TransportResult<Vec<(Vec<u8>, SendMode)>> {
        let mut net = self.relay.lock();
        let link = net.owned_link(self.identity, handle)?;
        let take = max.min(link.inbox.len());
        Ok(link.inbox.drain(..take).collect())
    }

    fn ensure_available(net: &Network) -> TransportResult<()> {
        if net.availability.is_available() {
            Ok(())
        } else {
            Err(TransportError::RelayUnavailable)
        }
    }
}

impl RelayTransport for MemoryTransport {
    fn availability(&self) -> RelayAvailability {
        self.relay.lock().availability
    }

    fn local_identity(&self) -> Option<PeerIdentity> {
        let net = self.relay.lock();
        net.availability.is_available().then_some(self.identity)
    }

    fn create_listen_endpoint(&self) -> TransportResult<ListenHandle> {
        let mut net = self.relay.lock();
        Self::ensure_available(&net)?;
        net.next_listen += 1;
        let listen = ListenHandle::new(net.next_listen);
        net.listeners.insert(self.identity, listen);
        Ok(listen)
    }

    fn close_listen_endpoint(&self, listen: ListenHandle) -> TransportResult<()> {
        let mut net = self.relay.lock();
        match net.listeners.get(&self.identity) {
            Some(current) if *current == listen => {
                net.listeners.remove(&self.identity);
                Ok(())
            }
            _ => Err(TransportError::Other(format!(
                "unknown listen handle {}",
                listen.as_u32()
            ))),
        }
    }

    fn connect(&self, peer: PeerIdentity) -> TransportResult<ConnectionHandle> {
        let mut net = self.relay.lock();
        Self::ensure_available(&net)?;
        if !peer.is_valid() || peer == self.identity {
            return Err(TransportError::ConnectionFailed(format!(
                "cannot connect to {peer}"
            )));
        }

        let outbound = net.allocate_handle();
        net.links.insert(
            outbound,
            Link {
                owner: self.identity,
                remote: peer,
                peer: None,
                inbound: false,
                state: ConnectionState::None,
                inbox: VecDeque::new(),
                end_reason: None,
                end_debug: String::new(),
            },
        );
        net.set_state(outbound, ConnectionState::Connecting);

        if net.listeners.contains_key(&peer) {
            let inbound = net.allocate_handle();
            net.links.insert(
                inbound,
                Link {
                    owner: peer,
                    remote: self.identity,
                    peer: Some(outbound),
                    inbound: true,
                    state: ConnectionState::None,
                    inbox: VecDeque::new(),
                    end_reason: None,
                    end_debug: String::new(),
                },
            );
            if let Some(link) = net.links.get_mut(&outbound) {
                link.peer = Some(inbound);
            }
            net.set_state(inbound, ConnectionState::Connecting);
        } else {
            if let Some(link) = net.links.get_mut(&outbound) {
                link.end_reason = Some(EndReason::Timeout);
                link.end_debug = "peer not listening".into();
            }
            net.set_state(outbound, ConnectionState::ProblemDetectedLocally);
        }

        Ok(outbound)
    }

    fn accept(&self, handle: ConnectionHandle) -> TransportResult<()> {
        let mut net = self.relay.lock();
        let link = net.owned_link(self.identity, handle)?;
        if !link.inbound {
            return Ok(());
        }
        if link.state != ConnectionState::Connecting {
            return Err(TransportError::ConnectionFailed(format!(
                "cannot accept {handle} in state {}",
                link.state
            )));
        }
        let peer = link.peer;

        net.set_state(handle, ConnectionState::Connected);
        if let Some(peer) = peer {
            net.set_state(peer, ConnectionState::Connected);
        }
        Ok(())
    }

    fn close(
        &self,
        handle: ConnectionHandle,
        reason: EndReason,
        debug: &str,
        _linger: bool,
    ) -> TransportResult<()> {
        let mut net = self.relay.lock();
        net.owned_link(self.identity, handle)?;
        let Some(link) = net.links.remove(&handle) else {
            return Err(TransportError::InvalidHandle(handle));
        };

        if let Some(peer) = link.peer {
            let live = match net.links.get_mut(&peer) {
                Some(remote) => {
                    remote.peer = None;
                    remote.end_reason = Some(reason);
                    remote.end_debug = debug.to_owned();
                    !remote.state.is_terminal()
                }
                None => false,
            };
            if live {
                net.set_state(peer, ConnectionState::ClosedByPeer);
            }
        }
        Ok(())
    }

    fn send(
        &self,
        handle: ConnectionHandle,
        payload: &[u8],
        mode: SendMode,
    ) -> TransportResult<MessageId> {
        let mut net = self.relay.lock();
        let link = net.owned_link(self.identity, handle)?;
        if link.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected(handle));
        }
        let Some(peer) = link.peer else {
            return Err(TransportError::NotConnected(handle));
        };
        let Some(remote) = net.links.get_mut(&peer) else {
            return Err(TransportError::NotConnected(handle));
        };
        remote.inbox.push_back((payload.to_vec(), mode));
        net.next_message += 1;
        Ok(net.next_message)
    }

    fn receive(&self, handle: ConnectionHandle, max: usize) -> TransportResult<Vec<Vec<u8>>> {
        let messages = self.receive_with_mode(handle, max)?;
        Ok(messages.into_iter().map(|(payload, _)| payload).collect())
    }

    fn connection_info(&self, handle: ConnectionHandle) -> Option<ConnectionInfo> {
        let net = self.relay.lock();
        let link = net.links.get(&handle)?;
        (link.owner == self.identity).then(|| ConnectionInfo {
            remote: link.remote,
            state: link.state,
            end_reason: link.end_reason,
            end_debug: link.end_debug.clone(),
        })
    }

    fn subscribe(&self) -> Receiver<TransportEvent> {
        let (tx, rx) = unbounded();
        self.relay
            .lock()
            .subscribers
            .entry(self.identity)
            .or_default()
            .push(tx);
        rx
    }
}
