//! In-process lobby directory shared by several nodes.
//!
//! Requests made through one node's [`HubDirectory`] queue the resulting
//! [`DirectoryEvent`]s for the node concerned; the node fixture delivers them
//! on its tick.

use coplay_core::{Directory, DirectoryEvent, LobbyId, LobbySummary, LobbyVisibility};
use coplay_transport::PeerIdentity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

struct Lobby {
    owner: PeerIdentity,
    members: Vec<PeerIdentity>,
    visibility: LobbyVisibility,
    max_members: u32,
    data: HashMap<String, String>,
}

#[derive(Default)]
struct HubState {
    next_lobby: u64,
    lobbies: HashMap<LobbyId, Lobby>,
    presence: HashMap<PeerIdentity, HashMap<String, String>>,
    queues: HashMap<PeerIdentity, Vec<DirectoryEvent>>,
}

impl HubState {
    fn push(&mut self, to: PeerIdentity, event: DirectoryEvent) {
        self.queues.entry(to).or_default().push(event);
    }
}

/// A lobby service shared by every node of a test.
#[derive(Clone, Default)]
pub struct DirectoryHub {
    state: Arc<Mutex<HubState>>,
}

impl DirectoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// The directory as seen by `identity`.
    pub fn directory(&self, identity: PeerIdentity) -> Arc<HubDirectory> {
        Arc::new(HubDirectory {
            identity,
            hub: self.clone(),
        })
    }

    /// Events queued for `identity`, oldest first.
    pub fn take_events(&self, identity: PeerIdentity) -> Vec<DirectoryEvent> {
        self.lock().queues.remove(&identity).unwrap_or_default()
    }

    /// Rich-presence value `key` of `identity`.
    pub fn presence(&self, identity: PeerIdentity, key: &str) -> String {
        self.lock()
            .presence
            .get(&identity)
            .and_then(|values| values.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Lobby data value `key` of `lobby`.
    pub fn lobby_data(&self, lobby: LobbyId, key: &str) -> Option<String> {
        self.lock()
            .lobbies
            .get(&lobby)
            .and_then(|l| l.data.get(key))
            .cloned()
    }

    /// Member cap of `lobby`.
    pub fn lobby_member_limit(&self, lobby: LobbyId) -> Option<u32> {
        self.lock().lobbies.get(&lobby).map(|l| l.max_members)
    }

    /// Whether `lobby` still exists.
    pub fn lobby_exists(&self, lobby: LobbyId) -> bool {
        self.lock().lobbies.contains_key(&lobby)
    }

    /// Queue an event for `identity`, as if the user had clicked something.
    pub fn inject(&self, identity: PeerIdentity, event: DirectoryEvent) {
        self.lock().push(identity, event);
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// One node's handle onto a [`DirectoryHub`].
pub struct HubDirectory {
    identity: PeerIdentity,
    hub: DirectoryHub,
}

impl Directory for HubDirectory {
    fn create_lobby(&self, visibility: LobbyVisibility, max_members: u32) {
        let mut state = self.hub.lock();
        state.next_lobby += 1;
        let lobby = LobbyId::new(state.next_lobby);
        state.lobbies.insert(
            lobby,
            Lobby {
                owner: self.identity,
                members: vec![self.identity],
                visibility,
                max_members,
                data: HashMap::new(),
            },
        );
        state.push(self.identity, DirectoryEvent::LobbyCreated { lobby });
        state.push(
            self.identity,
            DirectoryEvent::LobbyEntered {
                lobby,
                success: true,
            },
        );
    }

    fn join_lobby(&self, lobby: LobbyId) {
        let mut state = self.hub.lock();
        let success = match state.lobbies.get_mut(&lobby) {
            Some(l) if l.members.contains(&self.identity) => true,
            Some(l) if (l.members.len() as u32) < l.max_members => {
                l.members.push(self.identity);
                true
            }
            _ => false,
        };
        state.push(self.identity, DirectoryEvent::LobbyEntered { lobby, success });
    }

    fn leave_lobby(&self, lobby: LobbyId) {
        let mut state = self.hub.lock();
        let owner_left = match state.lobbies.get_mut(&lobby) {
            Some(l) => {
                l.members.retain(|m| *m != self.identity);
                l.owner == self.identity
            }
            None => false,
        };
        if owner_left {
            state.lobbies.remove(&lobby);
        }
    }

    fn lobby_owner(&self, lobby: LobbyId) -> Option<PeerIdentity> {
        self.hub.lock().lobbies.get(&lobby).map(|l| l.owner)
    }

    fn is_member(&self, lobby: LobbyId, peer: PeerIdentity) -> bool {
        self.hub
            .lock()
            .lobbies
            .get(&lobby)
            .is_some_and(|l| l.members.contains(&peer))
    }

    fn set_lobby_data(&self, lobby: LobbyId, key: &str, value: &str) {
        if let Some(l) = self.hub.lock().lobbies.get_mut(&lobby) {
            l.data.insert(key.to_owned(), value.to_owned());
        }
    }

    fn set_lobby_visibility(&self, lobby: LobbyId, visibility: LobbyVisibility) {
        if let Some(l) = self.hub.lock().lobbies.get_mut(&lobby) {
            l.visibility = visibility;
        }
    }

    fn set_lobby_member_limit(&self, lobby: LobbyId, max_members: u32) {
        if let Some(l) = self.hub.lock().lobbies.get_mut(&lobby) {
            l.max_members = max_members;
        }
    }

    fn request_lobby_list(&self) {
        let mut state = self.hub.lock();
        let mut list: Vec<LobbySummary> = state
            .lobbies
            .iter()
            .filter(|(_, l)| l.visibility == LobbyVisibility::Public)
            .map(|(id, l)| LobbySummary {
                lobby: *id,
                host_name: l.data.get("hostname").cloned().unwrap_or_default(),
                map: l.data.get("map").cloned().unwrap_or_default(),
                members: l.members.len() as u32,
                max_members: l.max_members,
            })
            .collect();
        list.sort_by_key(|s| s.lobby);
        state.push(self.identity, DirectoryEvent::LobbyList(list));
    }

    fn set_presence(&self, key: &str, value: &str) {
        self.hub
            .lock()
            .presence
            .entry(self.identity)
            .or_default()
            .insert(key.to_owned(), value.to_owned());
    }
}
