//! Peer lifecycle states and the host's peer table.

use std::collections::BTreeMap;

use syncroom_types::PeerId;

/// Where a connected follower stands with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Connected, onboarding still running. Receives no relayed traffic.
    Initializing,
    /// Fully onboarded; counted by the barriers.
    Active,
    /// Joined mid-activity; sits out until the current activity ends.
    AwaitingSessionEnd,
}

impl PeerStatus {
    /// Whether the peer takes part in barriers.
    pub fn is_active(self) -> bool {
        self == Self::Active
    }

    /// Whether onboarding has finished.
    pub fn is_initialized(self) -> bool {
        self != Self::Initializing
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Active => write!(f, "Active"),
            Self::AwaitingSessionEnd => write!(f, "AwaitingSessionEnd"),
        }
    }
}

/// Connected followers keyed by id. Owned by the host actor.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerStatus>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly connected peer. Returns `true` if it replaced an entry.
    pub fn insert_initializing(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer, PeerStatus::Initializing).is_some()
    }

    /// Update a known peer; unknown peers are ignored.
    pub fn set_status(&mut self, peer: &PeerId, status: PeerStatus) -> bool {
        match self.peers.get_mut(peer) {
            Some(slot) => {
                *slot = status;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerStatus> {
        self.peers.remove(peer)
    }

    pub fn status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.peers.get(peer).copied()
    }

    /// Peers the barriers wait for.
    pub fn active(&self) -> Vec<PeerId> {
        self.with_status(PeerStatus::is_active)
    }

    /// Peers past onboarding, whatever their activity state.
    pub fn initialized(&self) -> Vec<PeerId> {
        self.with_status(PeerStatus::is_initialized)
    }

    /// Recipients for relayed traffic of the given class.
    pub fn relay_targets(&self, gameplay: bool) -> Vec<PeerId> {
        self.with_status(|status| match status {
            PeerStatus::Initializing => false,
            PeerStatus::Active => true,
            PeerStatus::AwaitingSessionEnd => !gameplay,
        })
    }

    /// Move every peer waiting for the activity to end into the active set.
    pub fn promote_awaiting(&mut self) -> Vec<PeerId> {
        let mut promoted = Vec::new();
        for (peer, status) in &mut self.peers {
            if *status == PeerStatus::AwaitingSessionEnd {
                *status = PeerStatus::Active;
                promoted.push(peer.clone());
            }
        }
        promoted
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, PeerStatus)> {
        self.peers.iter().map(|(id, status)| (id, *status))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn with_status(&self, keep: impl Fn(PeerStatus) -> bool) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, status)| keep(**status))
            .map(|(id, _)| id.clone())
            .collect()
    }
}
