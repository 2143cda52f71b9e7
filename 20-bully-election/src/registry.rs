//! A node's local view of its peers.
//!
//! The registry is plain data: it lives inside the election state, which is
//! owned by the node task, so it needs no locking of its own.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::NodeId;

/// Identity and address of another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRef {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl PeerRef {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// Known peers keyed by id. A `BTreeMap` keeps broadcasts in id order, which
/// makes logs and tests deterministic.
#[derive(Debug, Default, Clone)]
pub struct PeerRegistry {
    peers: BTreeMap<NodeId, PeerRef>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer unless one with the same id is already known. Returns
    /// `true` if the peer was new.
    pub fn add(&mut self, peer: PeerRef) -> bool {
        if self.peers.contains_key(&peer.id) {
            return false;
        }
        self.peers.insert(peer.id, peer);
        true
    }

    pub fn remove(&mut self, id: NodeId) -> Option<PeerRef> {
        self.peers.remove(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<PeerRef> {
        self.peers.get(&id).copied()
    }

    /// All known peers, ordered by id.
    pub fn snapshot(&self) -> Vec<PeerRef> {
        self.peers.values().copied().collect()
    }

    /// Peers whose id is strictly greater than `id`: the only ones that can
    /// still win an election against it.
    pub fn higher_than(&self, id: NodeId) -> Vec<PeerRef> {
        self.peers
            .range(id.saturating_add(1)..)
            .filter(|(peer_id, _)| **peer_id > id)
            .map(|(_, peer)| *peer)
            .collect()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }
}

impl FromIterator<PeerRef> for PeerRegistry {
    fn from_iter<I: IntoIterator<Item = PeerRef>>(iter: I) -> Self {
        let mut registry = PeerRegistry::new();
        for peer in iter {
            registry.add(peer);
        }
        registry
    }
}
