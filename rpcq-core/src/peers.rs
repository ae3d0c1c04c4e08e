//! Connected peers and their readiness to receive lifecycle messages.

use rpcq_protocol::PeerId;
use std::collections::{HashMap, HashSet};

/// What an internal message send pass should do with a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Not connected yet, or connected but still loading.
    Pending,
    /// Connected and ready for lifecycle messages.
    Ready,
    /// Was connected and has left.
    Disconnected,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    /// Connected peers and whether they finished loading.
    connected: HashMap<PeerId, bool>,
    /// Peers that left while something may still target them. Pruned with
    /// [`prune_departed`](Self::prune_departed).
    departed: HashSet<PeerId>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, peer: PeerId) {
        self.departed.remove(&peer);
        self.connected.entry(peer).or_insert(false);
    }

    /// Marks a connected peer as ready. Returns false for unknown peers.
    pub fn mark_ready(&mut self, peer: PeerId) -> bool {
        match self.connected.get_mut(&peer) {
            Some(ready) => {
                *ready = true;
                true
            }
            None => false,
        }
    }

    pub fn disconnect(&mut self, peer: PeerId) {
        if self.connected.remove(&peer).is_some() {
            self.departed.insert(peer);
        }
    }

    pub fn state(&self, peer: PeerId) -> PeerState {
        match self.connected.get(&peer) {
            Some(true) => PeerState::Ready,
            Some(false) => PeerState::Pending,
            None if self.departed.contains(&peer) => PeerState::Disconnected,
            None => PeerState::Pending,
        }
    }

    /// Forgets departed peers for which `referenced` returns false.
    ///
    /// Returns how many were forgotten. A forgotten peer reads as
    /// [`PeerState::Pending`] again.
    pub fn prune_departed<F>(&mut self, mut referenced: F) -> usize
    where
        F: FnMut(PeerId) -> bool,
    {
        let before = self.departed.len();
        self.departed.retain(|&peer| referenced(peer));
        before - self.departed.len()
    }

    pub fn departed_len(&self) -> usize {
        self.departed.len()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.connected.contains_key(&peer)
    }

    /// Connected peers in ascending id order.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.connected.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }
}
