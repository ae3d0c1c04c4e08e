//! In-process network.
//!
//! Every peer that joins a [`MemoryNetwork`] gets an inbox. Sends are
//! delivered to the target's inbox immediately, in order. Reliable sends can
//! be split into fixed-size chunks to mimic a stream transport.

use crate::adapter::RawTransport;
use bytes::Bytes;
use parking_lot::Mutex;
use rpcq_core::TransportEvent;
use rpcq_protocol::{Channel, PeerId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<PeerId, VecDeque<TransportEvent>>,
    chunk_size: Option<usize>,
}

/// Shared handle to an in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits every reliable delivery into chunks of at most `chunk_size`
    /// bytes.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let network = Self::default();
        network.state.lock().chunk_size = Some(chunk_size.max(1));
        network
    }

    /// Registers `peer` and returns its transport endpoint.
    pub fn join(&self, peer: PeerId) -> MemoryTransport {
        self.state.lock().inboxes.entry(peer).or_default();
        MemoryTransport {
            peer,
            network: self.clone(),
        }
    }

    /// Tells both peers about each other.
    pub fn connect(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.lock();
        state
            .inboxes
            .entry(a)
            .or_default()
            .push_back(TransportEvent::Connected(b));
        state
            .inboxes
            .entry(b)
            .or_default()
            .push_back(TransportEvent::Connected(a));
    }

    /// Tells both peers the other one left.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.lock();
        if let Some(inbox) = state.inboxes.get_mut(&a) {
            inbox.push_back(TransportEvent::Disconnected(b));
        }
        if let Some(inbox) = state.inboxes.get_mut(&b) {
            inbox.push_back(TransportEvent::Disconnected(a));
        }
    }

    /// Events waiting in `peer`'s inbox.
    pub fn pending(&self, peer: PeerId) -> usize {
        self.state.lock().inboxes.get(&peer).map_or(0, VecDeque::len)
    }

    fn deliver(&self, from: PeerId, to: PeerId, bytes: &[u8], channel: Channel) {
        let mut state = self.state.lock();
        let chunk_size = state.chunk_size;
        let Some(inbox) = state.inboxes.get_mut(&to) else {
            tracing::trace!("Dropping {} bytes for unknown peer {}", bytes.len(), to);
            return;
        };

        match chunk_size {
            Some(size) if channel.is_reliable() => {
                for chunk in bytes.chunks(size) {
                    inbox.push_back(TransportEvent::Data {
                        peer: from,
                        channel,
                        payload: Bytes::copy_from_slice(chunk),
                    });
                }
            }
            _ => inbox.push_back(TransportEvent::Data {
                peer: from,
                channel,
                payload: Bytes::copy_from_slice(bytes),
            }),
        }
    }

    fn poll(&self, peer: PeerId) -> Option<TransportEvent> {
        self.state.lock().inboxes.get_mut(&peer)?.pop_front()
    }
}

/// One peer's endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    peer: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl RawTransport for MemoryTransport {
    fn send_raw(&mut self, peer: PeerId, bytes: &[u8], channel: Channel) {
        self.network.deliver(self.peer, peer, bytes, channel);
    }

    fn poll_raw(&mut self) -> Option<TransportEvent> {
        self.network.poll(self.peer)
    }
}
