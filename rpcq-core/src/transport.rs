//! Transport collaborator.

use bytes::Bytes;
use rpcq_protocol::{Channel, PeerId};

/// Something the transport reports between ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Data {
        peer: PeerId,
        channel: Channel,
        payload: Bytes,
    },
}

/// Moves bytes between peers.
///
/// The engine only sends; the pump that owns the engine polls. `send` must
/// not block and must not drop data silently.
pub trait Transport {
    fn send(&mut self, peer: PeerId, payload: &[u8], channel: Channel);

    /// Returns the next pending event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent> {
        None
    }

    /// Pushes out anything buffered by `send`. Called once per send pass.
    fn flush(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, peer: PeerId, payload: &[u8], channel: Channel) {
        (**self).send(peer, payload, channel)
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        (**self).poll_event()
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}
