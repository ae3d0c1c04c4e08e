//! Batching transport adapter.
//!
//! Sits between the queue processor and a raw transport. Outbound payloads
//! are coalesced per (peer, channel) in fixed-capacity send queues and go
//! out on [`Transport::flush`]:
//!
//! ```text
//! unreliable channel:  one datagram = envelope(isBatched, records)
//! reliable channel:    raw records appended to the peer's byte stream
//! ```
//!
//! A payload too large for an empty queue skips batching and is sent on its
//! own, after anything already queued for the same peer and channel.
//! Queues flush in the order they were first written to, so bytes handed
//! over on one channel are not overtaken by later bytes on another.
//!
//! Inbound, datagrams are unwrapped and stream deliveries are reassembled
//! per (peer, channel) before being handed to the processor.

use bytes::{Bytes, BytesMut};
use rpcq_core::{Transport, TransportEvent};
use rpcq_protocol::{
    write_record, BatchedSendQueue, Channel, Envelope, PeerId, PushOutcome, ReceiveQueue,
};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// A transport that moves opaque bytes.
///
/// Reliable channels behave as ordered byte streams: a send may arrive split
/// across several deliveries or merged with its neighbours. Unreliable
/// channels deliver each send as one datagram or not at all.
pub trait RawTransport {
    fn send_raw(&mut self, peer: PeerId, bytes: &[u8], channel: Channel);

    fn poll_raw(&mut self) -> Option<TransportEvent>;
}

pub struct BatchingTransport<R: RawTransport> {
    raw: R,
    capacity: usize,
    max_receive_message: usize,
    queues: HashMap<(PeerId, Channel), BatchedSendQueue>,
    /// Non-empty queues, oldest first.
    pending: Vec<(PeerId, Channel)>,
    receivers: HashMap<(PeerId, Channel), ReceiveQueue>,
    ready: VecDeque<TransportEvent>,
}

impl<R: RawTransport> BatchingTransport<R> {
    /// `capacity` bounds each send queue; `max_receive_message` bounds each
    /// reassembled record.
    pub fn new(raw: R, capacity: usize, max_receive_message: usize) -> Self {
        Self {
            raw,
            capacity,
            max_receive_message,
            queues: HashMap::new(),
            pending: Vec::new(),
            receivers: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn raw(&self) -> &R {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut R {
        &mut self.raw
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes waiting in the send queue for `peer` on `channel`.
    pub fn queued_bytes(&self, peer: PeerId, channel: Channel) -> usize {
        self.queues.get(&(peer, channel)).map_or(0, |q| q.len())
    }

    /// Drops every queue kept for `peer`.
    pub fn forget_peer(&mut self, peer: PeerId) {
        self.queues.retain(|&(p, _), _| p != peer);
        self.pending.retain(|&(p, _)| p != peer);
        self.receivers.retain(|&(p, _), _| p != peer);
    }

    fn unpack(&mut self, peer: PeerId, channel: Channel, payload: Bytes) {
        if channel.is_reliable() {
            let max = self.max_receive_message;
            let receiver = self
                .receivers
                .entry((peer, channel))
                .or_insert_with(|| ReceiveQueue::new(max));
            receiver.push(&payload);
            loop {
                match receiver.pop_message() {
                    Ok(Some(message)) => self.ready.push_back(TransportEvent::Data {
                        peer,
                        channel,
                        payload: message,
                    }),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(
                            "Discarding {} buffered bytes from peer {} on {}: {}",
                            receiver.buffered(),
                            peer,
                            channel,
                            e
                        );
                        receiver.clear();
                        break;
                    }
                }
            }
            return;
        }

        match Envelope::decode(payload) {
            Ok(envelope) => {
                for message in envelope.messages {
                    self.ready.push_back(TransportEvent::Data {
                        peer,
                        channel,
                        payload: message,
                    });
                }
            }
            Err(e) => warn!("Dropping datagram from peer {} on {}: {}", peer, channel, e),
        }
    }
}

fn flush_queue<R: RawTransport>(
    raw: &mut R,
    peer: PeerId,
    channel: Channel,
    queue: &mut BatchedSendQueue,
) {
    if queue.is_empty() {
        return;
    }
    let count = queue.message_count();
    let records = queue.take();
    trace!(
        "Flushing {} messages ({} bytes) to peer {} on {}",
        count,
        records.len(),
        peer,
        channel
    );
    if channel.is_reliable() {
        raw.send_raw(peer, &records, channel);
    } else {
        raw.send_raw(peer, &Envelope::encode_batched(&records), channel);
    }
}

fn send_standalone<R: RawTransport>(raw: &mut R, peer: PeerId, channel: Channel, payload: &[u8]) {
    if channel.is_reliable() {
        let mut record = BytesMut::new();
        write_record(&mut record, payload);
        raw.send_raw(peer, &record, channel);
    } else {
        raw.send_raw(peer, &Envelope::encode_single(payload), channel);
    }
}

impl<R: RawTransport> Transport for BatchingTransport<R> {
    fn send(&mut self, peer: PeerId, payload: &[u8], channel: Channel) {
        let capacity = self.capacity;
        let key = (peer, channel);
        let queue = self
            .queues
            .entry(key)
            .or_insert_with(|| BatchedSendQueue::new(capacity));

        match queue.push(payload) {
            PushOutcome::Queued => {
                if !self.pending.contains(&key) {
                    self.pending.push(key);
                }
            }
            PushOutcome::Full => {
                debug!(
                    "Send queue for peer {} on {} is full, flushing before retry",
                    peer, channel
                );
                flush_queue(&mut self.raw, peer, channel, queue);
                self.pending.retain(|k| *k != key);
                if queue.push(payload) == PushOutcome::Queued {
                    self.pending.push(key);
                } else {
                    send_standalone(&mut self.raw, peer, channel, payload);
                }
            }
            PushOutcome::Oversized => {
                warn!(
                    "Payload of {} bytes for peer {} exceeds send queue capacity {}, sending unbatched",
                    payload.len(),
                    peer,
                    capacity
                );
                flush_queue(&mut self.raw, peer, channel, queue);
                self.pending.retain(|k| *k != key);
                send_standalone(&mut self.raw, peer, channel, payload);
            }
        }
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            match self.raw.poll_raw()? {
                TransportEvent::Data {
                    peer,
                    channel,
                    payload,
                } => self.unpack(peer, channel, payload),
                TransportEvent::Disconnected(peer) => {
                    self.forget_peer(peer);
                    return Some(TransportEvent::Disconnected(peer));
                }
                event => return Some(event),
            }
        }
    }

    fn flush(&mut self) {
        for (peer, channel) in self.pending.drain(..) {
            if let Some(queue) = self.queues.get_mut(&(peer, channel)) {
                flush_queue(&mut self.raw, peer, channel, queue);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Wire {
        sent: Vec<(PeerId, Channel, Vec<u8>)>,
        incoming: VecDeque<TransportEvent>,
    }

    impl RawTransport for Wire {
        fn send_raw(&mut self, peer: PeerId, bytes: &[u8], channel: Channel) {
            self.sent.push((peer, channel, bytes.to_vec()));
        }

        fn poll_raw(&mut self) -> Option<TransportEvent> {
            self.incoming.pop_front()
        }
    }

    fn adapter(capacity: usize) -> BatchingTransport<Wire> {
        BatchingTransport::new(Wire::default(), capacity, 1024)
    }

    fn data(event: TransportEvent) -> (PeerId, Channel, Bytes) {
        match event {
            TransportEvent::Data {
                peer,
                channel,
                payload,
            } => (peer, channel, payload),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_unreliable_batch_is_one_envelope() {
        let mut t = adapter(256);
        t.send(1, b"a", Channel::PositionUpdate);
        t.send(1, b"bc", Channel::PositionUpdate);
        assert!(t.raw().sent.is_empty());

        t.flush();
        assert_eq!(t.raw().sent.len(), 1);
        let envelope = Envelope::decode(Bytes::from(t.raw().sent[0].2.clone())).unwrap();
        assert_eq!(envelope.messages, vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")]);
        assert_eq!(t.queued_bytes(1, Channel::PositionUpdate), 0);
    }

    #[test]
    fn test_reliable_batch_is_raw_records() {
        let mut t = adapter(256);
        t.send(1, b"abc", Channel::ReliableRpc);
        t.flush();
        let (_, _, bytes) = &t.raw().sent[0];
        assert_eq!(&bytes[..4], &3i32.to_le_bytes());
        assert_eq!(&bytes[4..], b"abc");
    }

    #[test]
    fn test_full_queue_flushes_then_retries() {
        let mut t = adapter(16);
        t.send(2, &[1; 8], Channel::UnreliableRpc);
        t.send(2, &[2; 8], Channel::UnreliableRpc);
        assert_eq!(t.raw().sent.len(), 1);
        assert_eq!(t.queued_bytes(2, Channel::UnreliableRpc), 12);

        t.flush();
        assert_eq!(t.raw().sent.len(), 2);
        let second = Envelope::decode(Bytes::from(t.raw().sent[1].2.clone())).unwrap();
        assert_eq!(&second.messages[0][..], &[2; 8]);
    }

    #[test]
    fn test_oversized_payload_bypasses_queue_in_order() {
        let mut t = adapter(16);
        t.send(3, b"x", Channel::UnreliableRpc);
        t.send(3, &[7; 40], Channel::UnreliableRpc);
        t.send(3, &[8; 40], Channel::ReliableRpc);

        let sent = &t.raw().sent;
        assert_eq!(sent.len(), 3);
        let first = Envelope::decode(Bytes::from(sent[0].2.clone())).unwrap();
        assert_eq!(&first.messages[0][..], b"x");
        let single = Envelope::decode(Bytes::from(sent[1].2.clone())).unwrap();
        assert_eq!(single.kind, rpcq_protocol::EnvelopeKind::Single);
        assert_eq!(single.messages[0].len(), 40);
        assert_eq!(sent[2].2.len(), 4 + 40);
    }

    #[test]
    fn test_flush_keeps_handover_order_across_channels() {
        let mut t = adapter(256);
        t.send(6, b"rpc", Channel::ReliableRpc);
        t.send(6, b"move", Channel::PositionUpdate);
        t.send(6, b"destroy", Channel::Internal);
        t.flush();

        let channels: Vec<_> = t.raw().sent.iter().map(|(_, c, _)| *c).collect();
        assert_eq!(
            channels,
            vec![Channel::ReliableRpc, Channel::PositionUpdate, Channel::Internal]
        );

        t.flush();
        assert_eq!(t.raw().sent.len(), 3);
    }

    #[test]
    fn test_reliable_stream_reassembly() {
        let mut sender = adapter(256);
        sender.send(9, b"hello", Channel::ReliableRpc);
        sender.send(9, b"world!", Channel::ReliableRpc);
        sender.flush();
        let stream = sender.raw().sent[0].2.clone();

        let mut receiver = adapter(256);
        for chunk in stream.chunks(3) {
            receiver.raw_mut().incoming.push_back(TransportEvent::Data {
                peer: 4,
                channel: Channel::ReliableRpc,
                payload: Bytes::copy_from_slice(chunk),
            });
        }

        let (peer, channel, first) = data(receiver.poll_event().unwrap());
        assert_eq!((peer, channel), (4, Channel::ReliableRpc));
        assert_eq!(&first[..], b"hello");
        let (_, _, second) = data(receiver.poll_event().unwrap());
        assert_eq!(&second[..], b"world!");
        assert!(receiver.poll_event().is_none());
    }

    #[test]
    fn test_corrupt_inputs_are_dropped() {
        let mut t = adapter(256);
        t.raw_mut().incoming.push_back(TransportEvent::Data {
            peer: 1,
            channel: Channel::ReliableRpc,
            payload: Bytes::copy_from_slice(&(-5i32).to_le_bytes()),
        });
        t.raw_mut().incoming.push_back(TransportEvent::Data {
            peer: 1,
            channel: Channel::PositionUpdate,
            payload: Bytes::from_static(&[9, 0, 0]),
        });
        t.raw_mut().incoming.push_back(TransportEvent::Connected(2));

        assert!(matches!(t.poll_event(), Some(TransportEvent::Connected(2))));
        assert!(t.poll_event().is_none());
    }

    #[test]
    fn test_disconnect_forgets_peer() {
        let mut t = adapter(256);
        t.send(5, b"pending", Channel::ReliableRpc);
        t.raw_mut()
            .incoming
            .push_back(TransportEvent::Disconnected(5));

        assert!(matches!(t.poll_event(), Some(TransportEvent::Disconnected(5))));
        assert_eq!(t.queued_bytes(5, Channel::ReliableRpc), 0);
        t.flush();
        assert!(t.raw().sent.is_empty());
    }

    proptest! {
        #[test]
        fn test_reliable_sends_survive_any_chunking(
            messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..96), 1..24),
            capacity in 8usize..128,
            flush_every in 1usize..8,
            cuts in proptest::collection::vec(1usize..40, 1..32),
        ) {
            let mut sender = adapter(capacity);
            for (i, message) in messages.iter().enumerate() {
                sender.send(3, message, Channel::ReliableRpc);
                if i % flush_every == 0 {
                    sender.flush();
                }
            }
            sender.flush();
            let stream: Vec<u8> = sender
                .raw()
                .sent
                .iter()
                .flat_map(|(_, _, bytes)| bytes.iter().copied())
                .collect();

            let mut receiver = adapter(capacity);
            let mut offset = 0;
            let mut cut = cuts.iter().cycle();
            while offset < stream.len() {
                let end = (offset + *cut.next().unwrap()).min(stream.len());
                receiver.raw_mut().incoming.push_back(TransportEvent::Data {
                    peer: 3,
                    channel: Channel::ReliableRpc,
                    payload: Bytes::copy_from_slice(&stream[offset..end]),
                });
                offset = end;
            }

            let mut received = Vec::new();
            while let Some(event) = receiver.poll_event() {
                received.push(data(event).2.to_vec());
            }
            prop_assert_eq!(received, messages);
        }
    }
}
