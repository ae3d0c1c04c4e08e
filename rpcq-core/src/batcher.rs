//! Per-(peer, channel) batching of outbound messages.
//!
//! A batch is a run of length-prefixed records:
//!
//! ```text
//! +-----------+---------+-----------+---------+----
//! | len (i32) | message | len (i32) | message | ...
//! +-----------+---------+-----------+---------+----
//! ```
//!
//! Streams flush in the order they first received a message since their
//! last flush, not in key order. A stream started after another one is
//! never sent ahead of it.

use bytes::{Bytes, BytesMut};
use rpcq_protocol::{split_records, write_record, Channel, PeerId, ProtocolError};
use std::collections::HashMap;

/// Accumulates outbound messages per peer and channel.
#[derive(Debug, Default)]
pub struct Batcher {
    streams: HashMap<(PeerId, Channel), BytesMut>,
    /// Non-empty streams, oldest first.
    order: Vec<(PeerId, Channel)>,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one message to the stream for `peer` on `channel`.
    pub fn queue_item(&mut self, peer: PeerId, channel: Channel, message: &[u8]) {
        let stream = self.streams.entry((peer, channel)).or_default();
        if stream.is_empty() {
            self.order.push((peer, channel));
        }
        write_record(stream, message);
    }

    /// Flushes every stream holding at least `threshold` bytes.
    ///
    /// Returns the number of batches handed to `send`.
    pub fn send_if_over_threshold<F>(&mut self, threshold: usize, mut send: F) -> usize
    where
        F: FnMut(PeerId, Channel, &[u8]),
    {
        let mut flushed = 0;
        let streams = &mut self.streams;
        self.order.retain(|&(peer, channel)| {
            let Some(stream) = streams.get_mut(&(peer, channel)) else {
                return false;
            };
            if stream.is_empty() {
                return false;
            }
            if stream.len() < threshold {
                return true;
            }
            send(peer, channel, &stream[..]);
            stream.clear();
            flushed += 1;
            false
        });
        flushed
    }

    /// Flushes every non-empty stream.
    pub fn send_all<F>(&mut self, send: F) -> usize
    where
        F: FnMut(PeerId, Channel, &[u8]),
    {
        self.send_if_over_threshold(0, send)
    }

    /// Splits a received batch back into messages.
    pub fn receive_items(batch: &Bytes) -> Result<Vec<Bytes>, ProtocolError> {
        split_records(batch)
    }

    /// Bytes waiting for `peer` on `channel`.
    pub fn pending_bytes(&self, peer: PeerId, channel: Channel) -> usize {
        self.streams
            .get(&(peer, channel))
            .map_or(0, |stream| stream.len())
    }

    pub fn is_empty(&self) -> bool {
        self.streams.values().all(|stream| stream.is_empty())
    }

    /// Forgets every stream for a peer that has gone away.
    pub fn drop_peer(&mut self, peer: PeerId) -> usize {
        let mut dropped = 0;
        self.order.retain(|&(p, _)| p != peer);
        self.streams.retain(|&(p, _), stream| {
            if p == peer {
                dropped += stream.len();
                false
            } else {
                true
            }
        });
        dropped
    }
}
