//! Retry queue for internal lifecycle messages.
//!
//! Object create/destroy notifications cannot go out until the target peer
//! has finished loading, so they wait here and are retried on every send
//! pass. A message is dropped once no targets remain or once it has been
//! queued for longer than the configured lifetime, which bounds memory when
//! a peer never finishes loading.

use crate::peers::{PeerDirectory, PeerState};
use bytes::Bytes;
use rpcq_protocol::{Channel, ItemKind, PeerId};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct InternalMessage {
    pub kind: ItemKind,
    pub channel: Channel,
    /// Complete message bytes, routing header included.
    pub payload: Bytes,
    pending: Vec<PeerId>,
    queued_at: Duration,
}

impl InternalMessage {
    /// Targets that have not received the message yet.
    pub fn pending_targets(&self) -> &[PeerId] {
        &self.pending
    }

    pub fn queued_at(&self) -> Duration {
        self.queued_at
    }
}

/// What one send pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InternalPassReport {
    /// Individual (message, peer) sends.
    pub sent: usize,
    /// Messages dropped because every target was served or left.
    pub completed: usize,
    /// Messages dropped for outliving the lifetime.
    pub expired: usize,
}

#[derive(Debug)]
pub struct InternalMessageQueue {
    messages: VecDeque<InternalMessage>,
    lifetime: Duration,
}

impl InternalMessageQueue {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            messages: VecDeque::new(),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether any queued message still waits on `peer`.
    pub fn targets(&self, peer: PeerId) -> bool {
        self.messages
            .iter()
            .any(|message| message.pending.binary_search(&peer).is_ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = &InternalMessage> {
        self.messages.iter()
    }

    pub fn push(
        &mut self,
        kind: ItemKind,
        channel: Channel,
        payload: impl Into<Bytes>,
        targets: &[PeerId],
        now: Duration,
    ) {
        let mut pending = targets.to_vec();
        pending.sort_unstable();
        pending.dedup();
        self.messages.push_back(InternalMessage {
            kind,
            channel,
            payload: payload.into(),
            pending,
            queued_at: now,
        });
    }

    /// Retries every message against the current peer states.
    ///
    /// Expired messages are dropped before anything is sent to them. Ready
    /// targets are served, departed targets are forgotten, and pending ones
    /// are kept for the next pass.
    pub fn send_pass<F>(&mut self, now: Duration, peers: &PeerDirectory, mut send: F) -> InternalPassReport
    where
        F: FnMut(PeerId, Channel, &[u8]),
    {
        let mut report = InternalPassReport::default();
        let lifetime = self.lifetime;

        self.messages.retain_mut(|message| {
            if now.saturating_sub(message.queued_at) >= lifetime {
                tracing::debug!(
                    "Dropping expired {:?} message for {} pending peers",
                    message.kind,
                    message.pending.len()
                );
                report.expired += 1;
                return false;
            }

            message.pending.retain(|&peer| match peers.state(peer) {
                PeerState::Ready => {
                    send(peer, message.channel, &message.payload);
                    report.sent += 1;
                    false
                }
                PeerState::Disconnected => {
                    tracing::trace!("Peer {} left before {:?} was delivered", peer, message.kind);
                    false
                }
                PeerState::Pending => true,
            });

            if message.pending.is_empty() {
                report.completed += 1;
                return false;
            }
            true
        });

        report
    }

    /// Sends every message to its ready targets and empties the queue.
    pub fn flush<F>(&mut self, peers: &PeerDirectory, mut send: F) -> usize
    where
        F: FnMut(PeerId, Channel, &[u8]),
    {
        let mut sent = 0;
        for message in self.messages.drain(..) {
            for &peer in &message.pending {
                if peers.state(peer) == PeerState::Ready {
                    send(peer, message.channel, &message.payload);
                    sent += 1;
                }
            }
        }
        sent
    }
}
