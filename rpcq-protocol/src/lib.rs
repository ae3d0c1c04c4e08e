//! # rpcq-protocol
//!
//! Wire format for the rpcq RPC queue.
//!
//! This crate provides:
//! - A growable little-endian frame buffer with reserve/commit length patching
//! - Queue item headers (kind, flags, routing) for inbound and outbound frames
//! - The per-message routing header read by receivers
//! - The transport envelope and the fixed-capacity batched send queue
//! - Per-peer reassembly of length-prefixed messages from reliable streams

pub mod buffer;
pub mod channel;
pub mod envelope;
pub mod error;
pub mod item;
pub mod message;
pub mod reassembly;
pub mod send_queue;
pub mod stage;

pub use buffer::{Reservation, WireBuffer, WireReader};
pub use channel::Channel;
pub use envelope::{Envelope, EnvelopeKind};
pub use error::ProtocolError;
pub use item::{ItemFlags, ItemHeader, ItemKind, ITEM_HEADER_SIZE};
pub use message::{MessageHeader, MESSAGE_HEADER_SIZE};
pub use reassembly::ReceiveQueue;
pub use send_queue::{split_records, write_record, BatchedSendQueue, PushOutcome};
pub use stage::UpdateStage;

/// Identifier of a connected peer (client or server).
pub type PeerId = u64;

/// Exclusive upper bound on a single item's payload length (128 KiB).
///
/// A length outside `1..MAX_ITEM_PAYLOAD` read back from a frame is treated
/// as corruption.
pub const MAX_ITEM_PAYLOAD: usize = 128 * 1024;

/// Default upper bound on the number of targets an outbound item may carry.
pub const DEFAULT_MAX_CLIENTS: usize = 512;

/// Size of the `i32` length prefix in front of every queued message.
pub const LENGTH_PREFIX_SIZE: usize = 4;
