//! # rpcq-core
//!
//! RPC queue engine for rpcq.
//!
//! This crate provides:
//! - Outbound RPC writes into the frame history, with in-process loopback
//!   delivery for a host's own peer
//! - Per-stage inbound dispatch to a handler table
//! - Per-(peer, channel) batching of outbound messages
//! - A retry queue for lifecycle messages with a bounded lifetime
//! - The collaborator traits the engine is driven through

pub mod batcher;
pub mod clock;
pub mod error;
pub mod handler;
pub mod internal;
pub mod peers;
pub mod processor;
pub mod transport;
pub mod writer;

pub use batcher::Batcher;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use handler::{CallContext, HandlerTable, MethodRegistry};
pub use internal::{InternalMessageQueue, InternalPassReport};
pub use peers::{PeerDirectory, PeerState};
pub use processor::{ProcessorConfig, QueueProcessor};
pub use transport::{Transport, TransportEvent};
pub use writer::RpcWriter;

pub use rpcq_history::{Direction, NullStats, StatsSink};

use std::time::Duration;

/// Peer id of the server.
pub const SERVER_PEER_ID: u64 = 0;

/// Accumulated batch size that triggers an early flush (bytes).
pub const DEFAULT_BATCH_THRESHOLD: usize = 512;

/// How long an internal message is retried before it is dropped.
pub const DEFAULT_INTERNAL_LIFETIME: Duration = Duration::from_secs(60);
