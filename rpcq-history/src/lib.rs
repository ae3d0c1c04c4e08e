//! # rpcq-history
//!
//! Queue history frames for rpcq.
//!
//! This crate provides:
//! - One binary frame per (direction, slot, update stage) with an ordered
//!   item offset list and first/next iteration
//! - Length-patched item writes with rollback of uncommitted items
//! - A fixed-depth circular table of frames per direction with wraparound
//! - Loopback pinning so same-process deliveries survive a slot roll
//! - The stats sink fed when slots roll

pub mod config;
pub mod error;
pub mod frame;
pub mod stats;
pub mod table;

pub use config::HistoryConfig;
pub use error::HistoryError;
pub use frame::{Direction, PendingItem, QueueHistoryFrame, QueueItem};
pub use stats::{NullStats, StatsSink};
pub use table::{FrameHistoryTable, SlotTarget};

/// Slots kept on top of the configured history depth.
///
/// One slot is being drained while the next one receives loopback writes.
pub const MIN_HISTORY_SLOTS: usize = 2;

/// Default configured history depth.
pub const DEFAULT_HISTORY_DEPTH: usize = 1;

/// Largest accepted history depth.
pub const MAX_HISTORY_DEPTH: usize = 256;

/// Initial byte capacity of every frame buffer.
pub const DEFAULT_FRAME_CAPACITY: usize = 1024;
