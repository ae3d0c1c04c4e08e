//! Stats sink fed by the history table and the queue processor.

use crate::frame::Direction;

/// Receives queue statistics.
///
/// Implementations are shared across the pump and must be cheap to call on
/// every item.
pub trait StatsSink: Send + Sync {
    /// Byte size of a dirty frame at the moment its slot rolls.
    fn record_queue_size(&self, direction: Direction, bytes: usize);

    /// One inbound item was dispatched.
    fn record_item_processed(&self);

    /// Bytes handed to the transport.
    fn record_bytes_sent(&self, bytes: usize);

    /// A batch was flushed to the transport.
    fn record_batch_sent(&self) {}

    /// An internal message was dropped for outliving its lifetime.
    fn record_internal_expired(&self) {}
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStats;

impl StatsSink for NullStats {
    fn record_queue_size(&self, _direction: Direction, _bytes: usize) {}

    fn record_item_processed(&self) {}

    fn record_bytes_sent(&self, _bytes: usize) {}
}
