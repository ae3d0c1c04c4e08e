//! History error types.

use crate::frame::Direction;
use rpcq_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while building or writing history frames.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("invalid history depth {depth} (max {max})")]
    InvalidDepth { depth: usize, max: usize },

    #[error("max clients must be greater than zero")]
    InvalidMaxClients,

    #[error("{actual} frame cannot take {expected} items")]
    WrongDirection {
        expected: Direction,
        actual: Direction,
    },

    #[error("pending item does not belong to this frame (start {start}, len {len})")]
    StalePendingItem { start: usize, len: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HistoryError {
    /// Returns whether the error comes from configuration rather than use.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            HistoryError::InvalidDepth { .. } | HistoryError::InvalidMaxClients
        )
    }
}
