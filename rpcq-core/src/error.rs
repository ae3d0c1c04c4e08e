//! Core error types.

use rpcq_history::HistoryError;
use rpcq_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the queue engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("RPC queue is not initialized")]
    NotInitialized,

    #[error("RPC has no targets")]
    NoTargets,

    #[error("unknown method: {0:#x}")]
    UnknownMethod(u64),

    #[error("method already registered: {0:#x}")]
    DuplicateMethod(u64),

    #[error("handler for method {method_id:#x} failed: {reason}")]
    Handler { method_id: u64, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CoreError {
    /// Returns whether the error is a handler-side failure rather than an
    /// engine failure.
    pub fn is_handler_error(&self) -> bool {
        matches!(
            self,
            CoreError::UnknownMethod(_) | CoreError::Handler { .. }
        )
    }

    pub fn handler(method_id: u64, reason: impl Into<String>) -> Self {
        CoreError::Handler {
            method_id,
            reason: reason.into(),
        }
    }
}
