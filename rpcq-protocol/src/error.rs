//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding rpcq wire data.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("unexpected end of buffer: need {needed} bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("seek out of range: position {position} (len {len})")]
    SeekOutOfRange { position: usize, len: usize },

    #[error("payload length out of bounds: {size} (must be in 1..{max})")]
    PayloadOutOfBounds { size: i64, max: usize },

    #[error("target count out of bounds: {count} (max {max})")]
    TargetCountOutOfBounds { count: i64, max: usize },

    #[error("resume offset {offset} outside payload of {len} bytes")]
    ResumeOffsetOutOfBounds { offset: i64, len: usize },

    #[error("invalid item kind: {0}")]
    InvalidItemKind(u16),

    #[error("invalid item flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("invalid update stage: {0}")]
    InvalidStage(u8),

    #[error("invalid channel: {0}")]
    InvalidChannel(u8),

    #[error("invalid envelope marker: {0:#x}")]
    InvalidEnvelopeMarker(u8),

    #[error("empty envelope")]
    EmptyEnvelope,

    #[error("negative message length: {0}")]
    NegativeLength(i32),

    #[error("empty item payload")]
    EmptyPayload,

    #[error("message too large: {size} bytes (capacity {capacity})")]
    MessageTooLarge { size: usize, capacity: usize },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Returns whether this error means the bytes on the wire cannot be trusted.
    ///
    /// Corruption aborts the iteration of the frame it was found in; the
    /// remaining errors are caller mistakes or capacity limits.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnexpectedEof { .. }
                | ProtocolError::PayloadOutOfBounds { .. }
                | ProtocolError::TargetCountOutOfBounds { .. }
                | ProtocolError::ResumeOffsetOutOfBounds { .. }
                | ProtocolError::InvalidItemKind(_)
                | ProtocolError::InvalidFlags(_)
                | ProtocolError::InvalidStage(_)
                | ProtocolError::InvalidChannel(_)
                | ProtocolError::InvalidEnvelopeMarker(_)
                | ProtocolError::EmptyEnvelope
                | ProtocolError::NegativeLength(_)
                | ProtocolError::InvalidUtf8
        )
    }
}
