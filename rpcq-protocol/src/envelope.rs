//! Transport-level envelope for datagram channels.
//!
//! ```text
//! +-----------+-----------------------------------------+
//! | isBatched | records                                 |
//! |    u8     | 0: exactly one (len i32 | payload)      |
//! |           | 1: (len i32 | payload) until exhausted  |
//! +-----------+-----------------------------------------+
//! ```
//!
//! Both forms share the record parser, so a payload too large for batching
//! can be sent on its own without a separate receive path.

use crate::error::ProtocolError;
use crate::send_queue::{split_records, write_record};
use crate::LENGTH_PREFIX_SIZE;
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    Single = 0,
    Batched = 1,
}

impl EnvelopeKind {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(EnvelopeKind::Single),
            1 => Ok(EnvelopeKind::Batched),
            other => Err(ProtocolError::InvalidEnvelopeMarker(other)),
        }
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub messages: Vec<Bytes>,
}

impl Envelope {
    /// Wraps one message for an unbatched send.
    pub fn encode_single(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u8(EnvelopeKind::Single as u8);
        write_record(&mut buf, payload);
        buf
    }

    /// Wraps records already produced by a send queue.
    pub fn encode_batched(records: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + records.len());
        buf.put_u8(EnvelopeKind::Batched as u8);
        buf.put_slice(records);
        buf
    }

    /// Decodes a datagram into its messages.
    pub fn decode(datagram: Bytes) -> Result<Self, ProtocolError> {
        let Some(&marker) = datagram.first() else {
            return Err(ProtocolError::EmptyEnvelope);
        };
        let kind = EnvelopeKind::from_u8(marker)?;
        let messages = split_records(&datagram.slice(1..))?;
        if kind == EnvelopeKind::Single && messages.len() != 1 {
            return Err(ProtocolError::UnexpectedEof {
                needed: LENGTH_PREFIX_SIZE,
                available: datagram.len() - 1,
            });
        }
        Ok(Self { kind, messages })
    }
}
