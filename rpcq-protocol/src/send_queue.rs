//! Fixed-capacity queue of length-prefixed messages.
//!
//! Each queued message is a record:
//!
//! ```text
//! +-----------+---------------+
//! | len (i32) | payload bytes |
//! +-----------+---------------+
//! ```
//!
//! The queue never drops a message silently. [`BatchedSendQueue::push`]
//! refuses a message that does not fit so the owner can flush and retry, and
//! a message that could never fit is reported as such.

use crate::error::ProtocolError;
use crate::LENGTH_PREFIX_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Appends one length-prefixed record to `dst`.
pub fn write_record(dst: &mut BytesMut, payload: &[u8]) {
    dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
    dst.put_i32_le(payload.len() as i32);
    dst.put_slice(payload);
}

/// Splits a run of length-prefixed records into zero-copy slices.
pub fn split_records(src: &Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    let mut records = Vec::new();
    let mut cursor = &src[..];
    while cursor.has_remaining() {
        if cursor.remaining() < LENGTH_PREFIX_SIZE {
            return Err(ProtocolError::UnexpectedEof {
                needed: LENGTH_PREFIX_SIZE,
                available: cursor.remaining(),
            });
        }
        let len = cursor.get_i32_le();
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        let len = len as usize;
        if cursor.remaining() < len {
            return Err(ProtocolError::UnexpectedEof {
                needed: len,
                available: cursor.remaining(),
            });
        }
        let start = src.len() - cursor.remaining();
        records.push(src.slice(start..start + len));
        cursor.advance(len);
    }
    Ok(records)
}

/// Outcome of offering a message to a [`BatchedSendQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The message was appended.
    Queued,
    /// Not enough room left; flush and offer it again.
    Full,
    /// The message exceeds the queue's capacity even when empty.
    Oversized,
}

/// Fixed-capacity accumulation of records for one peer and channel.
#[derive(Debug)]
pub struct BatchedSendQueue {
    data: BytesMut,
    capacity: usize,
    messages: usize,
}

impl BatchedSendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            messages: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes queued, including length prefixes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.messages
    }

    /// Returns whether a message of `len` bytes could ever be queued.
    pub fn fits_empty(&self, len: usize) -> bool {
        len + LENGTH_PREFIX_SIZE <= self.capacity
    }

    /// Appends a message if it fits in the remaining space.
    pub fn push(&mut self, payload: &[u8]) -> PushOutcome {
        if !self.fits_empty(payload.len()) {
            return PushOutcome::Oversized;
        }
        if self.data.len() + LENGTH_PREFIX_SIZE + payload.len() > self.capacity {
            return PushOutcome::Full;
        }
        write_record(&mut self.data, payload);
        self.messages += 1;
        PushOutcome::Queued
    }

    /// Like [`push`](Self::push) but reports refusals as errors.
    pub fn try_push(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        match self.push(payload) {
            PushOutcome::Queued => Ok(()),
            PushOutcome::Full => Err(ProtocolError::MessageTooLarge {
                size: payload.len() + LENGTH_PREFIX_SIZE,
                capacity: self.capacity - self.data.len(),
            }),
            PushOutcome::Oversized => Err(ProtocolError::MessageTooLarge {
                size: payload.len() + LENGTH_PREFIX_SIZE,
                capacity: self.capacity,
            }),
        }
    }

    /// Takes every queued record, leaving the queue empty.
    pub fn take(&mut self) -> Bytes {
        self.messages = 0;
        self.data.split().freeze()
    }

    pub fn clear(&mut self) {
        self.messages = 0;
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_take() {
        let mut queue = BatchedSendQueue::new(64);
        assert_eq!(queue.push(b"abc"), PushOutcome::Queued);
        assert_eq!(queue.push(b"de"), PushOutcome::Queued);
        assert_eq!(queue.len(), 4 + 3 + 4 + 2);
        assert_eq!(queue.message_count(), 2);

        let bytes = queue.take();
        assert!(queue.is_empty());
        assert_eq!(queue.message_count(), 0);

        let records = split_records(&bytes).unwrap();
        assert_eq!(records, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")]);
    }

    #[test]
    fn test_push_full_then_retry_after_take() {
        let mut queue = BatchedSendQueue::new(16);
        assert_eq!(queue.push(&[1; 8]), PushOutcome::Queued);
        assert_eq!(queue.push(&[2; 8]), PushOutcome::Full);
        assert_eq!(queue.message_count(), 1);

        let _ = queue.take();
        assert_eq!(queue.push(&[2; 8]), PushOutcome::Queued);
    }

    #[test]
    fn test_push_exact_fit() {
        let mut queue = BatchedSendQueue::new(12);
        assert_eq!(queue.push(&[0; 8]), PushOutcome::Queued);
        assert_eq!(queue.len(), 12);
        assert_eq!(queue.push(&[]), PushOutcome::Full);
    }

    #[test]
    fn test_oversized() {
        let mut queue = BatchedSendQueue::new(16);
        assert!(!queue.fits_empty(13));
        assert_eq!(queue.push(&[0; 13]), PushOutcome::Oversized);
        assert!(queue.is_empty());
        assert!(matches!(
            queue.try_push(&[0; 13]),
            Err(ProtocolError::MessageTooLarge {
                size: 17,
                capacity: 16
            })
        ));
    }

    #[test]
    fn test_split_records_truncated() {
        let mut dst = BytesMut::new();
        write_record(&mut dst, b"hello");
        let bytes = dst.freeze();

        let truncated = bytes.slice(..bytes.len() - 1);
        assert!(matches!(
            split_records(&truncated),
            Err(ProtocolError::UnexpectedEof { needed: 5, available: 4 })
        ));

        let short_prefix = bytes.slice(..2);
        assert!(split_records(&short_prefix).is_err());
    }

    #[test]
    fn test_split_records_negative_length() {
        let mut dst = BytesMut::new();
        dst.put_i32_le(-3);
        assert_eq!(
            split_records(&dst.freeze()).unwrap_err(),
            ProtocolError::NegativeLength(-3)
        );
    }

    #[test]
    fn test_split_empty() {
        assert!(split_records(&Bytes::new()).unwrap().is_empty());
    }
}
