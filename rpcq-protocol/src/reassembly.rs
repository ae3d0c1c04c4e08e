//! Per-peer reassembly of reliable stream deliveries.
//!
//! A reliable channel is a byte stream: one delivery may end halfway through
//! a record, or carry several. [`ReceiveQueue`] accumulates deliveries and
//! hands out complete records only, keeping any partial tail for the next
//! delivery.

use crate::error::ProtocolError;
use crate::LENGTH_PREFIX_SIZE;
use bytes::{Buf, Bytes, BytesMut};

/// Accumulates stream bytes for one peer and pops complete messages.
#[derive(Debug)]
pub struct ReceiveQueue {
    buffer: BytesMut,
    max_message: usize,
}

impl ReceiveQueue {
    /// Creates a queue that rejects any record longer than `max_message`.
    pub fn new(max_message: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_message,
        }
    }

    /// Appends a delivery.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pops the next complete message, or `None` if only a partial record is
    /// buffered.
    ///
    /// A negative or oversized length means the stream is desynchronised; the
    /// buffer is left untouched and the caller is expected to drop the peer's
    /// queue.
    pub fn pop_message(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = (&self.buffer[..LENGTH_PREFIX_SIZE]).get_i32_le();
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        let len = len as usize;
        if len > self.max_message {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                capacity: self.max_message,
            });
        }

        if self.buffer.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_queue::write_record;
    use proptest::prelude::*;

    fn stream(messages: &[&[u8]]) -> Vec<u8> {
        let mut dst = BytesMut::new();
        for message in messages {
            write_record(&mut dst, message);
        }
        dst.to_vec()
    }

    #[test]
    fn test_whole_messages() {
        let mut queue = ReceiveQueue::new(1024);
        queue.push(&stream(&[b"a", b"bc"]));

        assert_eq!(queue.pop_message().unwrap().unwrap(), &b"a"[..]);
        assert_eq!(queue.pop_message().unwrap().unwrap(), &b"bc"[..]);
        assert!(queue.pop_message().unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_tail_is_kept() {
        let bytes = stream(&[b"hello world"]);
        let mut queue = ReceiveQueue::new(1024);

        // Feed partial data
        queue.push(&bytes[..2]);
        assert!(queue.pop_message().unwrap().is_none());
        queue.push(&bytes[2..7]);
        assert!(queue.pop_message().unwrap().is_none());
        assert_eq!(queue.buffered(), 7);

        // Feed the rest
        queue.push(&bytes[7..]);
        assert_eq!(queue.pop_message().unwrap().unwrap(), &b"hello world"[..]);
        assert_eq!(queue.buffered(), 0);
    }

    #[test]
    fn test_zero_length_message() {
        let mut queue = ReceiveQueue::new(16);
        queue.push(&stream(&[b""]));
        assert_eq!(queue.pop_message().unwrap().unwrap().len(), 0);
    }

    #[test]
    fn test_desynchronised_stream() {
        let mut queue = ReceiveQueue::new(16);
        queue.push(&(-1i32).to_le_bytes());
        assert_eq!(
            queue.pop_message().unwrap_err(),
            ProtocolError::NegativeLength(-1)
        );

        let mut queue = ReceiveQueue::new(16);
        queue.push(&17i32.to_le_bytes());
        assert!(matches!(
            queue.pop_message(),
            Err(ProtocolError::MessageTooLarge { size: 17, capacity: 16 })
        ));
        assert_eq!(queue.buffered(), 4);
    }

    proptest! {
        #[test]
        fn test_any_chunking_yields_same_messages(
            messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..16),
            cuts in proptest::collection::vec(1usize..32, 1..64),
        ) {
            let refs: Vec<&[u8]> = messages.iter().map(|m| m.as_slice()).collect();
            let bytes = stream(&refs);

            let mut queue = ReceiveQueue::new(1024);
            let mut popped = Vec::new();
            let mut offset = 0;
            let mut cut = cuts.iter().cycle();
            while offset < bytes.len() {
                let end = (offset + cut.next().copied().unwrap_or(1)).min(bytes.len());
                queue.push(&bytes[offset..end]);
                offset = end;
                while let Some(message) = queue.pop_message().unwrap() {
                    popped.push(message.to_vec());
                }
            }

            prop_assert_eq!(popped, messages);
            prop_assert!(queue.is_empty());
        }
    }
}
