//! Growable little-endian wire buffer.
//!
//! `WireBuffer` backs every history frame. It keeps one cursor measured in
//! bits so that sub-byte fields can share the buffer with byte-aligned data;
//! byte-oriented reads and writes first align the cursor up to the next whole
//! byte.
//!
//! Writes at the cursor overwrite existing bytes and grow the buffer when they
//! run past its end. Variable-length items rely on this through the
//! reserve/commit pair:
//!
//! ```text
//! reserve_i64()        write payload           commit_i64(r, len)
//!      |                    |                        |
//!      v                    v                        v
//! +----------+--------------------------+   +----------+-------------+
//! | 00000000 | payload bytes ...        |-->| len (LE) | payload ... |
//! +----------+--------------------------+   +----------+-------------+
//!                                       ^ cursor stays at the tail
//! ```

use crate::error::ProtocolError;
use bytes::Buf;

/// A fixed-width placeholder inside a [`WireBuffer`] awaiting its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a reservation stays zero until it is committed"]
pub struct Reservation {
    position: usize,
}

impl Reservation {
    /// Byte position of the placeholder.
    pub fn position(&self) -> usize {
        self.position
    }
}

/// Growable byte buffer with a bit-granular cursor.
#[derive(Debug, Clone, Default)]
pub struct WireBuffer {
    data: Vec<u8>,
    bit_cursor: usize,
    mark: usize,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            bit_cursor: 0,
            mark: 0,
        }
    }

    /// Number of bytes written so far (the high-water mark, not the cursor).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Byte position of the cursor, rounded up past a partially written byte.
    pub fn position(&self) -> usize {
        (self.bit_cursor + 7) >> 3
    }

    /// Bit position of the cursor.
    pub fn bit_position(&self) -> usize {
        self.bit_cursor
    }

    /// Moves the cursor to a byte position inside the written region.
    pub fn set_position(&mut self, position: usize) -> Result<(), ProtocolError> {
        if position > self.data.len() {
            return Err(ProtocolError::SeekOutOfRange {
                position,
                len: self.data.len(),
            });
        }
        self.bit_cursor = position << 3;
        Ok(())
    }

    /// Moves the cursor to the end of the written region.
    pub fn seek_to_end(&mut self) {
        self.bit_cursor = self.data.len() << 3;
    }

    /// Bytes between the cursor and the end of the written region.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position())
    }

    /// Remembers the current byte position.
    pub fn mark(&mut self) {
        self.mark = self.position();
    }

    /// Position remembered by the last [`mark`](Self::mark).
    pub fn marked_position(&self) -> usize {
        self.mark
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Empties the buffer and rewinds the cursor, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.bit_cursor = 0;
        self.mark = 0;
    }

    /// Shortens the written region, pulling the cursor and mark back with it.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.bit_cursor = self.bit_cursor.min(self.data.len() << 3);
        self.mark = self.mark.min(self.data.len());
    }

    /// Returns a reader over the written region starting at `position`.
    pub fn reader_at(&self, position: usize) -> Result<WireReader<'_>, ProtocolError> {
        if position > self.data.len() {
            return Err(ProtocolError::SeekOutOfRange {
                position,
                len: self.data.len(),
            });
        }
        Ok(WireReader {
            data: &self.data,
            pos: position,
        })
    }

    fn align(&mut self) {
        self.bit_cursor = self.position() << 3;
    }

    fn put_raw(&mut self, bytes: &[u8]) {
        self.align();
        let start = self.bit_cursor >> 3;
        let end = start + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        self.bit_cursor = end << 3;
    }

    fn take_raw(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        self.align();
        let start = self.bit_cursor >> 3;
        let available = self.data.len().saturating_sub(start);
        if n > available {
            return Err(ProtocolError::UnexpectedEof {
                needed: n,
                available,
            });
        }
        self.bit_cursor = (start + n) << 3;
        Ok(&self.data[start..start + n])
    }

    // Writes

    pub fn write_u8(&mut self, value: u8) {
        self.put_raw(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.put_raw(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.put_raw(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.put_raw(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.put_raw(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.put_raw(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.put_raw(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.put_raw(bytes);
    }

    /// Writes a `u32` byte length followed by the UTF-8 bytes.
    pub fn write_str(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.put_raw(value.as_bytes());
    }

    /// Writes a single bit at the cursor without aligning.
    pub fn write_bit(&mut self, bit: bool) {
        let index = self.bit_cursor >> 3;
        let shift = self.bit_cursor & 7;
        if index >= self.data.len() {
            self.data.resize(index + 1, 0);
        }
        if bit {
            self.data[index] |= 1 << shift;
        } else {
            self.data[index] &= !(1 << shift);
        }
        self.bit_cursor += 1;
    }

    /// Writes the low `count` bits of `value`, least significant first.
    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64);
        for i in 0..count.min(64) {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    // Reads

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take_raw(1)?.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(self.take_raw(2)?.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(self.take_raw(4)?.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(self.take_raw(8)?.get_u64_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.take_raw(4)?.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(self.take_raw(8)?.get_i64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(self.take_raw(4)?.get_f32_le())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        self.take_raw(n)
    }

    pub fn read_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take_raw(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn read_bit(&mut self) -> Result<bool, ProtocolError> {
        let index = self.bit_cursor >> 3;
        if index >= self.data.len() {
            return Err(ProtocolError::UnexpectedEof {
                needed: 1,
                available: 0,
            });
        }
        let bit = (self.data[index] >> (self.bit_cursor & 7)) & 1 == 1;
        self.bit_cursor += 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, count: u32) -> Result<u64, ProtocolError> {
        debug_assert!(count <= 64);
        let mut value = 0u64;
        for i in 0..count.min(64) {
            if self.read_bit()? {
                value |= 1 << i;
            }
        }
        Ok(value)
    }

    // Length patching

    /// Writes a zeroed `i64` placeholder at the cursor.
    pub fn reserve_i64(&mut self) -> Reservation {
        self.align();
        let position = self.bit_cursor >> 3;
        self.put_raw(&[0; 8]);
        Reservation { position }
    }

    /// Overwrites a reserved placeholder. The cursor does not move.
    pub fn commit_i64(
        &mut self,
        reservation: Reservation,
        value: i64,
    ) -> Result<(), ProtocolError> {
        let start = reservation.position;
        let end = start + 8;
        if end > self.data.len() {
            return Err(ProtocolError::SeekOutOfRange {
                position: end,
                len: self.data.len(),
            });
        }
        self.data[start..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Read-only cursor over a borrowed byte slice.
///
/// Handlers receive one of these positioned just past the routing header.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.take(n).map(|_| ())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.remaining();
        if n > available {
            return Err(ProtocolError::UnexpectedEof {
                needed: n,
                available,
            });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(self.take(2)?.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(self.take(4)?.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(self.take(8)?.get_u64_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.take(4)?.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(self.take(8)?.get_i64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(self.take(4)?.get_f32_le())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(n)
    }

    pub fn read_str(&mut self) -> Result<&'a str, ProtocolError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }
}
