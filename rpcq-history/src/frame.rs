//! Queue history frames.
//!
//! A frame is one buffer's worth of items for a single (direction, stage)
//! pairing during one slot of the history. Items are appended with a
//! reserve/commit pair so the payload length can be patched in once the
//! caller has finished writing, and each committed item's start offset is
//! recorded so iteration never has to scan.
//!
//! Lifecycle:
//!
//! ```text
//!   Clean --commit--> Dirty --reset, not pinned--> Clean
//!                       |
//!                       +--reset, loopback pinned--> Dirty (kept)
//! ```

use crate::error::HistoryError;
use rpcq_protocol::item::{check_payload_len, read_route, write_route};
use rpcq_protocol::{
    Channel, ItemFlags, ItemHeader, ItemKind, PeerId, ProtocolError, Reservation, UpdateStage,
    WireBuffer, WireReader, MAX_ITEM_PAYLOAD,
};
use std::fmt;

/// Scratch capacity kept across [`QueueHistoryFrame::close`] calls.
const SCRATCH_RETAIN: usize = 4096;

/// Direction of travel for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub const COUNT: usize = 2;

    pub const ALL: [Direction; Self::COUNT] = [Direction::Inbound, Direction::Outbound];

    pub fn index(self) -> usize {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }

    /// Stages that keep a frame in this direction. Inbound items run at
    /// several points of a tick; outbound items are sent once per tick.
    pub fn stages(self) -> &'static [UpdateStage] {
        match self {
            Direction::Inbound => &UpdateStage::ALL,
            Direction::Outbound => &[UpdateStage::SEND],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to an item whose header is written but whose payload length is not
/// yet patched.
#[derive(Debug)]
#[must_use = "a pending item must be committed or aborted"]
pub struct PendingItem {
    start: usize,
    length: Reservation,
    payload_start: usize,
    resume_offset: Option<usize>,
}

impl PendingItem {
    /// Byte offset at which the item starts.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Byte offset at which the payload starts.
    pub fn payload_start(&self) -> usize {
        self.payload_start
    }
}

/// One item parsed back out of a frame.
///
/// Outbound payloads borrow the frame buffer directly. Inbound payloads
/// borrow a scratch copy owned by the frame, which stays valid until the
/// next call to `first_item`, `next_item` or `close`.
#[derive(Debug, Clone, Copy)]
pub struct QueueItem<'a> {
    pub kind: ItemKind,
    pub flags: ItemFlags,
    pub timestamp: f32,
    pub sender: PeerId,
    /// Present on outbound items only.
    pub channel: Option<Channel>,
    /// Empty on inbound items.
    pub targets: &'a [PeerId],
    pub stage: UpdateStage,
    pub payload: &'a [u8],
    /// Offset into `payload` at which the handler resumes reading.
    pub resume_offset: usize,
}

impl<'a> QueueItem<'a> {
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// The part of the payload not yet consumed by routing.
    pub fn args(&self) -> &'a [u8] {
        &self.payload[self.resume_offset.min(self.payload.len())..]
    }

    /// A reader over the payload positioned at the resume offset.
    pub fn reader(&self) -> WireReader<'a> {
        WireReader::new(self.args())
    }
}

#[derive(Debug, Clone, Copy)]
enum PayloadSource {
    Buffer { start: usize },
    Scratch,
}

#[derive(Debug, Clone, Copy)]
struct ItemMeta {
    header: ItemHeader,
    channel: Option<Channel>,
    source: PayloadSource,
    len: usize,
    resume_offset: usize,
}

/// A buffer of serialized items for one (direction, slot, stage) cell.
#[derive(Debug)]
pub struct QueueHistoryFrame {
    direction: Direction,
    stage: UpdateStage,
    buffer: WireBuffer,
    /// Start offset of every committed item, in append order.
    offsets: Vec<usize>,
    read_index: usize,
    dirty: bool,
    has_loopback_data: bool,
    open_item: Option<usize>,
    max_clients: usize,
    scratch: Vec<u8>,
    targets: Vec<PeerId>,
}

impl QueueHistoryFrame {
    pub fn new(
        direction: Direction,
        stage: UpdateStage,
        max_clients: usize,
        capacity: usize,
    ) -> Self {
        Self {
            direction,
            stage,
            buffer: WireBuffer::with_capacity(capacity),
            offsets: Vec::new(),
            read_index: 0,
            dirty: false,
            has_loopback_data: false,
            open_item: None,
            max_clients,
            scratch: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn stage(&self) -> UpdateStage {
        self.stage
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_loopback_data(&self) -> bool {
        self.has_loopback_data
    }

    /// Pins the frame so a slot roll does not reset it.
    pub fn set_loopback_data(&mut self) {
        self.has_loopback_data = true;
    }

    /// Unpins the frame once its loopback items have been consumed.
    pub fn clear_loopback_data(&mut self) {
        self.has_loopback_data = false;
    }

    /// Bytes written to the frame.
    pub fn total_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn item_count(&self) -> usize {
        self.offsets.len()
    }

    /// Start offsets of the committed items, in append order.
    pub fn item_offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn mark_current_position(&mut self) {
        self.buffer.mark();
    }

    pub fn marked_position(&self) -> usize {
        self.buffer.marked_position()
    }

    /// The underlying buffer, for writing an open item's payload.
    pub fn buffer_mut(&mut self) -> &mut WireBuffer {
        &mut self.buffer
    }

    pub fn buffer(&self) -> &WireBuffer {
        &self.buffer
    }

    // Writing

    /// Writes an outbound item header and routing block.
    pub fn begin_outbound(
        &mut self,
        header: &ItemHeader,
        channel: Channel,
        targets: &[PeerId],
    ) -> Result<PendingItem, HistoryError> {
        self.expect_direction(Direction::Outbound)?;
        if targets.len() > self.max_clients {
            return Err(ProtocolError::TargetCountOutOfBounds {
                count: targets.len() as i64,
                max: self.max_clients,
            }
            .into());
        }

        let start = self.open();
        header.write(&mut self.buffer);
        write_route(&mut self.buffer, channel, targets);
        let length = self.buffer.reserve_i64();
        Ok(PendingItem {
            start,
            length,
            payload_start: self.buffer.position(),
            resume_offset: None,
        })
    }

    /// Writes an inbound item header. `resume_offset` is where the handler
    /// starts reading inside the payload.
    pub fn begin_inbound(
        &mut self,
        header: &ItemHeader,
        resume_offset: usize,
    ) -> Result<PendingItem, HistoryError> {
        self.expect_direction(Direction::Inbound)?;

        let start = self.open();
        header.write(&mut self.buffer);
        let length = self.buffer.reserve_i64();
        self.buffer.write_i64(resume_offset as i64);
        Ok(PendingItem {
            start,
            length,
            payload_start: self.buffer.position(),
            resume_offset: Some(resume_offset),
        })
    }

    /// Patches the payload length of an open item and records its offset.
    ///
    /// Returns the payload length. A payload outside `1..MAX_ITEM_PAYLOAD`
    /// rolls the item back.
    pub fn commit(&mut self, item: PendingItem) -> Result<usize, HistoryError> {
        if self.open_item != Some(item.start) {
            return Err(HistoryError::StalePendingItem {
                start: item.start,
                len: self.buffer.len(),
            });
        }

        self.buffer.seek_to_end();
        let len = self.buffer.position().saturating_sub(item.payload_start);
        debug_assert!(len > 0, "committed an item with an empty payload");
        if len == 0 {
            self.rollback(item.start);
            return Err(ProtocolError::EmptyPayload.into());
        }
        if len >= MAX_ITEM_PAYLOAD {
            self.rollback(item.start);
            return Err(ProtocolError::PayloadOutOfBounds {
                size: len as i64,
                max: MAX_ITEM_PAYLOAD,
            }
            .into());
        }
        if let Some(offset) = item.resume_offset {
            if offset > len {
                self.rollback(item.start);
                return Err(ProtocolError::ResumeOffsetOutOfBounds {
                    offset: offset as i64,
                    len,
                }
                .into());
            }
        }

        self.buffer.commit_i64(item.length, len as i64)?;
        self.offsets.push(item.start);
        self.open_item = None;
        self.dirty = true;
        Ok(len)
    }

    /// Discards an open item.
    pub fn abort(&mut self, item: PendingItem) {
        if self.open_item == Some(item.start) {
            self.rollback(item.start);
        }
    }

    /// Writes a complete outbound item.
    pub fn push_outbound(
        &mut self,
        header: &ItemHeader,
        channel: Channel,
        targets: &[PeerId],
        payload: &[u8],
    ) -> Result<usize, HistoryError> {
        let item = self.begin_outbound(header, channel, targets)?;
        self.buffer.write_bytes(payload);
        self.commit(item)
    }

    /// Writes a complete inbound item.
    pub fn push_inbound(
        &mut self,
        header: &ItemHeader,
        payload: &[u8],
        resume_offset: usize,
    ) -> Result<usize, HistoryError> {
        let item = self.begin_inbound(header, resume_offset)?;
        self.buffer.write_bytes(payload);
        self.commit(item)
    }

    fn expect_direction(&self, expected: Direction) -> Result<(), HistoryError> {
        if self.direction != expected {
            return Err(HistoryError::WrongDirection {
                expected,
                actual: self.direction,
            });
        }
        Ok(())
    }

    fn open(&mut self) -> usize {
        if let Some(stale) = self.open_item {
            tracing::warn!(
                "{} frame for {}: discarding uncommitted item at offset {}",
                self.direction,
                self.stage,
                stale
            );
            self.rollback(stale);
        }
        self.buffer.seek_to_end();
        let start = self.buffer.position();
        self.buffer.mark();
        self.open_item = Some(start);
        start
    }

    fn rollback(&mut self, start: usize) {
        self.buffer.truncate(start);
        self.buffer.seek_to_end();
        self.open_item = None;
    }

    // Reading

    /// Rewinds to the first item and parses it.
    ///
    /// Returns `None` when nothing was written.
    pub fn first_item(&mut self) -> Option<QueueItem<'_>> {
        self.read_index = 0;
        if self.buffer.is_empty() {
            return None;
        }
        self.next_item()
    }

    /// Parses the item at the next recorded offset.
    ///
    /// Returns `None` once the offsets are exhausted. A corrupt item also
    /// returns `None` and ends the iteration of this frame.
    pub fn next_item(&mut self) -> Option<QueueItem<'_>> {
        let start = *self.offsets.get(self.read_index)?;
        self.read_index += 1;

        let meta = match self.decode_at(start) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(
                    "{} frame for {}: corrupt item at offset {}, abandoning frame: {}",
                    self.direction,
                    self.stage,
                    start,
                    e
                );
                self.read_index = self.offsets.len();
                return None;
            }
        };
        Some(self.view(meta))
    }

    /// Resets the per-item scratch state. The frame's items are untouched.
    pub fn close(&mut self) {
        self.read_index = 0;
        self.scratch.clear();
        self.scratch.shrink_to(SCRATCH_RETAIN);
        self.targets.clear();
    }

    fn decode_at(&mut self, start: usize) -> Result<ItemMeta, ProtocolError> {
        let mut reader = self.buffer.reader_at(start)?;
        let header = ItemHeader::read(&mut reader)?;

        match self.direction {
            Direction::Outbound => {
                let channel = read_route(&mut reader, self.max_clients, &mut self.targets)?;
                let len = check_payload_len(reader.read_i64()?)?;
                let payload_start = reader.position();
                reader.skip(len)?;
                Ok(ItemMeta {
                    header,
                    channel: Some(channel),
                    source: PayloadSource::Buffer {
                        start: payload_start,
                    },
                    len,
                    resume_offset: 0,
                })
            }
            Direction::Inbound => {
                self.targets.clear();
                let len = check_payload_len(reader.read_i64()?)?;
                let resume = reader.read_i64()?;
                if resume < 0 || resume as usize > len {
                    return Err(ProtocolError::ResumeOffsetOutOfBounds {
                        offset: resume,
                        len,
                    });
                }
                let payload = reader.read_bytes(len)?;
                self.scratch.clear();
                self.scratch.extend_from_slice(payload);
                Ok(ItemMeta {
                    header,
                    channel: None,
                    source: PayloadSource::Scratch,
                    len,
                    resume_offset: resume as usize,
                })
            }
        }
    }

    fn view(&self, meta: ItemMeta) -> QueueItem<'_> {
        let payload = match meta.source {
            PayloadSource::Buffer { start } => &self.buffer.as_slice()[start..start + meta.len],
            PayloadSource::Scratch => &self.scratch[..meta.len],
        };
        QueueItem {
            kind: meta.header.kind,
            flags: meta.header.flags,
            timestamp: meta.header.timestamp,
            sender: meta.header.sender,
            channel: meta.channel,
            targets: &self.targets,
            stage: self.stage,
            payload,
            resume_offset: meta.resume_offset,
        }
    }

    // Lifecycle

    /// Clears the frame unless it is pinned by loopback data.
    ///
    /// Returns whether the frame was cleared.
    pub fn reset(&mut self) -> bool {
        if self.has_loopback_data {
            return false;
        }
        self.buffer.clear();
        self.offsets.clear();
        self.read_index = 0;
        self.open_item = None;
        self.dirty = false;
        true
    }
}
