//! Queue item headers.
//!
//! Every item in a history frame starts with a fixed header. Outbound items
//! carry their routing next, then a patched payload length. Inbound items
//! carry a resume offset after the length instead of routing:
//!
//! ```text
//! +------+-------+-----------+--------+
//! | kind | flags | timestamp | sender |          common, 16 bytes
//! | u16  | u16   |   f32     |  u64   |
//! +------+-------+-----------+--------+
//!
//! outbound: | channel u8 | count i32 | count x u64 target | len i64 | payload |
//! inbound:  | len i64 | resume i64 | payload |
//! ```
//!
//! All fields are little-endian.

use crate::buffer::{WireBuffer, WireReader};
use crate::channel::Channel;
use crate::error::ProtocolError;
use crate::{PeerId, MAX_ITEM_PAYLOAD};

/// Size of the common item header in bytes (2+2+4+8 = 16).
pub const ITEM_HEADER_SIZE: usize = 16;

/// What an item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ItemKind {
    ServerRpc = 0,
    ClientRpc = 1,
    CreateObject = 2,
    DestroyObject = 3,
}

impl ItemKind {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(ItemKind::ServerRpc),
            1 => Ok(ItemKind::ClientRpc),
            2 => Ok(ItemKind::CreateObject),
            3 => Ok(ItemKind::DestroyObject),
            other => Err(ProtocolError::InvalidItemKind(other)),
        }
    }

    /// Object lifecycle notifications, as opposed to RPCs.
    pub fn is_lifecycle(self) -> bool {
        matches!(self, ItemKind::CreateObject | ItemKind::DestroyObject)
    }
}

/// Item flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemFlags(u16);

impl ItemFlags {
    /// The item was delivered in-process rather than over the transport.
    pub const LOOPBACK: u16 = 1 << 0;
    /// The item is an internal lifecycle message.
    pub const INTERNAL: u16 = 1 << 1;

    const VALID_MASK: u16 = 0x0003;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_loopback(mut self) -> Self {
        self.0 |= Self::LOOPBACK;
        self
    }

    pub fn with_internal(mut self) -> Self {
        self.0 |= Self::INTERNAL;
        self
    }

    pub fn is_loopback(&self) -> bool {
        self.0 & Self::LOOPBACK != 0
    }

    pub fn is_internal(&self) -> bool {
        self.0 & Self::INTERNAL != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// Common header written at the start of every item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemHeader {
    pub kind: ItemKind,
    pub flags: ItemFlags,
    /// Network time at which the item was queued, in seconds.
    pub timestamp: f32,
    pub sender: PeerId,
}

impl ItemHeader {
    pub fn new(kind: ItemKind, sender: PeerId, timestamp: f32) -> Self {
        Self {
            kind,
            flags: ItemFlags::new(),
            timestamp,
            sender,
        }
    }

    pub fn with_flags(mut self, flags: ItemFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn write(&self, buf: &mut WireBuffer) {
        buf.write_u16(self.kind.as_u16());
        buf.write_u16(self.flags.bits());
        buf.write_f32(self.timestamp);
        buf.write_u64(self.sender);
    }

    pub fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let kind = ItemKind::from_u16(reader.read_u16()?)?;
        let flags = ItemFlags::from_bits(reader.read_u16()?)?;
        let timestamp = reader.read_f32()?;
        let sender = reader.read_u64()?;
        Ok(Self {
            kind,
            flags,
            timestamp,
            sender,
        })
    }
}

/// Writes the outbound routing block: channel, target count and targets.
pub fn write_route(buf: &mut WireBuffer, channel: Channel, targets: &[PeerId]) {
    buf.write_u8(channel.as_u8());
    buf.write_i32(targets.len() as i32);
    for target in targets {
        buf.write_u64(*target);
    }
}

/// Reads an outbound routing block into `targets`, replacing its contents.
///
/// A negative count or one above `max_clients` is rejected before any
/// target is read.
pub fn read_route(
    reader: &mut WireReader<'_>,
    max_clients: usize,
    targets: &mut Vec<PeerId>,
) -> Result<Channel, ProtocolError> {
    let channel = Channel::from_u8(reader.read_u8()?)?;
    let count = reader.read_i32()?;
    if count < 0 || count as usize > max_clients {
        return Err(ProtocolError::TargetCountOutOfBounds {
            count: count as i64,
            max: max_clients,
        });
    }
    targets.clear();
    for _ in 0..count {
        targets.push(reader.read_u64()?);
    }
    Ok(channel)
}

/// Validates a payload length read back from a frame.
pub fn check_payload_len(len: i64) -> Result<usize, ProtocolError> {
    if len <= 0 || len >= MAX_ITEM_PAYLOAD as i64 {
        return Err(ProtocolError::PayloadOutOfBounds {
            size: len,
            max: MAX_ITEM_PAYLOAD,
        });
    }
    Ok(len as usize)
}
