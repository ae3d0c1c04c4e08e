//! Per-message routing header.
//!
//! Every RPC or lifecycle message starts with this header so a receiver can
//! pick the inbound stage cell and the handler without touching the
//! arguments:
//!
//! ```text
//! +------+-------+-----------+
//! | kind | stage | method_id |
//! |  u8  |  u8   |    u64    |
//! +------+-------+-----------+
//! ```

use crate::buffer::{WireBuffer, WireReader};
use crate::error::ProtocolError;
use crate::item::ItemKind;
use crate::stage::UpdateStage;

/// Size of the routing header in bytes (1+1+8 = 10).
pub const MESSAGE_HEADER_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: ItemKind,
    /// Stage at which the receiver invokes the handler.
    pub stage: UpdateStage,
    pub method_id: u64,
}

impl MessageHeader {
    pub fn new(kind: ItemKind, stage: UpdateStage, method_id: u64) -> Self {
        Self {
            kind,
            stage,
            method_id,
        }
    }

    pub fn write(&self, buf: &mut WireBuffer) {
        buf.write_u8(self.kind.as_u16() as u8);
        buf.write_u8(self.stage.as_u8());
        buf.write_u64(self.method_id);
    }

    pub fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let kind = ItemKind::from_u16(reader.read_u8()? as u16)?;
        let stage = UpdateStage::from_u8(reader.read_u8()?)?;
        let method_id = reader.read_u64()?;
        Ok(Self {
            kind,
            stage,
            method_id,
        })
    }

    /// Parses the header at the start of a complete message.
    pub fn peek(message: &[u8]) -> Result<Self, ProtocolError> {
        Self::read(&mut WireReader::new(message))
    }

    /// Builds a complete message from a header and already serialized arguments.
    pub fn encode_message(&self, args: &[u8]) -> Vec<u8> {
        let mut buf = WireBuffer::with_capacity(MESSAGE_HEADER_SIZE + args.len());
        self.write(&mut buf);
        buf.write_bytes(args);
        buf.as_slice().to_vec()
    }
}
