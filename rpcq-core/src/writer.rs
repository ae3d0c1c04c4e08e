//! Guard for writing one RPC into the frame history.

use crate::error::CoreError;
use rpcq_history::{FrameHistoryTable, PendingItem, QueueHistoryFrame, SlotTarget};
use rpcq_protocol::{
    Channel, ItemFlags, ItemHeader, MessageHeader, PeerId, UpdateStage, WireBuffer,
    MESSAGE_HEADER_SIZE,
};
use std::ops::{Deref, DerefMut};

/// Frame an open item is written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    /// Current outbound send frame.
    Send,
    /// Inbound frame for the stage, one slot ahead.
    Loopback(UpdateStage),
}

impl Destination {
    fn frame(self, table: &FrameHistoryTable) -> &QueueHistoryFrame {
        match self {
            Destination::Send => table.outbound(SlotTarget::Current),
            Destination::Loopback(stage) => table.inbound(stage, SlotTarget::Next),
        }
    }

    fn frame_mut(self, table: &mut FrameHistoryTable) -> &mut QueueHistoryFrame {
        match self {
            Destination::Send => table.outbound_mut(SlotTarget::Current),
            Destination::Loopback(stage) => table.inbound_mut(stage, SlotTarget::Next),
        }
    }
}

/// Writes the arguments of one RPC.
///
/// Dereferences to the frame buffer the arguments go into. Call
/// [`finish`](Self::finish) to commit; dropping the writer discards the item.
///
/// Messages for remote peers go into the outbound send frame. Messages for
/// the local peer are delivered in-process: they land in the inbound frame
/// for their stage one slot ahead, which pins that frame until it has been
/// drained.
pub struct RpcWriter<'a> {
    table: &'a mut FrameHistoryTable,
    scratch: &'a mut Vec<u8>,
    pending: Option<PendingItem>,
    destination: Destination,
    header: ItemHeader,
    invoke_stage: UpdateStage,
    /// Also deliver a copy to the local peer on commit.
    loopback_copy: bool,
}

impl<'a> RpcWriter<'a> {
    /// Opens an outbound item for `targets`, none of which is the local peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn outbound(
        table: &'a mut FrameHistoryTable,
        scratch: &'a mut Vec<u8>,
        header: ItemHeader,
        channel: Channel,
        targets: &[PeerId],
        message: MessageHeader,
        loopback_copy: bool,
    ) -> Result<Self, CoreError> {
        let cell = Destination::Send.frame_mut(table);
        let pending = cell.begin_outbound(&header, channel, targets)?;
        message.write(cell.buffer_mut());
        Ok(Self {
            table,
            scratch,
            pending: Some(pending),
            destination: Destination::Send,
            header,
            invoke_stage: message.stage,
            loopback_copy,
        })
    }

    /// Opens an item delivered only to the local peer.
    pub(crate) fn local(
        table: &'a mut FrameHistoryTable,
        scratch: &'a mut Vec<u8>,
        header: ItemHeader,
        message: MessageHeader,
    ) -> Result<Self, CoreError> {
        let header = header.with_flags(header.flags.with_loopback());
        let destination = Destination::Loopback(message.stage);
        let cell = destination.frame_mut(table);
        let pending = cell.begin_inbound(&header, MESSAGE_HEADER_SIZE)?;
        message.write(cell.buffer_mut());
        Ok(Self {
            table,
            scratch,
            pending: Some(pending),
            destination,
            header,
            invoke_stage: message.stage,
            loopback_copy: false,
        })
    }

    /// Stage at which the receiver invokes the handler.
    pub fn stage(&self) -> UpdateStage {
        self.invoke_stage
    }

    /// Commits the item. Returns the message length in bytes.
    pub fn finish(mut self) -> Result<usize, CoreError> {
        let Some(pending) = self.pending.take() else {
            return Err(CoreError::NotInitialized);
        };
        let payload_start = pending.payload_start();

        let cell = self.destination.frame_mut(&mut *self.table);
        let len = cell.commit(pending)?;

        if let Destination::Loopback(_) = self.destination {
            cell.set_loopback_data();
        } else if self.loopback_copy {
            self.scratch.clear();
            self.scratch
                .extend_from_slice(&cell.buffer().as_slice()[payload_start..payload_start + len]);

            let header = self
                .header
                .with_flags(ItemFlags::new().with_loopback());
            let local = Destination::Loopback(self.invoke_stage).frame_mut(&mut *self.table);
            local.push_inbound(&header, &self.scratch[..], MESSAGE_HEADER_SIZE)?;
            local.set_loopback_data();
        }

        Ok(len)
    }
}

impl Deref for RpcWriter<'_> {
    type Target = WireBuffer;

    fn deref(&self) -> &WireBuffer {
        self.destination.frame(&*self.table).buffer()
    }
}

impl DerefMut for RpcWriter<'_> {
    fn deref_mut(&mut self) -> &mut WireBuffer {
        self.destination.frame_mut(&mut *self.table).buffer_mut()
    }
}

impl Drop for RpcWriter<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!("Discarding unfinished RPC for {}", self.invoke_stage);
            self.destination.frame_mut(&mut *self.table).abort(pending);
        }
    }
}
