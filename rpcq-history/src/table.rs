//! Fixed-depth circular history of frames.
//!
//! Frames live in one flat vector. Inbound keeps a frame per stage in every
//! slot; outbound is sent once per tick and keeps only the send stage:
//!
//! ```text
//!            slot 0          slot 1          ...   slot n-1
//! inbound  [ s0 s1 .. s6 ] [ s0 s1 .. s6 ] ... [ s0 .. s6 ]
//! outbound [ send ]        [ send ]        ... [ send ]
//!
//! index = base(direction) + slot * stages(direction) + stage position
//! ```
//!
//! Each direction has its own current slot. Rolling a direction resets every
//! dirty frame in its current slot, except frames pinned by loopback data,
//! and moves the cursor one slot forward with wraparound.

use crate::config::HistoryConfig;
use crate::error::HistoryError;
use crate::frame::{Direction, QueueHistoryFrame};
use crate::stats::StatsSink;
use crate::MIN_HISTORY_SLOTS;
use rpcq_protocol::UpdateStage;

/// Which slot a cell lookup resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTarget {
    /// The slot being produced into and drained this pass.
    Current,
    /// The slot after the current one, used for loopback writes.
    Next,
}

/// Frames for both directions across every slot.
#[derive(Debug)]
pub struct FrameHistoryTable {
    config: HistoryConfig,
    slots: usize,
    frames: Vec<QueueHistoryFrame>,
    current: [usize; Direction::COUNT],
    frames_processed: [u64; Direction::COUNT],
}

impl FrameHistoryTable {
    /// Allocates every frame up front.
    pub fn new(config: HistoryConfig) -> Result<Self, HistoryError> {
        config.validate()?;
        let slots = config.depth + MIN_HISTORY_SLOTS;

        let total = Direction::ALL
            .iter()
            .map(|direction| slots * direction.stages().len())
            .sum();
        let mut frames = Vec::with_capacity(total);
        for direction in Direction::ALL {
            for _ in 0..slots {
                for &stage in direction.stages() {
                    frames.push(QueueHistoryFrame::new(
                        direction,
                        stage,
                        config.max_clients,
                        config.frame_capacity,
                    ));
                }
            }
        }

        tracing::debug!(
            "Frame history allocated: {} slots, {} frames",
            slots,
            frames.len()
        );

        Ok(Self {
            config,
            slots,
            frames,
            current: [0; Direction::COUNT],
            frames_processed: [0; Direction::COUNT],
        })
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Number of slots per direction.
    pub fn total_slots(&self) -> usize {
        self.slots
    }

    pub fn current_slot(&self, direction: Direction) -> usize {
        self.current[direction.index()]
    }

    pub fn next_slot(&self, direction: Direction) -> usize {
        (self.current_slot(direction) + 1) % self.slots
    }

    /// Number of times `direction` has been advanced.
    pub fn frames_processed(&self, direction: Direction) -> u64 {
        self.frames_processed[direction.index()]
    }

    /// Index of the first frame of `slot` in `direction`.
    fn slot_base(&self, direction: Direction, slot: usize) -> usize {
        let inbound = self.slots * Direction::Inbound.stages().len();
        match direction {
            Direction::Inbound => slot * UpdateStage::COUNT,
            Direction::Outbound => inbound + slot,
        }
    }

    fn index(&self, direction: Direction, slot: usize, stage: UpdateStage) -> Option<usize> {
        let position = match direction {
            Direction::Inbound => stage.index(),
            Direction::Outbound if stage == UpdateStage::SEND => 0,
            Direction::Outbound => return None,
        };
        Some(self.slot_base(direction, slot) + position)
    }

    fn slot_for(&self, direction: Direction, target: SlotTarget) -> usize {
        match target {
            SlotTarget::Current => self.current_slot(direction),
            SlotTarget::Next => self.next_slot(direction),
        }
    }

    /// The inbound frame for `stage` in the current or next slot.
    pub fn inbound(&self, stage: UpdateStage, target: SlotTarget) -> &QueueHistoryFrame {
        let slot = self.slot_for(Direction::Inbound, target);
        &self.frames[self.slot_base(Direction::Inbound, slot) + stage.index()]
    }

    pub fn inbound_mut(&mut self, stage: UpdateStage, target: SlotTarget) -> &mut QueueHistoryFrame {
        let slot = self.slot_for(Direction::Inbound, target);
        let index = self.slot_base(Direction::Inbound, slot) + stage.index();
        &mut self.frames[index]
    }

    /// The outbound send frame in the current or next slot.
    pub fn outbound(&self, target: SlotTarget) -> &QueueHistoryFrame {
        let slot = self.slot_for(Direction::Outbound, target);
        &self.frames[self.slot_base(Direction::Outbound, slot)]
    }

    pub fn outbound_mut(&mut self, target: SlotTarget) -> &mut QueueHistoryFrame {
        let slot = self.slot_for(Direction::Outbound, target);
        let index = self.slot_base(Direction::Outbound, slot);
        &mut self.frames[index]
    }

    /// The frame for `stage` in the current or next slot, or `None` if
    /// `direction` keeps no frame for `stage`.
    pub fn cell(
        &self,
        direction: Direction,
        stage: UpdateStage,
        target: SlotTarget,
    ) -> Option<&QueueHistoryFrame> {
        let slot = self.slot_for(direction, target);
        self.cell_at(direction, slot, stage)
    }

    /// The frame at an explicit slot, or `None` if the slot or the stage does
    /// not exist for `direction`.
    pub fn cell_at(
        &self,
        direction: Direction,
        slot: usize,
        stage: UpdateStage,
    ) -> Option<&QueueHistoryFrame> {
        if slot >= self.slots {
            tracing::error!(
                "No {} frame at slot {} (table has {} slots)",
                direction,
                slot,
                self.slots
            );
            return None;
        }
        match self.index(direction, slot, stage) {
            Some(index) => Some(&self.frames[index]),
            None => {
                tracing::error!("No {} frame for {}", direction, stage);
                None
            }
        }
    }

    /// Returns whether the next slot holds loopback data waiting to be drained.
    pub fn has_pending_loopback(&self, direction: Direction) -> bool {
        let base = self.slot_base(direction, self.next_slot(direction));
        let count = direction.stages().len();
        self.frames[base..base + count]
            .iter()
            .any(|frame| frame.is_dirty() && frame.has_loopback_data())
    }

    /// Rolls `direction` to its next slot.
    ///
    /// Every dirty frame in the current slot reports its size to `stats` and
    /// is reset unless pinned by loopback data. Returns the new current slot.
    pub fn advance(&mut self, direction: Direction, stats: &dyn StatsSink) -> usize {
        let slot = self.current_slot(direction);
        let base = self.slot_base(direction, slot);
        let count = direction.stages().len();
        for frame in &mut self.frames[base..base + count] {
            if !frame.is_dirty() {
                continue;
            }
            stats.record_queue_size(direction, frame.total_size());
            if !frame.reset() {
                tracing::trace!(
                    "Keeping loopback-pinned {} frame for {} in slot {}",
                    direction,
                    frame.stage(),
                    slot
                );
            }
        }

        self.frames_processed[direction.index()] += 1;
        let next = (slot + 1) % self.slots;
        self.current[direction.index()] = next;
        tracing::trace!("Advanced {} history to slot {}", direction, next);
        next
    }

    /// Iterates every frame of one direction, slot by slot.
    pub fn frames(&self, direction: Direction) -> impl Iterator<Item = &QueueHistoryFrame> {
        let start = self.slot_base(direction, 0);
        let len = self.slots * direction.stages().len();
        self.frames[start..start + len].iter()
    }

    /// Unpins and clears every frame, and rewinds both cursors.
    pub fn clear(&mut self) {
        for frame in &mut self.frames {
            frame.clear_loopback_data();
            frame.close();
            frame.reset();
        }
        self.current = [0; Direction::COUNT];
    }
}
