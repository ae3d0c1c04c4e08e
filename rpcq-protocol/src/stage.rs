//! Update stages within one simulation tick.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point within one tick at which inbound RPCs may be invoked.
///
/// `Ord` follows the order in which a tick visits the stages, which is not
/// the order of the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UpdateStage {
    Initialization = 1,
    EarlyUpdate = 2,
    FixedUpdate = 3,
    PreUpdate = 4,
    Update = 0,
    PreLateUpdate = 5,
    PostLateUpdate = 6,
}

impl UpdateStage {
    /// Number of stages.
    pub const COUNT: usize = 7;

    /// All stages in processing order.
    pub const ALL: [UpdateStage; Self::COUNT] = [
        UpdateStage::Initialization,
        UpdateStage::EarlyUpdate,
        UpdateStage::FixedUpdate,
        UpdateStage::PreUpdate,
        UpdateStage::Update,
        UpdateStage::PreLateUpdate,
        UpdateStage::PostLateUpdate,
    ];

    /// The stage whose pass also drains the outbound queue.
    pub const SEND: UpdateStage = UpdateStage::PostLateUpdate;

    /// Dense index in processing order, in `0..COUNT`.
    pub fn index(self) -> usize {
        match self {
            UpdateStage::Initialization => 0,
            UpdateStage::EarlyUpdate => 1,
            UpdateStage::FixedUpdate => 2,
            UpdateStage::PreUpdate => 3,
            UpdateStage::Update => 4,
            UpdateStage::PreLateUpdate => 5,
            UpdateStage::PostLateUpdate => 6,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(UpdateStage::Update),
            1 => Ok(UpdateStage::Initialization),
            2 => Ok(UpdateStage::EarlyUpdate),
            3 => Ok(UpdateStage::FixedUpdate),
            4 => Ok(UpdateStage::PreUpdate),
            5 => Ok(UpdateStage::PreLateUpdate),
            6 => Ok(UpdateStage::PostLateUpdate),
            other => Err(ProtocolError::InvalidStage(other)),
        }
    }

    /// Returns true for the end-of-tick stage that drives sending.
    pub fn is_send_stage(self) -> bool {
        self == Self::SEND
    }
}

impl PartialOrd for UpdateStage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UpdateStage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index().cmp(&other.index())
    }
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateStage::Initialization => "initialization",
            UpdateStage::EarlyUpdate => "early_update",
            UpdateStage::FixedUpdate => "fixed_update",
            UpdateStage::PreUpdate => "pre_update",
            UpdateStage::Update => "update",
            UpdateStage::PreLateUpdate => "pre_late_update",
            UpdateStage::PostLateUpdate => "post_late_update",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_matches_processing_order() {
        for (i, stage) in UpdateStage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
        let mut sorted = UpdateStage::ALL;
        sorted.sort();
        assert_eq!(sorted, UpdateStage::ALL);
    }

    #[test]
    fn test_wire_values() {
        assert_eq!(UpdateStage::Update.as_u8(), 0);
        assert_eq!(UpdateStage::Initialization.as_u8(), 1);
        assert_eq!(UpdateStage::PostLateUpdate.as_u8(), 6);

        for stage in UpdateStage::ALL {
            assert_eq!(UpdateStage::from_u8(stage.as_u8()).unwrap(), stage);
        }
        assert_eq!(
            UpdateStage::from_u8(7).unwrap_err(),
            ProtocolError::InvalidStage(7)
        );
    }

    #[test]
    fn test_only_last_stage_sends() {
        let senders: Vec<_> = UpdateStage::ALL
            .iter()
            .filter(|s| s.is_send_stage())
            .collect();
        assert_eq!(senders, vec![&UpdateStage::PostLateUpdate]);
        assert_eq!(UpdateStage::ALL.last(), Some(&UpdateStage::SEND));
    }
}
