//! Delivery channels.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical channel an item is sent on.
///
/// Reliable channels are carried as ordered byte streams by the transport;
/// the rest are independent datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Channel {
    Internal = 0,
    TimeSync = 1,
    ReliableRpc = 2,
    UnreliableRpc = 3,
    SyncChannel = 4,
    DefaultMessage = 5,
    PositionUpdate = 6,
    AnimationUpdate = 7,
    NavAgentState = 8,
    NavAgentCorrection = 9,
}

impl Channel {
    pub const ALL: [Channel; 10] = [
        Channel::Internal,
        Channel::TimeSync,
        Channel::ReliableRpc,
        Channel::UnreliableRpc,
        Channel::SyncChannel,
        Channel::DefaultMessage,
        Channel::PositionUpdate,
        Channel::AnimationUpdate,
        Channel::NavAgentState,
        Channel::NavAgentCorrection,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::InvalidChannel(value))
    }

    /// Returns whether the channel is delivered as an ordered reliable stream.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Channel::Internal
                | Channel::ReliableRpc
                | Channel::SyncChannel
                | Channel::DefaultMessage
        )
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Internal => "internal",
            Channel::TimeSync => "time_sync",
            Channel::ReliableRpc => "reliable_rpc",
            Channel::UnreliableRpc => "unreliable_rpc",
            Channel::SyncChannel => "sync",
            Channel::DefaultMessage => "default_message",
            Channel::PositionUpdate => "position_update",
            Channel::AnimationUpdate => "animation_update",
            Channel::NavAgentState => "nav_agent_state",
            Channel::NavAgentCorrection => "nav_agent_correction",
        };
        f.write_str(name)
    }
}
