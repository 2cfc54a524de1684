// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Doorbell message sent to the co-processor.

use static_assertions::const_assert_eq;

/// Functions the co-processor implements on behalf of the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum Function {
    /// Hand over the shared-memory base and start serving requests.
    #[strum(serialize = "init")]
    Init = 0,
    /// Test-injection round-trip; the index carries the injected id.
    #[strum(serialize = "test")]
    Test = 1,
    /// Reload the complete bandwidth state from shared memory.
    #[strum(serialize = "sync-state")]
    SyncState = 2,
    /// Recompute one bus segment from the payload area; the index names the segment.
    #[strum(serialize = "comm-bw")]
    CommBw = 3,
}

impl Function {
    /// Bit of this function in the in-flight and acknowledgment words.
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

/// Fixed-layout message: function id, index, acknowledgment request and the 32-bit base
/// address of the shared-memory region.
///
/// ```text
/// byte 0   1     2    3     4..8
///      fn  index ack  rsvd  base (little endian)
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub func: Function,
    pub index: u8,
    pub ack: bool,
    pub base: u32,
}

const_assert_eq!(Message::LEN, 2 * size_of::<u32>());

impl Message {
    /// Encoded length: two 32-bit words.
    pub const LEN: usize = 8;

    #[must_use]
    pub fn new(func: Function, index: u8, base: u32) -> Self {
        Self {
            func,
            index,
            ack: true,
            base,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let base = self.base.to_le_bytes();
        [
            self.func as u8,
            self.index,
            u8::from(self.ack),
            0,
            base[0],
            base[1],
            base[2],
            base[3],
        ]
    }

    /// Decode a message, as the peer would. Returns `None` for an unknown function id.
    #[must_use]
    pub fn from_bytes(raw: &[u8; Self::LEN]) -> Option<Self> {
        Some(Self {
            func: Function::from_repr(raw[0])?,
            index: raw[1],
            ack: raw[2] != 0,
            base: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }
}
