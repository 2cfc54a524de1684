// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Offload channel errors

use crate::peer::PeerError;

/// The two bounded waits of a round-trip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum WaitPhase {
    /// Waiting for the peer to accept the doorbell message.
    #[strum(serialize = "peer-ready")]
    PeerReady,
    /// Waiting for the peer to raise the acknowledgment bit.
    #[strum(serialize = "ack")]
    Ack,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VcpError {
    #[error("co-processor is not ready")]
    NotReady,
    #[error("co-processor is suspending")]
    Busy,
    #[error("timed out waiting for {phase} after {polls} polls")]
    TimedOut { phase: WaitPhase, polls: u32 },
    #[error("co-processor went away while waiting for {0}")]
    PeerLeft(WaitPhase),
    #[error("co-processor power released more often than requested")]
    Unbalanced,
    #[error("payload of {0} words does not fit in shared memory")]
    PayloadTooLarge(usize),
    #[error("transport failure: {0}")]
    Transport(#[from] PeerError),
}
