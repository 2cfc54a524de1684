// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interface to the co-processor driver.

use crate::msg::Message;
use std::sync::Weak;

/// Opaque failure reported by the co-processor driver.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PeerError(pub String);

/// Outcome of a single attempt to ring the co-processor doorbell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transmit {
    /// The message was delivered.
    Done,
    /// The doorbell is still owned by a previous message; try again later.
    Busy,
    /// Delivery failed for good.
    Failed(PeerError),
}

/// Power and readiness notifications from the co-processor driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum VcpEvent {
    #[strum(serialize = "ready")]
    Ready,
    #[strum(serialize = "stop")]
    Stop,
}

pub trait VcpListener: Send + Sync {
    fn notify(&self, event: VcpEvent);
}

/// The co-processor driver as seen by the offload channel.
pub trait VcpPeer: Send + Sync {
    /// True once the co-processor firmware is up and serving messages.
    fn is_ready(&self) -> bool;
    /// True while the co-processor is on its way to suspend.
    fn is_suspending(&self) -> bool;
    /// Take a reference on the shared co-processor feature (powers it up).
    fn register_feature(&self) -> Result<(), PeerError>;
    /// Drop the reference taken by [`VcpPeer::register_feature`].
    fn deregister_feature(&self);
    /// Ring the doorbell once.
    fn transmit(&self, msg: &[u8; Message::LEN]) -> Transmit;
    /// Register for power/readiness notifications.
    fn subscribe(&self, listener: Weak<dyn VcpListener>);
}
