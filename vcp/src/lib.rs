// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Offload channel to the video co-processor (VCP).
//!
//! The multimedia QoS engine can hand its per-segment computation to a separate, lower-power
//! processor instead of programming the bus itself. This crate implements the host side of
//! that hand-off:
//!
//! - a shared-memory region ([`ShmRegion`]) holding synchronization words and the payload,
//! - the fixed-layout doorbell [`Message`] sent over the inter-processor interrupt,
//! - power reference counting of the co-processor ([`Offload::enable`]),
//! - the two-phase, timeout-bounded round-trip ([`Offload::send`]),
//! - a one-shot background task waiting for the peer to come up ([`Offload::start`]).
//!
//! The peer itself is abstracted behind [`VcpPeer`] so that the protocol can be exercised
//! against an in-memory fake.

#![deny(clippy::all, clippy::pedantic, clippy::unwrap_used)]
#![allow(clippy::missing_errors_doc)]

mod channel;
mod errors;
mod msg;
mod peer;
mod shm;

// re-exports
pub use channel::{Offload, OffloadParams, OffloadState};
pub use errors::{VcpError, WaitPhase};
pub use msg::{Function, Message};
pub use peer::{PeerError, Transmit, VcpEvent, VcpListener, VcpPeer};
pub use shm::{ShmRegion, layout};
