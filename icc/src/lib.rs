// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bandwidth QoS for the multimedia interconnect.
//!
//! Hardware ports (display, camera, video codecs) share one memory through a bus fabric. This
//! crate turns their individual bandwidth requests into bus settings:
//!
//! - requests are aggregated up a fixed four-level tree: leaf port, local arbiter (larb),
//!   common port and common bus ([`aggregate`]),
//! - every common port is accounted on a physical memory channel, and channel imbalance
//!   derates the usable bandwidth ([`channel`]),
//! - aggregates become outstanding-transaction limits, limiter values, bus operating points
//!   and memory-controller steps ([`translate`]),
//! - a segment's computation may be handed to a co-processor instead ([`vcp`]),
//! - the last updates of every entity are kept for postmortem dumps ([`history`]).
//!
//! Everything hangs off a [`Topology`], built once through a [`TopologyBuilder`]. Runtime
//! entry points never fail: problems are logged and the update is skipped.
//!
//! ## Features
//!
//! - `testing`: exposes in-memory fakes of every external service in [`fake`].
//! - `bolero`: derives value generators for fuzzing.

#![deny(clippy::all, clippy::pedantic, clippy::unwrap_used)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod aggregate;
pub mod bw;
pub mod channel;
pub mod history;
pub mod hw;
pub mod node;
pub mod params;
pub mod translate;
pub mod tunables;

mod builder;
mod display;
mod errors;
mod topology;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

// re-exports
pub use builder::{
    BusDecl, BusDeclBuilder, LarbDecl, LarbDeclBuilder, LeafDecl, LeafDeclBuilder, PortDecl,
    PortDeclBuilder, TopologyBuilder,
};
pub use bw::{Bandwidth, Direction};
pub use display::{HistoryDump, LastLarbDump};
pub use errors::TopologyError;
pub use node::{Channel, HrtKind, NodeId, NodeKind, PortCategory};
pub use params::{BusParams, BusParamsBuilder, QosParams, QosParamsBuilder};
pub use topology::{BusSnapshot, PortSnapshot, Topology};
pub use tunables::{Features, FreqMode, LogMask, Tunable, TunableError, Tunables};
