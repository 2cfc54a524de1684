// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Services the QoS core consumes but does not implement.
//!
//! Every method is best effort from the core's point of view: failures are the provider's
//! business and nothing is reported back.

use crate::bw::Bandwidth;
use crate::node::{HrtKind, NodeId};

/// Register access of one bus-interconnect device.
pub trait SmiDevice: Send + Sync {
    fn write_common_bw_limiter(&self, port: u16, value: u32);
    fn write_common_ostdl(&self, port: u16, is_write: bool, value: u32);
    fn write_larb_ostdl(&self, port: u16, value: u32);
}

/// A bandwidth request path into the memory-controller frequency framework.
pub trait BandwidthPath: Send + Sync {
    fn request_bandwidth(&self, avg: Bandwidth, peak: Bandwidth);
}

/// Clock of one bus segment.
pub trait BusClock: Send + Sync {
    /// Current rate in Hz, 0 while the clock is not running.
    fn rate(&self) -> u64;
    fn set_rate(&self, rate_hz: u64);
}

pub trait Regulator: Send + Sync {
    fn set_voltage(&self, microvolt: u32);
}

/// Parameters handed to the HRT budget service at start-up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrtConfig {
    /// Segments whose HRT totals will be reported.
    pub segments: Vec<u16>,
    /// Common ports drawing from an HRT budget.
    pub ports: Vec<(NodeId, HrtKind)>,
}

/// Hard-real-time admission control.
pub trait HrtService: Send + Sync {
    fn init_hrt(&self, config: &HrtConfig);
    fn set_hrt_bw(&self, kind: HrtKind, bw: Bandwidth);
    /// Per-mille ratio applied to peaks of `kind`; 0 means "no scaling".
    fn get_hrt_ratio(&self, kind: HrtKind) -> u32;
}
