// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Segment-wide and system-wide parameters.

use crate::bw::Bandwidth;
use crate::translate::{Opp, OstdlLimits};
use crate::tunables::{Features, LogMask};
use derive_builder::Builder;
use std::fmt::Display;
use vcp::OffloadParams;

pub const DEFAULT_BUS_WIDTH: u32 = 16;
pub const DEFAULT_CHANNELS: u8 = 2;

/// Parameters of one bus segment. N.B. we derive a builder type `BusParamsBuilder` and
/// provide defaults for each field.
#[derive(Builder, Clone, Debug, PartialEq, Eq)]
pub struct BusParams {
    /// Bytes moved per bus clock cycle.
    #[builder(default = DEFAULT_BUS_WIDTH)]
    pub bus_width: u32,

    /// Operating points, in any order.
    #[builder(default)]
    pub opps: Vec<Opp>,

    /// Memory channels behind the segment.
    #[builder(default = DEFAULT_CHANNELS)]
    pub channels: u8,
}

impl Default for BusParams {
    fn default() -> Self {
        Self {
            bus_width: DEFAULT_BUS_WIDTH,
            opps: Vec::new(),
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl Display for BusParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "width {}B, {} channel(s), opps:",
            self.bus_width, self.channels
        )?;
        for opp in &self.opps {
            write!(f, " {}MHz@{}uV", opp.rate_hz / 1_000_000, opp.microvolt)?;
        }
        Ok(())
    }
}

/// System-wide parameters.
#[derive(Builder, Clone, Debug, Default)]
pub struct QosParams {
    #[builder(default)]
    pub ostdl: OstdlLimits,

    /// Features enabled at start-up.
    #[builder(default = Features::COMM_OSTDL | Features::LARB_OSTDL)]
    pub features: Features,

    #[builder(default)]
    pub log_mask: LogMask,

    /// Memory-controller steps, in any order.
    #[builder(default)]
    pub dram_steps: Vec<Bandwidth>,

    /// Timing of the co-processor channel.
    #[builder(default)]
    pub offload: OffloadParams,
}

impl Display for QosParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "QoS config")?;
        writeln!(
            f,
            "  ostdl    : ceiling {:#x}, display {:#x}",
            self.ostdl.ceiling, self.ostdl.display_ceiling
        )?;
        writeln!(f, "  features : {:?}", self.features)?;
        writeln!(f, "  log mask : {:?}", self.log_mask)?;
        writeln!(f, "  dram     : {} step(s)", self.dram_steps.len())?;
        writeln!(
            f,
            "  offload  : {} x {:?}",
            self.offload.retries, self.offload.poll
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{BusParamsBuilder, DEFAULT_BUS_WIDTH, QosParamsBuilder};
    use crate::translate::{Opp, OstdlLimits};
    use crate::tunables::Features;

    #[test]
    fn builders_fill_defaults() {
        let bus = BusParamsBuilder::default()
            .opps(vec![Opp::new(273_000_000, 550_000)])
            .build()
            .unwrap();
        assert_eq!(bus.bus_width, DEFAULT_BUS_WIDTH);
        assert_eq!(bus.channels, 2);
        assert_eq!(bus.to_string(), "width 16B, 2 channel(s), opps: 273MHz@550000uV");

        let qos = QosParamsBuilder::default().build().unwrap();
        assert_eq!(qos.ostdl, OstdlLimits::default());
        assert_eq!(qos.features, Features::COMM_OSTDL | Features::LARB_OSTDL);
        assert_eq!(qos.offload.retries, 200);
        assert!(qos.to_string().starts_with("QoS config"));
    }
}
