// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Translation of aggregated bandwidth into register values and operating points.
//!
//! Everything here is a pure function of its arguments.

use crate::bw::{Bandwidth, saturating_convert};
use crate::tunables::FreqMode;
use std::num::NonZeroU32;

pub const DEFAULT_OSTDL_CEILING: u32 = 0x40;
pub const DEFAULT_DISPLAY_CEILING: u32 = 0xff;

/// Limits applied to computed outstanding-transaction values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OstdlLimits {
    /// Upper bound of every computed value.
    pub ceiling: u32,
    /// Value a maximum-bandwidth port is forced to.
    pub display_ceiling: u32,
}

impl Default for OstdlLimits {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_OSTDL_CEILING,
            display_ceiling: DEFAULT_DISPLAY_CEILING,
        }
    }
}

/// Per-port circumstances that bend the computed value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OstdlPolicy {
    /// The port's category is exempt from maximum-bandwidth promotion.
    pub exempt: bool,
    /// A camera port currently holds bandwidth.
    pub camera_busy: bool,
    /// Raw limit programmed while the port is idle.
    pub direct: Option<u32>,
}

/// Outstanding-transaction limit for a port moving `avg` with the given bandwidth ratio.
///
/// An idle port gets zero, or its direct limit when it has one. A maximum-bandwidth port gets
/// the display ceiling unless it is exempt or a camera is busy; then it falls back to the
/// computed value like every other port.
#[must_use]
pub fn ostdl(
    avg: Bandwidth,
    ratio: NonZeroU32,
    is_max: bool,
    limits: &OstdlLimits,
    policy: &OstdlPolicy,
) -> u32 {
    if avg.is_zero() {
        return policy.direct.map_or(0, |raw| raw.min(limits.ceiling));
    }
    if is_max && !policy.exempt && !policy.camera_busy {
        return limits.display_ceiling;
    }
    avg.mbps().div_ceil(ratio.get()).min(limits.ceiling)
}

/// Limiter mode used while a peak is requested or the system is not QoS-bound.
pub const LIMITER_MODE_SOFT: u32 = 0x1000;
/// Limiter mode used for average-only traffic on a QoS-bound system.
pub const LIMITER_MODE_HARD: u32 = 0x3000;
pub const LIMITER_MIN: u32 = 0x200;
pub const LIMITER_MAX: u32 = 0xfff;
/// Value written for a port that moves nothing.
pub const LIMITER_IDLE: u32 = LIMITER_MODE_SOFT | LIMITER_MIN;

/// Bandwidth limiter register value for a port, or `None` without a usable clock.
#[must_use]
pub fn limiter_value(
    mix: Bandwidth,
    peak: Bandwidth,
    freq_mhz: u32,
    qos_bound: bool,
    max_bwl: bool,
) -> Option<u32> {
    if freq_mhz == 0 {
        return None;
    }
    let mode = if !peak.is_zero() || !qos_bound {
        LIMITER_MODE_SOFT
    } else {
        LIMITER_MODE_HARD
    };
    if max_bwl {
        return Some(mode | LIMITER_MAX);
    }
    if mix.is_zero() {
        return Some(LIMITER_IDLE);
    }
    let raw = (u64::from(mix) << 8) / u64::from(freq_mhz);
    Some(mode | saturating_convert(raw).clamp(LIMITER_MIN, LIMITER_MAX))
}

/// Scale an HRT peak by a per-mille ratio. A zero ratio counts as 1000.
#[must_use]
pub fn normalize_hrt(peak: Bandwidth, ratio_permille: u32) -> Bandwidth {
    let ratio = if ratio_permille == 0 {
        1000
    } else {
        ratio_permille
    };
    Bandwidth::saturating_from(u64::from(peak) * 1000 / u64::from(ratio))
}

/// One bus operating point.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Opp {
    pub rate_hz: u64,
    pub microvolt: u32,
}

impl Opp {
    #[must_use]
    pub const fn new(rate_hz: u64, microvolt: u32) -> Self {
        Self { rate_hz, microvolt }
    }

    /// Bandwidth this point sustains on a bus `bus_width` bytes wide.
    #[must_use]
    pub fn capacity(&self, bus_width: u32) -> Bandwidth {
        Bandwidth::saturating_from(self.rate_hz.saturating_mul(u64::from(bus_width)) / 1_000_000)
    }
}

/// Pick the operating point for `total` from `opps`, sorted by ascending rate.
#[must_use]
pub fn select_opp(total: Bandwidth, bus_width: u32, opps: &[Opp], mode: FreqMode) -> Option<Opp> {
    match mode {
        FreqMode::ForceMax => opps.last().copied(),
        FreqMode::ForceMin => opps.first().copied(),
        FreqMode::Aggregate => opps
            .iter()
            .find(|opp| opp.capacity(bus_width) >= total)
            .or(opps.last())
            .copied(),
    }
}

/// Index of the lowest memory-controller step covering `bw`, or of the top step.
#[must_use]
pub fn dram_step(bw: Bandwidth, steps: &[Bandwidth]) -> Option<usize> {
    if steps.is_empty() {
        return None;
    }
    Some(
        steps
            .iter()
            .position(|step| *step >= bw)
            .unwrap_or(steps.len() - 1),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{
        LIMITER_IDLE, LIMITER_MODE_HARD, LIMITER_MODE_SOFT, Opp, OstdlLimits, OstdlPolicy,
        dram_step, limiter_value, normalize_hrt, ostdl, select_opp,
    };
    use crate::bw::Bandwidth;
    use crate::tunables::FreqMode;
    use std::num::NonZeroU32;

    fn bw(v: u32) -> Bandwidth {
        Bandwidth::from_mbps(v)
    }

    fn ratio(v: u32) -> NonZeroU32 {
        NonZeroU32::new(v).unwrap()
    }

    #[test]
    fn ostdl_rounds_up_and_clamps() {
        let limits = OstdlLimits {
            ceiling: 256,
            display_ceiling: 0x3ff,
        };
        let plain = OstdlPolicy::default();
        assert_eq!(ostdl(bw(10_000), ratio(4), false, &limits, &plain), 256);
        assert_eq!(ostdl(bw(9), ratio(4), false, &limits, &plain), 3);
        assert_eq!(ostdl(bw(0), ratio(4), false, &limits, &plain), 0);
    }

    #[test]
    fn idle_port_passes_its_direct_limit() {
        let limits = OstdlLimits::default();
        let direct = OstdlPolicy {
            direct: Some(0x10),
            ..OstdlPolicy::default()
        };
        assert_eq!(ostdl(bw(0), ratio(4), true, &limits, &direct), 0x10);
        let oversized = OstdlPolicy {
            direct: Some(0x1000),
            ..OstdlPolicy::default()
        };
        assert_eq!(ostdl(bw(0), ratio(4), false, &limits, &oversized), 0x40);
    }

    #[test]
    fn max_port_forced_to_display_ceiling_unless_held_back() {
        let limits = OstdlLimits::default();
        let plain = OstdlPolicy::default();
        assert_eq!(ostdl(bw(10), ratio(4), true, &limits, &plain), 0xff);

        let exempt = OstdlPolicy {
            exempt: true,
            ..OstdlPolicy::default()
        };
        assert_eq!(ostdl(bw(10), ratio(4), true, &limits, &exempt), 3);

        let camera = OstdlPolicy {
            camera_busy: true,
            ..OstdlPolicy::default()
        };
        assert_eq!(ostdl(bw(10), ratio(4), true, &limits, &camera), 3);
    }

    #[test]
    fn ostdl_never_exceeds_the_ceiling() {
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|(avg, r, ceiling, direct): (u32, u32, u16, Option<u32>)| {
                let limits = OstdlLimits {
                    ceiling: u32::from(ceiling),
                    display_ceiling: u32::from(ceiling),
                };
                let policy = OstdlPolicy {
                    direct,
                    ..OstdlPolicy::default()
                };
                let value = ostdl(bw(avg), ratio(r.max(1)), false, &limits, &policy);
                assert!(value <= limits.ceiling);
            });
    }

    #[test]
    fn limiter_scales_mix_by_clock() {
        // 1000 MB/s at 500 MHz: (1000 << 8) / 500 = 512
        assert_eq!(
            limiter_value(bw(1000), bw(0), 500, false, false),
            Some(LIMITER_MODE_SOFT | 512)
        );
        assert_eq!(
            limiter_value(bw(1000), bw(0), 500, true, false),
            Some(LIMITER_MODE_HARD | 512)
        );
        assert_eq!(
            limiter_value(bw(1000), bw(1), 500, true, false),
            Some(LIMITER_MODE_SOFT | 512)
        );
    }

    #[test]
    fn limiter_clamps_and_special_cases() {
        assert_eq!(
            limiter_value(bw(1), bw(0), 500, false, false),
            Some(LIMITER_MODE_SOFT | 0x200)
        );
        assert_eq!(
            limiter_value(bw(100_000), bw(0), 500, false, false),
            Some(LIMITER_MODE_SOFT | 0xfff)
        );
        assert_eq!(
            limiter_value(bw(0), bw(0), 500, true, false),
            Some(LIMITER_IDLE)
        );
        assert_eq!(
            limiter_value(bw(5), bw(0), 500, true, true),
            Some(LIMITER_MODE_HARD | 0xfff)
        );
        assert_eq!(limiter_value(bw(5), bw(0), 0, true, false), None);
    }

    #[test]
    fn hrt_normalization() {
        assert_eq!(normalize_hrt(bw(800), 800), bw(1000));
        assert_eq!(normalize_hrt(bw(800), 0), bw(800));
        assert_eq!(normalize_hrt(bw(u32::MAX - 1), 1), Bandwidth::MAX);
    }

    #[test]
    fn opp_selection() {
        let opps = [
            Opp::new(273_000_000, 550_000),
            Opp::new(416_000_000, 600_000),
            Opp::new(546_000_000, 650_000),
        ];
        // 16-byte bus: 4368, 6656 and 8736 MB/s
        let pick = |total, mode| select_opp(bw(total), 16, &opps, mode);
        assert_eq!(pick(100, FreqMode::Aggregate), Some(opps[0]));
        assert_eq!(pick(4368, FreqMode::Aggregate), Some(opps[0]));
        assert_eq!(pick(4369, FreqMode::Aggregate), Some(opps[1]));
        assert_eq!(pick(100_000, FreqMode::Aggregate), Some(opps[2]));
        assert_eq!(pick(100, FreqMode::ForceMax), Some(opps[2]));
        assert_eq!(pick(100_000, FreqMode::ForceMin), Some(opps[0]));
        assert_eq!(select_opp(bw(1), 16, &[], FreqMode::Aggregate), None);
    }

    #[test]
    fn dram_step_selection() {
        let steps = [bw(1600), bw(3200), bw(6400)];
        assert_eq!(dram_step(bw(0), &steps), Some(0));
        assert_eq!(dram_step(bw(1601), &steps), Some(1));
        assert_eq!(dram_step(bw(9999), &steps), Some(2));
        assert_eq!(dram_step(bw(1), &[]), None);
    }
}
