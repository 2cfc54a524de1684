// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-memory-channel bandwidth accounting.
//!
//! The balancer keeps, for every physical channel, rolling SRT and HRT sums per direction.
//! Sums are never recomputed: every update subtracts what the port contributed last time and
//! adds what it contributes now, so the cost of an update does not depend on how many ports
//! share the channel.

use crate::aggregate::MAX_BW_PEAK_PLACEHOLDER;
use crate::bw::{Bandwidth, Direction, saturating_convert};
use crate::node::{Channel, NodeId};
use std::collections::{BTreeMap, HashMap};

/// Nominal utilization rate, in percent.
pub const URATE_NOMINAL: u32 = 70;
/// Utilization rate once the busiest channel carries at least 1.5x the idlest.
pub const URATE_SKEWED: u32 = 65;
/// Utilization rate once the busiest channel carries at least 2x the idlest. Nothing lower is
/// ever applied.
pub const URATE_FLOOR: u32 = 60;

/// What one port adds to the sums of its channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(any(test, feature = "bolero"), derive(bolero::TypeGenerator))]
pub struct Contribution {
    pub srt_r: Bandwidth,
    pub srt_w: Bandwidth,
    pub hrt_r: Bandwidth,
    pub hrt_w: Bandwidth,
}

impl Contribution {
    /// Split a demand by direction: the average counts as SRT, the peak as HRT. A
    /// maximum-bandwidth peak counts as its finite placeholder.
    #[must_use]
    pub fn from_demand(dir: Direction, avg: Bandwidth, peak: Bandwidth) -> Self {
        let hrt = if peak.is_max() {
            MAX_BW_PEAK_PLACEHOLDER
        } else {
            peak
        };
        match dir {
            Direction::Read => Self {
                srt_r: avg,
                hrt_r: hrt,
                ..Self::default()
            },
            Direction::Write => Self {
                srt_w: avg,
                hrt_w: hrt,
                ..Self::default()
            },
        }
    }

    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            srt_r: self.srt_r.saturating_add(other.srt_r),
            srt_w: self.srt_w.saturating_add(other.srt_w),
            hrt_r: self.hrt_r.saturating_add(other.hrt_r),
            hrt_w: self.hrt_w.saturating_add(other.hrt_w),
        }
    }
}

impl std::iter::Sum for Contribution {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Contribution::saturating_add)
    }
}

/// Signed difference between two contributions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub srt_r: i64,
    pub srt_w: i64,
    pub hrt_r: i64,
    pub hrt_w: i64,
}

impl Delta {
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Delta::default()
    }
}

fn diff(old: Bandwidth, new: Bandwidth) -> i64 {
    i64::from(new.mbps()) - i64::from(old.mbps())
}

/// What must be applied to the sums to move a port from `old` to `new`.
#[must_use]
pub fn delta(old: Contribution, new: Contribution) -> Delta {
    Delta {
        srt_r: diff(old.srt_r, new.srt_r),
        srt_w: diff(old.srt_w, new.srt_w),
        hrt_r: diff(old.hrt_r, new.hrt_r),
        hrt_w: diff(old.hrt_w, new.hrt_w),
    }
}

fn shift(value: Bandwidth, by: i64) -> Bandwidth {
    let moved = (i64::from(value.mbps()) + by).max(0);
    Bandwidth::saturating_from(u64::try_from(moved).unwrap_or(0))
}

/// Rolling sums of one channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelSums {
    pub srt_r: Bandwidth,
    pub srt_w: Bandwidth,
    pub hrt_r: Bandwidth,
    pub hrt_w: Bandwidth,
}

impl ChannelSums {
    /// Apply a delta, clamping at zero.
    pub fn apply(&mut self, d: Delta) {
        self.srt_r = shift(self.srt_r, d.srt_r);
        self.srt_w = shift(self.srt_w, d.srt_w);
        self.hrt_r = shift(self.hrt_r, d.hrt_r);
        self.hrt_w = shift(self.hrt_w, d.hrt_w);
    }

    fn direction(&self, dir: Direction) -> (u64, u64) {
        match dir {
            Direction::Read => (self.srt_r.into(), self.hrt_r.into()),
            Direction::Write => (self.srt_w.into(), self.hrt_w.into()),
        }
    }

    /// SRT data bandwidth of one direction: occupied bandwidth minus the protocol overhead.
    #[must_use]
    pub fn srt_data(&self, dir: Direction) -> u64 {
        self.direction(dir).0 * 3 / 4
    }
}

/// Utilization rate, in percent, for a set of per-channel loads.
///
/// Non-increasing in the ratio between the busiest and the idlest channel. An idle channel
/// next to a busy one counts as the largest imbalance.
#[must_use]
pub fn urate(loads: &[u64]) -> u32 {
    let (Some(&min), Some(&max)) = (loads.iter().min(), loads.iter().max()) else {
        return URATE_NOMINAL;
    };
    if max == 0 {
        URATE_NOMINAL
    } else if min == 0 || u128::from(max) * 2 >= u128::from(min) * 4 {
        URATE_FLOOR
    } else if u128::from(max) * 2 >= u128::from(min) * 3 {
        URATE_SKEWED
    } else {
        URATE_NOMINAL
    }
}

/// Accumulator for every channel of every bus segment.
#[derive(Debug, Default)]
pub struct ChannelBalancer {
    sums: BTreeMap<Channel, ChannelSums>,
    /// Display-only shadow of `sums`.
    display: BTreeMap<Channel, ChannelSums>,
    previous: HashMap<NodeId, Contribution>,
}

impl ChannelBalancer {
    #[must_use]
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        let mut balancer = Self::default();
        for channel in channels {
            balancer.register(channel);
        }
        balancer
    }

    /// Make `channel` known with zeroed sums.
    pub fn register(&mut self, channel: Channel) {
        self.sums.entry(channel).or_default();
        self.display.entry(channel).or_default();
    }

    /// Move `port`'s share of `channel` to `contribution`. When `display` is set the same
    /// change is mirrored into the display shadow. Returns false if nothing changed.
    pub fn update_channel(
        &mut self,
        port: NodeId,
        channel: Channel,
        contribution: Contribution,
        display: bool,
    ) -> bool {
        let old = self
            .previous
            .insert(port, contribution)
            .unwrap_or_default();
        let d = delta(old, contribution);
        if d.is_zero() {
            return false;
        }
        self.sums.entry(channel).or_default().apply(d);
        if display {
            self.display.entry(channel).or_default().apply(d);
        }
        true
    }

    #[must_use]
    pub fn sums(&self, channel: Channel) -> ChannelSums {
        self.sums.get(&channel).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn display_sums(&self, channel: Channel) -> ChannelSums {
        self.display.get(&channel).copied().unwrap_or_default()
    }

    /// Contribution last recorded for `port`.
    #[must_use]
    pub fn previous(&self, port: NodeId) -> Contribution {
        self.previous.get(&port).copied().unwrap_or_default()
    }

    /// Channels of one segment, in channel order.
    pub fn segment(&self, bus: u16) -> impl Iterator<Item = (Channel, ChannelSums)> + '_ {
        segment_of(&self.sums, bus)
    }

    /// Bandwidth the busiest channel of segment `bus` needs.
    #[must_use]
    pub fn compute_max_channel_bw(&self, bus: u16, dynamic: bool) -> Bandwidth {
        max_channel_bw(&self.sums, bus, dynamic)
    }

    /// [`ChannelBalancer::compute_max_channel_bw`] restricted to display traffic.
    #[must_use]
    pub fn compute_max_display_bw(&self, bus: u16, dynamic: bool) -> Bandwidth {
        max_channel_bw(&self.display, bus, dynamic)
    }

    /// Zero every sum and forget every recorded contribution.
    pub fn reset(&mut self) {
        self.sums.values_mut().for_each(|s| *s = ChannelSums::default());
        self.display.values_mut().for_each(|s| *s = ChannelSums::default());
        self.previous.clear();
    }
}

fn segment_of(
    sums: &BTreeMap<Channel, ChannelSums>,
    bus: u16,
) -> impl Iterator<Item = (Channel, ChannelSums)> + '_ {
    sums.range(Channel::new(bus, 0)..=Channel::new(bus, u8::MAX))
        .map(|(c, s)| (*c, *s))
}

fn max_channel_bw(sums: &BTreeMap<Channel, ChannelSums>, bus: u16, dynamic: bool) -> Bandwidth {
    let channels: Vec<ChannelSums> = segment_of(sums, bus).map(|(_, s)| s).collect();
    let mut max = 0u64;
    for dir in [Direction::Read, Direction::Write] {
        if dynamic {
            // SRT and HRT are derated by the imbalance of their own category
            let srt_loads: Vec<u64> = channels.iter().map(|s| s.srt_data(dir)).collect();
            let hrt_loads: Vec<u64> = channels.iter().map(|s| s.direction(dir).1).collect();
            let srt_rate = u64::from(urate(&srt_loads));
            let hrt_rate = u64::from(urate(&hrt_loads));
            for s in &channels {
                let (srt, hrt) = s.direction(dir);
                max = max
                    .max((srt * 100).div_ceil(srt_rate))
                    .max((hrt * 100).div_ceil(hrt_rate));
            }
        } else {
            for s in &channels {
                let (srt, hrt) = s.direction(dir);
                max = max.max(hrt * 10 / 7).max(srt);
            }
        }
    }
    Bandwidth::from_mbps(saturating_convert(max))
}
