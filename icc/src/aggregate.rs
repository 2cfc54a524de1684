// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bandwidth aggregation across the children of a node.
//!
//! A node's aggregate is recomputed by folding [`aggregate`] over every child contribution,
//! starting from zeroed accumulators. Averages are summed. Peaks are summed too, except that
//! the maximum-bandwidth sentinel is replaced by a large finite placeholder so that a single
//! "give me everything" request cannot overflow the sum. Alongside the two accumulators each
//! node keeps a *mix* value (peak where one was requested, average otherwise) which drives
//! limiter programming.

use crate::bw::Bandwidth;

/// Amount a maximum-bandwidth peak adds to the running peak.
pub const MAX_BW_PEAK_PLACEHOLDER: Bandwidth = Bandwidth::from_mbps(3000);
/// Lower bound of the average used to size a sentinel's mix contribution.
pub const MAX_BW_MIX_FLOOR: Bandwidth = Bandwidth::from_mbps(1000);
/// Multiplier applied to `max(avg, floor)` for a sentinel's mix contribution.
pub const MAX_BW_MIX_FACTOR: u32 = 2;

/// Aggregated state of one node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Aggregate {
    pub avg: Bandwidth,
    pub peak: Bandwidth,
    pub mix: Bandwidth,
    /// Whether any child asked for the maximum-bandwidth sentinel.
    pub saturated: bool,
}

impl Aggregate {
    /// Combine two already-aggregated nodes. Sentinels were resolved by each side.
    #[must_use]
    pub fn merge(self, other: Aggregate) -> Aggregate {
        Aggregate {
            avg: self.avg.saturating_add(other.avg),
            peak: self.peak.saturating_add(other.peak),
            mix: self.mix.saturating_add(other.mix),
            saturated: self.saturated || other.saturated,
        }
    }
}

/// Placeholder a sentinel peak contributes to the mix value.
#[must_use]
pub fn sentinel_mix(avg: Bandwidth) -> Bandwidth {
    Bandwidth::saturating_from(u64::from(avg.max(MAX_BW_MIX_FLOOR)) * u64::from(MAX_BW_MIX_FACTOR))
}

/// Accumulate one path's `(avg_bw, peak_bw)` into the running `(agg_avg, agg_peak)` of a node.
///
/// `mix` is the node's mix value. It is reset when this is the first contribution of the pass
/// (both accumulators still zero). `exempt` marks nodes whose category is excluded from
/// maximum-bandwidth promotion: for those a sentinel peak adds nothing to the running peak.
/// `_tag` identifies the path and takes no part in the arithmetic.
#[must_use]
pub fn aggregate(
    mix: &mut Bandwidth,
    exempt: bool,
    _tag: u32,
    avg_bw: Bandwidth,
    peak_bw: Bandwidth,
    agg_avg: Bandwidth,
    agg_peak: Bandwidth,
) -> (Bandwidth, Bandwidth) {
    if agg_avg.is_zero() && agg_peak.is_zero() {
        *mix = Bandwidth::ZERO;
    }

    let mix_part = if peak_bw.is_max() {
        sentinel_mix(avg_bw)
    } else if peak_bw.is_zero() {
        avg_bw
    } else {
        peak_bw
    };
    *mix = mix.saturating_add(mix_part);

    let peak_part = match (peak_bw.is_max(), exempt) {
        (true, true) => Bandwidth::ZERO,
        (true, false) => MAX_BW_PEAK_PLACEHOLDER,
        (false, _) => peak_bw,
    };

    (agg_avg.saturating_add(avg_bw), agg_peak.saturating_add(peak_part))
}

/// Fold every `(tag, avg, peak)` child contribution into a fresh [`Aggregate`].
pub fn fold<I>(children: I, exempt: bool) -> Aggregate
where
    I: IntoIterator<Item = (u32, Bandwidth, Bandwidth)>,
{
    let mut out = Aggregate::default();
    for (tag, avg, peak) in children {
        out.saturated |= peak.is_max();
        (out.avg, out.peak) = aggregate(&mut out.mix, exempt, tag, avg, peak, out.avg, out.peak);
    }
    out
}

#[cfg(test)]
mod test {
    use super::{Aggregate, MAX_BW_PEAK_PLACEHOLDER, aggregate, fold, sentinel_mix};
    use crate::bw::Bandwidth;

    fn bw(v: u32) -> Bandwidth {
        Bandwidth::from_mbps(v)
    }

    #[test]
    fn first_contribution_resets_mix() {
        let mut mix = bw(999);
        let (avg, peak) = aggregate(&mut mix, false, 0, bw(10), bw(0), bw(0), bw(0));
        assert_eq!((avg, peak, mix), (bw(10), bw(0), bw(10)));

        let (avg, peak) = aggregate(&mut mix, false, 0, bw(10), bw(40), avg, peak);
        assert_eq!((avg, peak, mix), (bw(20), bw(40), bw(50)));
    }

    #[test]
    fn sentinel_uses_placeholders() {
        let mut mix = Bandwidth::ZERO;
        let (avg, peak) = aggregate(&mut mix, false, 0, bw(300), Bandwidth::MAX, bw(0), bw(0));
        assert_eq!(avg, bw(300));
        assert_eq!(peak, MAX_BW_PEAK_PLACEHOLDER);
        assert_eq!(mix, bw(2000));
        assert_eq!(sentinel_mix(bw(4000)), bw(8000));
    }

    #[test]
    fn exempt_node_ignores_sentinel_peak() {
        let agg = fold(
            [(0, bw(5), bw(7)), (0, bw(5), Bandwidth::MAX), (0, bw(1), bw(3))],
            true,
        );
        assert_eq!(agg.avg, bw(11));
        assert_eq!(agg.peak, bw(10));
        assert!(agg.saturated);
    }

    #[test]
    fn merge_keeps_resolved_peaks() {
        let exempt = fold([(0, bw(10), Bandwidth::MAX)], true);
        let plain = fold([(0, bw(5), bw(7))], false);
        let root = exempt.merge(plain);
        assert_eq!((root.avg, root.peak, root.mix), (bw(15), bw(7), bw(2007)));
        assert!(root.saturated);
    }

    #[test]
    fn empty_fold_is_zero() {
        assert_eq!(fold([], false), Aggregate::default());
    }

    #[test]
    fn average_is_additive_in_any_order() {
        bolero::check!()
            .with_type()
            .for_each(|children: &Vec<(u16, u16)>| {
                let forward = fold(
                    children.iter().map(|(a, p)| (0, bw(u32::from(*a)), bw(u32::from(*p)))),
                    false,
                );
                let backward = fold(
                    children
                        .iter()
                        .rev()
                        .map(|(a, p)| (0, bw(u32::from(*a)), bw(u32::from(*p)))),
                    false,
                );
                let sum: u32 = children.iter().map(|(a, _)| u32::from(*a)).sum();
                assert_eq!(forward.avg, bw(sum));
                assert_eq!(backward.avg, forward.avg);
                assert_eq!(backward.peak, forward.peak);
            });
    }

    #[test]
    fn sentinel_promotion_unless_exempt() {
        bolero::check!()
            .with_type()
            .for_each(|(peaks, at): &(Vec<u16>, u8)| {
                let mut children: Vec<_> = peaks
                    .iter()
                    .map(|p| (0, bw(1), bw(u32::from(*p))))
                    .collect();
                let pos = usize::from(*at) % (children.len() + 1);
                children.insert(pos, (0, bw(1), Bandwidth::MAX));
                let plain: u32 = peaks.iter().map(|p| u32::from(*p)).sum();

                let promoted = fold(children.iter().copied(), false);
                assert_eq!(promoted.peak, bw(plain).saturating_add(MAX_BW_PEAK_PLACEHOLDER));

                let exempt = fold(children.iter().copied(), true);
                assert_eq!(exempt.peak, bw(plain));
            });
    }
}
