// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bandwidth values and unit conversion.

/// Bandwidth in MB/s.
///
/// [`Bandwidth::MAX`] is not a real demand but a sentinel meaning "give this port the
/// maximum". It must never be summed as-is; see [`crate::aggregate`].
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(any(test, feature = "bolero"), derive(bolero::TypeGenerator))]
pub struct Bandwidth(u32);

impl Bandwidth {
    pub const ZERO: Bandwidth = Bandwidth(0);
    /// The maximum-bandwidth sentinel.
    pub const MAX: Bandwidth = Bandwidth(u32::MAX);

    #[must_use]
    pub const fn from_mbps(mbps: u32) -> Self {
        Self(mbps)
    }

    #[must_use]
    pub const fn mbps(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_max(self) -> bool {
        self.0 == u32::MAX
    }

    #[must_use]
    pub const fn saturating_add(self, other: Bandwidth) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    #[must_use]
    pub const fn saturating_sub(self, other: Bandwidth) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Build a bandwidth from a wider intermediate, clamping at the largest finite value.
    #[must_use]
    pub fn saturating_from(wide: u64) -> Self {
        Self(saturating_convert(wide))
    }
}

impl From<u32> for Bandwidth {
    fn from(mbps: u32) -> Self {
        Self(mbps)
    }
}

impl From<Bandwidth> for u64 {
    fn from(bw: Bandwidth) -> u64 {
        u64::from(bw.0)
    }
}

impl std::fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_max() {
            f.pad("MAX")
        } else {
            f.pad(&self.0.to_string())
        }
    }
}

/// Narrow a wide intermediate to a 32-bit register/unit value, clamping instead of wrapping.
#[must_use]
pub fn saturating_convert(wide: u64) -> u32 {
    u32::try_from(wide).unwrap_or(u32::MAX)
}

/// Transfer direction of a port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
#[cfg_attr(any(test, feature = "bolero"), derive(bolero::TypeGenerator))]
pub enum Direction {
    #[default]
    #[strum(serialize = "r")]
    Read,
    #[strum(serialize = "w")]
    Write,
}

impl Direction {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Direction::Write)
    }
}

#[cfg(test)]
mod test {
    use super::{Bandwidth, saturating_convert};

    #[test]
    fn conversion_clamps_instead_of_wrapping() {
        assert_eq!(saturating_convert(0), 0);
        assert_eq!(saturating_convert(u64::from(u32::MAX)), u32::MAX);
        assert_eq!(saturating_convert(u64::from(u32::MAX) + 1), u32::MAX);
        assert_eq!(saturating_convert(u64::MAX), u32::MAX);
    }

    #[test]
    fn conversion_is_identity_below_the_limit() {
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|v: u32| assert_eq!(saturating_convert(u64::from(v)), v));
    }

    #[test]
    fn arithmetic_saturates() {
        let big = Bandwidth::from_mbps(u32::MAX - 1);
        assert_eq!(big.saturating_add(Bandwidth::from_mbps(5)), Bandwidth::MAX);
        assert_eq!(
            Bandwidth::from_mbps(3).saturating_sub(Bandwidth::from_mbps(5)),
            Bandwidth::ZERO
        );
    }

    #[test]
    fn sentinel_displays_as_max() {
        assert_eq!(Bandwidth::MAX.to_string(), "MAX");
        assert_eq!(Bandwidth::from_mbps(1200).to_string(), "1200");
    }
}
