// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control surface.
//!
//! Every tunable is a plain integer, settable by name and readable lock-free from any caller.

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

bitflags::bitflags! {
    /// Policy switches.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// Program per-port bandwidth limiter registers.
        const BW_LIMITER = 1 << 0;
        /// Program common-port outstanding-transaction limits.
        const COMM_OSTDL = 1 << 1;
        /// Program larb-port outstanding-transaction limits.
        const LARB_OSTDL = 1 << 2;
        /// Drive the per-channel memory-controller step.
        const CHANNEL_BW = 1 << 3;
        /// Derate channel bandwidth by imbalance.
        const DYNAMIC_URATE = 1 << 4;
        /// Keep a display-only shadow of the channel sums.
        const DISP_SEPARATE = 1 << 5;
        /// Exclude display traffic from the average-path request.
        const DYN_POWER = 1 << 6;
        /// Ship root computations to the co-processor.
        const VCP_OFFLOAD = 1 << 7;
        const DISP_BY_LARB_EXEMPT = 1 << 8;
        const CAM_NO_MAX_EXEMPT = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Verbosity switches for the per-update debug lines.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LogMask: u32 {
        const BW = 1 << 0;
        const CHANNEL = 1 << 1;
        const OSTDL = 1 << 2;
        const HRT = 1 << 3;
        const VCP = 1 << 4;
        const LIMITER = 1 << 5;
    }
}

/// How the bus clock is chosen.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u32)]
pub enum FreqMode {
    /// Follow the aggregated demand.
    #[default]
    #[strum(serialize = "aggregate")]
    Aggregate = 0,
    #[strum(serialize = "force-max")]
    ForceMax = 1,
    #[strum(serialize = "force-min")]
    ForceMin = 2,
}

/// Names of the runtime tunables.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Tunable {
    Features,
    LogMask,
    VcpTestId,
    FreqMode,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunableError {
    #[error("unknown tunable '{0}'")]
    UnknownName(String),
    #[error("'{0}' is not an integer")]
    NotAnInteger(String),
    #[error("value {value:#x} not allowed for {tunable}")]
    OutOfRange { tunable: Tunable, value: u32 },
}

/// Parse a plain integer, decimal or `0x`-prefixed hex.
pub fn parse_u32(raw: &str) -> Result<u32, TunableError> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| TunableError::NotAnInteger(raw.to_string()))
}

/// Current tunable values.
#[derive(Debug, Default)]
pub struct Tunables {
    features: AtomicU32,
    log_mask: AtomicU32,
    vcp_test_id: AtomicU32,
    freq_mode: AtomicU32,
}

impl Tunables {
    #[must_use]
    pub fn new(features: Features, log_mask: LogMask) -> Self {
        Self {
            features: AtomicU32::new(features.bits()),
            log_mask: AtomicU32::new(log_mask.bits()),
            vcp_test_id: AtomicU32::new(0),
            freq_mode: AtomicU32::new(FreqMode::Aggregate as u32),
        }
    }

    #[must_use]
    pub fn features(&self) -> Features {
        Features::from_bits_truncate(self.features.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn has(&self, feature: Features) -> bool {
        self.features().contains(feature)
    }

    #[must_use]
    pub fn log_mask(&self) -> LogMask {
        LogMask::from_bits_truncate(self.log_mask.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn logs(&self, mask: LogMask) -> bool {
        self.log_mask().intersects(mask)
    }

    #[must_use]
    pub fn vcp_test_id(&self) -> u32 {
        self.vcp_test_id.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn freq_mode(&self) -> FreqMode {
        FreqMode::from_repr(self.freq_mode.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn set_features(&self, features: Features) -> Features {
        Features::from_bits_truncate(self.features.swap(features.bits(), Ordering::Relaxed))
    }

    pub fn set_log_mask(&self, mask: LogMask) {
        self.log_mask.store(mask.bits(), Ordering::Relaxed);
    }

    pub fn set_freq_mode(&self, mode: FreqMode) {
        self.freq_mode.store(mode as u32, Ordering::Relaxed);
    }

    /// Validate and store `raw` under the tunable called `name`, returning which one changed.
    pub fn set(&self, name: &str, raw: &str) -> Result<Tunable, TunableError> {
        let tunable =
            Tunable::from_str(name).map_err(|_| TunableError::UnknownName(name.to_string()))?;
        let value = parse_u32(raw)?;
        let out_of_range = || TunableError::OutOfRange { tunable, value };
        match tunable {
            Tunable::Features => {
                let features = Features::from_bits(value).ok_or_else(out_of_range)?;
                self.set_features(features);
            }
            Tunable::LogMask => {
                let mask = LogMask::from_bits(value).ok_or_else(out_of_range)?;
                self.set_log_mask(mask);
            }
            Tunable::VcpTestId => self.vcp_test_id.store(value, Ordering::Relaxed),
            Tunable::FreqMode => {
                let mode = FreqMode::from_repr(value).ok_or_else(out_of_range)?;
                self.set_freq_mode(mode);
            }
        }
        Ok(tunable)
    }

    /// Current value of a tunable, as it would be accepted by [`Tunables::set`].
    #[must_use]
    pub fn get(&self, tunable: Tunable) -> u32 {
        match tunable {
            Tunable::Features => self.features().bits(),
            Tunable::LogMask => self.log_mask().bits(),
            Tunable::VcpTestId => self.vcp_test_id(),
            Tunable::FreqMode => self.freq_mode() as u32,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{Features, FreqMode, LogMask, Tunable, TunableError, Tunables, parse_u32};

    #[test]
    fn integers_parse_in_both_bases() {
        assert_eq!(parse_u32("42"), Ok(42));
        assert_eq!(parse_u32(" 0x1f\n"), Ok(0x1f));
        assert_eq!(parse_u32("0XFF"), Ok(0xff));
        assert_eq!(
            parse_u32("forty"),
            Err(TunableError::NotAnInteger("forty".to_string()))
        );
        assert!(parse_u32("-1").is_err());
    }

    #[test]
    fn set_by_name() {
        let tunables = Tunables::default();
        assert_eq!(tunables.set("features", "0x9"), Ok(Tunable::Features));
        assert_eq!(
            tunables.features(),
            Features::BW_LIMITER | Features::CHANNEL_BW
        );
        assert_eq!(tunables.set("log_mask", "3"), Ok(Tunable::LogMask));
        assert!(tunables.logs(LogMask::CHANNEL));
        assert!(!tunables.logs(LogMask::VCP));
        assert_eq!(tunables.set("freq_mode", "1"), Ok(Tunable::FreqMode));
        assert_eq!(tunables.freq_mode(), FreqMode::ForceMax);
        assert_eq!(tunables.set("vcp_test_id", "7"), Ok(Tunable::VcpTestId));
        assert_eq!(tunables.get(Tunable::VcpTestId), 7);
    }

    #[test]
    fn invalid_values_are_rejected_and_leave_state_alone() {
        let tunables = Tunables::new(Features::COMM_OSTDL, LogMask::empty());
        assert_eq!(
            tunables.set("bogus", "1"),
            Err(TunableError::UnknownName("bogus".to_string()))
        );
        assert_eq!(
            tunables.set("features", "0x80000000"),
            Err(TunableError::OutOfRange {
                tunable: Tunable::Features,
                value: 0x8000_0000
            })
        );
        assert_eq!(
            tunables.set("freq_mode", "3"),
            Err(TunableError::OutOfRange {
                tunable: Tunable::FreqMode,
                value: 3
            })
        );
        assert_eq!(tunables.features(), Features::COMM_OSTDL);
        assert_eq!(tunables.freq_mode(), FreqMode::Aggregate);
    }

    #[test]
    fn every_accepted_value_reads_back() {
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|value: u32| {
                let tunables = Tunables::default();
                if tunables.set("features", &value.to_string()).is_ok() {
                    assert_eq!(tunables.get(Tunable::Features), value);
                }
                tunables
                    .set("vcp_test_id", &format!("{value:#x}"))
                    .unwrap();
                assert_eq!(tunables.vcp_test_id(), value);
            });
    }
}
