// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-segment settings: limiters, bandwidth requests, operating point, memory-controller
//! step and HRT budget, or their hand-off to the co-processor.

use super::{BusNode, Node, PortNode, PortState, Topology};
use crate::bw::{Bandwidth, saturating_convert};
use crate::history::EntityKey;
use crate::node::{HrtKind, PortCategory};
use crate::translate::{Opp, dram_step, limiter_value, normalize_hrt, select_opp};
use crate::tunables::{Features, LogMask};
use strum::{EnumCount, IntoEnumIterator};
use tracing::{debug, info, warn};
use vcp::{Function, layout};

fn mhz(rate_hz: u64) -> u32 {
    saturating_convert(rate_hz / 1_000_000)
}

/// Segment totals derived from the port snapshots.
#[derive(Copy, Clone, Debug, Default)]
struct Totals {
    comm: Bandwidth,
    avg: Bandwidth,
    hrt: [Bandwidth; HrtKind::COUNT],
    hrt_total: Bandwidth,
}

impl Topology {
    fn port_states<'a>(&'a self, bus: &BusNode) -> Vec<(&'a PortNode, PortState)> {
        let Some(slot) = self.buses.get(&bus.index) else {
            return Vec::new();
        };
        self.slots[*slot]
            .children
            .iter()
            .filter_map(|child| match &self.slots[*child].node {
                Node::CommonPort(port) => Some((port, *port.state.lock())),
                _ => None,
            })
            .collect()
    }

    fn totals(&self, features: Features, ports: &[(&PortNode, PortState)]) -> Totals {
        let mut totals = Totals::default();
        let mut raw = [Bandwidth::ZERO; HrtKind::COUNT];
        for (port, state) in ports {
            totals.comm = totals
                .comm
                .saturating_add(state.agg.avg)
                .saturating_add(state.agg.peak);
            if !(features.contains(Features::DYN_POWER) && port.category.is_display()) {
                totals.avg = totals.avg.saturating_add(state.agg.avg);
            }
            if let Some(kind) = port.category.hrt_kind() {
                raw[kind.slot()] = raw[kind.slot()].saturating_add(state.agg.peak);
            }
        }
        for kind in HrtKind::iter() {
            let ratio = self.hrt.as_ref().map_or(0, |hrt| hrt.get_hrt_ratio(kind));
            totals.hrt[kind.slot()] = normalize_hrt(raw[kind.slot()], ratio);
            totals.hrt_total = totals.hrt_total.saturating_add(totals.hrt[kind.slot()]);
        }
        totals
    }

    /// Recompute and apply the settings of one segment from the latest port values.
    ///
    /// A segment whose clock is missing or stopped is skipped. With offload enabled the
    /// port values are handed to the co-processor instead.
    pub(crate) fn set_bus_bandwidth(&self, bus: &BusNode) {
        let features = self.tunables.features();
        let Some(clock) = &bus.clock else {
            Self::warn_missing(&bus.missing.clock, bus.index, "clock");
            return;
        };
        let rate = clock.rate();
        if rate == 0 {
            Self::warn_missing(&bus.missing.rate, bus.index, "running clock");
            return;
        }

        let ports = self.port_states(bus);
        let offloading = features.contains(Features::VCP_OFFLOAD) && self.offload.is_some();
        if features.contains(Features::BW_LIMITER) && !offloading {
            self.program_limiters(bus, rate, &ports);
        }

        let totals = self.totals(features, &ports);
        if self.tunables.logs(LogMask::BW) {
            debug!(
                "comm{}: comm {} avg {} hrt {}",
                bus.index, totals.comm, totals.avg, totals.hrt_total
            );
        }
        {
            let mut state = bus.state.lock();
            state.comm_total = totals.comm;
            state.hrt = totals.hrt;
        }

        if offloading {
            self.offload_bus(bus, &totals, &ports);
            return;
        }

        match &bus.avg_path {
            Some(path) => path.request_bandwidth(totals.avg, Bandwidth::ZERO),
            None => Self::warn_missing(&bus.missing.avg_path, bus.index, "average bandwidth path"),
        }
        match &bus.hrt_path {
            Some(path) => path.request_bandwidth(Bandwidth::ZERO, totals.hrt_total),
            None => Self::warn_missing(&bus.missing.hrt_path, bus.index, "hrt bandwidth path"),
        }
        bus.state.lock().avg_request = totals.avg;

        let total = totals.avg.saturating_add(totals.hrt_total);
        let mode = self.tunables.freq_mode();
        if let Some(opp) = select_opp(total, bus.params.bus_width, &bus.params.opps, mode) {
            self.apply_opp(bus, rate, opp);
        }

        self.update_channel_step(bus, features);
        self.push_hrt(bus.index, totals.hrt);
    }

    fn program_limiters(&self, bus: &BusNode, rate: u64, ports: &[(&PortNode, PortState)]) {
        let Some(smi) = &bus.smi else {
            Self::warn_missing(&bus.missing.smi, bus.index, "register access");
            return;
        };
        let qos_bound = self.is_qos_bound();
        for (port, state) in ports {
            let Some(value) = limiter_value(
                state.agg.mix,
                state.agg.peak,
                mhz(rate),
                qos_bound,
                port.category == PortCategory::MaxBwl,
            ) else {
                continue;
            };
            if port.state.lock().limiter.replace(value) == Some(value) {
                continue;
            }
            smi.write_common_bw_limiter(port.hw_port, value);
            if self.tunables.logs(LogMask::LIMITER) {
                debug!("comm{} port {}: limiter {value:#x}", bus.index, port.hw_port);
            }
        }
    }

    /// Move the segment to `opp`. Voltage goes up before the clock and down after it.
    fn apply_opp(&self, bus: &BusNode, current_rate: u64, opp: Opp) {
        let previous_uv = {
            let mut state = bus.state.lock();
            if current_rate == opp.rate_hz && state.microvolt == opp.microvolt {
                return;
            }
            let previous = state.microvolt;
            state.rate_hz = opp.rate_hz;
            state.microvolt = opp.microvolt;
            state.smi_clk_mhz = mhz(opp.rate_hz);
            previous
        };
        let raise = opp.microvolt > previous_uv;
        let set_voltage = || match &bus.regulator {
            Some(regulator) => regulator.set_voltage(opp.microvolt),
            None => Self::warn_missing(&bus.missing.regulator, bus.index, "regulator"),
        };
        if raise {
            set_voltage();
        }
        if let Some(clock) = &bus.clock {
            clock.set_rate(opp.rate_hz);
        }
        if !raise {
            set_voltage();
        }
        if self.tunables.logs(LogMask::BW) {
            debug!(
                "comm{}: {} MHz at {} uV",
                bus.index,
                mhz(opp.rate_hz),
                opp.microvolt
            );
        }
    }

    fn update_channel_step(&self, bus: &BusNode, features: Features) {
        let dynamic = features.contains(Features::DYNAMIC_URATE);
        let (max, display_max, sums) = {
            let channels = self.channels.lock();
            (
                channels.compute_max_channel_bw(bus.index, dynamic),
                channels.compute_max_display_bw(bus.index, dynamic),
                channels.segment(bus.index).collect::<Vec<_>>(),
            )
        };
        let step = dram_step(max, &self.dram_steps);
        {
            let mut state = bus.state.lock();
            state.channel_max = max;
            state.dram_step = step;
        }

        if features.contains(Features::CHANNEL_BW) {
            let request = step
                .and_then(|i| self.dram_steps.get(i).copied())
                .unwrap_or(max);
            match &bus.chn_path {
                Some(path) => path.request_bandwidth(request, Bandwidth::ZERO),
                None => Self::warn_missing(&bus.missing.chn_path, bus.index, "channel path"),
            }
        }
        if self.tunables.logs(LogMask::CHANNEL) {
            debug!(
                "comm{}: channel max {max} (display {display_max}) step {step:?}",
                bus.index
            );
        }
        for (channel, s) in sums {
            self.history.record(
                EntityKey::Channel(channel),
                &[
                    s.srt_r.into(),
                    s.srt_w.into(),
                    s.hrt_r.into(),
                    s.hrt_w.into(),
                    max.into(),
                ],
            );
        }
    }

    /// Store the segment's HRT totals and push every system-wide total that changed.
    fn push_hrt(&self, bus: u16, hrt: [Bandwidth; HrtKind::COUNT]) {
        let (changed, sums) = {
            let mut totals = self.hrt_totals.lock();
            totals.per_bus.insert(bus, hrt);
            let mut sums = [Bandwidth::ZERO; HrtKind::COUNT];
            for per_bus in totals.per_bus.values() {
                for (sum, value) in sums.iter_mut().zip(per_bus) {
                    *sum = sum.saturating_add(*value);
                }
            }
            let changed: Vec<(HrtKind, Bandwidth)> = HrtKind::iter()
                .filter(|kind| totals.pushed[kind.slot()] != Some(sums[kind.slot()]))
                .map(|kind| (kind, sums[kind.slot()]))
                .collect();
            for (kind, value) in &changed {
                totals.pushed[kind.slot()] = Some(*value);
            }
            (changed, sums)
        };
        if changed.is_empty() {
            return;
        }
        if let Some(service) = &self.hrt {
            for (kind, value) in &changed {
                service.set_hrt_bw(*kind, *value);
                if self.tunables.logs(LogMask::HRT) {
                    debug!("hrt {kind}: {value}");
                }
            }
        }
        let total = sums.iter().fold(Bandwidth::ZERO, |a, b| a.saturating_add(*b));
        let fields: Vec<u64> = sums
            .iter()
            .map(|b| u64::from(*b))
            .chain([u64::from(total)])
            .collect();
        self.history.record(EntityKey::HrtTotal, &fields);
    }

    /// Hand the segment's port values to the co-processor.
    ///
    /// Payload: segment index, comm total, average, HRT total, port count, then
    /// `(hw port, avg, peak, mix)` per port.
    fn offload_bus(&self, bus: &BusNode, totals: &Totals, ports: &[(&PortNode, PortState)]) {
        let Some(offload) = &self.offload else {
            return;
        };
        let mut payload = vec![
            u32::from(bus.index),
            totals.comm.mbps(),
            totals.avg.mbps(),
            totals.hrt_total.mbps(),
            u32::try_from(ports.len()).unwrap_or(u32::MAX),
        ];
        for (port, state) in ports {
            payload.extend([
                u32::from(port.hw_port),
                state.agg.avg.mbps(),
                state.agg.peak.mbps(),
                state.agg.mix.mbps(),
            ]);
        }
        let index = u8::try_from(bus.index).unwrap_or(u8::MAX);
        match offload.send_with_payload(Function::CommBw, index, &payload) {
            Ok(()) => {
                if self.tunables.logs(LogMask::VCP) {
                    debug!("comm{}: offloaded {} word(s)", bus.index, payload.len());
                }
            }
            Err(e) => warn!("comm{}: offload failed, update skipped: {e}", bus.index),
        }
    }

    /// Ask the co-processor to reload the full state.
    pub(crate) fn offload_sync(&self) {
        let Some(offload) = &self.offload else {
            warn!("offload enabled without a co-processor channel");
            return;
        };
        match offload.send(Function::SyncState, 0) {
            Ok(()) => info!("co-processor state synchronized"),
            Err(e) => warn!("co-processor state sync failed: {e}"),
        }
    }

    /// Run one test round-trip with the low byte of `id`; 0 does nothing.
    pub(crate) fn offload_test(&self, id: u32) {
        if id == 0 {
            return;
        }
        let Some(offload) = &self.offload else {
            warn!("co-processor test {id} requested without a channel");
            return;
        };
        let index = id.to_le_bytes()[0];
        match offload.send(Function::Test, index) {
            Ok(()) => {
                let echo = offload.shm().load(layout::TEST_ECHO);
                if echo == u32::from(index) {
                    info!("co-processor test {index} passed");
                } else {
                    warn!("co-processor test {index}: echo {echo}");
                }
            }
            Err(e) => warn!("co-processor test {index} failed: {e}"),
        }
    }

    /// Bus clock notification: cache the new rate and recompute every segment.
    ///
    /// Does not take the segment aggregation locks, so it may be called from within a clock
    /// change issued by this topology.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn on_bus_clock_change(&self, bus: u16, rate_hz: u64) {
        match self.bus_node(bus) {
            Some(node) => node.state.lock().rate_hz = rate_hz,
            None => warn!("clock change on unknown segment {bus}"),
        }
        for node in self.bus_nodes() {
            self.set_bus_bandwidth(node);
        }
    }
}
