// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The aggregation tree and its runtime entry points.
//!
//! A [`Topology`] owns every node, the channel balancer, the history recorder and the
//! tunables. It is built once by a [`crate::TopologyBuilder`] and never changes shape.
//!
//! Locks are always taken in this order: segment aggregation lock, bus state, port state,
//! channel balancer. No lock is held while calling into a collaborator.

mod root;
mod set;

use crate::aggregate::Aggregate;
use crate::bw::{Bandwidth, Direction};
use crate::channel::{ChannelBalancer, ChannelSums, Contribution};
use crate::history::Recorder;
use crate::hw::{BandwidthPath, BusClock, HrtService, Regulator, SmiDevice};
use crate::node::{Channel, HrtKind, NodeId, PortCategory};
use crate::params::BusParams;
use crate::translate::OstdlLimits;
use crate::tunables::{Features, Tunable, TunableError, Tunables};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strum::EnumCount;
use tracing::{info, warn};
use vcp::Offload;

/// Set on first use; used to report a missing collaborator only once.
#[derive(Debug, Default)]
pub(crate) struct Latch(AtomicBool);

impl Latch {
    /// True the first time only.
    pub(crate) fn first(&self) -> bool {
        !self.0.swap(true, Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Missing {
    pub(crate) clock: Latch,
    pub(crate) rate: Latch,
    pub(crate) regulator: Latch,
    pub(crate) avg_path: Latch,
    pub(crate) hrt_path: Latch,
    pub(crate) chn_path: Latch,
    pub(crate) smi: Latch,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct LeafState {
    pub(crate) avg: Bandwidth,
    pub(crate) peak: Bandwidth,
}

pub(crate) struct LeafNode {
    pub(crate) dir: Direction,
    pub(crate) ratio: NonZeroU32,
    pub(crate) direct: Option<u32>,
    /// Category of the common port above.
    pub(crate) category: PortCategory,
    /// Port number on the larb.
    pub(crate) hw_port: u16,
    /// Register access of the larb.
    pub(crate) smi: Option<Arc<dyn SmiDevice>>,
    pub(crate) state: Mutex<LeafState>,
}

pub(crate) struct LarbNode {
    pub(crate) dir: Direction,
    pub(crate) ratio: NonZeroU32,
    pub(crate) category: PortCategory,
    pub(crate) smi: Option<Arc<dyn SmiDevice>>,
    /// Device this larb reports its bandwidth to.
    pub(crate) mirror: Option<Arc<dyn BandwidthPath>>,
    pub(crate) state: Mutex<Aggregate>,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct PortState {
    pub(crate) agg: Aggregate,
    pub(crate) contribution: Contribution,
    /// Last limiter value written.
    pub(crate) limiter: Option<u32>,
}

pub(crate) struct PortNode {
    pub(crate) category: PortCategory,
    pub(crate) channel: Channel,
    /// Port number on the common bus.
    pub(crate) hw_port: u16,
    pub(crate) state: Mutex<PortState>,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct BusState {
    pub(crate) rate_hz: u64,
    pub(crate) microvolt: u32,
    pub(crate) smi_clk_mhz: u32,
    pub(crate) agg: Aggregate,
    /// Co-processor-visible total: every port's average plus peak.
    pub(crate) comm_total: Bandwidth,
    pub(crate) avg_request: Bandwidth,
    pub(crate) hrt: [Bandwidth; HrtKind::COUNT],
    pub(crate) channel_max: Bandwidth,
    pub(crate) dram_step: Option<usize>,
}

pub(crate) struct BusNode {
    pub(crate) index: u16,
    pub(crate) params: BusParams,
    pub(crate) clock: Option<Arc<dyn BusClock>>,
    pub(crate) regulator: Option<Arc<dyn Regulator>>,
    pub(crate) avg_path: Option<Arc<dyn BandwidthPath>>,
    pub(crate) hrt_path: Option<Arc<dyn BandwidthPath>>,
    pub(crate) chn_path: Option<Arc<dyn BandwidthPath>>,
    pub(crate) smi: Option<Arc<dyn SmiDevice>>,
    /// Serializes aggregation passes through this segment.
    pub(crate) agg_lock: Mutex<()>,
    pub(crate) state: Mutex<BusState>,
    pub(crate) missing: Missing,
}

pub(crate) enum Node {
    Leaf(LeafNode),
    Larb(LarbNode),
    CommonPort(PortNode),
    CommonBus(BusNode),
}

pub(crate) struct Slot {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) node: Node,
}

/// Consistent view of one common port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSnapshot {
    pub id: NodeId,
    pub name: String,
    pub category: PortCategory,
    pub channel: Channel,
    pub avg: Bandwidth,
    pub peak: Bandwidth,
    pub mix: Bandwidth,
    pub saturated: bool,
    pub limiter: Option<u32>,
}

/// Last settings computed for one bus segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusSnapshot {
    pub index: u16,
    pub name: String,
    pub rate_hz: u64,
    pub microvolt: u32,
    pub smi_clk_mhz: u32,
    pub avg: Bandwidth,
    pub peak: Bandwidth,
    pub comm_total: Bandwidth,
    pub avg_request: Bandwidth,
    pub hrt: [Bandwidth; HrtKind::COUNT],
    pub channel_max: Bandwidth,
    pub dram_step: Option<usize>,
}

/// The interconnect QoS context.
pub struct Topology {
    pub(crate) slots: Vec<Slot>,
    pub(crate) index: HashMap<NodeId, usize>,
    /// Slot of every common bus, by segment index.
    pub(crate) buses: BTreeMap<u16, usize>,
    pub(crate) tunables: Tunables,
    pub(crate) limits: OstdlLimits,
    pub(crate) dram_steps: Vec<Bandwidth>,
    pub(crate) channels: Mutex<ChannelBalancer>,
    pub(crate) history: Recorder,
    pub(crate) hrt: Option<Arc<dyn HrtService>>,
    /// Normalized HRT totals per segment, and the sums last pushed to the HRT service.
    pub(crate) hrt_totals: Mutex<HrtTotals>,
    pub(crate) offload: Option<Arc<Offload>>,
    pub(crate) qos_bound: AtomicBool,
}

#[derive(Debug, Default)]
pub(crate) struct HrtTotals {
    pub(crate) per_bus: BTreeMap<u16, [Bandwidth; HrtKind::COUNT]>,
    pub(crate) pushed: [Option<Bandwidth>; HrtKind::COUNT],
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("nodes", &self.slots.len())
            .field("buses", &self.buses.keys().collect::<Vec<_>>())
            .field("tunables", &self.tunables)
            .field("offload", &self.offload)
            .finish_non_exhaustive()
    }
}

impl Topology {
    #[must_use]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    #[must_use]
    pub fn history(&self) -> &Recorder {
        &self.history
    }

    #[must_use]
    pub fn offload(&self) -> Option<&Arc<Offload>> {
        self.offload.as_ref()
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    #[must_use]
    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.slot(id).map(|s| s.name.as_str())
    }

    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.slot(id)?.parent?;
        Some(self.slots[parent].id)
    }

    #[must_use]
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.slot(id)
            .map(|s| s.children.iter().map(|c| self.slots[*c].id).collect())
            .unwrap_or_default()
    }

    /// Every node id, in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.iter().map(|s| s.id)
    }

    /// Segment indexes, ascending.
    pub fn segments(&self) -> impl Iterator<Item = u16> + '_ {
        self.buses.keys().copied()
    }

    pub(crate) fn slot(&self, id: NodeId) -> Option<&Slot> {
        self.index.get(&id).map(|i| &self.slots[*i])
    }

    pub(crate) fn bus_node(&self, index: u16) -> Option<&BusNode> {
        let slot = self.buses.get(&index)?;
        match &self.slots[*slot].node {
            Node::CommonBus(bus) => Some(bus),
            _ => None,
        }
    }

    pub(crate) fn bus_nodes(&self) -> impl Iterator<Item = &BusNode> + '_ {
        self.buses.keys().filter_map(|index| self.bus_node(*index))
    }

    /// Last request of a leaf port.
    #[must_use]
    pub fn leaf(&self, id: NodeId) -> Option<(Bandwidth, Bandwidth)> {
        match &self.slot(id)?.node {
            Node::Leaf(leaf) => {
                let state = *leaf.state.lock();
                Some((state.avg, state.peak))
            }
            _ => None,
        }
    }

    /// Aggregate of a larb.
    #[must_use]
    pub fn larb(&self, id: NodeId) -> Option<Aggregate> {
        match &self.slot(id)?.node {
            Node::Larb(larb) => Some(*larb.state.lock()),
            _ => None,
        }
    }

    #[must_use]
    pub fn port(&self, id: NodeId) -> Option<PortSnapshot> {
        let slot = self.slot(id)?;
        let Node::CommonPort(port) = &slot.node else {
            return None;
        };
        let state = *port.state.lock();
        Some(PortSnapshot {
            id,
            name: slot.name.clone(),
            category: port.category,
            channel: port.channel,
            avg: state.agg.avg,
            peak: state.agg.peak,
            mix: state.agg.mix,
            saturated: state.agg.saturated,
            limiter: state.limiter,
        })
    }

    /// Every common port, in declaration order.
    #[must_use]
    pub fn ports(&self) -> Vec<PortSnapshot> {
        self.slots
            .iter()
            .filter(|s| matches!(s.node, Node::CommonPort(_)))
            .filter_map(|s| self.port(s.id))
            .collect()
    }

    #[must_use]
    pub fn bus(&self, index: u16) -> Option<BusSnapshot> {
        let slot = &self.slots[*self.buses.get(&index)?];
        let Node::CommonBus(bus) = &slot.node else {
            return None;
        };
        let state = *bus.state.lock();
        Some(BusSnapshot {
            index,
            name: slot.name.clone(),
            rate_hz: state.rate_hz,
            microvolt: state.microvolt,
            smi_clk_mhz: state.smi_clk_mhz,
            avg: state.agg.avg,
            peak: state.agg.peak,
            comm_total: state.comm_total,
            avg_request: state.avg_request,
            hrt: state.hrt,
            channel_max: state.channel_max,
            dram_step: state.dram_step,
        })
    }

    #[must_use]
    pub fn channel_sums(&self, channel: Channel) -> ChannelSums {
        self.channels.lock().sums(channel)
    }

    #[must_use]
    pub fn display_channel_sums(&self, channel: Channel) -> ChannelSums {
        self.channels.lock().display_sums(channel)
    }

    /// Bandwidth the busiest channel of a segment needs under the current policy.
    #[must_use]
    pub fn max_channel_bw(&self, bus: u16) -> Bandwidth {
        let dynamic = self.tunables.has(Features::DYNAMIC_URATE);
        self.channels.lock().compute_max_channel_bw(bus, dynamic)
    }

    /// Zero the channel sums. Ports are accounted again on their next update.
    pub fn reset_channels(&self) {
        self.channels.lock().reset();
        info!("channel sums reset");
    }

    /// Rebuild the channel sums from every port's current contribution.
    pub fn rebuild_channels(&self) {
        let separate = self.tunables.has(Features::DISP_SEPARATE);
        let ports: Vec<(NodeId, Channel, Contribution, bool)> = self
            .slots
            .iter()
            .filter_map(|slot| match &slot.node {
                Node::CommonPort(port) => Some((
                    slot.id,
                    port.channel,
                    port.state.lock().contribution,
                    separate && port.category.is_display(),
                )),
                _ => None,
            })
            .collect();
        let mut channels = self.channels.lock();
        channels.reset();
        for (id, channel, contribution, display) in ports {
            channels.update_channel(id, channel, contribution, display);
        }
    }

    #[must_use]
    pub fn is_qos_bound(&self) -> bool {
        self.qos_bound.load(Ordering::Relaxed)
    }

    /// Record whether the system is currently QoS-bound and reprogram every segment.
    pub fn set_qos_bound(&self, bound: bool) {
        if self.qos_bound.swap(bound, Ordering::Relaxed) != bound {
            info!("qos bound: {bound}");
            self.recompute_all();
        }
    }

    /// Recompute every segment.
    pub fn recompute_all(&self) {
        for bus in self.bus_nodes() {
            let _serial = bus.agg_lock.lock();
            self.set_bus_bandwidth(bus);
        }
    }

    /// Set a tunable by name and apply its side effects.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn set_tunable(&self, name: &str, raw: &str) -> Result<Tunable, TunableError> {
        let before = self.tunables.features();
        let tunable = self.tunables.set(name, raw)?;
        info!("{tunable} = {:#x}", self.tunables.get(tunable));
        match tunable {
            Tunable::VcpTestId => self.offload_test(self.tunables.vcp_test_id()),
            Tunable::Features => {
                let after = self.tunables.features();
                if (before ^ after).contains(Features::DISP_SEPARATE) {
                    self.rebuild_channels();
                }
                if after.contains(Features::VCP_OFFLOAD) && !before.contains(Features::VCP_OFFLOAD)
                {
                    self.offload_sync();
                }
                self.recompute_all();
            }
            Tunable::FreqMode => self.recompute_all(),
            Tunable::LogMask => {}
        }
        Ok(tunable)
    }

    /// Whether a camera port other than `except` currently holds bandwidth.
    pub(crate) fn camera_busy(&self, except: Option<usize>) -> bool {
        self.slots.iter().enumerate().any(|(i, slot)| match &slot.node {
            Node::CommonPort(port) if port.category == PortCategory::Camera && Some(i) != except => {
                let state = port.state.lock();
                !state.agg.avg.is_zero() || !state.agg.peak.is_zero()
            }
            _ => false,
        })
    }

    /// Slot of the closest ancestor (or self) that is a common port.
    pub(crate) fn port_above(&self, mut slot: usize) -> Option<usize> {
        loop {
            if matches!(self.slots[slot].node, Node::CommonPort(_)) {
                return Some(slot);
            }
            slot = self.slots[slot].parent?;
        }
    }

    pub(crate) fn bus_above(&self, mut slot: usize) -> Option<&BusNode> {
        loop {
            if let Node::CommonBus(bus) = &self.slots[slot].node {
                return Some(bus);
            }
            slot = self.slots[slot].parent?;
        }
    }

    pub(crate) fn warn_missing(latch: &Latch, bus: u16, what: &str) {
        if latch.first() {
            warn!("comm{bus}: no {what}; skipping");
        }
    }
}
