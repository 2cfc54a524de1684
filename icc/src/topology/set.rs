// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Propagation of a leaf request up the tree.
//!
//! Larbs and common ports on the path from a leaf to its segment aggregate the requests of
//! all the leaves below them; the segment sums its common ports. The hop into each node is
//! then applied by [`Topology::set`].

use super::{LeafNode, LeafState, Node, PortNode, Topology};
use crate::aggregate::{Aggregate, fold};
use crate::bw::Bandwidth;
use crate::channel::Contribution;
use crate::history::{EntityKey, LarbEvent};
use crate::node::NodeId;
use crate::translate::{OstdlPolicy, ostdl};
use crate::tunables::{Features, LogMask};
use tracing::{debug, error};

impl Topology {
    /// Apply a new `(avg, peak)` request on a leaf port and propagate it to the root.
    ///
    /// Unknown ids and ids that are not leaf ports are reported and ignored.
    #[tracing::instrument(level = "debug", skip(self), fields(avg = %avg, peak = %peak))]
    pub fn update_port(&self, leaf: NodeId, avg: Bandwidth, peak: Bandwidth) {
        let Some(&slot) = self.index.get(&leaf) else {
            error!("update for unknown node {leaf} ignored");
            return;
        };
        let Node::Leaf(port) = &self.slots[slot].node else {
            error!("{leaf} is not a leaf port: update ignored");
            return;
        };
        let Some(bus) = self.bus_above(slot) else {
            error!("{leaf} is not attached to a bus segment: update ignored");
            return;
        };

        let _serial = bus.agg_lock.lock();
        *port.state.lock() = LeafState { avg, peak };
        if self.tunables.logs(LogMask::BW) {
            debug!("{}: avg {avg} peak {peak}", self.slots[slot].name);
        }

        let mut src = slot;
        while let Some(dst) = self.slots[src].parent {
            self.reaggregate(dst);
            self.set(src, dst);
            src = dst;
        }
    }

    /// Every leaf below `slot` with its last request.
    fn leaves_below(&self, slot: usize) -> Vec<(NodeId, &LeafNode, LeafState)> {
        let mut out = Vec::new();
        let mut pending = vec![slot];
        while let Some(next) = pending.pop() {
            let next = &self.slots[next];
            match &next.node {
                Node::Leaf(leaf) => out.push((next.id, leaf, *leaf.state.lock())),
                _ => pending.extend(next.children.iter().rev()),
            }
        }
        out
    }

    /// Recompute the aggregate of the node in `slot` from the leaves below it.
    fn reaggregate(&self, slot: usize) {
        let features = self.tunables.features();
        let requests = |exempt| {
            let leaves = self.leaves_below(slot);
            let agg = fold(
                leaves.iter().map(|(id, _, s)| (id.raw(), s.avg, s.peak)),
                exempt,
            );
            let contribution: Contribution = leaves
                .iter()
                .map(|(_, leaf, s)| {
                    let peak = if exempt && s.peak.is_max() {
                        Bandwidth::ZERO
                    } else {
                        s.peak
                    };
                    Contribution::from_demand(leaf.dir, s.avg, peak)
                })
                .sum();
            (agg, contribution)
        };

        match &self.slots[slot].node {
            Node::Larb(larb) => {
                let (agg, _) = requests(larb.category.is_exempt(features));
                *larb.state.lock() = agg;
            }
            Node::CommonPort(port) => {
                let (agg, contribution) = requests(port.category.is_exempt(features));
                let mut state = port.state.lock();
                state.agg = agg;
                state.contribution = contribution;
            }
            Node::CommonBus(bus) => {
                // ports have already resolved their sentinels under their own policy
                let agg = self.slots[slot]
                    .children
                    .iter()
                    .filter_map(|child| match &self.slots[*child].node {
                        Node::CommonPort(port) => Some(port.state.lock().agg),
                        _ => None,
                    })
                    .fold(Aggregate::default(), Aggregate::merge);
                bus.state.lock().agg = agg;
            }
            Node::Leaf(_) => {
                error!("{}: leaf ports do not aggregate", self.slots[slot].id);
            }
        }
    }

    /// Apply the hop from `src` into its parent `dst`.
    fn set(&self, src: usize, dst: usize) {
        match &self.slots[dst].node {
            Node::Larb(_) => self.set_larb(src, dst),
            Node::CommonPort(port) => self.set_common_port(src, dst, port),
            Node::CommonBus(bus) => self.set_bus_bandwidth(bus),
            Node::Leaf(_) => {
                error!("{}: a leaf port cannot be a destination", self.slots[dst].id);
            }
        }
    }

    /// Leaf into larb: program the leaf's outstanding-transaction limit and mirror the larb.
    fn set_larb(&self, src: usize, dst: usize) {
        let Node::Larb(larb) = &self.slots[dst].node else {
            return;
        };
        let leaf_slot = &self.slots[src];
        let Node::Leaf(leaf) = &leaf_slot.node else {
            error!("{}: unexpected child {}", self.slots[dst].id, leaf_slot.id);
            return;
        };
        let features = self.tunables.features();
        let state = *leaf.state.lock();

        let mut value = 0;
        if features.contains(Features::LARB_OSTDL) {
            let policy = OstdlPolicy {
                exempt: leaf.category.is_exempt(features),
                camera_busy: self.camera_busy(self.port_above(dst)),
                direct: leaf.direct,
            };
            value = ostdl(
                state.avg,
                leaf.ratio,
                state.peak.is_max(),
                &self.limits,
                &policy,
            );
            if let Some(smi) = &leaf.smi {
                smi.write_larb_ostdl(leaf.hw_port, value);
            }
            if self.tunables.logs(LogMask::OSTDL) {
                debug!("{}: larb ostdl {value:#x}", leaf_slot.name);
            }
        }

        self.history.record(
            EntityKey::LarbPort(leaf_slot.id),
            &[state.avg.into(), state.peak.into(), u64::from(value)],
        );
        self.history.set_last_larb(LarbEvent {
            at: self.history.now(),
            larb: self.slots[dst].id,
            port: leaf_slot.id,
            avg: state.avg,
            peak: state.peak,
            ostdl: value,
        });

        if let Some(mirror) = &larb.mirror {
            let agg = *larb.state.lock();
            mirror.request_bandwidth(agg.avg, agg.peak);
        }
    }

    /// Larb into common port: account the port on its channel and program the port's
    /// outstanding-transaction limit for the larb's direction.
    fn set_common_port(&self, src: usize, dst: usize, port: &PortNode) {
        let Node::Larb(larb) = &self.slots[src].node else {
            error!(
                "{}: unexpected child {}",
                self.slots[dst].id, self.slots[src].id
            );
            return;
        };
        let features = self.tunables.features();
        let id = self.slots[dst].id;
        let camera_busy = self.camera_busy(Some(dst));
        let larb_agg = *larb.state.lock();
        let state = *port.state.lock();

        let display = features.contains(Features::DISP_SEPARATE) && port.category.is_display();
        let changed =
            self.channels
                .lock()
                .update_channel(id, port.channel, state.contribution, display);
        if changed && self.tunables.logs(LogMask::CHANNEL) {
            debug!(
                "{}: {} contribution {:?}",
                self.slots[dst].name, port.channel, state.contribution
            );
        }

        if features.contains(Features::COMM_OSTDL) {
            let policy = OstdlPolicy {
                exempt: port.category.is_exempt(features),
                camera_busy,
                direct: None,
            };
            let value = ostdl(
                larb_agg.avg,
                larb.ratio,
                larb_agg.saturated,
                &self.limits,
                &policy,
            );
            if let Some(smi) = self.bus_above(dst).and_then(|bus| bus.smi.as_ref()) {
                smi.write_common_ostdl(port.hw_port, larb.dir.is_write(), value);
            }
            if self.tunables.logs(LogMask::OSTDL) {
                debug!(
                    "{}: comm ostdl {} {value:#x}",
                    self.slots[dst].name, larb.dir
                );
            }
        }

        self.history.record(
            EntityKey::CommonPort(id),
            &[
                state.agg.avg.into(),
                state.agg.peak.into(),
                state.agg.mix.into(),
            ],
        );
    }
}
