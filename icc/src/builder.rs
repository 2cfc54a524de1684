// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Declaration and validation of a topology.
//!
//! Nodes are declared with their parent's id. Parents must be declared before their children
//! are built, but declarations may be added in any order: [`TopologyBuilder::build`] creates
//! buses first, then common ports, larbs and leaf ports.

use crate::aggregate::Aggregate;
use crate::bw::Direction;
use crate::channel::ChannelBalancer;
use crate::errors::TopologyError;
use crate::history::Recorder;
use crate::hw::{BandwidthPath, BusClock, HrtConfig, HrtService, Regulator, SmiDevice};
use crate::node::{Channel, NodeId, NodeKind, PortCategory};
use crate::params::{BusParams, QosParams};
use crate::topology::{
    BusNode, BusState, HrtTotals, LarbNode, LeafNode, LeafState, Missing, Node, PortNode,
    PortState, Slot, Topology,
};
use crate::tunables::Tunables;
use derive_builder::Builder;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{debug, info};
use vcp::Offload;

/// A bus segment (common bus).
#[derive(Builder, Clone)]
#[builder(pattern = "owned")]
pub struct BusDecl {
    pub index: u16,
    #[builder(setter(into), default)]
    pub name: String,
    #[builder(default)]
    pub params: BusParams,
    #[builder(setter(strip_option), default)]
    pub clock: Option<Arc<dyn BusClock>>,
    #[builder(setter(strip_option), default)]
    pub regulator: Option<Arc<dyn Regulator>>,
    /// Path carrying the average request.
    #[builder(setter(strip_option), default)]
    pub avg_path: Option<Arc<dyn BandwidthPath>>,
    /// Path carrying the normalized HRT request.
    #[builder(setter(strip_option), default)]
    pub hrt_path: Option<Arc<dyn BandwidthPath>>,
    /// Path carrying the memory-controller step.
    #[builder(setter(strip_option), default)]
    pub chn_path: Option<Arc<dyn BandwidthPath>>,
    /// Register access of the common bus.
    #[builder(setter(strip_option), default)]
    pub smi: Option<Arc<dyn SmiDevice>>,
}

/// A common port.
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned")]
pub struct PortDecl {
    pub index: u16,
    #[builder(setter(into), default)]
    pub name: String,
    /// The common bus above.
    pub parent: NodeId,
    #[builder(default)]
    pub category: PortCategory,
    /// Memory channel within the segment.
    #[builder(default)]
    pub chn: u8,
}

/// A local arbiter.
#[derive(Builder, Clone)]
#[builder(pattern = "owned")]
pub struct LarbDecl {
    pub index: u16,
    #[builder(setter(into), default)]
    pub name: String,
    /// The common port above.
    pub parent: NodeId,
    #[builder(default)]
    pub dir: Direction,
    #[builder(default = 1)]
    pub ratio: u32,
    #[builder(setter(strip_option), default)]
    pub smi: Option<Arc<dyn SmiDevice>>,
    /// Device this larb reports its bandwidth to.
    #[builder(setter(strip_option), default)]
    pub mirror: Option<Arc<dyn BandwidthPath>>,
}

/// A leaf (master) port.
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned")]
pub struct LeafDecl {
    pub index: u16,
    #[builder(setter(into), default)]
    pub name: String,
    /// The larb above.
    pub parent: NodeId,
    #[builder(default)]
    pub dir: Direction,
    #[builder(default = 1)]
    pub ratio: u32,
    /// Outstanding-transaction limit programmed while the port is idle.
    #[builder(setter(strip_option), default)]
    pub direct_ostdl: Option<u32>,
}

/// Collects node declarations and builds a [`Topology`].
pub struct TopologyBuilder {
    qos: QosParams,
    hrt: Option<Arc<dyn HrtService>>,
    offload: Option<Arc<Offload>>,
    buses: Vec<BusDecl>,
    ports: Vec<PortDecl>,
    larbs: Vec<LarbDecl>,
    leaves: Vec<LeafDecl>,
}

fn ratio(id: NodeId, ratio: u32) -> Result<NonZeroU32, TopologyError> {
    NonZeroU32::new(ratio).ok_or(TopologyError::ZeroRatio(id))
}

fn name_or_id(name: String, id: NodeId) -> String {
    if name.is_empty() {
        id.to_string()
    } else {
        name
    }
}

struct Arena {
    slots: Vec<Slot>,
    index: HashMap<NodeId, usize>,
}

impl Arena {
    fn insert(
        &mut self,
        id: NodeId,
        name: String,
        parent: Option<usize>,
        node: Node,
    ) -> Result<usize, TopologyError> {
        if self.index.contains_key(&id) {
            return Err(TopologyError::DuplicateNode(id));
        }
        let slot = self.slots.len();
        self.slots.push(Slot {
            id,
            name: name_or_id(name, id),
            parent,
            children: Vec::new(),
            node,
        });
        self.index.insert(id, slot);
        if let Some(parent) = parent {
            self.slots[parent].children.push(slot);
        }
        Ok(slot)
    }

    /// Slot of `parent`, checked to be what a node of kind `kind` hangs from.
    fn parent(
        &self,
        node: NodeId,
        kind: NodeKind,
        parent: NodeId,
    ) -> Result<usize, TopologyError> {
        let slot = *self
            .index
            .get(&parent)
            .ok_or(TopologyError::UnknownParent { node, parent })?;
        let found = self.slots[slot].id.kind();
        match (kind.parent(), found) {
            (Some(expected), Some(found)) if expected == found => Ok(slot),
            (Some(expected), Some(found)) => Err(TopologyError::WrongParentKind {
                node,
                parent,
                found,
                expected,
            }),
            _ => Err(TopologyError::UnknownParent { node, parent }),
        }
    }

    /// Number of children `slot` has so far: the port number of the next one.
    fn next_hw_port(&self, slot: usize) -> u16 {
        u16::try_from(self.slots[slot].children.len()).unwrap_or(u16::MAX)
    }
}

impl TopologyBuilder {
    #[must_use]
    pub fn new(qos: QosParams) -> Self {
        Self {
            qos,
            hrt: None,
            offload: None,
            buses: Vec::new(),
            ports: Vec::new(),
            larbs: Vec::new(),
            leaves: Vec::new(),
        }
    }

    #[must_use]
    pub fn hrt(mut self, hrt: Arc<dyn HrtService>) -> Self {
        self.hrt = Some(hrt);
        self
    }

    #[must_use]
    pub fn offload(mut self, offload: Arc<Offload>) -> Self {
        self.offload = Some(offload);
        self
    }

    #[must_use]
    pub fn add_bus(mut self, decl: BusDecl) -> Self {
        self.buses.push(decl);
        self
    }

    #[must_use]
    pub fn add_common_port(mut self, decl: PortDecl) -> Self {
        self.ports.push(decl);
        self
    }

    #[must_use]
    pub fn add_larb(mut self, decl: LarbDecl) -> Self {
        self.larbs.push(decl);
        self
    }

    #[must_use]
    pub fn add_leaf_port(mut self, decl: LeafDecl) -> Self {
        self.leaves.push(decl);
        self
    }

    /// Validate the declarations and build the topology. The HRT service, if any, is
    /// initialized here.
    pub fn build(self) -> Result<Topology, TopologyError> {
        let mut arena = Arena {
            slots: Vec::new(),
            index: HashMap::new(),
        };
        let mut buses = BTreeMap::new();
        let mut channels = ChannelBalancer::default();

        for decl in self.buses {
            let id = NodeId::common_bus(decl.index);
            let mut params = decl.params;
            if params.opps.is_empty() {
                return Err(TopologyError::NoOpps(decl.index));
            }
            if params.channels == 0 {
                return Err(TopologyError::NoChannels(decl.index));
            }
            params.opps.sort_unstable();
            for chn in 0..params.channels {
                channels.register(Channel::new(decl.index, chn));
            }
            let rate_hz = decl.clock.as_ref().map_or(0, |clock| clock.rate());
            let bus = BusNode {
                index: decl.index,
                params,
                clock: decl.clock,
                regulator: decl.regulator,
                avg_path: decl.avg_path,
                hrt_path: decl.hrt_path,
                chn_path: decl.chn_path,
                smi: decl.smi,
                agg_lock: Mutex::new(()),
                state: Mutex::new(BusState {
                    rate_hz,
                    ..BusState::default()
                }),
                missing: Missing::default(),
            };
            let slot = arena.insert(id, decl.name, None, Node::CommonBus(bus))?;
            buses.insert(decl.index, slot);
        }

        let mut hrt_ports = Vec::new();
        for decl in self.ports {
            let id = NodeId::common_port(decl.index);
            let parent = arena.parent(id, NodeKind::CommonPort, decl.parent)?;
            let channels_on_bus = match &arena.slots[parent].node {
                Node::CommonBus(bus) => bus.params.channels,
                _ => 0,
            };
            if decl.chn >= channels_on_bus {
                return Err(TopologyError::ChannelOutOfRange {
                    port: id,
                    chn: decl.chn,
                    channels: channels_on_bus,
                });
            }
            if let Some(kind) = decl.category.hrt_kind() {
                hrt_ports.push((id, kind));
            }
            let port = PortNode {
                category: decl.category,
                channel: Channel::new(decl.parent.index(), decl.chn),
                hw_port: arena.next_hw_port(parent),
                state: Mutex::new(PortState::default()),
            };
            arena.insert(id, decl.name, Some(parent), Node::CommonPort(port))?;
        }

        for decl in self.larbs {
            let id = NodeId::larb(decl.index);
            let parent = arena.parent(id, NodeKind::Larb, decl.parent)?;
            let category = match &arena.slots[parent].node {
                Node::CommonPort(port) => port.category,
                _ => PortCategory::None,
            };
            let larb = LarbNode {
                dir: decl.dir,
                ratio: ratio(id, decl.ratio)?,
                category,
                smi: decl.smi,
                mirror: decl.mirror,
                state: Mutex::new(Aggregate::default()),
            };
            arena.insert(id, decl.name, Some(parent), Node::Larb(larb))?;
        }

        for decl in self.leaves {
            let id = NodeId::leaf(decl.index);
            let parent = arena.parent(id, NodeKind::LeafPort, decl.parent)?;
            let (category, smi) = match &arena.slots[parent].node {
                Node::Larb(larb) => (larb.category, larb.smi.clone()),
                _ => (PortCategory::None, None),
            };
            let leaf = LeafNode {
                dir: decl.dir,
                ratio: ratio(id, decl.ratio)?,
                direct: decl.direct_ostdl,
                category,
                hw_port: arena.next_hw_port(parent),
                smi,
                state: Mutex::new(LeafState::default()),
            };
            arena.insert(id, decl.name, Some(parent), Node::Leaf(leaf))?;
        }

        if let Some(hrt) = &self.hrt {
            hrt.init_hrt(&HrtConfig {
                segments: buses.keys().copied().collect(),
                ports: hrt_ports,
            });
        }

        info!(
            "topology built: {} node(s) on {} segment(s)",
            arena.slots.len(),
            buses.len()
        );
        debug!("{}", self.qos);
        let mut dram_steps = self.qos.dram_steps;
        dram_steps.sort_unstable();

        Ok(Topology {
            slots: arena.slots,
            index: arena.index,
            buses,
            tunables: Tunables::new(self.qos.features, self.qos.log_mask),
            limits: self.qos.ostdl,
            dram_steps,
            channels: Mutex::new(channels),
            history: Recorder::new(),
            hrt: self.hrt,
            hrt_totals: Mutex::new(HrtTotals::default()),
            offload: self.offload,
            qos_bound: AtomicBool::new(false),
        })
    }
}

impl Topology {
    #[must_use]
    pub fn builder(qos: QosParams) -> TopologyBuilder {
        TopologyBuilder::new(qos)
    }
}
