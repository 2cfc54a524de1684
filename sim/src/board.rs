// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A reference board: two bus segments populated with the usual multimedia masters, all
//! backed by simulated hardware.

use icc::fake::{FakeClock, FakeHrt, FakePath, FakeRegulator, FakeSmi, FakeVcpPeer, SmiWrite};
use icc::translate::Opp;
use icc::{
    Bandwidth, BusDecl, BusDeclBuilder, BusParamsBuilder, Direction, Features, LarbDeclBuilder,
    LeafDeclBuilder, NodeId, NodeKind, PortCategory, PortDeclBuilder, QosParamsBuilder, Topology,
    TopologyBuilder, TopologyError,
};
use std::sync::Arc;
use vcp::{Offload, OffloadParams, ShmRegion};

const SHM_BASE: u32 = 0x7fe0_0000;
const SHM_LEN: usize = 4096;

const OPPS: [Opp; 4] = [
    Opp::new(273_000_000, 575_000),
    Opp::new(416_000_000, 600_000),
    Opp::new(546_000_000, 650_000),
    Opp::new(728_000_000, 725_000),
];

/// `(index, name, category, channel)` per common port, per segment.
const PORTS: [&[(u16, &str, PortCategory, u8)]; 2] = [
    &[
        (0, "disp", PortCategory::Display, 0),
        (1, "mdp", PortCategory::DispByLarb, 1),
        (2, "cam", PortCategory::Camera, 0),
    ],
    &[
        (3, "vdec", PortCategory::VdecSrt, 0),
        (4, "venc", PortCategory::VencSrt, 1),
        (5, "gpu", PortCategory::MaxBwl, 1),
    ],
];

/// `(index, name, common port, direction, ratio)` per larb.
const LARBS: [(u16, &str, u16, Direction, u32); 6] = [
    (0, "larb0", 0, Direction::Read, 2),
    (1, "larb1", 1, Direction::Read, 1),
    (2, "larb2", 2, Direction::Write, 1),
    (4, "larb4", 3, Direction::Read, 1),
    (7, "larb7", 4, Direction::Write, 2),
    (9, "larb9", 5, Direction::Read, 4),
];

/// `(index, name, larb, direction)` per leaf port.
const LEAVES: [(u16, &str, u16, Direction); 10] = [
    (0, "ovl0", 0, Direction::Read),
    (1, "rdma0", 0, Direction::Read),
    (2, "mdp_rdma", 1, Direction::Read),
    (3, "cam_imgo", 2, Direction::Write),
    (4, "cam_rrzo", 2, Direction::Write),
    (5, "vdec_mc", 4, Direction::Read),
    (6, "vdec_ufo", 4, Direction::Read),
    (7, "venc_rec", 7, Direction::Write),
    (8, "venc_bsdma", 7, Direction::Write),
    (9, "gpu", 9, Direction::Read),
];

/// Simulated hardware of one segment.
pub struct Segment {
    pub clock: Arc<FakeClock>,
    pub regulator: Arc<FakeRegulator>,
    pub avg_path: Arc<FakePath>,
    pub hrt_path: Arc<FakePath>,
    pub chn_path: Arc<FakePath>,
    pub smi: Arc<FakeSmi>,
}

impl Segment {
    fn new() -> Self {
        Self {
            clock: FakeClock::new(OPPS[0].rate_hz),
            regulator: FakeRegulator::new(),
            avg_path: FakePath::new(),
            hrt_path: FakePath::new(),
            chn_path: FakePath::new(),
            smi: FakeSmi::new(),
        }
    }

    fn decl(&self, index: u16) -> Result<BusDecl, String> {
        let params = BusParamsBuilder::default()
            .opps(OPPS.to_vec())
            .build()
            .map_err(|e| e.to_string())?;
        BusDeclBuilder::default()
            .index(index)
            .name(format!("comm{index}"))
            .params(params)
            .clock(self.clock.clone())
            .regulator(self.regulator.clone())
            .avg_path(self.avg_path.clone())
            .hrt_path(self.hrt_path.clone())
            .chn_path(self.chn_path.clone())
            .smi(self.smi.clone())
            .build()
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("invalid declaration: {0}")]
    Declaration(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("co-processor init task: {0}")]
    Offload(String),
}

pub struct Board {
    pub topology: Topology,
    pub segments: Vec<Segment>,
    pub larb_smi: Arc<FakeSmi>,
    pub hrt: Arc<FakeHrt>,
    pub peer: Option<Arc<FakeVcpPeer>>,
}

impl Board {
    /// Build the board, with a simulated co-processor if `offload` is set.
    pub fn new(offload: bool) -> Result<Self, BoardError> {
        let decl = BoardError::Declaration;
        let qos = QosParamsBuilder::default()
            .features(
                Features::COMM_OSTDL
                    | Features::LARB_OSTDL
                    | Features::BW_LIMITER
                    | Features::CHANNEL_BW
                    | Features::DYNAMIC_URATE,
            )
            .dram_steps(
                [1600, 3200, 4266, 6400]
                    .into_iter()
                    .map(Bandwidth::from_mbps)
                    .collect::<Vec<_>>(),
            )
            .build()
            .map_err(|e| decl(e.to_string()))?;

        let segments = vec![Segment::new(), Segment::new()];
        let larb_smi = FakeSmi::new();
        let hrt = FakeHrt::new(1000);
        let mut builder = TopologyBuilder::new(qos).hrt(hrt.clone());

        let mut peer = None;
        let mut channel = None;
        if offload {
            let shm = Arc::new(ShmRegion::new(SHM_BASE, SHM_LEN));
            let fake = FakeVcpPeer::new(&shm);
            let offload = Offload::new(fake.clone(), shm, OffloadParams::default());
            builder = builder.offload(offload.clone());
            peer = Some(fake);
            channel = Some(offload);
        }

        for (index, (segment, ports)) in (0u16..).zip(segments.iter().zip(PORTS)) {
            builder = builder.add_bus(segment.decl(index).map_err(decl)?);
            for &(port, name, category, chn) in ports {
                builder = builder.add_common_port(
                    PortDeclBuilder::default()
                        .index(port)
                        .name(name)
                        .parent(NodeId::common_bus(index))
                        .category(category)
                        .chn(chn)
                        .build()
                        .map_err(|e| decl(e.to_string()))?,
                );
            }
        }
        for (index, name, port, dir, ratio) in LARBS {
            builder = builder.add_larb(
                LarbDeclBuilder::default()
                    .index(index)
                    .name(name)
                    .parent(NodeId::common_port(port))
                    .dir(dir)
                    .ratio(ratio)
                    .smi(larb_smi.clone())
                    .build()
                    .map_err(|e| decl(e.to_string()))?,
            );
        }
        for (index, name, larb, dir) in LEAVES {
            builder = builder.add_leaf_port(
                LeafDeclBuilder::default()
                    .index(index)
                    .name(name)
                    .parent(NodeId::larb(larb))
                    .dir(dir)
                    .build()
                    .map_err(|e| decl(e.to_string()))?,
            );
        }
        let topology = builder.build()?;

        if let Some(channel) = channel {
            channel
                .start()
                .map_err(|e| BoardError::Offload(e.to_string()))?
                .join()
                .map_err(|_| BoardError::Offload("panicked".to_string()))?;
        }

        Ok(Self {
            topology,
            segments,
            larb_smi,
            hrt,
            peer,
        })
    }

    /// Leaf port called `name`.
    pub fn leaf(&self, name: &str) -> Option<NodeId> {
        self.topology
            .nodes()
            .filter(|id| id.kind() == Some(NodeKind::LeafPort))
            .find(|id| self.topology.name(*id) == Some(name))
    }

    /// Names of every leaf port, in declaration order.
    pub fn leaf_names() -> impl Iterator<Item = &'static str> {
        LEAVES.iter().map(|(_, name, _, _)| *name)
    }

    /// Every register write, per device.
    pub fn writes(&self) -> Vec<(String, Vec<SmiWrite>)> {
        let mut out: Vec<(String, Vec<SmiWrite>)> = (0u16..)
            .zip(&self.segments)
            .map(|(index, s)| (format!("comm{index}"), s.smi.writes()))
            .collect();
        out.push(("larbs".to_string(), self.larb_smi.writes()));
        out
    }
}
