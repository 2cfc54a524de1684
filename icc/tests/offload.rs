// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Hand-off of segment computations to the co-processor.

use mmqos_icc::fake::{FakeClock, FakeHrt, FakePath, FakeSmi, FakeVcpPeer, SmiWrite};
use mmqos_icc::translate::Opp;
use mmqos_icc::{
    Bandwidth, BusDeclBuilder, BusParamsBuilder, Features, LarbDeclBuilder, LeafDeclBuilder,
    NodeId, PortCategory, PortDeclBuilder, QosParams, Topology,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;
use vcp::{Function, Offload, OffloadParams, OffloadState, ShmRegion};

fn bw(v: u32) -> Bandwidth {
    Bandwidth::from_mbps(v)
}

struct Fixture {
    topology: Topology,
    peer: Arc<FakeVcpPeer>,
    offload: Arc<Offload>,
    clock: Arc<FakeClock>,
    avg_path: Arc<FakePath>,
    smi: Arc<FakeSmi>,
}

fn base_features() -> Features {
    Features::COMM_OSTDL | Features::BW_LIMITER
}

fn set_features(topology: &Topology, features: Features) {
    topology
        .set_tunable("features", &format!("{:#x}", features.bits()))
        .unwrap();
}

impl Fixture {
    /// Two ports on one segment, offload channel up but offload not enabled yet.
    fn new() -> Self {
        let shm = Arc::new(ShmRegion::new(0x5000_0000, 4096));
        let peer = FakeVcpPeer::new(&shm);
        let offload = Offload::new(
            peer.clone(),
            shm,
            OffloadParams {
                poll: Duration::from_millis(1),
                retries: 5,
                init_poll: Duration::from_millis(1),
            },
        );
        let clock = FakeClock::new(273_000_000);
        let avg_path = FakePath::new();
        let smi = FakeSmi::new();
        let bus = NodeId::common_bus(0);

        let topology = Topology::builder(QosParams {
            features: base_features(),
            ..QosParams::default()
        })
        .hrt(FakeHrt::new(1000))
        .offload(offload.clone())
        .add_bus(
            BusDeclBuilder::default()
                .index(0)
                .name("comm0")
                .params(
                    BusParamsBuilder::default()
                        .opps(vec![Opp::new(273_000_000, 550_000)])
                        .build()
                        .unwrap(),
                )
                .clock(clock.clone())
                .avg_path(avg_path.clone())
                .smi(smi.clone())
                .build()
                .unwrap(),
        )
        .add_common_port(
            PortDeclBuilder::default()
                .index(0)
                .name("disp")
                .parent(bus)
                .category(PortCategory::Display)
                .build()
                .unwrap(),
        )
        .add_common_port(
            PortDeclBuilder::default()
                .index(1)
                .name("vdec")
                .parent(bus)
                .category(PortCategory::VdecSrt)
                .chn(1)
                .build()
                .unwrap(),
        )
        .add_larb(
            LarbDeclBuilder::default()
                .index(0)
                .parent(NodeId::common_port(0))
                .build()
                .unwrap(),
        )
        .add_larb(
            LarbDeclBuilder::default()
                .index(1)
                .parent(NodeId::common_port(1))
                .build()
                .unwrap(),
        )
        .add_leaf_port(
            LeafDeclBuilder::default()
                .index(0)
                .parent(NodeId::larb(0))
                .build()
                .unwrap(),
        )
        .add_leaf_port(
            LeafDeclBuilder::default()
                .index(1)
                .parent(NodeId::larb(1))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

        Self {
            topology,
            peer,
            offload,
            clock,
            avg_path,
            smi,
        }
    }

    /// Bring the channel up through its init task.
    fn start(&self) {
        self.offload.start().unwrap().join().unwrap();
        assert!(self.offload.is_ready());
    }
}

#[test]
fn init_task_announces_the_host() {
    let fx = Fixture::new();
    fx.start();
    assert_eq!(fx.peer.functions(), vec![Function::Init]);
    assert_eq!(fx.offload.state(), OffloadState::Idle);
    assert_eq!(fx.offload.power_refs(), 0);
}

#[test]
fn enabling_offload_resynchronizes_the_peer() {
    let fx = Fixture::new();
    fx.start();
    set_features(&fx.topology, base_features() | Features::VCP_OFFLOAD);
    // the sync is followed by a full recomputation, now shipped to the peer
    assert_eq!(
        fx.peer.functions(),
        vec![Function::Init, Function::SyncState, Function::CommBw]
    );

    // already enabled: no second sync
    set_features(&fx.topology, base_features() | Features::VCP_OFFLOAD);
    assert_eq!(
        fx.peer
            .functions()
            .iter()
            .filter(|f| **f == Function::SyncState)
            .count(),
        1
    );
}

#[test]
fn offloaded_segment_ships_its_port_values() {
    let fx = Fixture::new();
    fx.start();
    set_features(&fx.topology, base_features() | Features::VCP_OFFLOAD);
    let clock_settings = fx.clock.history().len();
    let avg_requests = fx.avg_path.requests().len();

    fx.topology.update_port(NodeId::leaf(0), bw(100), bw(50));

    let (msg, payload) = fx.peer.received().last().cloned().unwrap();
    assert_eq!(msg.func, Function::CommBw);
    assert_eq!(msg.index, 0);
    assert_eq!(msg.base, 0x5000_0000);
    #[rustfmt::skip]
    assert_eq!(payload, vec![
        0, 150, 100, 50, 2,
        0, 100, 50, 50,
        1, 0, 0, 0,
    ]);

    // nothing is programmed locally
    assert_eq!(fx.clock.history().len(), clock_settings);
    assert_eq!(fx.avg_path.requests().len(), avg_requests);
    assert!(
        !fx.smi
            .writes()
            .iter()
            .any(|w| matches!(w, SmiWrite::Limiter { .. }))
    );
    // port-level work still happens
    assert_eq!(fx.smi.common_ostdl(0, false), Some(0x40));
    assert_eq!(fx.topology.bus(0).unwrap().comm_total, bw(150));
}

#[test]
fn disabling_offload_resumes_local_programming() {
    let fx = Fixture::new();
    fx.start();
    set_features(&fx.topology, base_features() | Features::VCP_OFFLOAD);
    fx.topology.update_port(NodeId::leaf(1), bw(30), Bandwidth::ZERO);
    assert!(fx.avg_path.requests().is_empty());

    set_features(&fx.topology, base_features());
    assert_eq!(fx.avg_path.last(), Some((bw(30), Bandwidth::ZERO)));
    assert!(fx.smi.limiter(1).is_some());
}

#[test]
#[traced_test]
fn unanswered_offload_skips_the_update() {
    let fx = Fixture::new();
    fx.start();
    set_features(&fx.topology, base_features() | Features::VCP_OFFLOAD);
    fx.peer.set_auto_ack(false);

    fx.topology.update_port(NodeId::leaf(0), bw(100), Bandwidth::ZERO);
    assert!(logs_contain("comm0: offload failed, update skipped"));
    assert!(fx.avg_path.requests().is_empty());
    assert!(fx.clock.history().is_empty());
    assert_eq!(fx.offload.state(), OffloadState::Idle);
    assert_eq!(fx.offload.power_refs(), 0);
}

#[test]
#[traced_test]
fn channel_not_ready_is_reported() {
    let fx = Fixture::new();
    set_features(&fx.topology, base_features() | Features::VCP_OFFLOAD);
    assert!(logs_contain("co-processor state sync failed"));
    fx.topology.update_port(NodeId::leaf(0), bw(100), Bandwidth::ZERO);
    assert!(logs_contain("offload failed"));
    assert!(fx.peer.received().is_empty());
}

#[test]
#[traced_test]
fn test_id_runs_an_echo_round_trip() {
    let fx = Fixture::new();
    fx.start();
    fx.topology.set_tunable("vcp_test_id", "0x107").unwrap();
    let (msg, _) = fx.peer.received().last().cloned().unwrap();
    assert_eq!((msg.func, msg.index), (Function::Test, 7));
    assert!(logs_contain("co-processor test 7 passed"));

    // zero is a no-op
    let sent = fx.peer.received().len();
    fx.topology.set_tunable("vcp_test_id", "0").unwrap();
    assert_eq!(fx.peer.received().len(), sent);
}

#[test]
#[traced_test]
fn offload_feature_without_channel_stays_local() {
    let clock = FakeClock::new(273_000_000);
    let avg_path = FakePath::new();
    let bus = NodeId::common_bus(0);
    let topology = Topology::builder(QosParams::default())
        .add_bus(
            BusDeclBuilder::default()
                .index(0)
                .params(
                    BusParamsBuilder::default()
                        .opps(vec![Opp::new(273_000_000, 550_000)])
                        .build()
                        .unwrap(),
                )
                .clock(clock)
                .avg_path(avg_path.clone())
                .build()
                .unwrap(),
        )
        .add_common_port(
            PortDeclBuilder::default()
                .index(0)
                .parent(bus)
                .build()
                .unwrap(),
        )
        .add_larb(
            LarbDeclBuilder::default()
                .index(0)
                .parent(NodeId::common_port(0))
                .build()
                .unwrap(),
        )
        .add_leaf_port(
            LeafDeclBuilder::default()
                .index(0)
                .parent(NodeId::larb(0))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    set_features(&topology, Features::VCP_OFFLOAD);
    assert!(logs_contain("offload enabled without a co-processor channel"));
    topology.update_port(NodeId::leaf(0), bw(10), Bandwidth::ZERO);
    assert_eq!(avg_path.last(), Some((bw(10), Bandwidth::ZERO)));
    assert!(topology.offload().is_none());
}
