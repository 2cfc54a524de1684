// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Round-trip behaviour of the offload channel against an in-memory peer.

use mmqos_vcp::{
    Function, Message, Offload, OffloadParams, OffloadState, PeerError, ShmRegion, Transmit,
    VcpError, VcpEvent, VcpListener, VcpPeer, WaitPhase, layout,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing_test::traced_test;

#[derive(Default)]
struct FakePeer {
    shm: Mutex<Option<Arc<ShmRegion>>>,
    ready: AtomicBool,
    suspending: AtomicBool,
    auto_ack: AtomicBool,
    /// Number of transmits answered with `Busy` before accepting.
    busy: AtomicU32,
    /// Drop readiness after this many delivered messages (0 = never).
    leave_after: AtomicU32,
    registered: AtomicU32,
    /// Notify listeners of a stop right after accepting a message.
    stop_on_transmit: AtomicBool,
    received: Mutex<Vec<Message>>,
    listeners: Mutex<Vec<Weak<dyn VcpListener>>>,
}

impl FakePeer {
    fn new(shm: &Arc<ShmRegion>) -> Arc<Self> {
        let peer = Self::default();
        *peer.shm.lock() = Some(Arc::clone(shm));
        peer.ready.store(true, Ordering::SeqCst);
        peer.auto_ack.store(true, Ordering::SeqCst);
        Arc::new(peer)
    }

    fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }
}

impl VcpPeer for FakePeer {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
    fn is_suspending(&self) -> bool {
        self.suspending.load(Ordering::SeqCst)
    }
    fn register_feature(&self) -> Result<(), PeerError> {
        self.registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn deregister_feature(&self) {
        self.registered.fetch_sub(1, Ordering::SeqCst);
    }
    fn transmit(&self, raw: &[u8; Message::LEN]) -> Transmit {
        if self
            .busy
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .is_ok()
        {
            return Transmit::Busy;
        }
        let Some(msg) = Message::from_bytes(raw) else {
            return Transmit::Failed(PeerError("bad message".to_string()));
        };
        self.received.lock().push(msg);
        if self.leave_after.load(Ordering::SeqCst) as usize == self.received.lock().len() {
            self.ready.store(false, Ordering::SeqCst);
        }
        if self.stop_on_transmit.load(Ordering::SeqCst) {
            for listener in self.listeners.lock().iter().filter_map(Weak::upgrade) {
                listener.notify(VcpEvent::Stop);
            }
        }
        if self.auto_ack.load(Ordering::SeqCst)
            && let Some(shm) = self.shm.lock().as_ref()
        {
            if msg.func == Function::Test {
                shm.store(layout::TEST_ECHO, u32::from(msg.index));
            }
            shm.set_bits(layout::SYNC_ACK, msg.func.bit());
        }
        Transmit::Done
    }
    fn subscribe(&self, listener: Weak<dyn VcpListener>) {
        self.listeners.lock().push(listener);
    }
}

fn fast() -> OffloadParams {
    OffloadParams {
        poll: Duration::from_millis(1),
        retries: 20,
        init_poll: Duration::from_millis(5),
    }
}

fn ready_channel() -> (Arc<ShmRegion>, Arc<FakePeer>, Arc<Offload>) {
    let shm = Arc::new(ShmRegion::new(0x4000_0000, 32));
    let peer = FakePeer::new(&shm);
    let offload = Offload::new(peer.clone(), Arc::clone(&shm), fast());
    offload.notify(VcpEvent::Ready);
    (shm, peer, offload)
}

#[test]
fn send_requires_ready() {
    let shm = Arc::new(ShmRegion::new(0x4000_0000, 32));
    let peer = FakePeer::new(&shm);
    let offload = Offload::new(peer.clone(), shm, fast());
    assert_eq!(offload.send(Function::Test, 1), Err(VcpError::NotReady));
    assert!(peer.received().is_empty());
}

#[test]
fn round_trip_consumes_ack_and_releases_power() {
    let (shm, peer, offload) = ready_channel();
    offload.send(Function::CommBw, 1).unwrap();

    assert_eq!(
        peer.received(),
        vec![Message::new(Function::CommBw, 1, 0x4000_0000)]
    );
    assert_eq!(shm.load(layout::SYNC_ACK), 0);
    assert_eq!(shm.load(layout::SYNC_FUNC), 0);
    assert_eq!(offload.power_refs(), 0);
    assert_eq!(peer.registered.load(Ordering::SeqCst), 0);
    assert_eq!(offload.state(), OffloadState::Idle);
}

#[test]
fn repeated_send_repeats_the_round_trip() {
    let (_shm, peer, offload) = ready_channel();
    offload.send(Function::Test, 7).unwrap();
    offload.send(Function::Test, 7).unwrap();
    assert_eq!(peer.received().len(), 2);
}

#[test]
fn busy_doorbell_is_retried() {
    let (_shm, peer, offload) = ready_channel();
    peer.busy.store(3, Ordering::SeqCst);
    offload.send(Function::SyncState, 0).unwrap();
    assert_eq!(peer.received().len(), 1);
}

#[test]
fn busy_doorbell_times_out_in_peer_ready_phase() {
    let (shm, peer, offload) = ready_channel();
    peer.busy.store(u32::MAX, Ordering::SeqCst);
    assert_eq!(
        offload.send(Function::SyncState, 0),
        Err(VcpError::TimedOut {
            phase: WaitPhase::PeerReady,
            polls: 20
        })
    );
    assert_eq!(shm.load(layout::SYNC_FUNC), 0);
}

#[traced_test]
#[test]
fn missing_ack_times_out_and_releases_the_lock() {
    let (shm, peer, offload) = ready_channel();
    peer.auto_ack.store(false, Ordering::SeqCst);
    assert_eq!(
        offload.send(Function::CommBw, 0),
        Err(VcpError::TimedOut {
            phase: WaitPhase::Ack,
            polls: 20
        })
    );
    assert!(logs_contain("round-trip (index 0) failed"));
    assert_eq!(offload.power_refs(), 0);
    assert_eq!(shm.load(layout::SYNC_FUNC), 0);

    // the channel is usable again once the peer answers
    peer.auto_ack.store(true, Ordering::SeqCst);
    offload.send(Function::CommBw, 0).unwrap();
}

#[test]
fn peer_leaving_is_not_a_timeout() {
    let (_shm, peer, offload) = ready_channel();
    peer.auto_ack.store(false, Ordering::SeqCst);
    peer.leave_after.store(1, Ordering::SeqCst);
    assert_eq!(
        offload.send(Function::CommBw, 0),
        Err(VcpError::PeerLeft(WaitPhase::Ack))
    );
    assert!(!offload.is_ready());
    assert_eq!(offload.send(Function::CommBw, 0), Err(VcpError::NotReady));
}

#[test]
fn stop_notification_ends_the_wait() {
    let (_shm, peer, offload) = ready_channel();
    let listener: Arc<dyn VcpListener> = offload.clone();
    peer.subscribe(Arc::downgrade(&listener));
    peer.auto_ack.store(false, Ordering::SeqCst);
    peer.stop_on_transmit.store(true, Ordering::SeqCst);
    assert_eq!(
        offload.send(Function::SyncState, 0),
        Err(VcpError::PeerLeft(WaitPhase::Ack))
    );
    assert!(peer.is_ready());
    assert!(!offload.is_ready());
    assert_eq!(offload.power_refs(), 0);
}

#[test]
fn late_ack_is_not_taken_for_the_next_answer() {
    let (shm, peer, offload) = ready_channel();
    peer.auto_ack.store(false, Ordering::SeqCst);
    assert!(matches!(
        offload.send(Function::CommBw, 0),
        Err(VcpError::TimedOut {
            phase: WaitPhase::Ack,
            ..
        })
    ));

    // the peer answers the abandoned request once the host has given up
    shm.set_bits(layout::SYNC_ACK, Function::CommBw.bit());
    assert_eq!(
        offload.send(Function::CommBw, 0),
        Err(VcpError::TimedOut {
            phase: WaitPhase::Ack,
            polls: 20
        })
    );
    assert_eq!(shm.load(layout::SYNC_ACK) & Function::CommBw.bit(), 0);
    assert_eq!(peer.received().len(), 2);
}

#[test]
fn stale_ack_of_another_function_is_ignored() {
    let (shm, peer, offload) = ready_channel();
    peer.auto_ack.store(false, Ordering::SeqCst);
    shm.set_bits(layout::SYNC_ACK, Function::Test.bit());
    assert!(matches!(
        offload.send(Function::CommBw, 0),
        Err(VcpError::TimedOut {
            phase: WaitPhase::Ack,
            ..
        })
    ));
    assert_eq!(shm.load(layout::SYNC_ACK), Function::Test.bit());
}

#[test]
fn power_is_reference_counted() {
    let (_shm, peer, offload) = ready_channel();
    offload.enable(true).unwrap();
    offload.enable(true).unwrap();
    assert_eq!(peer.registered.load(Ordering::SeqCst), 1);
    offload.enable(false).unwrap();
    assert_eq!(peer.registered.load(Ordering::SeqCst), 1);
    offload.enable(false).unwrap();
    assert_eq!(peer.registered.load(Ordering::SeqCst), 0);
    assert_eq!(offload.enable(false), Err(VcpError::Unbalanced));
}

#[test]
fn suspending_peer_refuses_power() {
    let (_shm, peer, offload) = ready_channel();
    peer.suspending.store(true, Ordering::SeqCst);
    assert_eq!(offload.enable(true), Err(VcpError::Busy));
    assert_eq!(offload.send(Function::Test, 0), Err(VcpError::Busy));
    assert!(peer.received().is_empty());
}

#[test]
fn payload_is_visible_to_the_peer() {
    let (shm, _peer, offload) = ready_channel();
    offload
        .send_with_payload(Function::CommBw, 3, &[10, 20, 30])
        .unwrap();
    assert_eq!(shm.read_payload(3), vec![10, 20, 30]);
}

#[test]
fn concurrent_senders_are_serialized() {
    let (_shm, peer, offload) = ready_channel();
    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let offload = Arc::clone(&offload);
            std::thread::spawn(move || offload.send(Function::CommBw, i))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    let mut indexes: Vec<u8> = peer.received().iter().map(|m| m.index).collect();
    indexes.sort_unstable();
    assert_eq!(indexes, vec![0, 1, 2, 3]);
    assert_eq!(offload.power_refs(), 0);
}

#[test]
fn init_task_waits_for_the_peer() {
    let shm = Arc::new(ShmRegion::new(0x4000_0000, 32));
    let peer = FakePeer::new(&shm);
    peer.ready.store(false, Ordering::SeqCst);
    let offload = Offload::new(peer.clone(), shm, fast());
    let task = offload.start().unwrap();

    std::thread::sleep(Duration::from_millis(20));
    assert!(!offload.is_ready());

    peer.ready.store(true, Ordering::SeqCst);
    task.join().unwrap();
    assert!(offload.is_ready());
    assert_eq!(peer.listeners.lock().len(), 1);
    assert_eq!(
        peer.received(),
        vec![Message::new(Function::Init, 0, 0x4000_0000)]
    );
}

#[test]
fn stop_event_disables_the_channel() {
    let (_shm, _peer, offload) = ready_channel();
    offload.notify(VcpEvent::Stop);
    assert_eq!(offload.send(Function::Test, 0), Err(VcpError::NotReady));
    offload.notify(VcpEvent::Ready);
    offload.send(Function::Test, 0).unwrap();
}
