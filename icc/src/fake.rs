// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory stand-ins for every external service, for tests and the simulator.

use crate::bw::Bandwidth;
use crate::hw::{BandwidthPath, BusClock, HrtConfig, HrtService, Regulator, SmiDevice};
use crate::node::HrtKind;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strum::EnumCount;
use vcp::{
    Function, Message, PeerError, ShmRegion, Transmit, VcpEvent, VcpListener, VcpPeer, layout,
};

/// One register write seen by [`FakeSmi`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SmiWrite {
    Limiter { port: u16, value: u32 },
    CommonOstdl { port: u16, is_write: bool, value: u32 },
    LarbOstdl { port: u16, value: u32 },
}

#[derive(Debug, Default)]
pub struct FakeSmi {
    writes: Mutex<Vec<SmiWrite>>,
}

impl FakeSmi {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn writes(&self) -> Vec<SmiWrite> {
        self.writes.lock().clone()
    }

    pub fn clear(&self) {
        self.writes.lock().clear();
    }

    /// Last limiter value written to `port`.
    #[must_use]
    pub fn limiter(&self, port: u16) -> Option<u32> {
        self.writes.lock().iter().rev().find_map(|w| match w {
            SmiWrite::Limiter { port: p, value } if *p == port => Some(*value),
            _ => None,
        })
    }

    /// Last larb outstanding-transaction limit written to `port`.
    #[must_use]
    pub fn larb_ostdl(&self, port: u16) -> Option<u32> {
        self.writes.lock().iter().rev().find_map(|w| match w {
            SmiWrite::LarbOstdl { port: p, value } if *p == port => Some(*value),
            _ => None,
        })
    }

    /// Last common outstanding-transaction limit written to `port` for a direction.
    #[must_use]
    pub fn common_ostdl(&self, port: u16, is_write: bool) -> Option<u32> {
        self.writes.lock().iter().rev().find_map(|w| match w {
            SmiWrite::CommonOstdl {
                port: p,
                is_write: d,
                value,
            } if *p == port && *d == is_write => Some(*value),
            _ => None,
        })
    }
}

impl SmiDevice for FakeSmi {
    fn write_common_bw_limiter(&self, port: u16, value: u32) {
        self.writes.lock().push(SmiWrite::Limiter { port, value });
    }
    fn write_common_ostdl(&self, port: u16, is_write: bool, value: u32) {
        self.writes.lock().push(SmiWrite::CommonOstdl {
            port,
            is_write,
            value,
        });
    }
    fn write_larb_ostdl(&self, port: u16, value: u32) {
        self.writes.lock().push(SmiWrite::LarbOstdl { port, value });
    }
}

#[derive(Debug, Default)]
pub struct FakePath {
    requests: Mutex<Vec<(Bandwidth, Bandwidth)>>,
}

impl FakePath {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn requests(&self) -> Vec<(Bandwidth, Bandwidth)> {
        self.requests.lock().clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<(Bandwidth, Bandwidth)> {
        self.requests.lock().last().copied()
    }
}

impl BandwidthPath for FakePath {
    fn request_bandwidth(&self, avg: Bandwidth, peak: Bandwidth) {
        self.requests.lock().push((avg, peak));
    }
}

#[derive(Debug, Default)]
pub struct FakeClock {
    rate: AtomicU64,
    history: Mutex<Vec<u64>>,
}

impl FakeClock {
    #[must_use]
    pub fn new(rate_hz: u64) -> Arc<Self> {
        let clock = Self::default();
        clock.rate.store(rate_hz, Ordering::Relaxed);
        Arc::new(clock)
    }

    /// Rates set through [`BusClock::set_rate`], in order.
    #[must_use]
    pub fn history(&self) -> Vec<u64> {
        self.history.lock().clone()
    }

    /// Change the rate behind the topology's back.
    pub fn force_rate(&self, rate_hz: u64) {
        self.rate.store(rate_hz, Ordering::Relaxed);
    }
}

impl BusClock for FakeClock {
    fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }
    fn set_rate(&self, rate_hz: u64) {
        self.rate.store(rate_hz, Ordering::Relaxed);
        self.history.lock().push(rate_hz);
    }
}

#[derive(Debug, Default)]
pub struct FakeRegulator {
    history: Mutex<Vec<u32>>,
}

impl FakeRegulator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn history(&self) -> Vec<u32> {
        self.history.lock().clone()
    }
}

impl Regulator for FakeRegulator {
    fn set_voltage(&self, microvolt: u32) {
        self.history.lock().push(microvolt);
    }
}

#[derive(Debug)]
pub struct FakeHrt {
    ratios: Mutex<[u32; HrtKind::COUNT]>,
    budget: Mutex<Vec<(HrtKind, Bandwidth)>>,
    config: Mutex<Option<HrtConfig>>,
}

impl FakeHrt {
    /// A service scaling every kind by `ratio_permille`.
    #[must_use]
    pub fn new(ratio_permille: u32) -> Arc<Self> {
        Arc::new(Self {
            ratios: Mutex::new([ratio_permille; HrtKind::COUNT]),
            budget: Mutex::new(Vec::new()),
            config: Mutex::new(None),
        })
    }

    pub fn set_ratio(&self, kind: HrtKind, ratio_permille: u32) {
        self.ratios.lock()[kind.slot()] = ratio_permille;
    }

    /// Every `set_hrt_bw` call, in order.
    #[must_use]
    pub fn budget(&self) -> Vec<(HrtKind, Bandwidth)> {
        self.budget.lock().clone()
    }

    /// Last bandwidth pushed for `kind`.
    #[must_use]
    pub fn last(&self, kind: HrtKind) -> Option<Bandwidth> {
        self.budget
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .map(|(_, bw)| *bw)
    }

    #[must_use]
    pub fn config(&self) -> Option<HrtConfig> {
        self.config.lock().clone()
    }
}

impl HrtService for FakeHrt {
    fn init_hrt(&self, config: &HrtConfig) {
        *self.config.lock() = Some(config.clone());
    }
    fn set_hrt_bw(&self, kind: HrtKind, bw: Bandwidth) {
        self.budget.lock().push((kind, bw));
    }
    fn get_hrt_ratio(&self, kind: HrtKind) -> u32 {
        self.ratios.lock()[kind.slot()]
    }
}

/// A co-processor answering every doorbell from shared memory.
pub struct FakeVcpPeer {
    shm: Arc<ShmRegion>,
    ready: AtomicBool,
    suspending: AtomicBool,
    auto_ack: AtomicBool,
    received: Mutex<Vec<(Message, Vec<u32>)>>,
    listeners: Mutex<Vec<Weak<dyn VcpListener>>>,
}

impl std::fmt::Debug for FakeVcpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeVcpPeer")
            .field("ready", &self.ready)
            .field("auto_ack", &self.auto_ack)
            .finish_non_exhaustive()
    }
}

impl FakeVcpPeer {
    /// A ready peer acknowledging every request.
    #[must_use]
    pub fn new(shm: &Arc<ShmRegion>) -> Arc<Self> {
        Arc::new(Self {
            shm: Arc::clone(shm),
            ready: AtomicBool::new(true),
            suspending: AtomicBool::new(false),
            auto_ack: AtomicBool::new(true),
            received: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        let event = if ready { VcpEvent::Ready } else { VcpEvent::Stop };
        for listener in self.listeners.lock().iter().filter_map(Weak::upgrade) {
            listener.notify(event);
        }
    }

    pub fn set_auto_ack(&self, ack: bool) {
        self.auto_ack.store(ack, Ordering::SeqCst);
    }

    pub fn set_suspending(&self, suspending: bool) {
        self.suspending.store(suspending, Ordering::SeqCst);
    }

    /// Messages received with the payload words present at that time. The payload length is
    /// taken from the fifth word, the port count of a segment update.
    #[must_use]
    pub fn received(&self) -> Vec<(Message, Vec<u32>)> {
        self.received.lock().clone()
    }

    #[must_use]
    pub fn functions(&self) -> Vec<Function> {
        self.received.lock().iter().map(|(m, _)| m.func).collect()
    }
}

impl VcpPeer for FakeVcpPeer {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
    fn is_suspending(&self) -> bool {
        self.suspending.load(Ordering::SeqCst)
    }
    fn register_feature(&self) -> Result<(), PeerError> {
        Ok(())
    }
    fn deregister_feature(&self) {}
    fn transmit(&self, raw: &[u8; Message::LEN]) -> Transmit {
        let Some(msg) = Message::from_bytes(raw) else {
            return Transmit::Failed(PeerError("malformed doorbell".to_string()));
        };
        let payload = match msg.func {
            Function::CommBw => {
                let ports = self.shm.read_payload(5).get(4).copied().unwrap_or(0);
                let len = 5 + 4 * usize::try_from(ports).unwrap_or(0);
                self.shm.read_payload(len)
            }
            _ => Vec::new(),
        };
        self.received.lock().push((msg, payload));
        if self.auto_ack.load(Ordering::SeqCst) {
            if msg.func == Function::Test {
                self.shm.store(layout::TEST_ECHO, u32::from(msg.index));
            }
            self.shm.set_bits(layout::SYNC_ACK, msg.func.bit());
        }
        Transmit::Done
    }
    fn subscribe(&self, listener: Weak<dyn VcpListener>) {
        self.listeners.lock().push(listener);
    }
}
