// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Host side of the offload protocol.
//!
//! A round-trip goes through `Idle -> PowerRequested -> Sending -> WaitingAck -> {Acked |
//! TimedOut} -> Idle`. The whole sequence runs under one channel-wide lock, so concurrent
//! callers are fully serialized. Both waits poll at millisecond granularity from the
//! caller's thread: [`Offload::send`] blocks and must not be called from a context that
//! cannot sleep.

use crate::errors::{VcpError, WaitPhase};
use crate::msg::{Function, Message};
use crate::peer::{Transmit, VcpEvent, VcpListener, VcpPeer};
use crate::shm::{ShmRegion, layout};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum OffloadState {
    Idle,
    PowerRequested,
    Sending,
    WaitingAck,
    Acked,
    TimedOut,
}

/// Timing parameters of the channel.
#[derive(Copy, Clone, Debug)]
pub struct OffloadParams {
    /// Interval between two polls of either wait phase.
    pub poll: Duration,
    /// Maximum number of polls per wait phase.
    pub retries: u32,
    /// Interval at which the init task re-checks peer readiness.
    pub init_poll: Duration,
}

impl Default for OffloadParams {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(1),
            retries: 200,
            init_poll: Duration::from_secs(1),
        }
    }
}

/// The offload channel. Shared as `Arc<Offload>` between the QoS engine and the init task.
pub struct Offload {
    peer: Arc<dyn VcpPeer>,
    shm: Arc<ShmRegion>,
    params: OffloadParams,
    /// Co-processor power references held by the host.
    power: Mutex<u32>,
    /// Serializes complete round-trips.
    send_lock: Mutex<()>,
    ready: AtomicBool,
    state: AtomicU8,
}

impl std::fmt::Debug for Offload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Offload")
            .field("shm", &self.shm)
            .field("params", &self.params)
            .field("power", &*self.power.lock())
            .field("ready", &self.is_ready())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Offload {
    #[must_use]
    pub fn new(peer: Arc<dyn VcpPeer>, shm: Arc<ShmRegion>, params: OffloadParams) -> Arc<Self> {
        Arc::new(Self {
            peer,
            shm,
            params,
            power: Mutex::new(0),
            send_lock: Mutex::new(()),
            ready: AtomicBool::new(false),
            state: AtomicU8::new(OffloadState::Idle as u8),
        })
    }

    #[must_use]
    pub fn shm(&self) -> &ShmRegion {
        &self.shm
    }

    /// True once the init task (or a `Ready` notification) marked the peer usable.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> OffloadState {
        OffloadState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or(OffloadState::Idle)
    }

    fn set_state(&self, state: OffloadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Number of power references currently held.
    #[must_use]
    pub fn power_refs(&self) -> u32 {
        *self.power.lock()
    }

    /// Take (`true`) or release (`false`) a co-processor power reference. The shared feature
    /// is registered on the 0 -> 1 transition and deregistered on 1 -> 0.
    pub fn enable(&self, enable: bool) -> Result<(), VcpError> {
        let mut refs = self.power.lock();
        if self.peer.is_suspending() {
            warn!("co-processor is suspending: refusing power change (refs={})", *refs);
            return Err(VcpError::Busy);
        }
        if enable {
            if *refs == 0 {
                self.peer.register_feature()?;
                debug!("co-processor feature registered");
            }
            *refs += 1;
        } else {
            if *refs == 0 {
                error!("co-processor power released without a matching request");
                return Err(VcpError::Unbalanced);
            }
            *refs -= 1;
            if *refs == 0 {
                self.peer.deregister_feature();
                debug!("co-processor feature deregistered");
            }
        }
        Ok(())
    }

    /// Run one complete round-trip for `func`.
    ///
    /// Sending the same function and index twice is safe: the second call repeats the
    /// round-trip.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn send(&self, func: Function, index: u8) -> Result<(), VcpError> {
        self.exchange(func, index, None)
    }

    /// Write `payload` into shared memory and run a round-trip for `func`. The payload is
    /// written under the channel lock so it cannot be overwritten by a concurrent sender.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub fn send_with_payload(
        &self,
        func: Function,
        index: u8,
        payload: &[u32],
    ) -> Result<(), VcpError> {
        self.exchange(func, index, Some(payload))
    }

    fn exchange(
        &self,
        func: Function,
        index: u8,
        payload: Option<&[u32]>,
    ) -> Result<(), VcpError> {
        if !self.is_ready() {
            return Err(VcpError::NotReady);
        }
        let _serial = self.send_lock.lock();
        if let Some(payload) = payload {
            self.shm.write_payload(payload)?;
        }

        self.set_state(OffloadState::PowerRequested);
        if let Err(e) = self.enable(true) {
            self.set_state(OffloadState::Idle);
            return Err(e);
        }

        let result = self.round_trip(func, index);
        match &result {
            Ok(()) => self.set_state(OffloadState::Acked),
            Err(e) => {
                warn!("{func} round-trip (index {index}) failed: {e}");
                self.set_state(OffloadState::TimedOut);
            }
        }

        if let Err(e) = self.enable(false) {
            warn!("failed to release co-processor power after {func}: {e}");
        }
        self.set_state(OffloadState::Idle);
        result
    }

    fn round_trip(&self, func: Function, index: u8) -> Result<(), VcpError> {
        let bit = func.bit();
        let inflight = self.shm.set_bits(layout::SYNC_FUNC, bit);
        if inflight & bit != 0 {
            warn!("{func} already flagged in flight: previous request was abandoned");
        }

        // an answer to an abandoned request must not be taken for this one
        self.shm.clear_bits(layout::SYNC_ACK, bit);
        let result = self.transmit_and_wait(func, index, bit);
        if result.is_err() {
            self.shm.clear_bits(layout::SYNC_ACK, bit);
        }

        self.shm.clear_bits(layout::SYNC_FUNC, bit);
        result
    }

    fn transmit_and_wait(&self, func: Function, index: u8, bit: u32) -> Result<(), VcpError> {
        let msg = Message::new(func, index, self.shm.phys()).to_bytes();

        self.set_state(OffloadState::Sending);
        self.wait(WaitPhase::PeerReady, || match self.peer.transmit(&msg) {
            Transmit::Done => Some(Ok(())),
            Transmit::Busy => None,
            Transmit::Failed(e) => Some(Err(VcpError::Transport(e))),
        })?;

        self.set_state(OffloadState::WaitingAck);
        self.wait(WaitPhase::Ack, || {
            (self.shm.load(layout::SYNC_ACK) & bit != 0).then_some(Ok(()))
        })?;

        // consume the acknowledgment so the next request cannot mistake it for its own
        self.shm.clear_bits(layout::SYNC_ACK, bit);
        debug!("{func} (index {index}) acknowledged");
        Ok(())
    }

    /// Poll `attempt` until it yields, the peer leaves (or a stop notification arrives), or
    /// the retry budget runs out.
    fn wait<F>(&self, phase: WaitPhase, mut attempt: F) -> Result<(), VcpError>
    where
        F: FnMut() -> Option<Result<(), VcpError>>,
    {
        for _ in 0..self.params.retries {
            if !self.peer.is_ready() || !self.is_ready() {
                self.ready.store(false, Ordering::Release);
                return Err(VcpError::PeerLeft(phase));
            }
            if let Some(outcome) = attempt() {
                return outcome;
            }
            std::thread::sleep(self.params.poll);
        }
        Err(VcpError::TimedOut {
            phase,
            polls: self.params.retries,
        })
    }

    /// Spawn the one-shot init task: sleep until the peer reports ready, subscribe to its
    /// notifications, mark the channel ready and send [`Function::Init`].
    pub fn start(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("vcp-init".to_string())
            .spawn(move || this.init())
    }

    fn init(self: Arc<Self>) {
        while !self.peer.is_ready() {
            std::thread::sleep(self.params.init_poll);
        }
        let listener: Arc<dyn VcpListener> = self.clone();
        self.peer.subscribe(Arc::downgrade(&listener));
        self.ready.store(true, Ordering::Release);
        info!("co-processor ready, shared memory at {:#x}", self.shm.phys());
        if let Err(e) = self.send(Function::Init, 0) {
            error!("co-processor init failed: {e}");
        }
    }
}

impl VcpListener for Offload {
    fn notify(&self, event: VcpEvent) {
        debug!("co-processor event: {event}");
        match event {
            VcpEvent::Ready => self.ready.store(true, Ordering::Release),
            VcpEvent::Stop => self.ready.store(false, Ordering::Release),
        }
    }
}
