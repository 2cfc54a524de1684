// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Shared-memory region between host and co-processor.

use crate::errors::VcpError;
use std::sync::atomic::{AtomicU32, Ordering};

/// Word offsets inside the shared-memory region.
pub mod layout {
    /// Bitmask of functions with a request in flight (written by the host).
    pub const SYNC_FUNC: usize = 0;
    /// Bitmask of functions the peer has acknowledged (written by the peer).
    pub const SYNC_ACK: usize = 1;
    /// Last test id echoed back by the peer.
    pub const TEST_ECHO: usize = 2;
    /// First word of the request payload.
    pub const PAYLOAD: usize = 4;
}

/// A region of 32-bit words visible to both processors, plus the bus address the peer uses
/// to reach it.
#[derive(Debug)]
pub struct ShmRegion {
    phys: u32,
    words: Box<[AtomicU32]>,
}

impl ShmRegion {
    /// Create a zeroed region of `len` words. Regions shorter than the header are padded.
    #[must_use]
    pub fn new(phys: u32, len: usize) -> Self {
        let len = len.max(layout::PAYLOAD);
        Self {
            phys,
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    #[must_use]
    pub fn phys(&self) -> u32 {
        self.phys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of payload words available after the header.
    #[must_use]
    pub fn payload_capacity(&self) -> usize {
        self.words.len() - layout::PAYLOAD
    }

    /// Read a word. Out-of-range offsets read as zero.
    #[must_use]
    pub fn load(&self, word: usize) -> u32 {
        self.words
            .get(word)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Write a word. Out-of-range offsets are ignored.
    pub fn store(&self, word: usize, value: u32) {
        if let Some(w) = self.words.get(word) {
            w.store(value, Ordering::Release);
        }
    }

    /// Set `bits` in a word and return its previous value.
    pub fn set_bits(&self, word: usize, bits: u32) -> u32 {
        self.words
            .get(word)
            .map_or(0, |w| w.fetch_or(bits, Ordering::AcqRel))
    }

    /// Clear `bits` in a word and return its previous value.
    pub fn clear_bits(&self, word: usize, bits: u32) -> u32 {
        self.words
            .get(word)
            .map_or(0, |w| w.fetch_and(!bits, Ordering::AcqRel))
    }

    /// Copy `data` into the payload area.
    pub fn write_payload(&self, data: &[u32]) -> Result<(), VcpError> {
        if data.len() > self.payload_capacity() {
            return Err(VcpError::PayloadTooLarge(data.len()));
        }
        for (i, value) in data.iter().enumerate() {
            self.store(layout::PAYLOAD + i, *value);
        }
        Ok(())
    }

    /// Read back `len` payload words (peer side).
    #[must_use]
    pub fn read_payload(&self, len: usize) -> Vec<u32> {
        (0..len.min(self.payload_capacity()))
            .map(|i| self.load(layout::PAYLOAD + i))
            .collect()
    }
}
