// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bandwidth history for postmortem dumps.

use crate::bw::Bandwidth;
use crate::node::{Channel, NodeId};
use arrayvec::ArrayVec;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Records kept per entity.
pub const CAPACITY: usize = 10;
/// Numeric fields per record.
pub const MAX_FIELDS: usize = 5;

/// Something whose history is tracked.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    /// Fields: avg, peak, mix.
    CommonPort(NodeId),
    /// Fields: srt read, srt write, hrt read, hrt write, channel max.
    Channel(Channel),
    /// Fields: avg, peak, ostdl.
    LarbPort(NodeId),
    /// Fields: display hrt, camera hrt, segment total.
    HrtTotal,
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::CommonPort(id) | EntityKey::LarbPort(id) => write!(f, "{id}"),
            EntityKey::Channel(channel) => write!(f, "{channel}"),
            EntityKey::HrtTotal => write!(f, "hrt"),
        }
    }
}

/// One history entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    /// Time since the recorder was created.
    pub at: Duration,
    pub fields: ArrayVec<u64, MAX_FIELDS>,
}

#[derive(Debug, Default)]
struct Ring {
    slots: [Option<Record>; CAPACITY],
    /// Slot the next record goes to.
    cursor: usize,
}

impl Ring {
    fn push(&mut self, record: Record) {
        self.slots[self.cursor] = Some(record);
        self.cursor = (self.cursor + 1) % CAPACITY;
    }

    fn ordered(&self) -> Vec<Record> {
        self.slots[self.cursor..]
            .iter()
            .chain(&self.slots[..self.cursor])
            .flatten()
            .cloned()
            .collect()
    }
}

/// Most recent larb-level event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LarbEvent {
    pub at: Duration,
    pub larb: NodeId,
    pub port: NodeId,
    pub avg: Bandwidth,
    pub peak: Bandwidth,
    pub ostdl: u32,
}

/// Fixed-capacity history per entity.
#[derive(Debug)]
pub struct Recorder {
    start: Instant,
    rings: Mutex<BTreeMap<EntityKey, Ring>>,
    last_larb: Mutex<Option<LarbEvent>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            rings: Mutex::new(BTreeMap::new()),
            last_larb: Mutex::new(None),
        }
    }

    /// Time elapsed since the recorder was created.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.start.elapsed()
    }

    /// Append the current time and up to [`MAX_FIELDS`] fields to `key`'s history. Extra
    /// fields are dropped.
    pub fn record(&self, key: EntityKey, fields: &[u64]) {
        self.record_at(key, self.now(), fields);
    }

    pub fn record_at(&self, key: EntityKey, at: Duration, fields: &[u64]) {
        let fields = fields.iter().copied().take(MAX_FIELDS).collect();
        self.rings
            .lock()
            .entry(key)
            .or_default()
            .push(Record { at, fields });
    }

    /// History of `key`, oldest first. Empty for an entity that never recorded.
    #[must_use]
    pub fn dump(&self, key: EntityKey) -> Vec<Record> {
        self.rings
            .lock()
            .get(&key)
            .map(Ring::ordered)
            .unwrap_or_default()
    }

    /// Every entity that has a history, in key order.
    #[must_use]
    pub fn keys(&self) -> Vec<EntityKey> {
        self.rings.lock().keys().copied().collect()
    }

    pub fn set_last_larb(&self, event: LarbEvent) {
        *self.last_larb.lock() = Some(event);
    }

    #[must_use]
    pub fn last_larb(&self) -> Option<LarbEvent> {
        *self.last_larb.lock()
    }
}

#[cfg(test)]
mod test {
    use super::{CAPACITY, EntityKey, Recorder};
    use crate::node::{Channel, NodeId};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn fill(recorder: &Recorder, key: EntityKey, n: u64) {
        for i in 0..n {
            recorder.record_at(key, Duration::from_millis(i), &[i, i * 2]);
        }
    }

    fn first_fields(recorder: &Recorder, key: EntityKey) -> Vec<u64> {
        recorder.dump(key).iter().map(|r| r.fields[0]).collect()
    }

    #[test]
    fn unknown_entity_dumps_empty() {
        let recorder = Recorder::new();
        assert!(recorder.dump(EntityKey::HrtTotal).is_empty());
    }

    #[test]
    fn partial_ring_in_write_order() {
        let recorder = Recorder::new();
        let key = EntityKey::CommonPort(NodeId::common_port(2));
        fill(&recorder, key, 4);
        assert_eq!(first_fields(&recorder, key), vec![0, 1, 2, 3]);
    }

    #[test]
    fn wrapped_ring_keeps_the_most_recent() {
        let recorder = Recorder::new();
        let key = EntityKey::Channel(Channel::new(1, 0));
        fill(&recorder, key, 13);
        assert_eq!(first_fields(&recorder, key), (3..13).collect::<Vec<_>>());
    }

    #[test]
    fn extra_fields_are_dropped() {
        let recorder = Recorder::new();
        recorder.record(EntityKey::HrtTotal, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            recorder.dump(EntityKey::HrtTotal)[0].fields.as_slice(),
            &[1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn entities_are_independent() {
        let recorder = Recorder::new();
        let a = EntityKey::LarbPort(NodeId::leaf(1));
        let b = EntityKey::LarbPort(NodeId::leaf(2));
        fill(&recorder, a, 3);
        fill(&recorder, b, 12);
        assert_eq!(recorder.dump(a).len(), 3);
        assert_eq!(recorder.dump(b).len(), CAPACITY);
        assert_eq!(recorder.keys(), vec![a, b]);
    }

    #[test]
    fn dump_returns_the_last_capacity_writes_in_order() {
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|n: u8| {
                let recorder = Recorder::new();
                let n = u64::from(n);
                fill(&recorder, EntityKey::HrtTotal, n);
                let expected: Vec<u64> = (n.saturating_sub(CAPACITY as u64)..n).collect();
                assert_eq!(first_fields(&recorder, EntityKey::HrtTotal), expected);
            });
    }
}
