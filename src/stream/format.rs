//! Per-format fan-out state
//!
//! Each (media, format) pair of a stream owns its subscriber set, an
//! optional RTP packetizer, a ring of recent units and counters. The
//! subscriber set is guarded by a read/write lock: `write_unit` holds the
//! read side while invoking callbacks, add/remove hold the write side
//! briefly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::media::{Format, MediaType, Packetizer, Unit};

/// Number of recent units kept per format for late-joiner catch-up.
const UNIT_RING_SIZE: usize = 64;

/// Identity of a reader within the fan-out structures.
pub type ReaderId = u64;

/// Callback invoked for every unit delivered to a reader. Must not block
/// beyond an enqueue into the reader's bounded queue.
pub type OnUnit = Arc<dyn Fn(Arc<Unit>) + Send + Sync>;

pub struct StreamFormat {
    media_type: MediaType,
    format: Format,
    subscribers: RwLock<HashMap<ReaderId, OnUnit>>,
    packetizer: Option<Mutex<Packetizer>>,
    ring: Mutex<VecDeque<Arc<Unit>>>,
    units_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl std::fmt::Debug for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFormat")
            .field("media_type", &self.media_type)
            .field("format", &self.format)
            .field("units_received", &self.units_received)
            .field("bytes_received", &self.bytes_received)
            .finish()
    }
}

impl StreamFormat {
    pub(super) fn new(
        media_type: MediaType,
        format: Format,
        packetizer: Option<Packetizer>,
    ) -> Self {
        Self {
            media_type,
            format,
            subscribers: RwLock::new(HashMap::new()),
            packetizer: packetizer.map(Mutex::new),
            ring: Mutex::new(VecDeque::with_capacity(UNIT_RING_SIZE)),
            units_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub(super) fn add_subscriber(&self, reader: ReaderId, on_unit: OnUnit) {
        self.subscribers
            .write()
            .unwrap()
            .insert(reader, on_unit);
    }

    pub(super) fn remove_subscriber(&self, reader: ReaderId) {
        self.subscribers.write().unwrap().remove(&reader);
    }

    pub(super) fn has_subscriber(&self, reader: ReaderId) -> bool {
        self.subscribers.read().unwrap().contains_key(&reader)
    }

    pub(super) fn clear_subscribers(&self) {
        self.subscribers.write().unwrap().clear();
    }

    /// Deliver one unit. Called by the stream's single writer.
    pub(super) fn write_unit(&self, mut unit: Unit) {
        if let Some(packetizer) = &self.packetizer {
            unit.rtp_packets = packetizer
                .lock()
                .unwrap()
                .packetize(&unit.payload, unit.pts);
        }

        self.units_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(unit.payload.byte_len() as u64, Ordering::Relaxed);

        let unit = Arc::new(unit);

        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() == UNIT_RING_SIZE {
                ring.pop_front();
            }
            ring.push_back(Arc::clone(&unit));
        }

        let subscribers = self.subscribers.read().unwrap();
        for on_unit in subscribers.values() {
            on_unit(Arc::clone(&unit));
        }
    }

    /// Recent units in write order, newest last.
    pub fn recent_units(&self) -> Vec<Arc<Unit>> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }

    pub fn units_received(&self) -> u64 {
        self.units_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}
