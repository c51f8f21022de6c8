//! Dedicated-channel pool and promotion bookkeeping.
//!
//! Holds the per-device receive channels together with the state that keeps
//! promotions sane: the last-seen clock used for eviction and reaping, the
//! per-device debounce, and the in-flight marker guarding against concurrent
//! promotion attempts for the same device.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::radio::RadioChannel;

/// One dedicated channel, exclusively owned by the pool for its lifetime.
pub struct DedicatedEntry {
    pub channel: Box<dyn RadioChannel>,
    pub last_seen: Instant,
}

pub struct DedicatedPool {
    capacity: usize,
    promote_debounce: Duration,
    entries: HashMap<u16, DedicatedEntry>,
    in_flight: HashSet<u16>,
    last_attempt: HashMap<u16, Instant>,
}

impl DedicatedPool {
    pub fn new(capacity: usize, promote_debounce: Duration) -> Self {
        Self {
            capacity,
            promote_debounce,
            entries: HashMap::new(),
            in_flight: HashSet::new(),
            last_attempt: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dedicated(&self, device_id: u16) -> bool {
        self.entries.contains_key(&device_id)
    }

    pub fn at_capacity(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn device_ids(&self) -> BTreeSet<u16> {
        self.entries.keys().copied().collect()
    }

    /// Refresh `last_seen` for a device that has a dedicated channel.
    pub fn touch(&mut self, device_id: u16, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&device_id) {
            entry.last_seen = now;
        }
    }

    /// The dedicated device least recently heard from (eviction candidate).
    pub fn oldest(&self) -> Option<u16> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_seen)
            .map(|(&device_id, _)| device_id)
    }

    /// Devices silent for longer than `max_idle`.
    pub fn stale(&self, now: Instant, max_idle: Duration) -> Vec<u16> {
        self.entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > max_idle)
            .map(|(&device_id, _)| device_id)
            .collect()
    }

    /// Whether a promotion attempt for this device happened too recently.
    pub fn debounced(&self, device_id: u16, now: Instant) -> bool {
        self.last_attempt
            .get(&device_id)
            .is_some_and(|&at| now.duration_since(at) < self.promote_debounce)
    }

    pub fn note_attempt(&mut self, device_id: u16, now: Instant) {
        self.last_attempt.insert(device_id, now);
    }

    /// Drop debounce records old enough to be meaningless.
    pub fn prune_attempts(&mut self, now: Instant) {
        let horizon = self.promote_debounce;
        self.last_attempt
            .retain(|_, &mut at| now.duration_since(at) < horizon);
    }

    /// Mark a promotion as in flight. Returns false if one is already
    /// running for this device.
    pub fn begin_promotion(&mut self, device_id: u16) -> bool {
        self.in_flight.insert(device_id)
    }

    /// Always paired with a successful [`Self::begin_promotion`], success or not.
    pub fn finish_promotion(&mut self, device_id: u16) {
        self.in_flight.remove(&device_id);
    }

    /// Commit a freshly opened channel. Re-checks capacity and uniqueness at
    /// the last moment; on refusal the channel is handed back so the caller
    /// can release it.
    pub fn insert(
        &mut self,
        device_id: u16,
        channel: Box<dyn RadioChannel>,
        now: Instant,
    ) -> Result<(), Box<dyn RadioChannel>> {
        if self.at_capacity() || self.entries.contains_key(&device_id) {
            return Err(channel);
        }
        self.entries.insert(
            device_id,
            DedicatedEntry {
                channel,
                last_seen: now,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, device_id: u16) -> Option<DedicatedEntry> {
        self.entries.remove(&device_id)
    }

    /// Take every entry out of the pool (shutdown path).
    pub fn drain(&mut self) -> Vec<(u16, DedicatedEntry)> {
        self.last_attempt.clear();
        self.entries.drain().collect()
    }
}
