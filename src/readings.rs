//! Shared table of the latest heart-rate reading per device.
//!
//! This is the sole output artifact of the channel manager: a concurrent map
//! `device_id -> {heart_rate, observed_at}` written by whichever channel last
//! observed each device and read by the external metrics/aggregation layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Latest observation for a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reading {
    pub heart_rate: u8,
    pub observed_at: DateTime<Utc>,
}

/// A reading paired with its device id, as returned by listing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceReading {
    pub device_id: u16,
    pub heart_rate: u8,
    pub observed_at: DateTime<Utc>,
}

/// Concurrent `device_id -> Reading` map, cheap to clone and share.
///
/// Writers replace whole entries under the lock, so readers never observe a
/// torn reading.
#[derive(Debug, Clone, Default)]
pub struct SharedReadingTable {
    inner: Arc<RwLock<HashMap<u16, Reading>>>,
}

impl SharedReadingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh observation for `device_id`, stamped with the current
    /// UTC time.
    pub fn insert(&self, device_id: u16, heart_rate: u8) {
        let reading = Reading {
            heart_rate,
            observed_at: Utc::now(),
        };
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id, reading);
    }

    pub fn get(&self, device_id: u16) -> Option<Reading> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device_id)
            .copied()
    }

    /// Drop the entry for `device_id` (called when its channel is reaped).
    pub fn remove(&self, device_id: u16) -> Option<Reading> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device_id)
    }

    /// Devices observed within the last `window_seconds`, ordered by id.
    ///
    /// Consumers use this both for display and to tell free devices apart
    /// from ones already being tracked.
    pub fn list_recent(&self, window_seconds: u64) -> Vec<DeviceReading> {
        let cutoff = Utc::now() - chrono::Duration::seconds(window_seconds as i64);
        let mut readings: Vec<DeviceReading> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, r)| r.observed_at >= cutoff)
            .map(|(&device_id, r)| DeviceReading {
                device_id,
                heart_rate: r.heart_rate,
                observed_at: r.observed_at,
            })
            .collect();
        readings.sort_by_key(|r| r.device_id);
        readings
    }

    /// Every current entry, ordered by device id.
    pub fn snapshot(&self) -> Vec<DeviceReading> {
        let mut readings: Vec<DeviceReading> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(&device_id, r)| DeviceReading {
                device_id,
                heart_rate: r.heart_rate,
                observed_at: r.observed_at,
            })
            .collect();
        readings.sort_by_key(|r| r.device_id);
        readings
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let table = SharedReadingTable::new();
        assert!(table.is_empty());

        table.insert(12345, 72);
        let reading = table.get(12345).unwrap();
        assert_eq!(reading.heart_rate, 72);

        table.insert(12345, 80);
        assert_eq!(table.get(12345).unwrap().heart_rate, 80);
        assert_eq!(table.len(), 1);

        assert!(table.remove(12345).is_some());
        assert!(table.get(12345).is_none());
    }

    #[test]
    fn test_list_recent_filters_stale_entries() {
        let table = SharedReadingTable::new();
        table.insert(1, 60);
        table.insert(2, 70);

        // Backdate device 1 past the window
        {
            let mut guard = table.inner.write().unwrap();
            let entry = guard.get_mut(&1).unwrap();
            entry.observed_at = Utc::now() - chrono::Duration::seconds(120);
        }

        let recent = table.list_recent(30);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].device_id, 2);
        assert_eq!(recent[0].heart_rate, 70);
    }

    #[test]
    fn test_snapshot_is_ordered_and_serializable() {
        let table = SharedReadingTable::new();
        table.insert(300, 88);
        table.insert(7, 65);

        let snapshot = table.snapshot();
        assert_eq!(snapshot[0].device_id, 7);
        assert_eq!(snapshot[1].device_id, 300);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"device_id\":7"));
        assert!(json.contains("\"heart_rate\":65"));
    }

    #[test]
    fn test_clones_share_storage() {
        let table = SharedReadingTable::new();
        let clone = table.clone();
        table.insert(42, 100);
        assert_eq!(clone.get(42).unwrap().heart_rate, 100);
    }
}
