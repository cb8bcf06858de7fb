//! Deserializer statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters for one deserializer.
#[derive(Debug, Default)]
pub struct DeserializerStatistics {
    pub records_cached: AtomicU64,
    pub records_already_known: AtomicU64,
    /// Records that failed identity verification and are now permanently
    /// invalid.
    pub records_invalid: AtomicU64,
    /// Stale entries that were re-resolved.
    pub revalidations: AtomicU64,
    pub stale_marks: AtomicU64,
    pub stale_purged: AtomicU64,
    pub resets: AtomicU64,
    pub deserializations_ok: AtomicU64,
    pub deserializations_failed: AtomicU64,
    /// Deserializations abandoned because a reset ran concurrently.
    pub concurrent_reset_aborts: AtomicU64,
}

impl DeserializerStatistics {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeserializerStatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DeserializerStatisticsSnapshot {
            records_cached: load(&self.records_cached),
            records_already_known: load(&self.records_already_known),
            records_invalid: load(&self.records_invalid),
            revalidations: load(&self.revalidations),
            stale_marks: load(&self.stale_marks),
            stale_purged: load(&self.stale_purged),
            resets: load(&self.resets),
            deserializations_ok: load(&self.deserializations_ok),
            deserializations_failed: load(&self.deserializations_failed),
            concurrent_reset_aborts: load(&self.concurrent_reset_aborts),
        }
    }
}

/// Serializable view of [`DeserializerStatistics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeserializerStatisticsSnapshot {
    pub records_cached: u64,
    pub records_already_known: u64,
    pub records_invalid: u64,
    pub revalidations: u64,
    pub stale_marks: u64,
    pub stale_purged: u64,
    pub resets: u64,
    pub deserializations_ok: u64,
    pub deserializations_failed: u64,
    pub concurrent_reset_aborts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let stats = DeserializerStatistics::default();
        DeserializerStatistics::bump(&stats.resets);
        DeserializerStatistics::add(&stats.records_cached, 4);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["resets"], 1);
        assert_eq!(json["records_cached"], 4);
        assert_eq!(json["stale_purged"], 0);
    }
}
