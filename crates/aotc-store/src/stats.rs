//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters for one cache instance.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    pub records_created: AtomicU64,
    pub record_lookups: AtomicU64,
    pub artifacts_stored: AtomicU64,
    /// Late `store_artifact` calls for a key that already had an artifact.
    pub artifacts_discarded: AtomicU64,
    pub artifact_hits: AtomicU64,
    pub artifact_misses: AtomicU64,
    /// Records or artifacts refused because the budget was exhausted.
    pub admission_refusals: AtomicU64,
    pub delta_requests: AtomicU64,
    pub delta_records_sent: AtomicU64,
    pub snapshots_saved: AtomicU64,
}

impl CacheStatistics {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Fraction of artifact lookups that hit, or 0 with no lookups.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.artifact_hits.load(Ordering::Relaxed);
        let total = hits + self.artifact_misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> CacheStatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStatisticsSnapshot {
            records_created: load(&self.records_created),
            record_lookups: load(&self.record_lookups),
            artifacts_stored: load(&self.artifacts_stored),
            artifacts_discarded: load(&self.artifacts_discarded),
            artifact_hits: load(&self.artifact_hits),
            artifact_misses: load(&self.artifact_misses),
            admission_refusals: load(&self.admission_refusals),
            delta_requests: load(&self.delta_requests),
            delta_records_sent: load(&self.delta_records_sent),
            snapshots_saved: load(&self.snapshots_saved),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Serializable view of [`CacheStatistics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatisticsSnapshot {
    pub records_created: u64,
    pub record_lookups: u64,
    pub artifacts_stored: u64,
    pub artifacts_discarded: u64,
    pub artifact_hits: u64,
    pub artifact_misses: u64,
    pub admission_refusals: u64,
    pub delta_requests: u64,
    pub delta_records_sent: u64,
    pub snapshots_saved: u64,
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStatistics::default();
        assert!(stats.hit_ratio().abs() < f64::EPSILON);
        CacheStatistics::bump(&stats.artifact_hits);
        CacheStatistics::bump(&stats.artifact_hits);
        CacheStatistics::bump(&stats.artifact_hits);
        CacheStatistics::bump(&stats.artifact_misses);
        assert!((stats.hit_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = CacheStatistics::default();
        CacheStatistics::add(&stats.delta_records_sent, 3);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["delta_records_sent"], 3);
        assert_eq!(json["artifact_hits"], 0);
    }
}
