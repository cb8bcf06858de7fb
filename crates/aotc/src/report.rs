//! Server counters and the serializable status report.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use aotc_store::{CacheStatisticsSnapshot, SharedClassCacheSnapshot};

#[derive(Debug, Default)]
pub struct ServerStatistics {
    pub requests: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    /// Requests refused because a record or artifact did not fit the budget.
    pub unavailable: AtomicU64,
    pub records_sent: AtomicU64,
    pub artifacts_stored: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
}

impl ServerStatistics {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServerStatisticsSnapshot {
            requests: load(&self.requests),
            hits: load(&self.hits),
            misses: load(&self.misses),
            unavailable: load(&self.unavailable),
            records_sent: load(&self.records_sent),
            artifacts_stored: load(&self.artifacts_stored),
            sessions_opened: load(&self.sessions_opened),
            sessions_closed: load(&self.sessions_closed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatisticsSnapshot {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub unavailable: u64,
    pub records_sent: u64,
    pub artifacts_stored: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
}

/// One named cache in a [`ServerReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheReport {
    pub name: String,
    pub records: usize,
    pub artifacts: usize,
    pub charged_bytes: usize,
    pub statistics: CacheStatisticsSnapshot,
}

/// Point-in-time view of a server, for logs and status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerReport {
    pub server_uid: u64,
    pub budget_used: usize,
    pub budget_limit: usize,
    pub sessions: usize,
    pub server: ServerStatisticsSnapshot,
    pub shared_classes: SharedClassCacheSnapshot,
    pub caches: Vec<CacheReport>,
}
