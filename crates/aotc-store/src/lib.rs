//! Server side of the AOT compilation cache.
//!
//! An [`AotCache`] deduplicates serialization records per kind, stores
//! compiled artifacts first-writer-wins, computes the delta of records a
//! client is missing, and persists itself to versioned snapshot files.
//! [`AotCacheMap`] keeps named caches under one [`MemoryBudget`], and
//! [`SharedClassCache`] holds a single counted copy of each canonical class.

pub mod budget;
pub mod cache;
pub mod cache_map;
pub mod config;
mod delta;
pub mod shared_class_cache;
pub mod snapshot;
pub mod stats;
mod table;

pub use budget::MemoryBudget;
pub use cache::AotCache;
pub use cache_map::AotCacheMap;
pub use config::{SavePolicy, StoreConfig};
pub use shared_class_cache::{SharedClassCache, SharedClassCacheSnapshot, SharedClassHandle};
pub use snapshot::{
    KindSummary, SNAPSHOT_EXTENSION, SNAPSHOT_FORMAT_VERSION, SNAPSHOT_MAGIC, SaveOutcome,
    SnapshotHeader, read_snapshot_header,
};
pub use stats::{CacheStatistics, CacheStatisticsSnapshot};
