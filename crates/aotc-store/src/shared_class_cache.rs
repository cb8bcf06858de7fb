//! Shared class-metadata cache.
//!
//! Holds one reference-counted copy of each distinct canonical class blob,
//! sharded by class hash. Taking a reference happens under the partition
//! lock; dropping one is a lock-free decrement, and only the thread that
//! brings the count to zero takes the lock, re-checks, and frees the entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tracing::debug;

use aotc_canon::CanonicalClass;
use aotc_types::{ClassHash, LockLevel, OrderedMutex};

#[derive(Debug)]
struct SharedEntry {
    hash: ClassHash,
    bytes: Box<[u8]>,
    refs: AtomicUsize,
}

type Partition = OrderedMutex<HashMap<ClassHash, Arc<SharedEntry>>>;

#[derive(Debug)]
pub struct SharedClassCache {
    partitions: Box<[Partition]>,
    live_bytes: AtomicUsize,
    hits: AtomicU64,
    inserts: AtomicU64,
    frees: AtomicU64,
}

/// Counters of a [`SharedClassCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedClassCacheSnapshot {
    pub entries: usize,
    pub live_bytes: usize,
    pub hits: u64,
    pub inserts: u64,
    pub frees: u64,
}

impl SharedClassCache {
    /// # Panics
    ///
    /// Panics if `partitions` is zero.
    pub fn new(partitions: usize) -> Arc<Self> {
        assert!(partitions > 0, "shared class cache needs a partition");
        Arc::new(Self {
            partitions: (0..partitions)
                .map(|_| OrderedMutex::new(LockLevel::SharedPartition, HashMap::new()))
                .collect(),
            live_bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn partition(&self, hash: &ClassHash) -> &Partition {
        let index = (hash.shard_key() % self.partitions.len() as u64) as usize;
        &self.partitions[index]
    }

    /// Take a reference to the entry for `class`, inserting it on first use.
    pub fn get_or_create(self: &Arc<Self>, class: &CanonicalClass) -> SharedClassHandle {
        let hash = class.hash();
        let mut map = self.partition(&hash).lock();
        let entry = if let Some(entry) = map.get(&hash) {
            entry.refs.fetch_add(1, Ordering::AcqRel);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Arc::clone(entry)
        } else {
            let entry = Arc::new(SharedEntry {
                hash,
                bytes: class.bytes().into(),
                refs: AtomicUsize::new(1),
            });
            map.insert(hash, Arc::clone(&entry));
            self.live_bytes.fetch_add(entry.bytes.len(), Ordering::Relaxed);
            self.inserts.fetch_add(1, Ordering::Relaxed);
            entry
        };
        drop(map);
        SharedClassHandle {
            cache: Arc::clone(self),
            entry,
        }
    }

    fn release(&self, entry: &Arc<SharedEntry>) {
        if entry.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut map = self.partition(&entry.hash).lock();
        // Someone may have revived the entry, or replaced it after an
        // earlier free, between the decrement and the lock.
        let still_dead = entry.refs.load(Ordering::Acquire) == 0
            && map.get(&entry.hash).is_some_and(|e| Arc::ptr_eq(e, entry));
        if still_dead {
            map.remove(&entry.hash);
            self.live_bytes
                .fetch_sub(entry.bytes.len(), Ordering::Relaxed);
            self.frees.fetch_add(1, Ordering::Relaxed);
            debug!(hash = %entry.hash, "shared class entry freed");
        }
    }

    pub fn contains(&self, hash: &ClassHash) -> bool {
        self.partition(hash).lock().contains_key(hash)
    }

    /// Number of live entries; takes each partition lock in turn.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> SharedClassCacheSnapshot {
        SharedClassCacheSnapshot {
            entries: self.len(),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}

/// A counted reference to one shared class blob.
#[derive(Debug)]
pub struct SharedClassHandle {
    cache: Arc<SharedClassCache>,
    entry: Arc<SharedEntry>,
}

impl SharedClassHandle {
    pub fn hash(&self) -> ClassHash {
        self.entry.hash
    }

    pub fn bytes(&self) -> &[u8] {
        &self.entry.bytes
    }

    /// Current reference count of the underlying entry.
    pub fn ref_count(&self) -> usize {
        self.entry.refs.load(Ordering::Acquire)
    }
}

impl Clone for SharedClassHandle {
    fn clone(&self) -> Self {
        // Holding a handle keeps the count above zero, so no lock is needed.
        self.entry.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            cache: Arc::clone(&self.cache),
            entry: Arc::clone(&self.entry),
        }
    }
}

impl Drop for SharedClassHandle {
    fn drop(&mut self) {
        self.cache.release(&self.entry);
    }
}
