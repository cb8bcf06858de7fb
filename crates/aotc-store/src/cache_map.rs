//! Registry of named cache instances sharing one memory budget.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use aotc_error::Result;
use aotc_types::{LockLevel, OrderedMutex};

use crate::budget::MemoryBudget;
use crate::cache::AotCache;
use crate::config::StoreConfig;
use crate::shared_class_cache::SharedClassCache;
use crate::snapshot::{SNAPSHOT_EXTENSION, SaveOutcome};

#[derive(Debug)]
pub struct AotCacheMap {
    caches: OrderedMutex<HashMap<String, Arc<AotCache>>>,
    budget: Arc<MemoryBudget>,
    shared_classes: Arc<SharedClassCache>,
    config: StoreConfig,
    server_uid: u64,
}

impl AotCacheMap {
    pub fn new(config: StoreConfig, server_uid: u64) -> Result<Self> {
        config.validate()?;
        info!(
            server_uid,
            budget = config.memory_budget_bytes,
            persistence = config.snapshot_dir.is_some(),
            "AOT cache registry started"
        );
        Ok(Self {
            caches: OrderedMutex::new(LockLevel::Registry, HashMap::new()),
            budget: Arc::new(MemoryBudget::new(config.memory_budget_bytes)),
            shared_classes: SharedClassCache::new(config.shared_class_partitions),
            config,
            server_uid,
        })
    }

    #[inline]
    pub const fn server_uid(&self) -> u64 {
        self.server_uid
    }

    #[inline]
    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    #[inline]
    pub fn shared_classes(&self) -> &Arc<SharedClassCache> {
        &self.shared_classes
    }

    #[inline]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Snapshot file for `name`, or `None` without a snapshot directory.
    ///
    /// Characters outside `[A-Za-z0-9._-]` are replaced so a cache name can
    /// never escape the directory.
    pub fn snapshot_path(&self, name: &str) -> Option<PathBuf> {
        let dir = self.config.snapshot_dir.as_ref()?;
        let mut file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if file.is_empty() || file.starts_with('.') {
            file.insert(0, '_');
        }
        Some(dir.join(format!("{file}.{SNAPSHOT_EXTENSION}")))
    }

    pub fn get(&self, name: &str) -> Option<Arc<AotCache>> {
        self.caches.lock().get(name).cloned()
    }

    /// The cache called `name`, creating it on first use.
    ///
    /// With persistence configured, a new cache is first loaded from its
    /// snapshot. The load runs without the registry lock; if another thread
    /// registered the name meanwhile, its cache wins and ours is dropped.
    pub fn get_or_create(&self, name: &str) -> Arc<AotCache> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let fresh = Arc::new(self.load_or_new(name));
        let mut caches = self.caches.lock();
        Arc::clone(caches.entry(name.to_owned()).or_insert(fresh))
    }

    fn load_or_new(&self, name: &str) -> AotCache {
        if self.config.load_on_startup {
            if let Some(path) = self.snapshot_path(name) {
                // Failures are logged by the loader; fall back to an empty cache.
                if let Ok(cache) =
                    AotCache::load_snapshot(&path, name, self.server_uid, Arc::clone(&self.budget))
                {
                    return cache;
                }
            }
        }
        AotCache::new(name, self.server_uid, Arc::clone(&self.budget))
    }

    /// Names of every registered cache, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<Arc<AotCache>> {
        self.caches.lock().values().cloned().collect()
    }

    /// Save every cache whose save policy is met at `now`.
    pub fn save_due(&self, now: Instant) -> Vec<(String, Result<SaveOutcome>)> {
        let policy = self.config.save_policy;
        self.all()
            .into_iter()
            .filter(|cache| cache.should_save(&policy, now))
            .filter_map(|cache| {
                let path = self.snapshot_path(cache.name())?;
                let outcome = cache.save_snapshot(&path);
                if let Err(err) = &outcome {
                    warn!(cache = %cache.name(), error = %err, "snapshot save failed");
                }
                Some((cache.name().to_owned(), outcome))
            })
            .collect()
    }

    /// Save every cache regardless of policy, e.g. at shutdown.
    pub fn save_all(&self) -> Vec<(String, Result<SaveOutcome>)> {
        self.all()
            .into_iter()
            .filter_map(|cache| {
                let path = self.snapshot_path(cache.name())?;
                Some((cache.name().to_owned(), cache.save_snapshot(&path)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use aotc_error::AotError;

    use super::*;

    #[test]
    fn test_named_caches_share_budget() {
        let map = AotCacheMap::new(StoreConfig::default(), 3).unwrap();
        let a = map.get_or_create("alpha");
        let b = map.get_or_create("beta");
        assert!(Arc::ptr_eq(&a, &map.get_or_create("alpha")));
        assert!(Arc::ptr_eq(a.budget(), b.budget()));
        assert_eq!(map.names(), vec!["alpha".to_owned(), "beta".to_owned()]);
    }

    #[test]
    fn test_snapshot_path_is_sanitized() {
        let config = StoreConfig {
            snapshot_dir: Some(PathBuf::from("/var/aot")),
            ..StoreConfig::default()
        };
        let map = AotCacheMap::new(config, 1).unwrap();
        assert_eq!(
            map.snapshot_path("../etc/passwd").unwrap(),
            PathBuf::from("/var/aot/_.._etc_passwd.aotcache")
        );
        assert_eq!(
            map.snapshot_path("app-1").unwrap(),
            PathBuf::from("/var/aot/app-1.aotcache")
        );
    }

    #[test]
    fn test_no_snapshot_dir_disables_saves() {
        let map = AotCacheMap::new(StoreConfig::default(), 1).unwrap();
        map.get_or_create("x");
        assert!(map.snapshot_path("x").is_none());
        assert!(map.save_all().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StoreConfig {
            memory_budget_bytes: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            AotCacheMap::new(config, 1),
            Err(AotError::OutOfRange { .. })
        ));
    }
}
