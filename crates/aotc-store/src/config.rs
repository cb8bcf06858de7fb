//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aotc_error::{AotError, Result};

/// When a cache's content is worth persisting.
///
/// Both thresholds must be met: at least `min_new_artifacts` stored since
/// the last save, and at least `min_interval` elapsed since it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavePolicy {
    pub min_new_artifacts: u64,
    pub min_interval: Duration,
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self {
            min_new_artifacts: 200,
            min_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound on bytes tracked across every cache instance.
    pub memory_budget_bytes: usize,
    /// Number of partitions of the shared class cache.
    pub shared_class_partitions: usize,
    /// Directory holding one snapshot file per named cache. `None`
    /// disables persistence.
    pub snapshot_dir: Option<PathBuf>,
    /// Load a named cache from its snapshot the first time it is used.
    pub load_on_startup: bool,
    pub save_policy: SavePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 300 * 1024 * 1024,
            shared_class_partitions: 16,
            snapshot_dir: None,
            load_on_startup: true,
            save_policy: SavePolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memory_budget_bytes == 0 {
            return Err(AotError::OutOfRange {
                what: "memory_budget_bytes".to_owned(),
                value: "0".to_owned(),
            });
        }
        if self.shared_class_partitions == 0 {
            return Err(AotError::OutOfRange {
                what: "shared_class_partitions".to_owned(),
                value: "0".to_owned(),
            });
        }
        Ok(())
    }
}
