//! Deserializer configuration.

use serde::{Deserialize, Serialize};

use aotc_error::{AotError, Result};

/// How fix-up cells are rewritten when an artifact is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverStrategy {
    /// Offsets into the durable store. Invalidated ids stay cached as stale.
    #[default]
    DurableStore,
    /// Process-local `(id, kind)` encoding. Stale ids may be purged.
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeserializerConfig {
    pub strategy: ResolverStrategy,
    /// Purge stale ids after every reset-free deserialization. Only valid
    /// with [`ResolverStrategy::InMemory`].
    pub purge_stale_eagerly: bool,
}

impl DeserializerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.purge_stale_eagerly && self.strategy == ResolverStrategy::DurableStore {
            return Err(AotError::Unsupported(
                "purge_stale_eagerly requires the in_memory resolver strategy".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_durable_store() {
        let config = DeserializerConfig::default();
        assert_eq!(config.strategy, ResolverStrategy::DurableStore);
        config.validate().unwrap();
    }

    #[test]
    fn test_eager_purge_needs_in_memory() {
        let config = DeserializerConfig {
            strategy: ResolverStrategy::DurableStore,
            purge_stale_eagerly: true,
        };
        assert!(matches!(config.validate(), Err(AotError::Unsupported(_))));
        let config = DeserializerConfig {
            strategy: ResolverStrategy::InMemory,
            purge_stale_eagerly: true,
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_strategy_parses_from_json() {
        let config: DeserializerConfig =
            serde_json::from_str(r#"{"strategy": "in_memory"}"#).unwrap();
        assert_eq!(config.strategy, ResolverStrategy::InMemory);
        assert!(!config.purge_stale_eagerly);
    }
}
