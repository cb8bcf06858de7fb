//! Fix-up value strategies.
//!
//! A resolver decides what 8-byte value is written into an artifact's
//! fix-up cell for a resolved record, and whether an invalidated id must be
//! kept around.

use std::sync::Arc;

use aotc_error::{AotError, Result};
use aotc_types::{RecordId, RecordKind, RecordRef};

use crate::config::{DeserializerConfig, ResolverStrategy};
use crate::runtime::LocalHandle;

pub trait OffsetResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Value for a fix-up cell referring to `target`, resolved to `handle`.
    fn encode(&self, target: RecordRef, handle: LocalHandle) -> Result<u64>;

    /// Whether invalidated ids must stay cached as stale. When `false`,
    /// stale ids may be purged and later re-sent by the server.
    fn retains_stale(&self) -> bool;
}

/// Offsets into a local store that survives process restarts.
pub trait DurableStore: Send + Sync {
    /// Stable offset of `handle`'s entry, adding it if absent. `None` means
    /// the store cannot hold the entity.
    fn offset_of(&self, handle: LocalHandle) -> Option<u64>;
}

/// Rewrites fix-ups to durable-store offsets, so installed code stays
/// valid across restarts for as long as the store keeps its entries.
#[derive(Debug)]
pub struct DurableStoreResolver<S> {
    store: Arc<S>,
}

impl<S: DurableStore> DurableStoreResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: DurableStore> OffsetResolver for DurableStoreResolver<S> {
    fn name(&self) -> &'static str {
        "durable-store"
    }

    fn encode(&self, target: RecordRef, handle: LocalHandle) -> Result<u64> {
        self.store
            .offset_of(handle)
            .ok_or_else(|| AotError::identity_mismatch(target, format!("{handle} has no durable-store entry")))
    }

    fn retains_stale(&self) -> bool {
        true
    }
}

/// Rewrites fix-ups to `(id << 8) | kind`, valid only within this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryResolver;

impl InMemoryResolver {
    const KIND_BITS: u32 = 8;

    /// Inverse of [`OffsetResolver::encode`].
    pub fn decode(value: u64) -> Option<RecordRef> {
        let kind = RecordKind::from_tag(u8::try_from(value & 0xFF).ok()?).ok()?;
        let id = RecordId::new(value >> Self::KIND_BITS)?;
        Some(RecordRef::new(kind, id))
    }
}

impl OffsetResolver for InMemoryResolver {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn encode(&self, target: RecordRef, _handle: LocalHandle) -> Result<u64> {
        let id = target.id.get();
        if id >> (u64::BITS - Self::KIND_BITS) != 0 {
            return Err(AotError::OutOfRange {
                what: "record id for in-memory encoding".to_owned(),
                value: id.to_string(),
            });
        }
        Ok((id << Self::KIND_BITS) | u64::from(target.kind.tag()))
    }

    fn retains_stale(&self) -> bool {
        false
    }
}

/// A resolver picked at startup from [`DeserializerConfig`].
#[derive(Debug)]
pub enum SelectedResolver<S> {
    DurableStore(DurableStoreResolver<S>),
    InMemory(InMemoryResolver),
}

impl<S: DurableStore> SelectedResolver<S> {
    /// Build the resolver `config` names. The durable-store strategy needs
    /// a store.
    pub fn from_config(config: &DeserializerConfig, store: Option<Arc<S>>) -> Result<Self> {
        config.validate()?;
        match config.strategy {
            ResolverStrategy::DurableStore => store
                .map(|s| Self::DurableStore(DurableStoreResolver::new(s)))
                .ok_or_else(|| {
                    AotError::Unsupported(
                        "durable_store strategy configured without a durable store".to_owned(),
                    )
                }),
            ResolverStrategy::InMemory => Ok(Self::InMemory(InMemoryResolver)),
        }
    }
}

impl<S: DurableStore> OffsetResolver for SelectedResolver<S> {
    fn name(&self) -> &'static str {
        match self {
            Self::DurableStore(r) => r.name(),
            Self::InMemory(r) => r.name(),
        }
    }

    fn encode(&self, target: RecordRef, handle: LocalHandle) -> Result<u64> {
        match self {
            Self::DurableStore(r) => r.encode(target, handle),
            Self::InMemory(r) => r.encode(target, handle),
        }
    }

    fn retains_stale(&self) -> bool {
        match self {
            Self::DurableStore(r) => r.retains_stale(),
            Self::InMemory(r) => r.retains_stale(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ClassHandle;
    use crate::sim::InMemoryDurableStore;

    #[test]
    fn test_in_memory_encoding_round_trips() {
        let target = RecordRef::new(RecordKind::Method, RecordId::new(0x1234).unwrap());
        let value = InMemoryResolver
            .encode(target, LocalHandle::AotHeader)
            .unwrap();
        assert_eq!(value, 0x1234_02);
        assert_eq!(InMemoryResolver::decode(value), Some(target));
        assert_eq!(InMemoryResolver::decode(0x07), None);
    }

    #[test]
    fn test_in_memory_rejects_ids_beyond_56_bits() {
        let target = RecordRef::new(RecordKind::Class, RecordId::new(1 << 56).unwrap());
        assert!(matches!(
            InMemoryResolver.encode(target, LocalHandle::AotHeader),
            Err(AotError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_durable_offsets_are_stable() {
        let resolver = DurableStoreResolver::new(Arc::new(InMemoryDurableStore::new(2)));
        let target = RecordRef::new(RecordKind::Class, RecordId::FIRST);
        let a = LocalHandle::Class(ClassHandle(1));
        let b = LocalHandle::Class(ClassHandle(2));
        let c = LocalHandle::Class(ClassHandle(3));
        let first = resolver.encode(target, a).unwrap();
        assert_eq!(resolver.encode(target, a).unwrap(), first);
        assert_ne!(resolver.encode(target, b).unwrap(), first);
        // The store is full.
        assert!(matches!(
            resolver.encode(target, c),
            Err(AotError::IdentityMismatch { .. })
        ));
        assert!(resolver.retains_stale());
        assert!(!InMemoryResolver.retains_stale());
    }

    #[test]
    fn test_selected_from_config() {
        let durable = DeserializerConfig::default();
        let err = SelectedResolver::<InMemoryDurableStore>::from_config(&durable, None).unwrap_err();
        assert!(matches!(err, AotError::Unsupported(_)));
        let selected =
            SelectedResolver::from_config(&durable, Some(Arc::new(InMemoryDurableStore::new(4))))
                .unwrap();
        assert_eq!(selected.name(), "durable-store");

        let in_memory = DeserializerConfig {
            strategy: ResolverStrategy::InMemory,
            ..DeserializerConfig::default()
        };
        let selected = SelectedResolver::<InMemoryDurableStore>::from_config(&in_memory, None).unwrap();
        assert_eq!(selected.name(), "in-memory");
        assert!(!selected.retains_stale());
    }
}
