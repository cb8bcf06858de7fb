//! Per-kind record tables and the artifact table.
//!
//! Each table is an arena: records live in an insertion-ordered `Vec`, the id
//! of a record is its position plus one, and a side map takes identities to
//! ids. Identity insertion and id allocation happen under one lock
//! acquisition, so an identity can never be given two ids.

use std::collections::HashMap;
use std::sync::Arc;

use aotc_types::{
    ArtifactKey, CompiledArtifact, LockLevel, OrderedMutex, RecordBody, RecordId, RecordIdentity,
    RecordKind, SerializationRecord,
};

use crate::budget::MemoryBudget;

/// Bytes charged per table entry on top of its encoded size.
pub(crate) const ENTRY_OVERHEAD: usize = 64;

/// Outcome of inserting into a table.
#[derive(Debug)]
pub(crate) enum Insert<T> {
    Existing(Arc<T>),
    Created { value: Arc<T>, charge: usize },
    NoCapacity,
}

#[derive(Debug, Default)]
struct TableState {
    by_identity: HashMap<RecordIdentity, RecordId>,
    records: Vec<Arc<SerializationRecord>>,
}

#[derive(Debug)]
pub(crate) struct RecordTable {
    kind: RecordKind,
    state: OrderedMutex<TableState>,
}

impl RecordTable {
    pub(crate) fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            state: OrderedMutex::new(LockLevel::for_kind(kind), TableState::default()),
        }
    }

    /// Look `body` up by identity, creating it with the next id on a miss.
    pub(crate) fn get_or_create(
        &self,
        body: RecordBody,
        budget: &MemoryBudget,
    ) -> Insert<SerializationRecord> {
        debug_assert_eq!(body.kind(), self.kind);
        let identity = body.identity();
        let mut state = self.state.lock();
        if let Some(id) = state.by_identity.get(&identity) {
            return Insert::Existing(Arc::clone(&state.records[id.index()]));
        }
        let Some(id) = RecordId::new(state.records.len() as u64 + 1) else {
            return Insert::NoCapacity;
        };
        let record = SerializationRecord::new(id, body);
        let charge = record.encoded_len() + ENTRY_OVERHEAD;
        if !budget.try_reserve(charge) {
            return Insert::NoCapacity;
        }
        let record = Arc::new(record);
        state.by_identity.insert(identity, id);
        state.records.push(Arc::clone(&record));
        Insert::Created {
            value: record,
            charge,
        }
    }

    pub(crate) fn get(&self, id: RecordId) -> Option<Arc<SerializationRecord>> {
        self.state.lock().records.get(id.index()).cloned()
    }

    pub(crate) fn contains(&self, id: RecordId) -> bool {
        id.index() < self.state.lock().records.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// All records in insertion order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<SerializationRecord>> {
        self.state.lock().records.clone()
    }
}

#[derive(Debug, Default)]
struct ArtifactState {
    by_key: HashMap<ArtifactKey, Arc<CompiledArtifact>>,
    order: Vec<Arc<CompiledArtifact>>,
}

#[derive(Debug)]
pub(crate) struct ArtifactTable {
    state: OrderedMutex<ArtifactState>,
}

impl ArtifactTable {
    pub(crate) fn new() -> Self {
        Self {
            state: OrderedMutex::new(LockLevel::Artifact, ArtifactState::default()),
        }
    }

    /// First writer wins: an existing artifact for the key is returned
    /// unchanged and `artifact` is dropped.
    pub(crate) fn insert(
        &self,
        artifact: CompiledArtifact,
        budget: &MemoryBudget,
    ) -> Insert<CompiledArtifact> {
        let mut state = self.state.lock();
        if let Some(existing) = state.by_key.get(artifact.key()) {
            return Insert::Existing(Arc::clone(existing));
        }
        let charge = artifact.encoded_len() + ENTRY_OVERHEAD;
        if !budget.try_reserve(charge) {
            return Insert::NoCapacity;
        }
        let artifact = Arc::new(artifact);
        state.by_key.insert(*artifact.key(), Arc::clone(&artifact));
        state.order.push(Arc::clone(&artifact));
        Insert::Created {
            value: artifact,
            charge,
        }
    }

    pub(crate) fn get(&self, key: &ArtifactKey) -> Option<Arc<CompiledArtifact>> {
        self.state.lock().by_key.get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<CompiledArtifact>> {
        self.state.lock().order.clone()
    }
}
