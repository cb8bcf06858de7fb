//! One named AOT cache instance.
//!
//! Holds one record table per kind, the artifact table, and the bookkeeping
//! persistence needs. Every table has its own lock; no operation nests two
//! table locks, and none holds a lock across hashing or I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use aotc_canon::{CanonicalClass, ClassImage, canonicalize};
use aotc_error::{AotError, Result};
use aotc_types::{
    AotHeaderRecord, ArtifactKey, ClassChainRecord, ClassLoaderRecord, ClassRecord,
    CompatibilityHeader, CompiledArtifact, KnownRecords, MethodRecord, RecordBody, RecordId,
    RecordKind, RecordRef, SerializationRecord, ThunkRecord, WellKnownClassesRecord,
};

use crate::budget::MemoryBudget;
use crate::config::SavePolicy;
use crate::delta::collect_delta;
use crate::stats::CacheStatistics;
use crate::table::{ArtifactTable, Insert, RecordTable};

/// Save bookkeeping. Times are nanoseconds since `created`.
#[derive(Debug)]
pub(crate) struct PersistState {
    pub(crate) created: Instant,
    pub(crate) save_in_flight: AtomicBool,
    pub(crate) artifacts_at_last_save: AtomicU64,
    pub(crate) last_save_nanos: AtomicU64,
}

impl PersistState {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            save_in_flight: AtomicBool::new(false),
            artifacts_at_last_save: AtomicU64::new(0),
            last_save_nanos: AtomicU64::new(0),
        }
    }

    pub(crate) fn mark_saved(&self, artifacts: usize, at: Instant) {
        let nanos = u64::try_from(at.saturating_duration_since(self.created).as_nanos())
            .unwrap_or(u64::MAX);
        self.artifacts_at_last_save
            .store(artifacts as u64, Ordering::Release);
        self.last_save_nanos.store(nanos, Ordering::Release);
    }

    fn last_save(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_save_nanos.load(Ordering::Acquire))
    }
}

/// A deduplicating store of serialization records and compiled artifacts.
#[derive(Debug)]
pub struct AotCache {
    name: String,
    server_uid: u64,
    tables: [RecordTable; RecordKind::COUNT],
    artifacts: ArtifactTable,
    budget: Arc<MemoryBudget>,
    charged: AtomicUsize,
    stats: CacheStatistics,
    pub(crate) persist: PersistState,
}

impl AotCache {
    pub fn new(name: impl Into<String>, server_uid: u64, budget: Arc<MemoryBudget>) -> Self {
        let name = name.into();
        info!(cache = %name, server_uid, "AOT cache created");
        Self {
            name,
            server_uid,
            tables: RecordKind::ALL.map(RecordTable::new),
            artifacts: ArtifactTable::new(),
            budget,
            charged: AtomicUsize::new(0),
            stats: CacheStatistics::default(),
            persist: PersistState::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of the server instance that owns this cache. Clients use a
    /// change in this value to detect that their cached ids are void.
    #[inline]
    pub const fn server_uid(&self) -> u64 {
        self.server_uid
    }

    #[inline]
    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    #[inline]
    pub const fn statistics(&self) -> &CacheStatistics {
        &self.stats
    }

    /// Bytes this cache has charged to the shared budget.
    pub fn charged_bytes(&self) -> usize {
        self.charged.load(Ordering::Acquire)
    }

    fn table(&self, kind: RecordKind) -> &RecordTable {
        &self.tables[kind.index()]
    }

    fn charge(&self, bytes: usize) {
        self.charged.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Each dependency table is locked on its own, before the caller takes
    /// its own table lock.
    fn check_dependencies(&self, deps: &[RecordRef]) -> Result<()> {
        for dep in deps {
            if !self.table(dep.kind).contains(dep.id) {
                return Err(AotError::UnresolvedDependency {
                    record: dep.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Insert a record read from a snapshot. The identity must be new and
    /// the budget must admit it; either failure rejects the snapshot.
    pub(crate) fn insert_loaded_record(
        &self,
        body: RecordBody,
    ) -> Result<Arc<SerializationRecord>> {
        self.check_dependencies(&body.dependencies())
            .map_err(|e| AotError::corrupt(e.to_string()))?;
        let kind = body.kind();
        match self.table(kind).get_or_create(body, &self.budget) {
            Insert::Created { value, charge } => {
                self.charge(charge);
                Ok(value)
            }
            Insert::Existing(existing) => Err(AotError::corrupt(format!(
                "duplicate {kind} identity (already stored as {})",
                existing.record_ref()
            ))),
            Insert::NoCapacity => Err(AotError::SnapshotTooLarge {
                needed: self.charged_bytes(),
            }),
        }
    }

    pub(crate) fn insert_loaded_artifact(
        &self,
        artifact: CompiledArtifact,
    ) -> Result<Arc<CompiledArtifact>> {
        self.check_dependencies(&artifact.dependencies())
            .map_err(|e| AotError::corrupt(e.to_string()))?;
        let key = *artifact.key();
        match self.artifacts.insert(artifact, &self.budget) {
            Insert::Created { value, charge } => {
                self.charge(charge);
                Ok(value)
            }
            Insert::Existing(_) => Err(AotError::corrupt(format!("duplicate artifact {key}"))),
            Insert::NoCapacity => Err(AotError::SnapshotTooLarge {
                needed: self.charged_bytes(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Return the record with `body`'s identity, creating it on a miss.
    ///
    /// Every dependency must already exist in this cache. Returns `Ok(None)`
    /// when the memory budget refuses the new record; nothing is allocated
    /// in that case.
    pub fn get_or_create(&self, body: RecordBody) -> Result<Option<Arc<SerializationRecord>>> {
        self.check_dependencies(&body.dependencies())?;
        let kind = body.kind();
        CacheStatistics::bump(&self.stats.record_lookups);
        match self.table(kind).get_or_create(body, &self.budget) {
            Insert::Existing(record) => Ok(Some(record)),
            Insert::Created { value, charge } => {
                self.charge(charge);
                CacheStatistics::bump(&self.stats.records_created);
                debug!(cache = %self.name, record = %value.record_ref(), bytes = charge, "record created");
                Ok(Some(value))
            }
            Insert::NoCapacity => {
                CacheStatistics::bump(&self.stats.admission_refusals);
                debug!(cache = %self.name, kind = %kind, "record refused: no capacity");
                Ok(None)
            }
        }
    }

    pub fn get_class_loader_record(
        &self,
        first_class_name: &str,
    ) -> Result<Option<Arc<SerializationRecord>>> {
        self.get_or_create(RecordBody::ClassLoader(ClassLoaderRecord {
            first_class_name: first_class_name.to_owned(),
        }))
    }

    /// Record for a class whose canonical form is already known.
    pub fn get_class_record(
        &self,
        class_loader_id: RecordId,
        name: &str,
        canonical: &CanonicalClass,
    ) -> Result<Option<Arc<SerializationRecord>>> {
        let canonical_size = u32::try_from(canonical.len()).map_err(|_| AotError::OutOfRange {
            what: "canonical class size".to_owned(),
            value: canonical.len().to_string(),
        })?;
        self.get_or_create(RecordBody::Class(ClassRecord {
            class_loader_id,
            hash: canonical.hash(),
            canonical_size,
            name: name.to_owned(),
        }))
    }

    /// Canonicalize `image` (with no lock held) and return its class record.
    pub fn get_class_record_for_image(
        &self,
        class_loader_id: RecordId,
        image: &ClassImage,
    ) -> Result<Option<Arc<SerializationRecord>>> {
        let name = image.name()?.to_owned();
        let canonical = canonicalize(image)?;
        self.get_class_record(class_loader_id, &name, &canonical)
    }

    pub fn get_method_record(
        &self,
        class_id: RecordId,
        index: u32,
    ) -> Result<Option<Arc<SerializationRecord>>> {
        self.get_or_create(RecordBody::Method(MethodRecord { class_id, index }))
    }

    pub fn get_class_chain_record(
        &self,
        class_ids: &[RecordId],
    ) -> Result<Option<Arc<SerializationRecord>>> {
        self.get_or_create(RecordBody::ClassChain(ClassChainRecord::new(
            class_ids.to_vec(),
        )?))
    }

    pub fn get_well_known_classes_record(
        &self,
        chain_ids: &[RecordId],
        include_mask: u64,
    ) -> Result<Option<Arc<SerializationRecord>>> {
        self.get_or_create(RecordBody::WellKnownClasses(WellKnownClassesRecord::new(
            chain_ids.to_vec(),
            include_mask,
        )?))
    }

    pub fn get_aot_header_record(
        &self,
        header: &CompatibilityHeader,
    ) -> Result<Option<Arc<SerializationRecord>>> {
        self.get_or_create(RecordBody::AotHeader(AotHeaderRecord { header: *header }))
    }

    /// Thunk identity is the signature alone; the first code stored for a
    /// signature is the one kept.
    pub fn get_thunk_record(
        &self,
        signature: &str,
        code: &[u8],
    ) -> Result<Option<Arc<SerializationRecord>>> {
        self.get_or_create(RecordBody::Thunk(ThunkRecord {
            signature: signature.to_owned(),
            code: code.to_vec(),
        }))
    }

    pub fn record(&self, target: RecordRef) -> Option<Arc<SerializationRecord>> {
        self.table(target.kind).get(target.id)
    }

    /// All records of `kind` in id order.
    pub fn records(&self, kind: RecordKind) -> Vec<Arc<SerializationRecord>> {
        self.table(kind).snapshot()
    }

    pub fn record_count(&self, kind: RecordKind) -> usize {
        self.table(kind).len()
    }

    pub fn total_record_count(&self) -> usize {
        self.tables.iter().map(RecordTable::len).sum()
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    /// Store a compiled artifact.
    ///
    /// The first artifact stored under a key wins; a later one is dropped
    /// and the existing artifact is returned. `Ok(None)` means the budget
    /// refused it.
    pub fn store_artifact(
        &self,
        artifact: CompiledArtifact,
    ) -> Result<Option<Arc<CompiledArtifact>>> {
        self.check_dependencies(&artifact.dependencies())?;
        let key = *artifact.key();
        match self.artifacts.insert(artifact, &self.budget) {
            Insert::Existing(existing) => {
                CacheStatistics::bump(&self.stats.artifacts_discarded);
                debug!(cache = %self.name, key = %key, "duplicate artifact discarded");
                Ok(Some(existing))
            }
            Insert::Created { value, charge } => {
                self.charge(charge);
                CacheStatistics::bump(&self.stats.artifacts_stored);
                debug!(
                    cache = %self.name,
                    key = %key,
                    signature = value.signature(),
                    bytes = charge,
                    "artifact stored"
                );
                Ok(Some(value))
            }
            Insert::NoCapacity => {
                CacheStatistics::bump(&self.stats.admission_refusals);
                Ok(None)
            }
        }
    }

    pub fn find_artifact(&self, key: &ArtifactKey) -> Option<Arc<CompiledArtifact>> {
        let found = self.artifacts.get(key);
        if found.is_some() {
            CacheStatistics::bump(&self.stats.artifact_hits);
        } else {
            CacheStatistics::bump(&self.stats.artifact_misses);
        }
        found
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    /// Artifacts in the order they were stored.
    pub fn artifacts(&self) -> Vec<Arc<CompiledArtifact>> {
        self.artifacts.snapshot()
    }

    /// Signatures of every stored artifact, in storage order.
    pub fn cached_method_signatures(&self) -> Vec<String> {
        self.artifacts
            .snapshot()
            .iter()
            .map(|a| a.signature().to_owned())
            .collect()
    }

    /// Records a client needs to consume `artifact`, given the ones it
    /// already has, in dependency order.
    pub fn get_delta_records(
        &self,
        artifact: &CompiledArtifact,
        known: &KnownRecords,
    ) -> Result<Vec<Arc<SerializationRecord>>> {
        let delta = collect_delta(artifact, known, |r| self.record(r))?;
        CacheStatistics::bump(&self.stats.delta_requests);
        CacheStatistics::add(&self.stats.delta_records_sent, delta.len());
        debug!(
            cache = %self.name,
            key = %artifact.key(),
            known = known.len(),
            sent = delta.len(),
            "delta computed"
        );
        Ok(delta)
    }

    // -----------------------------------------------------------------------
    // Save scheduling
    // -----------------------------------------------------------------------

    /// Whether `policy` calls for a save at `now`.
    pub fn should_save(&self, policy: &SavePolicy, now: Instant) -> bool {
        if self.persist.save_in_flight.load(Ordering::Acquire) {
            return false;
        }
        let stored = self.artifact_count() as u64;
        let new = stored.saturating_sub(self.persist.artifacts_at_last_save.load(Ordering::Acquire));
        new >= policy.min_new_artifacts
            && now.saturating_duration_since(self.persist.last_save()) >= policy.min_interval
    }
}

impl Drop for AotCache {
    fn drop(&mut self) {
        let charged = *self.charged.get_mut();
        if charged > 0 {
            self.budget.release(charged);
        }
    }
}
