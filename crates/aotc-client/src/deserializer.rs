//! Client-side deserializer.
//!
//! Each record id moves through `unresolved -> resolved -> stale ->
//! resolved | invalid`. Records are resolved against the live runtime
//! with no deserializer lock held; the result is published under the
//! kind's lock after re-checking the reset generation. A reset takes
//! every lock in order, bumps the generation and clears all state, so an
//! in-flight deserialization either finishes entirely before it or fails
//! with [`AotError::ConcurrentReset`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use aotc_canon::canonicalize_checked;
use aotc_error::{AotError, Result};
use aotc_types::encoding::write_u64_le;
use aotc_types::{
    AotHeaderRecord, ArtifactKey, CompiledArtifact, FIXUP_WIDTH, LockLevel, OrderedGuard,
    OrderedMutex, RecordBody, RecordId, RecordKind, RecordRef, SerializationRecord,
};

use crate::resolver::OffsetResolver;
use crate::runtime::{ClassHandle, ClassRuntime, LoaderHandle, LocalHandle, MethodHandle};
use crate::stats::DeserializerStatistics;

/// Result of [`AotDeserializer::cache_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The id was already cached and still resolves.
    AlreadyKnown,
    NewlyCached,
    /// The record can never resolve in this process.
    Invalid(String),
}

/// What the deserializer currently knows about one record id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Unresolved,
    Resolved(LocalHandle),
    /// Cached, but the entity it resolved to went away.
    Stale,
    Invalid(String),
}

/// Ids to report to the server with the next request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownIdsUpdate {
    /// The deserializer was reset since the last update; the server must
    /// drop its baseline before applying the rest.
    pub reset: bool,
    pub newly_cached: Vec<RecordRef>,
    /// Stale ids purged from the cache.
    pub forgotten: Vec<RecordRef>,
}

impl KnownIdsUpdate {
    pub fn is_empty(&self) -> bool {
        !self.reset && self.newly_cached.is_empty() && self.forgotten.is_empty()
    }
}

/// A compiled artifact with every fix-up rewritten for this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledArtifact {
    pub key: ArtifactKey,
    pub signature: String,
    pub code: Vec<u8>,
    /// Reset generation the artifact was installed in.
    pub generation: u64,
}

#[derive(Debug, Clone)]
enum Entry {
    Resolved {
        body: Arc<RecordBody>,
        handle: LocalHandle,
    },
    Stale {
        body: Arc<RecordBody>,
    },
    Invalid {
        reason: String,
    },
}

/// Per-kind state: id to entry, and live handle back to the ids that
/// resolved to it.
#[derive(Debug, Default)]
struct KindMap {
    entries: HashMap<RecordId, Entry>,
    backward: HashMap<LocalHandle, Vec<RecordId>>,
}

impl KindMap {
    fn insert_resolved(&mut self, id: RecordId, body: Arc<RecordBody>, handle: LocalHandle) {
        if let Some(Entry::Resolved { handle: old, .. }) =
            self.entries.insert(id, Entry::Resolved { body, handle })
        {
            self.unlink(old, id);
        }
        self.backward.entry(handle).or_default().push(id);
    }

    fn insert_invalid(&mut self, id: RecordId, reason: String) {
        if let Some(Entry::Resolved { handle, .. }) =
            self.entries.insert(id, Entry::Invalid { reason })
        {
            self.unlink(handle, id);
        }
    }

    fn mark_stale(&mut self, id: RecordId) -> bool {
        let Some(Entry::Resolved { body, handle }) = self.entries.get(&id).cloned() else {
            return false;
        };
        self.unlink(handle, id);
        self.entries.insert(id, Entry::Stale { body });
        true
    }

    /// Mark every id resolved to `handle` stale.
    fn mark_handle_stale(&mut self, handle: LocalHandle) -> usize {
        let ids = self.backward.remove(&handle).unwrap_or_default();
        let mut marked = 0;
        for id in ids {
            if let Some(Entry::Resolved { body, .. }) = self.entries.get(&id).cloned() {
                self.entries.insert(id, Entry::Stale { body });
                marked += 1;
            }
        }
        marked
    }

    fn unlink(&mut self, handle: LocalHandle, id: RecordId) {
        if let Some(ids) = self.backward.get_mut(&handle) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.backward.remove(&handle);
            }
        }
    }

    fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.backward.clear();
        n
    }
}

#[derive(Debug, Default)]
struct KnownIds {
    reset: bool,
    newly_cached: Vec<RecordRef>,
    forgotten: Vec<RecordRef>,
}

/// Turns server-sent records and artifacts into locally usable code.
///
/// `R` answers identity questions about the live process; `O` decides the
/// value written into each fix-up cell.
pub struct AotDeserializer<R, O> {
    runtime: Arc<R>,
    resolver: O,
    generation: AtomicU64,
    maps: [OrderedMutex<KindMap>; RecordKind::COUNT],
    known: OrderedMutex<KnownIds>,
    /// Held for the whole of a reset; guards the server instance id.
    reset_outer: OrderedMutex<Option<u64>>,
    /// Taken last by a reset and by every install.
    reset_inner: OrderedMutex<()>,
    stats: DeserializerStatistics,
}

impl<R: ClassRuntime, O: OffsetResolver> AotDeserializer<R, O> {
    pub fn new(runtime: Arc<R>, resolver: O) -> Self {
        debug!(resolver = resolver.name(), "aot deserializer created");
        Self {
            runtime,
            resolver,
            generation: AtomicU64::new(0),
            maps: RecordKind::ALL
                .map(|kind| OrderedMutex::new(LockLevel::for_kind(kind), KindMap::default())),
            known: OrderedMutex::new(LockLevel::KnownIds, KnownIds::default()),
            reset_outer: OrderedMutex::new(LockLevel::ResetOuter, None),
            reset_inner: OrderedMutex::new(LockLevel::ResetInner, ()),
            stats: DeserializerStatistics::default(),
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn resolver(&self) -> &O {
        &self.resolver
    }

    pub fn statistics(&self) -> &DeserializerStatistics {
        &self.stats
    }

    /// Current reset generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of cached ids of `kind`, in any state.
    pub fn cached_count(&self, kind: RecordKind) -> usize {
        self.maps[kind.index()].lock().entries.len()
    }

    fn lock_kind(&self, kind: RecordKind, generation: u64) -> Result<OrderedGuard<'_, KindMap>> {
        let guard = self.maps[kind.index()].lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return Err(AotError::ConcurrentReset);
        }
        Ok(guard)
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Resolve and cache one record.
    ///
    /// Dependencies must already be cached. A record whose identity cannot
    /// be confirmed is cached as permanently invalid and reported as
    /// [`CacheOutcome::Invalid`]; a record whose entity is merely absent
    /// right now is left uncached and reported as an error.
    pub fn cache_record(&self, record: &SerializationRecord) -> Result<CacheOutcome> {
        self.cache_record_in(record, self.generation())
    }

    fn cache_record_in(&self, record: &SerializationRecord, generation: u64) -> Result<CacheOutcome> {
        let target = record.record_ref();
        let present = self
            .lock_kind(target.kind, generation)?
            .entries
            .contains_key(&target.id);
        if present {
            return match self.resolve_ref(target, generation) {
                Ok(_) => {
                    DeserializerStatistics::bump(&self.stats.records_already_known);
                    Ok(CacheOutcome::AlreadyKnown)
                }
                Err(AotError::IdentityMismatch { reason, .. }) => Ok(CacheOutcome::Invalid(reason)),
                Err(err) => Err(err),
            };
        }

        let resolved = self.resolve_body(target, record.body(), generation);
        let mut map = self.lock_kind(target.kind, generation)?;
        if let Some(existing) = map.entries.get(&target.id) {
            // Another thread cached it first.
            return Ok(match existing {
                Entry::Invalid { reason } => CacheOutcome::Invalid(reason.clone()),
                Entry::Resolved { .. } | Entry::Stale { .. } => CacheOutcome::AlreadyKnown,
            });
        }
        let outcome = match resolved {
            Ok(handle) => {
                map.insert_resolved(target.id, Arc::new(record.body().clone()), handle);
                DeserializerStatistics::bump(&self.stats.records_cached);
                debug!(record = %target, %handle, "record cached");
                CacheOutcome::NewlyCached
            }
            Err(AotError::IdentityMismatch { reason, .. }) => {
                warn!(record = %target, reason = %reason, "record identity mismatch");
                map.insert_invalid(target.id, reason.clone());
                DeserializerStatistics::bump(&self.stats.records_invalid);
                CacheOutcome::Invalid(reason)
            }
            Err(err) => return Err(err),
        };
        // Queued while the kind lock is held so a reset cannot slip between
        // the map insert and the acknowledgement.
        self.known.lock().newly_cached.push(target);
        Ok(outcome)
    }

    /// Resolve a cached id, re-resolving it if it went stale.
    fn resolve_ref(&self, target: RecordRef, generation: u64) -> Result<LocalHandle> {
        let body = {
            let mut map = self.lock_kind(target.kind, generation)?;
            match map.entries.get(&target.id).cloned() {
                None => {
                    return Err(AotError::UnresolvedDependency {
                        record: target.to_string(),
                    });
                }
                Some(Entry::Invalid { reason }) => {
                    return Err(AotError::identity_mismatch(target, reason));
                }
                Some(Entry::Resolved { body, handle }) => {
                    if !self.runtime.is_live(handle) {
                        map.mark_stale(target.id);
                        DeserializerStatistics::bump(&self.stats.stale_marks);
                        body
                    } else if let RecordBody::WellKnownClasses(r) = &*body {
                        // The handle carries no identity of its own; only
                        // the chains it names can be checked.
                        let chain_ids = r.chain_ids.clone();
                        drop(map);
                        return self.recheck_well_known(target, handle, &chain_ids, generation);
                    } else {
                        return Ok(handle);
                    }
                }
                Some(Entry::Stale { body }) => body,
            }
        };

        let resolved = self.resolve_body(target, &body, generation);
        let mut map = self.lock_kind(target.kind, generation)?;
        match (map.entries.get(&target.id).cloned(), resolved) {
            (Some(Entry::Resolved { handle, .. }), _) => Ok(handle),
            (Some(Entry::Invalid { reason }), _) => Err(AotError::identity_mismatch(target, reason)),
            (None, _) => Err(AotError::UnresolvedDependency {
                record: target.to_string(),
            }),
            (Some(Entry::Stale { .. }), Ok(handle)) => {
                map.insert_resolved(target.id, body, handle);
                DeserializerStatistics::bump(&self.stats.revalidations);
                debug!(record = %target, %handle, "stale record revalidated");
                Ok(handle)
            }
            (Some(Entry::Stale { .. }), Err(AotError::IdentityMismatch { reason, .. })) => {
                warn!(record = %target, reason = %reason, "stale record no longer matches");
                map.insert_invalid(target.id, reason.clone());
                DeserializerStatistics::bump(&self.stats.records_invalid);
                Err(AotError::identity_mismatch(target, reason))
            }
            (Some(Entry::Stale { .. }), Err(err)) => Err(err),
        }
    }

    /// Re-resolve every chain a resolved well-known-classes entry names. A
    /// chain that no longer resolves takes the entry with it.
    fn recheck_well_known(
        &self,
        target: RecordRef,
        handle: LocalHandle,
        chain_ids: &[RecordId],
        generation: u64,
    ) -> Result<LocalHandle> {
        let Err(err) = chain_ids.iter().try_for_each(|id| {
            self.resolve_dep(RecordRef::new(RecordKind::ClassChain, *id), target, generation)
                .map(drop)
        }) else {
            return Ok(handle);
        };
        let mut map = self.lock_kind(target.kind, generation)?;
        if !matches!(map.entries.get(&target.id), Some(Entry::Resolved { .. })) {
            return Err(err);
        }
        match &err {
            AotError::IdentityMismatch { reason, .. } => {
                warn!(record = %target, reason = %reason, "well-known classes no longer match");
                map.insert_invalid(target.id, reason.clone());
                DeserializerStatistics::bump(&self.stats.records_invalid);
            }
            AotError::ConcurrentReset => {}
            _ => {
                map.mark_stale(target.id);
                DeserializerStatistics::bump(&self.stats.stale_marks);
                debug!(record = %target, error = %err, "well-known classes went stale");
            }
        }
        Err(err)
    }

    /// Resolve `dep` on behalf of `owner`; an invalid dependency makes the
    /// owner invalid too.
    fn resolve_dep(&self, dep: RecordRef, owner: RecordRef, generation: u64) -> Result<LocalHandle> {
        self.resolve_ref(dep, generation).map_err(|err| match err {
            AotError::IdentityMismatch { record, reason } => {
                AotError::identity_mismatch(owner, format!("depends on invalid {record}: {reason}"))
            }
            other => other,
        })
    }

    fn resolve_loader(&self, id: RecordId, owner: RecordRef, generation: u64) -> Result<LoaderHandle> {
        let dep = RecordRef::new(RecordKind::ClassLoader, id);
        let handle = self.resolve_dep(dep, owner, generation)?;
        handle
            .as_loader()
            .ok_or_else(|| AotError::internal(format!("{dep} resolved to {handle}")))
    }

    fn resolve_class(&self, id: RecordId, owner: RecordRef, generation: u64) -> Result<ClassHandle> {
        let dep = RecordRef::new(RecordKind::Class, id);
        let handle = self.resolve_dep(dep, owner, generation)?;
        handle
            .as_class()
            .ok_or_else(|| AotError::internal(format!("{dep} resolved to {handle}")))
    }

    /// Kind-specific resolution against the live runtime. No lock is held
    /// on entry or exit.
    fn resolve_body(&self, target: RecordRef, body: &RecordBody, generation: u64) -> Result<LocalHandle> {
        match body {
            RecordBody::ClassLoader(r) => self
                .runtime
                .find_loader(&r.first_class_name)
                .map(LocalHandle::Loader)
                .ok_or_else(|| {
                    AotError::entity_not_found(
                        target,
                        format!("no loader has loaded {}", r.first_class_name),
                    )
                }),
            RecordBody::Class(r) => {
                let loader = self.resolve_loader(r.class_loader_id, target, generation)?;
                let class = self.runtime.find_class(loader, &r.name).ok_or_else(|| {
                    AotError::entity_not_found(target, format!("{} is not loaded by {loader}", r.name))
                })?;
                let image = self.runtime.class_image(class).ok_or_else(|| {
                    AotError::entity_not_found(target, format!("{class} has no image"))
                })?;
                let canonical = match canonicalize_checked(&image, r.canonical_size as usize) {
                    Ok(canonical) => canonical,
                    Err(AotError::CanonicalSizeMismatch { expected, actual }) => {
                        return Err(AotError::identity_mismatch(
                            target,
                            format!("canonical size {actual} differs from {expected}"),
                        ));
                    }
                    Err(err) => {
                        return Err(AotError::identity_mismatch(
                            target,
                            format!("live image of {} cannot be canonicalized: {err}", r.name),
                        ));
                    }
                };
                if canonical.hash() != r.hash {
                    return Err(AotError::identity_mismatch(
                        target,
                        format!("class hash {} differs from {}", canonical.hash(), r.hash),
                    ));
                }
                Ok(LocalHandle::Class(class))
            }
            RecordBody::Method(r) => {
                let class = self.resolve_class(r.class_id, target, generation)?;
                self.runtime
                    .method(class, r.index)
                    .map(LocalHandle::Method)
                    .ok_or_else(|| {
                        AotError::identity_mismatch(target, format!("{class} has no method {}", r.index))
                    })
            }
            RecordBody::ClassChain(r) => {
                let classes = r
                    .class_ids
                    .iter()
                    .map(|id| self.resolve_class(*id, target, generation))
                    .collect::<Result<Vec<_>>>()?;
                let first = classes[0];
                let live = self.runtime.class_chain(first).ok_or_else(|| {
                    AotError::entity_not_found(target, format!("{first} has no class chain"))
                })?;
                if live != classes {
                    return Err(AotError::identity_mismatch(
                        target,
                        format!(
                            "live chain of {first} has {} entries, cached chain {} and they differ",
                            live.len(),
                            classes.len()
                        ),
                    ));
                }
                Ok(LocalHandle::ClassChain(first))
            }
            RecordBody::WellKnownClasses(r) => {
                for id in &r.chain_ids {
                    self.resolve_dep(RecordRef::new(RecordKind::ClassChain, *id), target, generation)?;
                }
                Ok(LocalHandle::WellKnownClasses)
            }
            RecordBody::AotHeader(r) => {
                if r.header == self.runtime.compatibility_header() {
                    Ok(LocalHandle::AotHeader)
                } else {
                    Err(AotError::identity_mismatch(
                        target,
                        "compatibility header differs from this process",
                    ))
                }
            }
            RecordBody::Thunk(r) => self
                .runtime
                .install_thunk(&r.signature, &r.code)
                .map(LocalHandle::Thunk)
                .ok_or_else(|| {
                    AotError::entity_not_found(target, format!("thunk {} was not installed", r.signature))
                }),
        }
    }

    /// Cache the key's header id as this process's own header. The server
    /// never sends header records; it only serves artifacts whose header
    /// matches the one the client presented.
    fn adopt_header(&self, id: RecordId, generation: u64) -> Result<()> {
        let target = RecordRef::new(RecordKind::AotHeader, id);
        let mut map = self.lock_kind(RecordKind::AotHeader, generation)?;
        match map.entries.get(&id) {
            Some(Entry::Invalid { reason }) => Err(AotError::identity_mismatch(target, reason.clone())),
            Some(_) => Ok(()),
            None => {
                let header = self.runtime.compatibility_header();
                map.insert_resolved(
                    id,
                    Arc::new(RecordBody::AotHeader(AotHeaderRecord { header })),
                    LocalHandle::AotHeader,
                );
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    /// Cache `records` in order, then rewrite `artifact`'s fix-ups.
    ///
    /// Fails on the first record that does not resolve, naming it. Records
    /// after it are not cached.
    pub fn deserialize(
        &self,
        artifact: &CompiledArtifact,
        records: &[SerializationRecord],
    ) -> Result<InstalledArtifact> {
        self.deserialize_with(artifact, records, |_| ())
    }

    /// As [`Self::deserialize`], running `install` while no reset can
    /// start. `install` must not call back into this deserializer.
    pub fn deserialize_with(
        &self,
        artifact: &CompiledArtifact,
        records: &[SerializationRecord],
        install: impl FnOnce(&InstalledArtifact),
    ) -> Result<InstalledArtifact> {
        let generation = self.generation();
        let result = self.deserialize_in(artifact, records, generation, install);
        match &result {
            Ok(installed) => {
                DeserializerStatistics::bump(&self.stats.deserializations_ok);
                debug!(
                    signature = %installed.signature,
                    records = records.len(),
                    generation,
                    "artifact deserialized"
                );
            }
            Err(AotError::ConcurrentReset) => {
                DeserializerStatistics::bump(&self.stats.concurrent_reset_aborts);
                debug!(signature = artifact.signature(), "deserialization raced a reset");
            }
            Err(err) => {
                DeserializerStatistics::bump(&self.stats.deserializations_failed);
                debug!(signature = artifact.signature(), error = %err, "deserialization failed");
            }
        }
        result
    }

    fn deserialize_in(
        &self,
        artifact: &CompiledArtifact,
        records: &[SerializationRecord],
        generation: u64,
        install: impl FnOnce(&InstalledArtifact),
    ) -> Result<InstalledArtifact> {
        let key = *artifact.key();
        self.adopt_header(key.aot_header_id, generation)?;
        for record in records {
            if let CacheOutcome::Invalid(reason) = self.cache_record_in(record, generation)? {
                return Err(AotError::IdentityMismatch {
                    record: record.record_ref().to_string(),
                    reason,
                });
            }
        }
        self.resolve_ref(
            RecordRef::new(RecordKind::ClassChain, key.defining_chain_id),
            generation,
        )?;
        self.resolve_ref(RecordRef::new(RecordKind::AotHeader, key.aot_header_id), generation)?;

        let mut code = artifact.payload().to_vec();
        for fixup in artifact.fixups() {
            let offset = fixup.offset as usize;
            if offset + FIXUP_WIDTH > code.len() {
                return Err(AotError::FixupOutOfBounds {
                    offset,
                    len: code.len(),
                });
            }
            let handle = self.resolve_ref(fixup.target, generation)?;
            write_u64_le(&mut code, offset, self.resolver.encode(fixup.target, handle)?);
        }

        let installed = InstalledArtifact {
            key,
            signature: artifact.signature().to_owned(),
            code,
            generation,
        };
        let _inner = self.reset_inner.lock();
        if self.generation() != generation {
            return Err(AotError::ConcurrentReset);
        }
        install(&installed);
        Ok(installed)
    }

    // -----------------------------------------------------------------------
    // Reset and acknowledgement
    // -----------------------------------------------------------------------

    /// Drop every cached id and abort in-flight deserializations.
    pub fn reset(&self) {
        let _outer = self.reset_outer.lock();
        self.reset_locked("requested");
    }

    /// Caller holds `reset_outer`.
    fn reset_locked(&self, cause: &'static str) {
        let mut maps: Vec<_> = self.maps.iter().map(OrderedMutex::lock).collect();
        let mut known = self.known.lock();
        let _inner = self.reset_inner.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let dropped: usize = maps.iter_mut().map(|map| map.clear()).sum();
        known.newly_cached.clear();
        known.forgotten.clear();
        known.reset = true;
        DeserializerStatistics::bump(&self.stats.resets);
        info!(generation, dropped, cause, "aot deserializer reset");
    }

    /// Record the server instance id from a response. Returns `true` if it
    /// differs from the previous one, in which case every cached id was
    /// dropped.
    pub fn check_server_uid(&self, server_uid: u64) -> bool {
        let mut outer = self.reset_outer.lock();
        match *outer {
            Some(current) if current == server_uid => false,
            Some(previous) => {
                info!(previous, current = server_uid, "server instance changed");
                self.reset_locked("server instance changed");
                *outer = Some(server_uid);
                true
            }
            None => {
                *outer = Some(server_uid);
                false
            }
        }
    }

    /// The server instance the cached ids came from, once a response was
    /// checked.
    pub fn server_uid(&self) -> Option<u64> {
        *self.reset_outer.lock()
    }

    /// Take the ids cached or purged since the last call.
    pub fn get_new_known_ids(&self) -> KnownIdsUpdate {
        let mut known = self.known.lock();
        KnownIdsUpdate {
            reset: std::mem::take(&mut known.reset),
            newly_cached: std::mem::take(&mut known.newly_cached),
            forgotten: std::mem::take(&mut known.forgotten),
        }
    }

    // -----------------------------------------------------------------------
    // Inspection and invalidation
    // -----------------------------------------------------------------------

    pub fn lookup(&self, target: RecordRef) -> RecordState {
        let map = self.maps[target.kind.index()].lock();
        match map.entries.get(&target.id) {
            None => RecordState::Unresolved,
            Some(Entry::Resolved { handle, .. }) => RecordState::Resolved(*handle),
            Some(Entry::Stale { .. }) => RecordState::Stale,
            Some(Entry::Invalid { reason }) => RecordState::Invalid(reason.clone()),
        }
    }

    /// Re-resolve `target` if it is stale and return its handle.
    pub fn revalidate(&self, target: RecordRef) -> Result<LocalHandle> {
        self.resolve_ref(target, self.generation())
    }

    fn mark_handle_stale(&self, handle: LocalHandle) -> usize {
        let marked = self.maps[handle.kind().index()]
            .lock()
            .mark_handle_stale(handle);
        DeserializerStatistics::add(&self.stats.stale_marks, marked);
        marked
    }

    pub fn on_class_loader_unloaded(&self, loader: LoaderHandle) {
        let marked = self.mark_handle_stale(LocalHandle::Loader(loader));
        debug!(%loader, marked, "class loader unloaded");
    }

    /// Also used for redefinition: the old handle stops denoting the class.
    pub fn on_class_unloaded(&self, class: ClassHandle) {
        let marked = self.mark_handle_stale(LocalHandle::Class(class))
            + self.mark_handle_stale(LocalHandle::ClassChain(class));
        debug!(%class, marked, "class unloaded");
    }

    pub fn on_class_redefined(&self, old: ClassHandle) {
        self.on_class_unloaded(old);
    }

    pub fn on_method_invalidated(&self, method: MethodHandle) {
        let marked = self.mark_handle_stale(LocalHandle::Method(method));
        debug!(%method, marked, "method invalidated");
    }

    /// Remove stale ids so the server sends them again.
    ///
    /// Only allowed when the resolver does not need stale ids retained;
    /// purged ids are reported through [`Self::get_new_known_ids`].
    pub fn purge_stale(&self) -> Result<usize> {
        if self.resolver.retains_stale() {
            return Err(AotError::Unsupported(format!(
                "the {} resolver retains stale ids",
                self.resolver.name()
            )));
        }
        let mut purged = 0;
        for (kind, mutex) in RecordKind::ALL.iter().zip(&self.maps) {
            let mut map = mutex.lock();
            let mut removed = Vec::new();
            map.entries.retain(|id, entry| {
                let stale = matches!(entry, Entry::Stale { .. });
                if stale {
                    removed.push(RecordRef::new(*kind, *id));
                }
                !stale
            });
            if removed.is_empty() {
                continue;
            }
            purged += removed.len();
            self.known.lock().forgotten.extend(removed);
        }
        DeserializerStatistics::add(&self.stats.stale_purged, purged);
        if purged > 0 {
            debug!(purged, "stale ids purged");
        }
        Ok(purged)
    }
}
