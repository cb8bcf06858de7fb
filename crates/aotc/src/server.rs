//! The cache server: named caches plus one session per connected client.
//!
//! A session remembers which records its client has acknowledged, so each
//! hit carries only the records the client is missing. The known set grows
//! only from acknowledgements; a record sent in a response counts as known
//! once the client reports it cached. An acknowledgement naming another
//! server instance is about ids this server never issued and is ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use aotc_canon::{CanonicalClass, canonicalize};
use aotc_client::KnownIdsUpdate;
use aotc_error::{AotError, Result};
use aotc_store::{AotCache, AotCacheMap, SaveOutcome, SharedClassHandle, StoreConfig};
use aotc_types::{
    ArtifactKey, ClassHash, CompatibilityHeader, CompiledArtifact, KnownRecords, LockLevel,
    OrderedMutex, RecordId,
};

use crate::protocol::{AotCacheRequest, AotCacheResponse, MethodDescriptor};
use crate::report::{CacheReport, ServerReport, ServerStatistics};

const NO_CAPACITY: &str = "memory budget exhausted";

#[derive(Debug, Default)]
struct SessionState {
    known: KnownRecords,
    /// Shared class blobs this client's requests referred to. Held for the
    /// life of the session so a class seen by many clients is stored once.
    classes: HashMap<ClassHash, SharedClassHandle>,
    requests: u64,
}

impl SessionState {
    fn apply(&mut self, update: &KnownIdsUpdate) {
        if update.reset {
            self.known.clear();
        }
        self.known.extend(update.newly_cached.iter().copied());
        // Removal last: an id both re-cached and purged since the previous
        // request is only re-sent, never wrongly assumed present.
        for forgotten in &update.forgotten {
            self.known.remove(forgotten);
        }
    }
}

/// Server-side state of one client.
#[derive(Debug)]
pub struct ClientSession {
    client_id: u64,
    state: OrderedMutex<SessionState>,
}

impl ClientSession {
    fn new(client_id: u64) -> Self {
        Self {
            client_id,
            state: OrderedMutex::new(LockLevel::Sessions, SessionState::default()),
        }
    }

    pub const fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Number of records the client has acknowledged.
    pub fn known_count(&self) -> usize {
        self.state.lock().known.len()
    }

    pub fn held_classes(&self) -> usize {
        self.state.lock().classes.len()
    }
}

/// What a compiler callback gets to build an artifact for a method.
#[derive(Debug)]
pub struct CompileContext<'a> {
    pub cache: &'a AotCache,
    pub key: ArtifactKey,
    /// Class record ids of the method's chain, defining class first.
    pub class_ids: Vec<RecordId>,
}

/// A method's chain after canonicalization, ready for record lookups.
struct PreparedChain {
    classes: Vec<(String, String, CanonicalClass)>,
}

impl PreparedChain {
    /// Canonicalize every class of `method` with no lock held.
    fn new(method: &MethodDescriptor) -> Result<Self> {
        if method.chain.is_empty() {
            return Err(AotError::malformed_record("method descriptor has an empty class chain"));
        }
        let classes = method
            .chain
            .iter()
            .map(|class| {
                Ok((
                    class.loader_first_class.clone(),
                    class.image.name()?.to_owned(),
                    canonicalize(&class.image)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { classes })
    }
}

fn fresh_server_uid() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
    (nanos ^ (u64::from(std::process::id()) << 32)).max(1)
}

#[derive(Debug)]
pub struct AotCacheServer {
    caches: AotCacheMap,
    sessions: OrderedMutex<HashMap<u64, Arc<ClientSession>>>,
    stats: ServerStatistics,
}

impl AotCacheServer {
    /// Start a server with a fresh instance id.
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_server_uid(config, fresh_server_uid())
    }

    /// Start a server with a given instance id, which must not be 0.
    pub fn with_server_uid(config: StoreConfig, server_uid: u64) -> Result<Self> {
        if server_uid == 0 {
            return Err(AotError::OutOfRange {
                what: "server_uid".to_owned(),
                value: "0".to_owned(),
            });
        }
        Ok(Self {
            caches: AotCacheMap::new(config, server_uid)?,
            sessions: OrderedMutex::new(LockLevel::Sessions, HashMap::new()),
            stats: ServerStatistics::default(),
        })
    }

    #[inline]
    pub const fn server_uid(&self) -> u64 {
        self.caches.server_uid()
    }

    #[inline]
    pub const fn caches(&self) -> &AotCacheMap {
        &self.caches
    }

    #[inline]
    pub const fn statistics(&self) -> &ServerStatistics {
        &self.stats
    }

    fn session(&self, client_id: u64) -> Arc<ClientSession> {
        let mut sessions = self.sessions.lock();
        Arc::clone(sessions.entry(client_id).or_insert_with(|| {
            ServerStatistics::bump(&self.stats.sessions_opened);
            info!(client_id, "client session opened");
            Arc::new(ClientSession::new(client_id))
        }))
    }

    pub fn client_session(&self, client_id: u64) -> Option<Arc<ClientSession>> {
        self.sessions.lock().get(&client_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Forget a client. Its shared class references are released once no
    /// request of that client is still running.
    pub fn end_session(&self, client_id: u64) -> bool {
        let removed = self.sessions.lock().remove(&client_id);
        if removed.is_some() {
            ServerStatistics::bump(&self.stats.sessions_closed);
            info!(client_id, "client session closed");
        }
        removed.is_some()
    }

    /// Look up the records naming `chain` and `header`, creating them as
    /// needed. `Ok(None)` means a record did not fit the budget.
    fn resolve_key(
        &self,
        cache: &AotCache,
        chain: &PreparedChain,
        method: &MethodDescriptor,
        header: &CompatibilityHeader,
        held: &mut HashMap<ClassHash, SharedClassHandle>,
    ) -> Result<Option<(ArtifactKey, Vec<RecordId>)>> {
        let mut class_ids = Vec::with_capacity(chain.classes.len());
        for (loader_first_class, name, canonical) in &chain.classes {
            let Some(loader) = cache.get_class_loader_record(loader_first_class)? else {
                return Ok(None);
            };
            held.entry(canonical.hash())
                .or_insert_with(|| self.caches.shared_classes().get_or_create(canonical));
            let Some(class) = cache.get_class_record(loader.id(), name, canonical)? else {
                return Ok(None);
            };
            class_ids.push(class.id());
        }
        let Some(chain_record) = cache.get_class_chain_record(&class_ids)? else {
            return Ok(None);
        };
        let Some(header_record) = cache.get_aot_header_record(header)? else {
            return Ok(None);
        };
        let key = ArtifactKey {
            defining_chain_id: chain_record.id(),
            method_index: method.method_index,
            opt_level: method.opt_level,
            aot_header_id: header_record.id(),
        };
        Ok(Some((key, class_ids)))
    }

    /// Serve one client request.
    pub fn handle(&self, request: &AotCacheRequest) -> Result<AotCacheResponse> {
        ServerStatistics::bump(&self.stats.requests);
        let server_uid = self.server_uid();
        let chain = PreparedChain::new(&request.method)?;
        // The registry lock ranks below session locks.
        let cache = self.caches.get_or_create(&request.cache_name);
        let session = self.session(request.client_id);
        let mut state = session.state.lock();
        state.requests += 1;
        if request.ack_server_uid == server_uid {
            state.apply(&request.known);
        } else {
            if !request.known.is_empty() {
                debug!(
                    client_id = request.client_id,
                    ack_server_uid = request.ack_server_uid,
                    "acknowledgement for another server instance ignored"
                );
            }
            state.known.clear();
        }

        let resolved = self.resolve_key(
            &cache,
            &chain,
            &request.method,
            &request.header,
            &mut state.classes,
        )?;
        let Some((key, _)) = resolved else {
            ServerStatistics::bump(&self.stats.unavailable);
            warn!(cache = %cache.name(), client_id = request.client_id, "request refused: no capacity");
            return Ok(AotCacheResponse::Unavailable {
                server_uid,
                reason: NO_CAPACITY.to_owned(),
            });
        };

        let Some(artifact) = cache.find_artifact(&key) else {
            ServerStatistics::bump(&self.stats.misses);
            debug!(
                cache = %cache.name(),
                client_id = request.client_id,
                signature = %request.method.signature,
                "cache miss"
            );
            return Ok(AotCacheResponse::Miss { server_uid });
        };
        let delta = cache.get_delta_records(&artifact, &state.known)?;
        ServerStatistics::bump(&self.stats.hits);
        ServerStatistics::add(&self.stats.records_sent, delta.len());
        debug!(
            cache = %cache.name(),
            client_id = request.client_id,
            signature = artifact.signature(),
            records = delta.len(),
            "cache hit"
        );
        Ok(AotCacheResponse::Hit {
            server_uid,
            artifact: CompiledArtifact::clone(&artifact),
            records: delta.iter().map(|r| (**r).clone()).collect(),
        })
    }

    /// Decode a request, serve it and encode the response.
    pub fn handle_bytes(&self, request: &[u8]) -> Result<Vec<u8>> {
        let request = AotCacheRequest::from_bytes(request)?;
        Ok(self.handle(&request)?.to_bytes())
    }

    /// Compile `method` into `cache_name` unless an artifact for it exists.
    ///
    /// `compile` builds the artifact from the records of the method's chain
    /// and may add records of its own through the context's cache; it
    /// returns `Ok(None)` when one of those did not fit. The result is the
    /// stored artifact, which is an earlier one if another compile won, or
    /// `None` if the budget refused something.
    pub fn store_compiled<F>(
        &self,
        cache_name: &str,
        method: &MethodDescriptor,
        header: &CompatibilityHeader,
        compile: F,
    ) -> Result<Option<Arc<CompiledArtifact>>>
    where
        F: FnOnce(&CompileContext<'_>) -> Result<Option<CompiledArtifact>>,
    {
        let chain = PreparedChain::new(method)?;
        let cache = self.caches.get_or_create(cache_name);
        // Compiling pins class blobs only for its own duration.
        let mut held = HashMap::new();
        let Some((key, class_ids)) =
            self.resolve_key(&cache, &chain, method, header, &mut held)?
        else {
            return Ok(None);
        };
        if let Some(existing) = cache.find_artifact(&key) {
            return Ok(Some(existing));
        }
        let context = CompileContext {
            cache: &cache,
            key,
            class_ids,
        };
        let Some(artifact) = compile(&context)? else {
            return Ok(None);
        };
        if *artifact.key() != key {
            return Err(AotError::internal(format!(
                "compiled artifact key {} does not match {key}",
                artifact.key()
            )));
        }
        let stored = cache.store_artifact(artifact)?;
        if stored.is_some() {
            ServerStatistics::bump(&self.stats.artifacts_stored);
        }
        Ok(stored)
    }

    /// Signatures of the methods compiled into `cache_name`.
    pub fn cached_methods(&self, cache_name: &str) -> Vec<String> {
        self.caches
            .get(cache_name)
            .map(|cache| cache.cached_method_signatures())
            .unwrap_or_default()
    }

    /// Save every cache whose save policy is met now.
    pub fn persist_due(&self) -> Vec<(String, Result<SaveOutcome>)> {
        self.caches.save_due(Instant::now())
    }

    /// Save every cache, e.g. before shutting down.
    pub fn shutdown(&self) -> Vec<(String, Result<SaveOutcome>)> {
        let outcomes = self.caches.save_all();
        info!(
            server_uid = self.server_uid(),
            caches = outcomes.len(),
            sessions = self.session_count(),
            "AOT cache server shutting down"
        );
        outcomes
    }

    pub fn report(&self) -> ServerReport {
        let budget = self.caches.budget();
        let caches = self
            .caches
            .names()
            .into_iter()
            .filter_map(|name| self.caches.get(&name))
            .map(|cache| CacheReport {
                name: cache.name().to_owned(),
                records: cache.total_record_count(),
                artifacts: cache.artifact_count(),
                charged_bytes: cache.charged_bytes(),
                statistics: cache.statistics().snapshot(),
            })
            .collect();
        ServerReport {
            server_uid: self.server_uid(),
            budget_used: budget.used(),
            budget_limit: budget.limit(),
            sessions: self.session_count(),
            server: self.stats.snapshot(),
            shared_classes: self.caches.shared_classes().snapshot(),
            caches,
        }
    }

    pub fn report_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.report())
            .map_err(|err| AotError::internal(format!("report serialization failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aotc_canon::ClassImageBuilder;
    use aotc_types::{CompatibilityDescriptor, OptLevel, RecordKind, RecordRef};

    use crate::protocol::ClassDescriptor;

    fn method() -> MethodDescriptor {
        MethodDescriptor {
            chain: vec![ClassDescriptor {
                loader_first_class: "app/Main".to_owned(),
                image: ClassImageBuilder::new("app/Main")
                    .method("run", "()V", 1, vec![0xB1], None)
                    .build(),
            }],
            method_index: 0,
            opt_level: OptLevel::Warm,
            signature: "app/Main.run()V".to_owned(),
        }
    }

    fn request(client_id: u64, known: KnownIdsUpdate) -> AotCacheRequest {
        AotCacheRequest {
            cache_name: "app".to_owned(),
            client_id,
            ack_server_uid: 5,
            header: CompatibilityDescriptor::default().encode(),
            method: method(),
            known,
        }
    }

    fn compile_run(server: &AotCacheServer) -> Arc<CompiledArtifact> {
        server
            .store_compiled(
                "app",
                &method(),
                &CompatibilityDescriptor::default().encode(),
                |ctx| {
                    CompiledArtifact::new(ctx.key, "app/Main.run()V", vec![], vec![0x90; 4])
                        .map(Some)
                },
            )
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_miss_then_hit() {
        let server = AotCacheServer::with_server_uid(StoreConfig::default(), 5).unwrap();
        let response = server.handle(&request(1, KnownIdsUpdate::default())).unwrap();
        assert_eq!(response, AotCacheResponse::Miss { server_uid: 5 });

        compile_run(&server);
        let response = server.handle(&request(1, KnownIdsUpdate::default())).unwrap();
        let AotCacheResponse::Hit { records, .. } = response else {
            panic!("expected a hit");
        };
        // Loader, class and chain; the header travels with the key.
        assert_eq!(records.len(), 3);
        assert_eq!(server.cached_methods("app"), vec!["app/Main.run()V".to_owned()]);
        let stats = server.statistics().snapshot();
        assert_eq!((stats.requests, stats.hits, stats.misses), (2, 1, 1));
    }

    #[test]
    fn test_second_compile_keeps_first_artifact() {
        let server = AotCacheServer::with_server_uid(StoreConfig::default(), 5).unwrap();
        let first = compile_run(&server);
        let mut called = false;
        let second = server
            .store_compiled(
                "app",
                &method(),
                &CompatibilityDescriptor::default().encode(),
                |_| {
                    called = true;
                    Ok(None)
                },
            )
            .unwrap()
            .unwrap();
        assert!(!called);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_acknowledgement_shrinks_next_delta() {
        let server = AotCacheServer::with_server_uid(StoreConfig::default(), 5).unwrap();
        compile_run(&server);
        let AotCacheResponse::Hit { records, .. } =
            server.handle(&request(1, KnownIdsUpdate::default())).unwrap()
        else {
            panic!("expected a hit");
        };
        let ack = KnownIdsUpdate {
            reset: false,
            newly_cached: records.iter().map(|r| r.record_ref()).collect(),
            forgotten: vec![],
        };
        let AotCacheResponse::Hit { records, .. } = server.handle(&request(1, ack)).unwrap() else {
            panic!("expected a hit");
        };
        assert!(records.is_empty());
        assert_eq!(server.client_session(1).unwrap().known_count(), 3);

        // Another client starts from nothing.
        let AotCacheResponse::Hit { records, .. } =
            server.handle(&request(2, KnownIdsUpdate::default())).unwrap()
        else {
            panic!("expected a hit");
        };
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_reset_flag_drops_baseline() {
        let mut state = SessionState::default();
        let chain = RecordRef::new(RecordKind::ClassChain, RecordId::new(1).unwrap());
        let class = RecordRef::new(RecordKind::Class, RecordId::new(1).unwrap());
        state.apply(&KnownIdsUpdate {
            reset: false,
            newly_cached: vec![chain, class],
            forgotten: vec![],
        });
        state.apply(&KnownIdsUpdate {
            reset: false,
            newly_cached: vec![],
            forgotten: vec![chain],
        });
        assert_eq!(state.known.len(), 1);
        state.apply(&KnownIdsUpdate {
            reset: true,
            newly_cached: vec![chain],
            forgotten: vec![],
        });
        assert!(state.known.contains(&chain));
        assert!(!state.known.contains(&class));
    }

    #[test]
    fn test_sessions_share_class_blobs() {
        let server = AotCacheServer::with_server_uid(StoreConfig::default(), 5).unwrap();
        server.handle(&request(1, KnownIdsUpdate::default())).unwrap();
        server.handle(&request(2, KnownIdsUpdate::default())).unwrap();
        let shared = server.caches().shared_classes();
        assert_eq!(shared.len(), 1);
        assert_eq!(server.client_session(1).unwrap().held_classes(), 1);

        assert!(server.end_session(1));
        assert!(!server.end_session(1));
        assert_eq!(shared.len(), 1);
        server.end_session(2);
        assert!(shared.is_empty());
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_acknowledgement_from_other_instance_ignored() {
        let server = AotCacheServer::with_server_uid(StoreConfig::default(), 5).unwrap();
        compile_run(&server);
        let stale = KnownIdsUpdate {
            reset: false,
            newly_cached: vec![RecordRef::new(RecordKind::ClassChain, RecordId::new(1).unwrap())],
            forgotten: vec![],
        };
        let mut req = request(1, stale);
        req.ack_server_uid = 4;
        let AotCacheResponse::Hit { records, .. } = server.handle(&req).unwrap() else {
            panic!("expected a hit");
        };
        assert_eq!(records.len(), 3);
        assert_eq!(server.client_session(1).unwrap().known_count(), 0);
    }

    #[test]
    fn test_zero_server_uid_rejected() {
        assert!(AotCacheServer::with_server_uid(StoreConfig::default(), 0).is_err());
        assert_ne!(AotCacheServer::new(StoreConfig::default()).unwrap().server_uid(), 0);
    }

    #[test]
    fn test_empty_chain_rejected() {
        let server = AotCacheServer::with_server_uid(StoreConfig::default(), 5).unwrap();
        let mut req = request(1, KnownIdsUpdate::default());
        req.method.chain.clear();
        assert!(matches!(
            server.handle(&req),
            Err(AotError::MalformedRecord { .. })
        ));
    }
}
