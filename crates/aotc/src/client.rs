//! Client front end: turns method lookups into requests, and responses
//! into installed code.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use aotc_client::{
    AotDeserializer, ClassRuntime, DeserializerConfig, DurableStore, InstalledArtifact,
    OffsetResolver, SelectedResolver,
};
use aotc_error::{AotError, Result};

use crate::protocol::{AotCacheRequest, AotCacheResponse, MethodDescriptor};
use crate::server::AotCacheServer;

pub struct AotCacheClient<R, O> {
    deserializer: AotDeserializer<R, O>,
    client_id: u64,
    cache_name: String,
    purge_eagerly: bool,
    /// Installed code by method signature. Written while the deserializer
    /// holds its reset lock, so it is a plain mutex outside the ranking.
    installed: Mutex<HashMap<String, InstalledArtifact>>,
}

impl<R, S> AotCacheClient<R, SelectedResolver<S>>
where
    R: ClassRuntime,
    S: DurableStore,
{
    /// A client whose resolver strategy comes from `config`.
    pub fn from_config(
        runtime: Arc<R>,
        store: Option<Arc<S>>,
        config: &DeserializerConfig,
        client_id: u64,
        cache_name: impl Into<String>,
    ) -> Result<Self> {
        let resolver = SelectedResolver::from_config(config, store)?;
        let mut client = Self::new(AotDeserializer::new(runtime, resolver), client_id, cache_name);
        client.purge_eagerly = config.purge_stale_eagerly;
        Ok(client)
    }
}

impl<R, O> AotCacheClient<R, O>
where
    R: ClassRuntime,
    O: OffsetResolver,
{
    pub fn new(
        deserializer: AotDeserializer<R, O>,
        client_id: u64,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            deserializer,
            client_id,
            cache_name: cache_name.into(),
            purge_eagerly: false,
            installed: Mutex::new(HashMap::new()),
        }
    }

    pub const fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// The deserializer, for runtime invalidation hooks and statistics.
    pub const fn deserializer(&self) -> &AotDeserializer<R, O> {
        &self.deserializer
    }

    /// Build a request for `method`, carrying every id cached or purged
    /// since the previous one.
    pub fn request(&self, method: MethodDescriptor) -> AotCacheRequest {
        // Read before the ids: a reset in between only gets them ignored.
        let ack_server_uid = self.deserializer.server_uid().unwrap_or(0);
        AotCacheRequest {
            cache_name: self.cache_name.clone(),
            client_id: self.client_id,
            ack_server_uid,
            header: self.deserializer.runtime().compatibility_header(),
            method,
            known: self.deserializer.get_new_known_ids(),
        }
    }

    /// Apply a server response. Returns the installed artifact on a hit.
    ///
    /// A response from a different server instance drops every cached id
    /// first; the next request then tells the server to start over.
    pub fn handle_response(&self, response: &AotCacheResponse) -> Result<Option<InstalledArtifact>> {
        if self.deserializer.check_server_uid(response.server_uid()) {
            info!(
                client_id = self.client_id,
                server_uid = response.server_uid(),
                "server instance changed; cached ids dropped"
            );
        }
        let (artifact, records) = match response {
            AotCacheResponse::Miss { .. } => return Ok(None),
            AotCacheResponse::Unavailable { reason, .. } => {
                debug!(client_id = self.client_id, reason = %reason, "cache unavailable");
                return Ok(None);
            }
            AotCacheResponse::Hit {
                artifact, records, ..
            } => (artifact, records),
        };
        let installed = self.deserializer.deserialize_with(artifact, records, |installed| {
            self.installed
                .lock()
                .insert(installed.signature.clone(), installed.clone());
        })?;
        if self.purge_eagerly {
            let purged = self.deserializer.purge_stale()?;
            if purged > 0 {
                debug!(client_id = self.client_id, purged, "stale ids purged");
            }
        }
        Ok(Some(installed))
    }

    /// Look `method` up on an in-process server, going through the wire
    /// encoding both ways. A lookup that raced a reset is retried once.
    pub fn fetch(
        &self,
        server: &AotCacheServer,
        method: &MethodDescriptor,
    ) -> Result<Option<InstalledArtifact>> {
        match self.fetch_once(server, method) {
            Err(AotError::ConcurrentReset) => {
                debug!(client_id = self.client_id, "retrying lookup after reset");
                self.fetch_once(server, method)
            }
            other => other,
        }
    }

    fn fetch_once(
        &self,
        server: &AotCacheServer,
        method: &MethodDescriptor,
    ) -> Result<Option<InstalledArtifact>> {
        let request = self.request(method.clone()).to_bytes();
        let response = AotCacheResponse::from_bytes(&server.handle_bytes(&request)?)?;
        self.handle_response(&response)
    }

    pub fn installed(&self, signature: &str) -> Option<InstalledArtifact> {
        self.installed.lock().get(signature).cloned()
    }

    pub fn installed_count(&self) -> usize {
        self.installed.lock().len()
    }
}
