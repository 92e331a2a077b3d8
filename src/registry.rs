//! Cache Registry and Named Caches
//!
//! A [`NamedCache`] binds one data type's key schema, loader, and storage
//! backend behind the interface business modules call: `get` with a scoped
//! delete list, and `invalidate` by untyped object key (wildcards allowed).
//! The [`CacheRegistry`] holds every named cache for the process; it is
//! constructed explicitly at startup and passed to collaborators, never
//! reached through global state.
//!
//! # Configuration
//!
//! ```yaml
//! database_id: prod-atp
//! caches:
//!   - name: StopoverRule
//!     storage: compressed
//!     capacity: { bytes: 16777216 }
//!     compression_threshold: 2048
//!   - name: Nation
//!     storage: simple
//!     capacity: { entries: 4096 }
//!     remote: { host: master.fare.local, port: 5001 }
//! ```

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::compressed::{CompressedCache, CompressedCacheConfig, DEFAULT_COMPRESSION_THRESHOLD};
use crate::error::{Error, Result};
use crate::historical::{BucketLoader, HistoricalCache, HistoricalLoader};
use crate::key::{Key, KeyPattern, KeySchema, ObjectKey};
use crate::remote::{RemoteClient, RemoteClientConfig, RemoteEndpoint, RemoteLoader};
use crate::store::{CacheBackend, CacheStore, Loader, ValuePayload};
use crate::value::{DeleteList, RecordSet};

/// Storage backend selection for one named cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Simple,
    Compressed,
}

/// What `invalidate` does to a matched resident entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPolicy {
    /// Drop the entry; the next get reloads
    #[default]
    Evict,
    /// Recompute in place so readers never observe a gap
    LoadOnUpdate,
}

/// Capacity budget: entry count for simple stores, stored bytes for
/// compressed stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    Entries(usize),
    Bytes(u64),
}

/// Per-cache configuration block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub name: String,
    #[serde(default)]
    pub storage: StorageMode,
    #[serde(default)]
    pub capacity: Option<Capacity>,
    #[serde(default = "default_threshold")]
    pub compression_threshold: usize,
    #[serde(default)]
    pub remote: Option<RemoteEndpoint>,
    #[serde(default)]
    pub invalidation: InvalidationPolicy,
}

fn default_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

impl CacheSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageMode::default(),
            capacity: None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            remote: None,
            invalidation: InvalidationPolicy::default(),
        }
    }

    /// The capacity unit must match the storage mode's accounting.
    fn validate(&self) -> Result<()> {
        match (self.storage, self.capacity) {
            (StorageMode::Simple, Some(Capacity::Bytes(_))) => Err(Error::Config(format!(
                "cache '{}': simple storage takes an entry budget, not bytes",
                self.name
            ))),
            (StorageMode::Compressed, Some(Capacity::Entries(_))) => Err(Error::Config(format!(
                "cache '{}': compressed storage takes a byte budget, not entries",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    fn entry_budget(&self) -> usize {
        match self.capacity {
            Some(Capacity::Entries(n)) => n,
            _ => 0,
        }
    }

    fn compressed_config(&self) -> CompressedCacheConfig {
        CompressedCacheConfig {
            total_capacity_bytes: match self.capacity {
                Some(Capacity::Bytes(b)) => b,
                _ => 0,
            },
            compression_threshold: self.compression_threshold,
        }
    }
}

/// Whole-process cache configuration, usually loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Backing-store identity; masters refuse slaves from a different one
    #[serde(default = "default_database_id")]
    pub database_id: String,
    pub caches: Vec<CacheSettings>,
}

fn default_database_id() -> String {
    "default".to_string()
}

impl RegistryConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        for settings in &config.caches {
            settings.validate()?;
        }
        Ok(config)
    }

    pub fn cache(&self, name: &str) -> Option<&CacheSettings> {
        self.caches.iter().find(|c| c.name == name)
    }
}

enum Flavor<R> {
    Current {
        backend: Arc<dyn CacheBackend<Key, R>>,
        loader: Arc<dyn Loader<Key, R>>,
    },
    Historical(HistoricalCache<R>),
}

/// One data type's cache: schema, backend, loader, and invalidation policy.
pub struct NamedCache<R> {
    settings: CacheSettings,
    schema: KeySchema,
    flavor: Flavor<R>,
}

impl<R> std::fmt::Debug for NamedCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedCache")
            .field("settings", &self.settings)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl<R> NamedCache<R>
where
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a current-keyed cache. With a remote endpoint configured, the
    /// loader is wrapped so misses try the master before computing locally.
    pub fn current(
        settings: CacheSettings,
        schema: KeySchema,
        loader: Arc<dyn Loader<Key, R>>,
        database_id: &str,
    ) -> Result<Self> {
        settings.validate()?;
        let loader = wrap_remote(&settings, database_id, loader);
        let backend: Arc<dyn CacheBackend<Key, R>> = match settings.storage {
            StorageMode::Simple => Arc::new(CacheStore::with_capacity(
                Arc::clone(&loader),
                settings.entry_budget(),
            )),
            StorageMode::Compressed => Arc::new(CompressedCache::new(
                Arc::clone(&loader),
                settings.compressed_config(),
            )),
        };
        Ok(Self {
            settings,
            schema,
            flavor: Flavor::Current { backend, loader },
        })
    }

    /// Build a date-scoped cache over a historical loader.
    pub fn historical(
        settings: CacheSettings,
        schema: KeySchema,
        resolver: Arc<dyn HistoricalLoader<R>>,
        database_id: &str,
    ) -> Result<Self> {
        settings.validate()?;
        let bucket_loader: Arc<dyn Loader<crate::key::HistoricalKey, R>> =
            Arc::new(BucketLoader::new(Arc::clone(&resolver)));
        let loader = wrap_remote(&settings, database_id, bucket_loader);
        let backend: Arc<dyn CacheBackend<crate::key::HistoricalKey, R>> =
            match settings.storage {
                StorageMode::Simple => Arc::new(CacheStore::with_capacity(
                    loader,
                    settings.entry_budget(),
                )),
                StorageMode::Compressed => {
                    Arc::new(CompressedCache::new(loader, settings.compressed_config()))
                }
            };
        let cache = HistoricalCache::new(settings.name.clone(), resolver, backend);
        Ok(Self {
            settings,
            schema,
            flavor: Flavor::Historical(cache),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    /// Translate and serve; the returned view is parked on `del` so it
    /// outlives the call.
    pub fn get(&self, del: &DeleteList, object_key: &ObjectKey) -> Result<RecordSet<R>> {
        let key = self.schema.translate(object_key)?;
        self.get_key(del, &key)
    }

    /// Typed-key fast path for callers that already hold a [`Key`].
    pub fn get_key(&self, del: &DeleteList, key: &Key) -> Result<RecordSet<R>> {
        match &self.flavor {
            Flavor::Current { backend, .. } => Ok(del.adopt(&backend.get(key)?)),
            Flavor::Historical(_) => Err(Error::Config(format!(
                "cache '{}' is historical, an as-of date is required",
                self.settings.name
            ))),
        }
    }

    /// Date-scoped lookup for historical caches.
    pub fn get_as_of(
        &self,
        del: &DeleteList,
        object_key: &ObjectKey,
        as_of: NaiveDate,
    ) -> Result<RecordSet<R>> {
        let key = self.schema.translate(object_key)?;
        match &self.flavor {
            Flavor::Historical(cache) => Ok(del.adopt(&cache.get(&key, as_of)?)),
            Flavor::Current { .. } => Err(Error::Config(format!(
                "cache '{}' is not historical",
                self.settings.name
            ))),
        }
    }

    /// Invalidate every resident entry the object key denotes.
    ///
    /// Without wildcards this is a single-key operation; with wildcards the
    /// resident key set is enumerated and matched structurally. Returns the
    /// number of affected entries.
    pub fn invalidate(&self, object_key: &ObjectKey) -> Result<usize> {
        let pattern = self.schema.pattern(object_key)?;
        match &self.flavor {
            Flavor::Current { backend, loader } => {
                Ok(self.invalidate_current(backend, loader, &pattern))
            }
            // Bucket entries are always evicted; the bucket layout itself
            // may have changed, so recompute-in-place could resurrect a
            // stale interval
            Flavor::Historical(cache) => Ok(cache.invalidate_matching(&pattern)),
        }
    }

    fn invalidate_current(
        &self,
        backend: &Arc<dyn CacheBackend<Key, R>>,
        loader: &Arc<dyn Loader<Key, R>>,
        pattern: &KeyPattern,
    ) -> usize {
        let targets: Vec<Key> = match pattern.as_exact() {
            Some(key) => vec![key],
            None => backend
                .keys()
                .into_iter()
                .filter(|k| k.matches(pattern))
                .collect(),
        };

        let mut affected = 0;
        for key in targets {
            match self.settings.invalidation {
                InvalidationPolicy::Evict => affected += backend.invalidate(&key),
                InvalidationPolicy::LoadOnUpdate => {
                    if backend.get_if_resident(&key).is_none() {
                        continue;
                    }
                    match loader.create(&key) {
                        Ok(value) => backend.put(key, value),
                        Err(e) => {
                            // Serving stale data would be worse than a miss
                            warn!(
                                cache = %self.settings.name,
                                key = %key,
                                error = %e,
                                "load-on-update recompute failed, evicting"
                            );
                            backend.invalidate(&key);
                        }
                    }
                    affected += 1;
                }
            }
        }
        affected
    }

    pub fn clear(&self) {
        match &self.flavor {
            Flavor::Current { backend, .. } => backend.clear(),
            Flavor::Historical(cache) => cache.backend().clear(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.flavor {
            Flavor::Current { backend, .. } => backend.len(),
            Flavor::Historical(cache) => cache.backend().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn wrap_remote<K, R>(
    settings: &CacheSettings,
    database_id: &str,
    local: Arc<dyn Loader<K, R>>,
) -> Arc<dyn Loader<K, R>>
where
    K: Serialize + Send + Sync + 'static,
    R: DeserializeOwned + Send + Sync + 'static,
{
    match &settings.remote {
        Some(endpoint) => {
            info!(cache = %settings.name, endpoint = %endpoint.addr(), "remote-backed cache");
            Arc::new(RemoteLoader::new(
                settings.name.clone(),
                database_id,
                RemoteClient::new(endpoint.clone(), RemoteClientConfig::default()),
                local,
            ))
        }
        None => local,
    }
}

/// Type-erased view the registry and the master server work through.
pub trait ManagedCache: Send + Sync {
    fn name(&self) -> &str;

    fn invalidate_object(&self, object_key: &ObjectKey) -> Result<usize>;

    fn clear(&self);

    fn len(&self) -> usize;

    /// Serve a wire request: decode the key bytes with the crate codec and
    /// hand back the stored payload.
    fn fetch_payload_bytes(&self, key: &[u8]) -> Result<ValuePayload>;
}

impl<R> ManagedCache for NamedCache<R>
where
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn invalidate_object(&self, object_key: &ObjectKey) -> Result<usize> {
        self.invalidate(object_key)
    }

    fn clear(&self) {
        NamedCache::clear(self)
    }

    fn len(&self) -> usize {
        NamedCache::len(self)
    }

    fn fetch_payload_bytes(&self, key: &[u8]) -> Result<ValuePayload> {
        match &self.flavor {
            Flavor::Current { backend, .. } => {
                let key: Key =
                    rmp_serde::from_slice(key).map_err(|e| Error::Protocol(e.to_string()))?;
                backend.fetch_payload(&key)
            }
            Flavor::Historical(cache) => {
                let key: crate::key::HistoricalKey =
                    rmp_serde::from_slice(key).map_err(|e| Error::Protocol(e.to_string()))?;
                cache.backend().fetch_payload(&key)
            }
        }
    }
}

/// Process-wide set of named caches.
///
/// Populated once during startup, then shared read-only; `register` after
/// serving has begun is not supported.
pub struct CacheRegistry {
    database_id: String,
    caches: RwLock<HashMap<String, Arc<dyn ManagedCache>>>,
}

impl CacheRegistry {
    pub fn new(database_id: impl Into<String>) -> Self {
        Self {
            database_id: database_id.into(),
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn register(&self, cache: Arc<dyn ManagedCache>) -> Result<()> {
        let name = cache.name().to_string();
        let mut caches = self.caches.write();
        if caches.contains_key(&name) {
            return Err(Error::Config(format!("cache '{}' already registered", name)));
        }
        info!(cache = %name, "registered cache");
        caches.insert(name, cache);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ManagedCache>> {
        self.caches.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invalidate by name and object key; unknown names affect nothing.
    pub fn invalidate(&self, name: &str, object_key: &ObjectKey) -> Result<usize> {
        match self.get(name) {
            Some(cache) => cache.invalidate_object(object_key),
            None => Ok(0),
        }
    }

    pub fn clear_all(&self) {
        for cache in self.caches.read().values() {
            cache.clear();
        }
    }

    /// Master-side dispatch for one wire request.
    pub fn fetch_payload(&self, name: &str, key: &[u8]) -> Result<ValuePayload> {
        let cache = self
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown cache '{}'", name)))?;
        cache.fetch_payload_bytes(key)
    }
}

// =============================================================================
// Tests
// =============================================================================
