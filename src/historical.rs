//! Historical (Date-Scoped) Caching
//!
//! Reference data carries effective/discontinue validity windows. A
//! historical lookup is keyed by a base key plus an as-of date; the loader
//! first resolves which validity bucket covers that date, and the cache
//! stores one entry per (base key, bucket). Every as-of date falling inside
//! the same bucket shares one resident entry and one backing-store load.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::compressed::{CompressedCache, CompressedCacheConfig};
use crate::error::{Error, Result};
use crate::key::{DateBucket, HistoricalKey, Key, KeyPattern};
use crate::store::{CacheBackend, CacheStore, Loader};
use crate::value::RecordSet;

/// Loader for date-scoped data types.
///
/// `resolve_bucket` consults the backing store's validity intervals;
/// `create` fetches the records governed by one resolved bucket.
pub trait HistoricalLoader<R>: Send + Sync {
    /// The validity interval covering `as_of`, or [`Error::NoBucket`].
    fn resolve_bucket(&self, key: &Key, as_of: NaiveDate) -> Result<DateBucket>;

    fn create(&self, key: &HistoricalKey) -> Result<RecordSet<R>>;
}

/// Adapter presenting a [`HistoricalLoader`] as a plain bucket-keyed loader.
pub(crate) struct BucketLoader<R> {
    inner: Arc<dyn HistoricalLoader<R>>,
}

impl<R> BucketLoader<R> {
    pub(crate) fn new(inner: Arc<dyn HistoricalLoader<R>>) -> Self {
        Self { inner }
    }
}

impl<R> Loader<HistoricalKey, R> for BucketLoader<R>
where
    R: Send + Sync + 'static,
{
    fn create(&self, key: &HistoricalKey) -> Result<RecordSet<R>> {
        self.inner.create(key)
    }
}

/// Cache over bucket-scoped entries.
///
/// Composes a resolver with any backend keyed by [`HistoricalKey`]; the
/// backend supplies residency, single-flight, and eviction unchanged.
pub struct HistoricalCache<R> {
    resolver: Arc<dyn HistoricalLoader<R>>,
    backend: Arc<dyn CacheBackend<HistoricalKey, R>>,
    data_type: String,
}

impl<R> HistoricalCache<R>
where
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        data_type: impl Into<String>,
        resolver: Arc<dyn HistoricalLoader<R>>,
        backend: Arc<dyn CacheBackend<HistoricalKey, R>>,
    ) -> Self {
        Self {
            resolver,
            backend,
            data_type: data_type.into(),
        }
    }

    /// Uncompressed backend with an entry-count budget (0 = unbounded).
    pub fn simple(
        data_type: impl Into<String>,
        resolver: Arc<dyn HistoricalLoader<R>>,
        max_entries: usize,
    ) -> Self {
        let loader = Arc::new(BucketLoader::new(Arc::clone(&resolver)));
        let backend = Arc::new(CacheStore::with_capacity(loader, max_entries));
        Self::new(data_type, resolver, backend)
    }

    /// Compressed backend with a byte budget.
    pub fn compressed(
        data_type: impl Into<String>,
        resolver: Arc<dyn HistoricalLoader<R>>,
        config: CompressedCacheConfig,
    ) -> Self {
        let loader = Arc::new(BucketLoader::new(Arc::clone(&resolver)));
        let backend = Arc::new(CompressedCache::new(loader, config));
        Self::new(data_type, resolver, backend)
    }

    /// Resolve the bucket for `as_of`, then serve the bucket's entry.
    pub fn get(&self, base: &Key, as_of: NaiveDate) -> Result<RecordSet<R>> {
        let key = self.resolve(base, as_of)?;
        self.backend.get(&key)
    }

    /// Resolve without loading; the cache entry the lookup would use.
    pub fn resolve(&self, base: &Key, as_of: NaiveDate) -> Result<HistoricalKey> {
        let bucket = self.resolver.resolve_bucket(base, as_of)?;
        if !bucket.covers(as_of) {
            return Err(Error::NoBucket {
                data_type: self.data_type.clone(),
                date: as_of.to_string(),
            });
        }
        Ok(HistoricalKey::new(base.clone(), bucket))
    }

    /// Drop every resident bucket whose base key matches `pattern`.
    pub fn invalidate_matching(&self, pattern: &KeyPattern) -> usize {
        let mut removed = 0;
        for key in self.backend.keys() {
            if key.matches(pattern) {
                removed += self.backend.invalidate(&key);
            }
        }
        removed
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend<HistoricalKey, R>> {
        &self.backend
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }
}

// =============================================================================
// Tests
// =============================================================================
