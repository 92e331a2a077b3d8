//! Compressed Cache Store
//!
//! Wrapper store that keeps resident values serialized, and lz4-compressed
//! when the serialization is large enough to be worth it. Hits inflate and
//! decode on the way out, so memory footprint tracks the compressed size
//! while callers still see ordinary [`RecordSet`] values.
//!
//! # Design
//!
//! - put path: serialize, then compress when at or above the threshold;
//!   a compression that fails or does not shrink the value stores plain
//! - get path: inflate, verify the inflated length against the recorded
//!   pre-compression length; a mismatch is treated as a miss and reloaded
//! - capacity is a byte budget over stored (post-compression) sizes, with
//!   least-recently-used eviction

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{CacheBackend, FlightGroup, Loader, StoreStats, ValuePayload};
use crate::value::{decode_records, encode_records, RecordSet};

/// Default minimum serialized size before compression is attempted
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Compressed store tuning
#[derive(Debug, Clone)]
pub struct CompressedCacheConfig {
    /// Byte budget over stored sizes; 0 = unbounded
    pub total_capacity_bytes: u64,
    /// Serializations below this many bytes stay uncompressed
    pub compression_threshold: usize,
}

impl Default for CompressedCacheConfig {
    fn default() -> Self {
        Self {
            total_capacity_bytes: 0,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// Resident representation of one value
#[derive(Debug, Clone)]
enum Stored {
    /// Serialized but not compressed (below threshold, or compression
    /// declined to shrink it)
    Plain { bytes: Bytes },
    /// lz4 block, with the pre-compression length for integrity checking
    Packed { bytes: Bytes, inflated_len: u64 },
}

impl Stored {
    fn cost(&self) -> u64 {
        match self {
            Stored::Plain { bytes } => bytes.len() as u64,
            Stored::Packed { bytes, .. } => bytes.len() as u64,
        }
    }
}

struct CompressedEntry {
    stored: Stored,
    last_access: AtomicU64,
}

/// Byte-budgeted store holding serialized, optionally lz4-compressed values.
pub struct CompressedCache<K, R> {
    entries: DashMap<K, Arc<CompressedEntry>>,
    flights: FlightGroup<K, R>,
    loader: Arc<dyn Loader<K, R>>,
    config: CompressedCacheConfig,
    /// Sum of stored costs, kept in step with the entry map
    total_bytes: AtomicU64,
    clock: AtomicU64,
    /// Serializes eviction sweeps so concurrent puts do not over-evict
    evict_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    integrity_failures: AtomicU64,
}

impl<K, R> CompressedCache<K, R>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(loader: Arc<dyn Loader<K, R>>, config: CompressedCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            flights: FlightGroup::new(),
            loader,
            config,
            total_bytes: AtomicU64::new(0),
            clock: AtomicU64::new(1),
            evict_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
        }
    }

    /// Serialize and, when worthwhile, compress a value for residency.
    fn pack(&self, value: &RecordSet<R>) -> Result<Stored> {
        let plain = encode_records(value)?;
        if plain.len() < self.config.compression_threshold {
            return Ok(Stored::Plain {
                bytes: Bytes::from(plain),
            });
        }
        match lz4::block::compress(&plain, None, false) {
            Ok(packed) if packed.len() < plain.len() => Ok(Stored::Packed {
                inflated_len: plain.len() as u64,
                bytes: Bytes::from(packed),
            }),
            Ok(_) => {
                // Incompressible payload, keep the plain serialization
                Ok(Stored::Plain {
                    bytes: Bytes::from(plain),
                })
            }
            Err(e) => Err(Error::CompressionFailed {
                reason: e.to_string(),
            }),
        }
    }

    /// Inflate and decode a resident representation.
    fn inflate(&self, stored: &Stored) -> Result<RecordSet<R>> {
        match stored {
            Stored::Plain { bytes } => decode_records(bytes),
            Stored::Packed {
                bytes,
                inflated_len,
            } => {
                // lz4 block sizes are i32; a larger claim can only be a
                // corrupt length, reject it before it truncates
                if *inflated_len > i32::MAX as u64 {
                    return Err(Error::DecompressionIntegrity {
                        expected: *inflated_len,
                        actual: 0,
                    });
                }
                let plain = lz4::block::decompress(bytes, Some(*inflated_len as i32))
                    .map_err(|_| Error::DecompressionIntegrity {
                        expected: *inflated_len,
                        actual: 0,
                    })?;
                if plain.len() as u64 != *inflated_len {
                    return Err(Error::DecompressionIntegrity {
                        expected: *inflated_len,
                        actual: plain.len() as u64,
                    });
                }
                decode_records(&plain)
            }
        }
    }

    fn touch(&self, entry: &CompressedEntry) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        entry.last_access.store(tick, Ordering::Relaxed);
    }

    fn install(&self, key: K, stored: Stored) {
        let cost = stored.cost();
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        // Accounting invariant: a cost is added before its entry becomes
        // visible and subtracted exactly once when that entry is removed.
        // Adding after the insert would let a concurrent removal subtract
        // first and wrap the counter.
        self.total_bytes.fetch_add(cost, Ordering::Relaxed);
        let previous = self.entries.insert(
            key,
            Arc::new(CompressedEntry {
                stored,
                last_access: AtomicU64::new(tick),
            }),
        );
        if let Some(old) = previous {
            self.total_bytes
                .fetch_sub(old.stored.cost(), Ordering::Relaxed);
        }
        self.enforce_capacity();
    }

    fn remove_entry(&self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.total_bytes
                    .fetch_sub(entry.stored.cost(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Evict least-recently-used entries until within the byte budget.
    fn enforce_capacity(&self) {
        let budget = self.config.total_capacity_bytes;
        if budget == 0 || self.total_bytes.load(Ordering::Relaxed) <= budget {
            return;
        }
        let _sweep = self.evict_lock.lock();
        if self.total_bytes.load(Ordering::Relaxed) <= budget {
            return;
        }
        let mut candidates: Vec<(K, u64, u64)> = self
            .entries
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().last_access.load(Ordering::Relaxed),
                    e.value().stored.cost(),
                )
            })
            .collect();
        candidates.sort_by_key(|(_, tick, _)| *tick);

        for (key, _, cost) in candidates {
            if self.total_bytes.load(Ordering::Relaxed) <= budget {
                break;
            }
            if self.remove_entry(&key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(cost, "evicted compressed entry");
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Stored (post-compression) bytes currently resident.
    pub fn resident_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Decompression integrity failures observed so far.
    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures.load(Ordering::Relaxed)
    }

    /// Resident hit, or None. An integrity failure drops the entry and
    /// reports None so the caller reloads.
    fn resident(&self, key: &K) -> Option<RecordSet<R>> {
        let stored = {
            let entry = self.entries.get(key)?;
            self.touch(&entry);
            entry.stored.clone()
        };
        match self.inflate(&stored) {
            Ok(value) => Some(value),
            Err(e) => {
                self.integrity_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "corrupt compressed entry, dropping and reloading");
                self.remove_entry(key);
                None
            }
        }
    }
}

impl<K, R> CacheBackend<K, R> for CompressedCache<K, R>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Result<RecordSet<R>> {
        if let Some(value) = self.resident(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        self.flights.load_or_join(key, || {
            if let Some(value) = self.resident(key) {
                return Ok(value);
            }
            self.loads.fetch_add(1, Ordering::Relaxed);
            let value = self.loader.create(key)?;
            self.install(key.clone(), self.pack(&value)?);
            Ok(value)
        })
    }

    fn get_if_resident(&self, key: &K) -> Option<RecordSet<R>> {
        self.resident(key)
    }

    fn put(&self, key: K, value: RecordSet<R>) {
        match self.pack(&value) {
            Ok(stored) => self.install(key, stored),
            Err(e) => {
                // Unstorable value: leave the slot empty, the next get reloads
                warn!(error = %e, "failed to pack value for cache put");
            }
        }
    }

    fn invalidate(&self, key: &K) -> usize {
        if self.remove_entry(key) {
            1
        } else {
            0
        }
    }

    fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) {
        // Drain per key so every subtraction pairs with the insert that
        // added the cost; a blanket counter reset races concurrent installs
        for key in self.keys() {
            self.remove_entry(&key);
        }
    }

    fn fetch_payload(&self, key: &K) -> Result<ValuePayload> {
        // Make the entry resident, then hand off the stored bytes verbatim
        let value = self.get(key)?;
        if let Some(entry) = self.entries.get(key) {
            return Ok(match &entry.stored {
                Stored::Plain { bytes } => ValuePayload {
                    bytes: bytes.clone(),
                    inflated_len: bytes.len() as u64,
                    compressed: false,
                },
                Stored::Packed {
                    bytes,
                    inflated_len,
                } => ValuePayload {
                    bytes: bytes.clone(),
                    inflated_len: *inflated_len,
                    compressed: true,
                },
            });
        }
        // Evicted between get and lookup; serve the plain serialization
        let plain = encode_records(&value)?;
        let inflated_len = plain.len() as u64;
        Ok(ValuePayload {
            bytes: Bytes::from(plain),
            inflated_len,
            compressed: false,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    struct BlobLoader {
        calls: AtomicUsize,
        record_len: usize,
        repeat: usize,
    }

    impl BlobLoader {
        fn new(record_len: usize, repeat: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                record_len,
                repeat,
            }
        }
    }

    impl Loader<String, String> for BlobLoader {
        fn create(&self, key: &String) -> Result<RecordSet<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Repetitive content compresses well
            let record = key.chars().cycle().take(self.record_len).collect::<String>();
            Ok(RecordSet::new(vec![record; self.repeat]))
        }
    }

    fn cache_with(
        loader: Arc<BlobLoader>,
        config: CompressedCacheConfig,
    ) -> CompressedCache<String, String> {
        CompressedCache::new(loader, config)
    }

    #[test]
    fn test_large_values_stored_compressed() {
        let loader = Arc::new(BlobLoader::new(512, 16));
        let cache = cache_with(loader.clone(), CompressedCacheConfig::default());

        let value = cache.get(&"PG".to_string()).unwrap();
        assert_eq!(value.len(), 16);

        let entry = cache.entries.get(&"PG".to_string()).unwrap();
        assert_matches!(&entry.stored, Stored::Packed { bytes, inflated_len } => {
            assert!((bytes.len() as u64) < *inflated_len);
        });
        // Resident bytes reflect the compressed size
        assert_eq!(cache.resident_bytes(), entry.stored.cost());
    }

    #[test]
    fn test_small_values_stay_plain() {
        let loader = Arc::new(BlobLoader::new(8, 2));
        let cache = cache_with(loader, CompressedCacheConfig::default());

        cache.get(&"XX".to_string()).unwrap();
        let entry = cache.entries.get(&"XX".to_string()).unwrap();
        assert_matches!(&entry.stored, Stored::Plain { .. });
    }

    #[test]
    fn test_hit_inflates_to_equal_value() {
        let loader = Arc::new(BlobLoader::new(512, 8));
        let cache = cache_with(loader.clone(), CompressedCacheConfig::default());

        let first = cache.get(&"PG".to_string()).unwrap();
        let second = cache.get(&"PG".to_string()).unwrap();
        assert_eq!(first, second);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_integrity_failure_reloads() {
        let loader = Arc::new(BlobLoader::new(512, 8));
        let cache = cache_with(loader.clone(), CompressedCacheConfig::default());

        cache.get(&"PG".to_string()).unwrap();

        // Corrupt the resident entry: claim a larger pre-compression length
        let stored = {
            let entry = cache.entries.get(&"PG".to_string()).unwrap();
            match &entry.stored {
                Stored::Packed { bytes, inflated_len } => Stored::Packed {
                    bytes: bytes.clone(),
                    inflated_len: inflated_len + 100,
                },
                other => other.clone(),
            }
        };
        cache.entries.insert(
            "PG".to_string(),
            Arc::new(CompressedEntry {
                stored,
                last_access: AtomicU64::new(0),
            }),
        );

        // Served by reload, not by the corrupt entry
        let value = cache.get(&"PG".to_string()).unwrap();
        assert_eq!(value.len(), 8);
        assert_eq!(cache.integrity_failures(), 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_absurd_inflated_claim_is_integrity_failure() {
        let loader = Arc::new(BlobLoader::new(512, 8));
        let cache = cache_with(loader.clone(), CompressedCacheConfig::default());
        cache.get(&"PG".to_string()).unwrap();

        // Claim a length no i32-sized lz4 block could ever inflate to
        let stored = {
            let entry = cache.entries.get(&"PG".to_string()).unwrap();
            match &entry.stored {
                Stored::Packed { bytes, .. } => Stored::Packed {
                    bytes: bytes.clone(),
                    inflated_len: u64::MAX,
                },
                other => other.clone(),
            }
        };
        cache.entries.insert(
            "PG".to_string(),
            Arc::new(CompressedEntry {
                stored,
                last_access: AtomicU64::new(0),
            }),
        );

        let value = cache.get(&"PG".to_string()).unwrap();
        assert_eq!(value.len(), 8);
        assert_eq!(cache.integrity_failures(), 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_byte_budget_eviction() {
        let loader = Arc::new(BlobLoader::new(256, 8));
        // Budget fits roughly two stored entries of this shape
        let probe = cache_with(loader.clone(), CompressedCacheConfig::default());
        probe.get(&"A".to_string()).unwrap();
        let one = probe.resident_bytes();

        let cache = cache_with(
            Arc::new(BlobLoader::new(256, 8)),
            CompressedCacheConfig {
                total_capacity_bytes: one * 2 + one / 2,
                compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            },
        );
        for name in ["A", "B", "C", "D"] {
            cache.get(&name.to_string()).unwrap();
        }
        assert!(cache.resident_bytes() <= one * 2 + one / 2);
        assert!(cache.stats().evictions >= 2);
        // The most recent key survives
        assert!(cache.get_if_resident(&"D".to_string()).is_some());
    }

    #[test]
    fn test_invalidate_releases_bytes() {
        let loader = Arc::new(BlobLoader::new(512, 8));
        let cache = cache_with(loader, CompressedCacheConfig::default());

        cache.get(&"PG".to_string()).unwrap();
        assert!(cache.resident_bytes() > 0);
        assert_eq!(cache.invalidate(&"PG".to_string()), 1);
        assert_eq!(cache.resident_bytes(), 0);
        assert_eq!(cache.invalidate(&"PG".to_string()), 0);
    }

    #[test]
    fn test_fetch_payload_marks_compression() {
        let big = Arc::new(BlobLoader::new(512, 16));
        let cache = cache_with(big, CompressedCacheConfig::default());
        let payload = cache.fetch_payload(&"PG".to_string()).unwrap();
        assert!(payload.compressed);
        assert!((payload.bytes.len() as u64) < payload.inflated_len);

        let small = Arc::new(BlobLoader::new(8, 2));
        let cache = cache_with(small, CompressedCacheConfig::default());
        let payload = cache.fetch_payload(&"XX".to_string()).unwrap();
        assert!(!payload.compressed);
        assert_eq!(payload.inflated_len, payload.bytes.len() as u64);
    }

    proptest! {
        #[test]
        fn prop_pack_inflate_preserves_records(
            records in proptest::collection::vec(".{0,64}", 0..32),
            threshold in 0usize..4096,
        ) {
            let loader = Arc::new(BlobLoader::new(1, 1));
            let cache = cache_with(loader, CompressedCacheConfig {
                total_capacity_bytes: 0,
                compression_threshold: threshold,
            });
            let value = RecordSet::new(records);
            let stored = cache.pack(&value).unwrap();
            let back = cache.inflate(&stored).unwrap();
            prop_assert_eq!(back, value);
        }
    }
}
