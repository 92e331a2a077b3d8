//! Cache Store and Loader Abstraction
//!
//! The store is a keyed map in front of a slow backing store. A miss runs
//! the configured [`Loader`] under a single-flight discipline: for a given
//! key, exactly one loader invocation executes at a time, and every thread
//! waiting on that key receives the outcome, success or failure. A waiting
//! thread never blocks on another key's load.
//!
//! # Design
//!
//! - Resident entries live in a `DashMap` with per-entry last-access ticks
//! - In-flight loads are tracked in a mutex-guarded flight table; waiters
//!   park on a condvar slot while the leader runs the loader outside any lock
//! - Optional entry-count capacity with least-recently-used eviction

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::value::{encode_records, RecordSet};

/// Pluggable per-data-type loader: one backing-store call per miss.
pub trait Loader<K, R>: Send + Sync {
    fn create(&self, key: &K) -> Result<RecordSet<R>>;
}

/// A serialized value ready for wire handoff or compressed storage.
///
/// `inflated_len` is the byte length of the uncompressed serialization,
/// whether or not `bytes` is compressed.
#[derive(Debug, Clone)]
pub struct ValuePayload {
    pub bytes: Bytes,
    pub inflated_len: u64,
    pub compressed: bool,
}

/// Object-safe store contract shared by the simple and compressed stores.
pub trait CacheBackend<K, R>: Send + Sync {
    /// Resident value or single-flight load.
    fn get(&self, key: &K) -> Result<RecordSet<R>>;

    /// Never triggers a load.
    fn get_if_resident(&self, key: &K) -> Option<RecordSet<R>>;

    /// Unconditionally install/replace an entry.
    fn put(&self, key: K, value: RecordSet<R>);

    /// Remove the entry if present; returns 1 or 0.
    fn invalidate(&self, key: &K) -> usize;

    /// Snapshot of currently resident keys.
    fn keys(&self) -> Vec<K>;

    fn len(&self) -> usize;

    fn clear(&self);

    /// Serialized (possibly compressed) value for master-side handoff,
    /// loading on miss like `get`.
    fn fetch_payload(&self, key: &K) -> Result<ValuePayload>;
}

// =============================================================================
// Single-flight group
// =============================================================================

struct FlightSlot<R> {
    state: Mutex<Option<Result<RecordSet<R>>>>,
    done: Condvar,
}

impl<R> FlightSlot<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            done: Condvar::new(),
        }
    }
}

/// Per-key in-flight load table shared by both store implementations.
pub(crate) struct FlightGroup<K, R> {
    flights: Mutex<HashMap<K, Arc<FlightSlot<R>>>>,
}

impl<K: Clone + Eq + Hash, R> FlightGroup<K, R> {
    pub(crate) fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Run `load` as the flight leader for `key`, or join an existing flight
    /// and wait for its outcome. The loader runs outside every lock.
    pub(crate) fn load_or_join<F>(&self, key: &K, load: F) -> Result<RecordSet<R>>
    where
        F: FnOnce() -> Result<RecordSet<R>>,
    {
        let (slot, leader) = {
            let mut flights = self.flights.lock();
            match flights.get(key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(FlightSlot::new());
                    flights.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if leader {
            let result = load();
            {
                let mut state = slot.state.lock();
                *state = Some(result.clone());
            }
            slot.done.notify_all();
            self.flights.lock().remove(key);
            result
        } else {
            let mut state = slot.state.lock();
            while state.is_none() {
                slot.done.wait(&mut state);
            }
            state.clone().unwrap_or_else(|| unreachable!())
        }
    }
}

// =============================================================================
// Cache Store
// =============================================================================

struct StoreEntry<R> {
    value: RecordSet<R>,
    last_access: AtomicU64,
}

/// Uncompressed keyed store with single-flight loads and an optional
/// entry-count LRU capacity.
pub struct CacheStore<K, R> {
    entries: DashMap<K, Arc<StoreEntry<R>>>,
    flights: FlightGroup<K, R>,
    loader: Arc<dyn Loader<K, R>>,
    /// Monotonic access clock for LRU ordering
    clock: AtomicU64,
    /// 0 = unbounded
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

/// Store statistics snapshot
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
}

impl<K, R> CacheStore<K, R>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Create an unbounded store backed by `loader`.
    pub fn new(loader: Arc<dyn Loader<K, R>>) -> Self {
        Self::with_capacity(loader, 0)
    }

    /// Create a store that holds at most `max_entries` entries (0 = unbounded).
    pub fn with_capacity(loader: Arc<dyn Loader<K, R>>, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            flights: FlightGroup::new(),
            loader,
            clock: AtomicU64::new(1),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn touch(&self, entry: &StoreEntry<R>) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        entry.last_access.store(tick, Ordering::Relaxed);
    }

    fn lookup(&self, key: &K) -> Option<RecordSet<R>> {
        let entry = self.entries.get(key)?;
        self.touch(&entry);
        Some(entry.value.clone())
    }

    fn install(&self, key: K, value: RecordSet<R>) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            Arc::new(StoreEntry {
                value,
                last_access: AtomicU64::new(tick),
            }),
        );
        self.enforce_capacity();
    }

    /// Evict least-recently-used entries until within the entry budget.
    fn enforce_capacity(&self) {
        if self.max_entries == 0 {
            return;
        }
        while self.entries.len() > self.max_entries {
            // Snapshot, oldest tick first
            let mut candidates: Vec<(K, u64)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().last_access.load(Ordering::Relaxed)))
                .collect();
            candidates.sort_by_key(|(_, tick)| *tick);

            let excess = self.entries.len().saturating_sub(self.max_entries);
            for (key, _) in candidates.into_iter().take(excess) {
                if self.entries.remove(&key).is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
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
}

impl<K, R> CacheBackend<K, R> for CacheStore<K, R>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    R: Serialize + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Result<RecordSet<R>> {
        if let Some(value) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        self.flights.load_or_join(key, || {
            // A put or a finished flight may have raced us here
            if let Some(value) = self.lookup(key) {
                return Ok(value);
            }
            self.loads.fetch_add(1, Ordering::Relaxed);
            let value = self.loader.create(key)?;
            self.install(key.clone(), value.clone());
            Ok(value)
        })
    }

    fn get_if_resident(&self, key: &K) -> Option<RecordSet<R>> {
        self.lookup(key)
    }

    fn put(&self, key: K, value: RecordSet<R>) {
        self.install(key, value);
    }

    fn invalidate(&self, key: &K) -> usize {
        if self.entries.remove(key).is_some() {
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
        self.entries.clear();
    }

    fn fetch_payload(&self, key: &K) -> Result<ValuePayload> {
        let value = self.get(key)?;
        let bytes = encode_records(&value)?;
        let inflated_len = bytes.len() as u64;
        Ok(ValuePayload {
            bytes: Bytes::from(bytes),
            inflated_len,
            compressed: false,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
