//! Concurrency and Capacity Integration Tests
//!
//! Thread-level stress over the public cache surface: single-flight under
//! contention, wildcard invalidation racing readers, and byte-budget
//! accounting under many concurrent inserts.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use farecache::{
    CacheSettings, Capacity, CompressedCache, CompressedCacheConfig, DeleteList, FieldKind,
    InvalidationPolicy, Key, KeySchema, Loader, NamedCache, ObjectKey, RecordSet, Result,
    StorageMode,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RuleRecord {
    sequence: i64,
    text: String,
}

fn rule_schema() -> KeySchema {
    KeySchema::new(
        "StopoverRule",
        &[
            ("nation", FieldKind::Code),
            ("gds", FieldKind::Code),
            ("carrier", FieldKind::Code),
            ("plan", FieldKind::Code),
        ],
    )
}

fn rule_key(nation: &str, plan: &str) -> ObjectKey {
    ObjectKey::new()
        .field("nation", nation)
        .field("gds", "1S")
        .field("carrier", "PG")
        .field("plan", plan)
}

struct SlowLoader {
    calls: AtomicUsize,
    delay: Duration,
}

impl SlowLoader {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }
}

impl Loader<Key, RuleRecord> for SlowLoader {
    fn create(&self, key: &Key) -> Result<RecordSet<RuleRecord>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as i64;
        thread::sleep(self.delay);
        Ok(RecordSet::new(vec![RuleRecord {
            sequence: call,
            text: key.to_string(),
        }]))
    }
}

#[test]
fn test_single_flight_through_named_cache() {
    const THREADS: usize = 16;
    let loader = SlowLoader::new(Duration::from_millis(60));
    let cache = Arc::new(
        NamedCache::current(
            CacheSettings::new("StopoverRule"),
            rule_schema(),
            Arc::clone(&loader) as Arc<dyn Loader<Key, RuleRecord>>,
            "test",
        )
        .unwrap(),
    );
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let del = DeleteList::new();
                cache.get(&del, &rule_key("US", "BSP")).unwrap()
            })
        })
        .collect();

    let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    for value in &values {
        assert_eq!(value, &values[0]);
    }
}

#[test]
fn test_wildcard_invalidation_races_readers() {
    let loader = SlowLoader::new(Duration::ZERO);
    let cache = Arc::new(
        NamedCache::current(
            CacheSettings {
                invalidation: InvalidationPolicy::Evict,
                ..CacheSettings::new("StopoverRule")
            },
            rule_schema(),
            Arc::clone(&loader) as Arc<dyn Loader<Key, RuleRecord>>,
            "test",
        )
        .unwrap(),
    );

    let plans = ["BSP", "STU", "ARC", "GEN"];
    let readers: Vec<_> = plans
        .iter()
        .map(|plan| {
            let cache = Arc::clone(&cache);
            let plan = plan.to_string();
            thread::spawn(move || {
                let del = DeleteList::new();
                for _ in 0..200 {
                    let value = cache.get(&del, &rule_key("US", &plan)).unwrap();
                    assert_eq!(value.len(), 1);
                }
            })
        })
        .collect();

    let invalidator = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for _ in 0..50 {
                cache
                    .invalidate(&rule_key("US", farecache::key::WILDCARD))
                    .unwrap();
                thread::yield_now();
            }
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    invalidator.join().unwrap();

    // Quiesced: one final wildcard sweep removes whatever is resident,
    // then nothing remains
    cache
        .invalidate(&rule_key("US", farecache::key::WILDCARD))
        .unwrap();
    assert_eq!(cache.len(), 0);
}

#[test]
fn test_load_on_update_keeps_entries_resident() {
    let loader = SlowLoader::new(Duration::ZERO);
    let cache = Arc::new(
        NamedCache::current(
            CacheSettings {
                invalidation: InvalidationPolicy::LoadOnUpdate,
                ..CacheSettings::new("StopoverRule")
            },
            rule_schema(),
            Arc::clone(&loader) as Arc<dyn Loader<Key, RuleRecord>>,
            "test",
        )
        .unwrap(),
    );

    let del = DeleteList::new();
    for plan in ["BSP", "STU"] {
        cache.get(&del, &rule_key("US", plan)).unwrap();
    }

    let affected = cache
        .invalidate(&rule_key("US", farecache::key::WILDCARD))
        .unwrap();
    assert_eq!(affected, 2);
    // Refreshed in place, never evicted
    assert_eq!(cache.len(), 2);
    let refreshed = cache.get(&del, &rule_key("US", "BSP")).unwrap();
    assert!(refreshed.records()[0].sequence >= 2);
}

struct BulkLoader;

impl Loader<u32, RuleRecord> for BulkLoader {
    fn create(&self, key: &u32) -> Result<RecordSet<RuleRecord>> {
        Ok(RecordSet::new(vec![
            RuleRecord {
                sequence: i64::from(*key),
                text: "stopover permitted at intermediate points ".repeat(32),
            };
            4
        ]))
    }
}

#[test]
fn test_compressed_budget_holds_under_concurrent_inserts() {
    const BUDGET: u64 = 64 * 1024;
    let cache = Arc::new(CompressedCache::new(
        Arc::new(BulkLoader),
        CompressedCacheConfig {
            total_capacity_bytes: BUDGET,
            compression_threshold: 256,
        },
    ));

    let handles: Vec<_> = (0..8u32)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..100u32 {
                    use farecache::CacheBackend;
                    cache.get(&(worker * 100 + i)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    use farecache::CacheBackend;
    assert!(cache.resident_bytes() <= BUDGET);
    assert!(cache.len() > 0);

    cache.clear();
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.resident_bytes(), 0);
}

#[test]
fn test_clear_racing_replacement_puts_keeps_accounting_exact() {
    use farecache::CacheBackend;
    let cache = Arc::new(CompressedCache::new(
        Arc::new(BulkLoader),
        CompressedCacheConfig {
            total_capacity_bytes: 0,
            compression_threshold: 256,
        },
    ));

    // Replacement-heavy writers on a tiny key space, racing clear sweeps
    let writers: Vec<_> = (0..4u32)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..300u32 {
                    let value = RecordSet::new(vec![
                        RuleRecord {
                            sequence: i64::from(worker * 1000 + i),
                            text: "issued against published tariff ".repeat(16),
                        };
                        3
                    ]);
                    cache.put(i % 4, value);
                }
            })
        })
        .collect();

    let clearer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for _ in 0..100 {
                cache.clear();
                thread::yield_now();
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    clearer.join().unwrap();

    // Removing every resident entry must return the counter to exactly zero
    for key in cache.keys() {
        cache.invalidate(&key);
    }
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.resident_bytes(), 0);
}

#[test]
fn test_capacity_config_drives_store_budget() {
    let loader = SlowLoader::new(Duration::ZERO);
    let cache = NamedCache::current(
        CacheSettings {
            storage: StorageMode::Simple,
            capacity: Some(Capacity::Entries(2)),
            ..CacheSettings::new("StopoverRule")
        },
        rule_schema(),
        Arc::clone(&loader) as Arc<dyn Loader<Key, RuleRecord>>,
        "test",
    )
    .unwrap();

    let del = DeleteList::new();
    for nation in ["US", "CA", "MX", "BR"] {
        cache.get(&del, &rule_key(nation, "BSP")).unwrap();
    }
    assert!(cache.len() <= 2);
}
