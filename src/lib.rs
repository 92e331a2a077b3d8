//! FareCache - Keyed Reference-Data Cache for Fare Pricing
//!
//! Generic caching layer for the reference data a fare-pricing process
//! consults on every request (fare rules, routings, taxes, carrier tables).
//! Each data type gets a named cache binding a typed key schema to a
//! pluggable backing-store loader.
//!
//! # Architecture
//!
//! ```text
//! caller → NamedCache.get → Store (single-flight) → Loader | Remote Master
//! ```
//!
//! # Features
//!
//! - Single-flight loads (one backing-store call per cold key)
//! - Composite typed keys with wildcard invalidation
//! - LZ4-compressed residency with a byte budget
//! - Historical (date-bucketed) lookups
//! - Master/slave remote cache over a binary TCP protocol
//! - YAML-configured registry with evict or load-on-update invalidation
//!
//! # Modules
//!
//! - [`key`] - Composite keys, schemas, wildcard patterns, date buckets
//! - [`value`] - Shared record sets and the scoped delete list
//! - [`store`] - Loader trait and the single-flight cache store
//! - [`compressed`] - Compressed store with byte-budget eviction
//! - [`historical`] - Date-scoped cache composition
//! - [`remote`] - Master/slave wire protocol, client, and server
//! - [`registry`] - Named caches, configuration, process-wide registry
//! - [`error`] - Error types

pub mod compressed;
pub mod error;
pub mod historical;
pub mod key;
pub mod registry;
pub mod remote;
pub mod store;
pub mod value;

// Re-export commonly used types
pub use compressed::{CompressedCache, CompressedCacheConfig};
pub use error::{Error, Result};
pub use historical::{HistoricalCache, HistoricalLoader};
pub use key::{DateBucket, FieldKind, FieldValue, HistoricalKey, Key, KeySchema, ObjectKey};
pub use registry::{
    CacheRegistry, CacheSettings, Capacity, InvalidationPolicy, ManagedCache, NamedCache,
    RegistryConfig, StorageMode,
};
pub use remote::{MasterServer, RemoteClient, RemoteEndpoint, RemoteLoader};
pub use store::{CacheBackend, CacheStore, Loader};
pub use value::{DeleteList, RecordSet};

/// Install a process-wide tracing subscriber honoring `RUST_LOG`, with
/// `filter` as the default directive. Call once at startup.
pub fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}
