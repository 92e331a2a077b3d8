//! Cached Values
//!
//! A cache value is an owned, immutable-after-creation collection of domain
//! records. The cache store is the sole long-lived owner; business callers
//! receive shared, non-owning views ([`RecordSet`] clones are reference
//! bumps). Equality is structural, record by record, which is what the
//! stability guarantee is stated in terms of: a recomputed or remotely
//! fetched value compares equal even when the instance differs.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Shared, immutable collection of records for one key.
///
/// An empty set is a valid cached value, distinct from "absent".
pub struct RecordSet<R>(Arc<Vec<R>>);

impl<R> RecordSet<R> {
    pub fn new(records: Vec<R>) -> Self {
        Self(Arc::new(records))
    }

    pub fn empty() -> Self {
        Self(Arc::new(Vec::new()))
    }

    /// Borrow the underlying records.
    pub fn records(&self) -> &[R] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn shared(&self) -> Arc<Vec<R>> {
        Arc::clone(&self.0)
    }
}

impl<R> Clone for RecordSet<R> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<R> Deref for RecordSet<R> {
    type Target = [R];

    fn deref(&self) -> &[R] {
        &self.0
    }
}

impl<R: PartialEq> PartialEq for RecordSet<R> {
    fn eq(&self, other: &Self) -> bool {
        // Pointer equality short-circuits the common same-instance case
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl<R: Eq> Eq for RecordSet<R> {}

impl<R: fmt::Debug> fmt::Debug for RecordSet<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

// Serialized exactly as the plain record vector, so the compressed store and
// the wire protocol round-trip byte-for-byte with a caller-built Vec<R>.
impl<R: Serialize> Serialize for RecordSet<R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, R: Deserialize<'de>> Deserialize<'de> for RecordSet<R> {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Ok(Self(Arc::new(Vec::<R>::deserialize(deserializer)?)))
    }
}

/// Encode a record set with the crate's binary codec.
pub fn encode_records<R: Serialize>(set: &RecordSet<R>) -> Result<Vec<u8>> {
    rmp_serde::to_vec(set).map_err(|e| Error::Codec(e.to_string()))
}

/// Decode a record set from the crate's binary codec.
pub fn decode_records<R: DeserializeOwned>(bytes: &[u8]) -> Result<RecordSet<R>> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
}

/// Caller-owned scoped arena.
///
/// Lookups park a shared clone of every returned value here, so transient
/// records outlive the call and are reclaimed together when the caller's
/// transaction ends and the list drops.
#[derive(Default)]
pub struct DeleteList {
    retained: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
}

impl DeleteList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a shared clone of `set` and hand back a view for the caller.
    pub fn adopt<R: Send + Sync + 'static>(&self, set: &RecordSet<R>) -> RecordSet<R> {
        self.retained.lock().push(set.shared());
        set.clone()
    }

    /// Number of values currently kept alive by this list.
    pub fn len(&self) -> usize {
        self.retained.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.lock().is_empty()
    }
}

impl fmt::Debug for DeleteList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteList")
            .field("retained", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
