//! Composite Cache Keys
//!
//! Keys are ordered tuples of named, strongly-typed fields (codes, dates,
//! numbers). Invalidation callers hand the cache an untyped [`ObjectKey`]
//! (field name to string value); a [`KeySchema`] translates it into a typed
//! [`Key`], or into a [`KeyPattern`] when some fields carry the `"?"`
//! wildcard sentinel. Matching is structural on the typed representation,
//! never on strings.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Sentinel marking an ObjectKey field as "match any value"
pub const WILDCARD: &str = "?";

/// A single typed key field
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    /// Short alphanumeric code (carrier, vendor, agency, settlement plan)
    Code(String),
    /// Numeric field (tariff number, item number, sequence number)
    Number(i64),
    /// Calendar date (travel date, ticketing date)
    Date(NaiveDate),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Code(c) => write!(f, "{}", c),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Date(d) => write!(f, "{}", d),
        }
    }
}

/// The declared type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Code,
    Number,
    Date,
}

impl FieldKind {
    /// Parse a raw ObjectKey string into a typed field value.
    fn parse(self, name: &str, raw: &str) -> Result<FieldValue> {
        match self {
            FieldKind::Code => {
                if raw.is_empty() {
                    Err(Error::key_translation(name, "empty code"))
                } else {
                    Ok(FieldValue::Code(raw.to_string()))
                }
            }
            FieldKind::Number => raw
                .parse::<i64>()
                .map(FieldValue::Number)
                .map_err(|e| Error::key_translation(name, format!("not a number: {}", e))),
            FieldKind::Date => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(FieldValue::Date)
                .map_err(|e| Error::key_translation(name, format!("not a date: {}", e))),
        }
    }
}

/// Untyped name-to-value map supplied by invalidation callers.
///
/// Field order is irrelevant; the schema imposes order at translation time.
/// A value of `"?"` marks the field as wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectKey {
    entries: Vec<(String, String)>,
}

impl ObjectKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exact field value (builder style).
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// Add a wildcard field (builder style).
    pub fn wildcard(self, name: impl Into<String>) -> Self {
        self.field(name, WILDCARD)
    }

    /// Look up a field value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// True if any field carries the wildcard sentinel.
    pub fn has_wildcard(&self) -> bool {
        self.entries.iter().any(|(_, v)| v == WILDCARD)
    }
}

/// Typed composite key: an ordered tuple of field values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    fields: Vec<FieldValue>,
}

impl Key {
    pub fn new(fields: Vec<FieldValue>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    /// Structural match against a partial-key pattern.
    ///
    /// Arity must agree; wildcard positions match anything.
    pub fn matches(&self, pattern: &KeyPattern) -> bool {
        if self.fields.len() != pattern.fields.len() {
            return false;
        }
        self.fields
            .iter()
            .zip(pattern.fields.iter())
            .all(|(value, pat)| match pat {
                FieldPattern::Any => true,
                FieldPattern::Exact(expected) => value == expected,
            })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.fields.iter().map(|v| v.to_string()).collect();
        write!(f, "({})", parts.join(","))
    }
}

/// One pattern position: either an exact typed value or "any"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPattern {
    Exact(FieldValue),
    Any,
}

/// Partial-key pattern used by wildcard invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    fields: Vec<FieldPattern>,
}

impl KeyPattern {
    pub fn new(fields: Vec<FieldPattern>) -> Self {
        Self { fields }
    }

    /// If no position is wildcarded, the pattern denotes exactly one key.
    pub fn as_exact(&self) -> Option<Key> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for pat in &self.fields {
            match pat {
                FieldPattern::Exact(v) => fields.push(v.clone()),
                FieldPattern::Any => return None,
            }
        }
        Some(Key::new(fields))
    }
}

/// Ordered, typed field layout for one data type's keys.
#[derive(Debug, Clone)]
pub struct KeySchema {
    data_type: String,
    fields: Vec<(String, FieldKind)>,
}

impl KeySchema {
    pub fn new(data_type: impl Into<String>, fields: &[(&str, FieldKind)]) -> Self {
        Self {
            data_type: data_type.into(),
            fields: fields
                .iter()
                .map(|(n, k)| (n.to_string(), *k))
                .collect(),
        }
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// Translate an ObjectKey into a typed key.
    ///
    /// Fails if a schema field is missing, wildcarded, or malformed.
    pub fn translate(&self, object_key: &ObjectKey) -> Result<Key> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for (name, kind) in &self.fields {
            let raw = object_key
                .get(name)
                .ok_or_else(|| Error::key_translation(name, "missing field"))?;
            if raw == WILDCARD {
                return Err(Error::key_translation(name, "wildcard in exact key"));
            }
            fields.push(kind.parse(name, raw)?);
        }
        Ok(Key::new(fields))
    }

    /// Translate an ObjectKey into a match pattern, honoring `"?"` fields.
    pub fn pattern(&self, object_key: &ObjectKey) -> Result<KeyPattern> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for (name, kind) in &self.fields {
            let raw = object_key
                .get(name)
                .ok_or_else(|| Error::key_translation(name, "missing field"))?;
            if raw == WILDCARD {
                fields.push(FieldPattern::Any);
            } else {
                fields.push(FieldPattern::Exact(kind.parse(name, raw)?));
            }
        }
        Ok(KeyPattern::new(fields))
    }
}

/// Inclusive effective/discontinue validity interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateBucket {
    pub effective: NaiveDate,
    pub discontinue: NaiveDate,
}

impl DateBucket {
    pub fn new(effective: NaiveDate, discontinue: NaiveDate) -> Self {
        Self {
            effective,
            discontinue,
        }
    }

    /// True if the interval contains `date`.
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.effective <= date && date <= self.discontinue
    }
}

impl fmt::Display for DateBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.effective, self.discontinue)
    }
}

/// A base key additionally scoped to a resolved validity bucket.
///
/// Distinct key type sharing the same traits as [`Key`]; the governed
/// entries for one bucket share one HistoricalKey.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HistoricalKey {
    pub base: Key,
    pub bucket: DateBucket,
}

impl HistoricalKey {
    pub fn new(base: Key, bucket: DateBucket) -> Self {
        Self { base, bucket }
    }

    /// Wildcard patterns match on the base fields; the bucket is carried
    /// along unchanged.
    pub fn matches(&self, pattern: &KeyPattern) -> bool {
        self.base.matches(pattern)
    }
}

impl fmt::Display for HistoricalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.bucket)
    }
}

// =============================================================================
// Tests
// =============================================================================
