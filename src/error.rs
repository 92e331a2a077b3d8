//! Error types for the reference-data cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache layer.
///
/// The enum is `Clone` because a single-flight load delivers its outcome,
/// success or failure, to every thread waiting on the same key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An ObjectKey could not be translated into a typed key
    #[error("key translation failed for field '{field}': {reason}")]
    KeyTranslation { field: String, reason: String },

    /// The backing-store loader failed; propagated to the caller of `get`
    #[error("loader failed for {data_type}: {reason}")]
    Loader { data_type: String, reason: String },

    /// No date bucket covers the requested as-of date
    #[error("no validity bucket covers {date} for {data_type}")]
    NoBucket { data_type: String, date: String },

    /// Remote master unreachable, timed out, or speaking a different protocol
    #[error("remote cache unavailable ({endpoint}): {reason}")]
    RemoteUnavailable { endpoint: String, reason: String },

    /// The master answered with a status the slave does not recognize
    #[error("unexpected remote status {status} from {endpoint}")]
    RemoteStatus { endpoint: String, status: u32 },

    /// Compression failed
    #[error("compression failed: {reason}")]
    CompressionFailed { reason: String },

    /// Decompressed bytes do not match the pre-compression serialization
    #[error("decompression integrity failure: expected {expected} bytes, got {actual}")]
    DecompressionIntegrity { expected: u64, actual: u64 },

    /// Value (de)serialization error
    #[error("value codec error: {0}")]
    Codec(String),

    /// Malformed wire frame
    #[error("wire protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for loader failures.
    pub fn loader(data_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Loader {
            data_type: data_type.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for key translation failures.
    pub fn key_translation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::KeyTranslation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for failures the slave recovers from by computing locally.
    pub fn is_remote_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnavailable { .. } | Error::RemoteStatus { .. } | Error::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::key_translation("carrier", "missing");
        assert_eq!(
            err.to_string(),
            "key translation failed for field 'carrier': missing"
        );
    }

    #[test]
    fn test_error_clone_broadcast() {
        // Waiters on a failed single-flight load each receive their own copy
        let err = Error::loader("FareInfo", "connection reset");
        let copies: Vec<Error> = (0..4).map(|_| err.clone()).collect();
        for c in copies {
            assert_eq!(c, err);
        }
    }

    #[test]
    fn test_remote_recoverable() {
        assert!(Error::RemoteUnavailable {
            endpoint: "host:5000".into(),
            reason: "timed out".into()
        }
        .is_remote_recoverable());
        assert!(!Error::loader("Nation", "db down").is_remote_recoverable());
    }
}
