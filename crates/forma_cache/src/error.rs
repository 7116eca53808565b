//! Error types for cache operations.

use std::path::PathBuf;

/// Errors that can occur during cache operations.
///
/// Cache reads are fail-safe: every read-side variant below is logged and
/// turned into a miss before it reaches a caller. Writes, deletions and
/// directory setup surface their errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },

    /// An entry file is truncated or its header is not a forma record.
    #[error("invalid cache record {path}: {reason}")]
    InvalidRecord {
        /// The entry file path.
        path: PathBuf,
        /// Description of the problem.
        reason: String,
    },

    /// The stored checksum does not match the checksum of the payload.
    #[error("checksum mismatch in {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The entry file path.
        path: PathBuf,
        /// The checksum recorded in the header.
        expected: String,
        /// The checksum computed from the payload.
        actual: String,
    },

    /// The record format version does not match the current version.
    #[error("version mismatch in {path}: expected {expected}, got {actual}")]
    VersionMismatch {
        /// The entry file path.
        path: PathBuf,
        /// The format version this build writes.
        expected: u32,
        /// The format version found in the file.
        actual: u32,
    },

    /// The record decoded fine but belongs to a different key.
    #[error("record {path} holds key {actual}, expected {expected}")]
    KeyMismatch {
        /// The entry file path.
        path: PathBuf,
        /// The requested key.
        expected: String,
        /// The key stored in the record.
        actual: String,
    },

    /// An entry file name could not be decoded back into a key.
    #[error("invalid cache key '{raw}': {reason}")]
    InvalidKey {
        /// The undecodable text.
        raw: String,
        /// Description of the problem.
        reason: String,
    },
}
