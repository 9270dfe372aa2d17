//! Storage error types.

use thiserror::Error;

/// Errors produced by the KV engine, the log store, and the apply layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Append was not contiguous with the existing log tail.
    ///
    /// The reactor treats this as a contract violation: proposals assign
    /// indices, so a gap here is a bug, not an I/O condition.
    #[error("non-contiguous append for {key}: expected index {expected}, got {got}")]
    NonContiguousAppend {
        /// Handler key of the log.
        key: String,
        /// Expected next index.
        expected: u64,
        /// First index of the rejected batch.
        got: u64,
    },

    /// A persisted record failed its checksum or structural decode.
    #[error("corrupt record at {key} index {index}: {details}")]
    Corruption {
        /// Handler key of the log.
        key: String,
        /// Index of the corrupt entry, 0 when unknown.
        index: u64,
        /// What failed.
        details: String,
    },

    /// Record (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A CMD envelope carried an unknown command type.
    #[error("unknown command type: {0}")]
    UnknownCmdType(u16),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Core codec error bubbled up from key or envelope decoding.
    #[error(transparent)]
    Core(#[from] reverb_core::Error),
}

/// Convenience result alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
