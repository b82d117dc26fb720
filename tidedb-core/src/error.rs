//! Error types for TideDB

use thiserror::Error;

/// Result type alias for TideDB operations
pub type Result<T> = std::result::Result<T, TideError>;

/// TideDB error types
#[derive(Error, Debug)]
pub enum TideError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration rejected at create/open/configure time
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cache arena reached its configured capacity
    #[error("Cache is full")]
    CacheFull,

    /// No table occupies the addressed slot
    #[error("Unknown table: tid {tid}")]
    TableUnknown {
        /// Dense table id that missed
        tid: i32,
    },

    /// The slot is occupied by a table with a different uid
    #[error("Table uid mismatch for tid {tid}: expected {expected}, got {actual}")]
    TableUidMismatch {
        /// Dense table id
        tid: i32,
        /// The uid registered for the slot
        expected: u64,
        /// The uid supplied by the caller
        actual: u64,
    },

    /// A commit task is already in flight
    #[error("Commit already in progress")]
    CommitInProgress,

    /// The repository is closed; all entry points reject
    #[error("Repository is closed")]
    RepoClosed,

    /// On-disk data failed structural validation (bad delimiter, truncation)
    #[error("Corrupt on-disk data: {0}")]
    CorruptOnDisk(String),

    /// Checksum mismatch while loading an on-disk region
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A tid, column, or row index fell outside its valid range
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// Malformed input (wire message, row payload, table config)
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

impl TideError {
    /// Check if error indicates corruption at rest
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TideError::CorruptOnDisk(_) | TideError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is retryable (a later trigger may succeed)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TideError::Io(_) | TideError::CacheFull | TideError::CommitInProgress
        )
    }
}
