//! Error types for QuiverDB

use crate::{SeriesId, Timestamp};
use thiserror::Error;

/// Result type alias for QuiverDB operations
pub type Result<T> = std::result::Result<T, QuiverError>;

/// QuiverDB error types
#[derive(Error, Debug)]
pub enum QuiverError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// A single sample could not be accepted
    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    /// Sample arrived too far behind the series' last buffered timestamp
    #[error("Out-of-order sample for series {series_id}: {timestamp} < {last_timestamp}")]
    OutOfOrder {
        series_id: SeriesId,
        timestamp: Timestamp,
        last_timestamp: Timestamp,
    },

    /// Sample is older than the retention cutoff
    #[error("Sample at {timestamp} is older than retention cutoff {cutoff}")]
    OutsideRetention { timestamp: Timestamp, cutoff: Timestamp },

    /// Label matcher could not be compiled
    #[error("Invalid matcher: {0}")]
    InvalidMatcher(String),

    /// Search selected more series than allowed
    #[error("Search matched more than {limit} series")]
    TooManySeries { limit: usize },

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Search deadline passed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Series index cannot be trusted
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// Part was quarantined after a failed checksum
    #[error("Part {0} is quarantined")]
    PartQuarantined(u64),

    /// Merge job failed
    #[error("Merge error: {0}")]
    Merge(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine is shutting down or closed
    #[error("Engine is closed")]
    Closed,

    /// Named snapshot does not exist
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuiverError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, QuiverError::Io(_) | QuiverError::Merge(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            QuiverError::Corruption(_)
                | QuiverError::ChecksumMismatch { .. }
                | QuiverError::IndexCorruption(_)
                | QuiverError::PartQuarantined(_)
        )
    }
}

impl From<bincode::Error> for QuiverError {
    fn from(e: bincode::Error) -> Self {
        QuiverError::InvalidFormat(e.to_string())
    }
}

impl From<serde_json::Error> for QuiverError {
    fn from(e: serde_json::Error) -> Self {
        QuiverError::InvalidFormat(e.to_string())
    }
}
