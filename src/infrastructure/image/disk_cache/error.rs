//! Disk cache error types.

use thiserror::Error;

use crate::domain::errors::ImageError;

/// Result type for disk cache operations.
pub type DiskCacheResult<T> = std::result::Result<T, DiskCacheError>;

/// Errors raised by the disk cache.
#[derive(Debug, Error)]
pub enum DiskCacheError {
    /// Filesystem failure.
    #[error("disk cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The journal could not be parsed.
    #[error("corrupt journal at line {line}: {reason}")]
    CorruptJournal {
        /// One-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A commit or read found no data value for the entry.
    #[error("entry {key} has no data value")]
    MissingData {
        /// Cache key of the entry.
        key: String,
    },

    /// The cache has been closed.
    #[error("disk cache is closed")]
    Closed,

    /// A read or write observed cancellation between chunks.
    #[error("disk cache operation cancelled")]
    Cancelled,
}

impl DiskCacheError {
    pub(super) fn corrupt(line: usize, reason: impl Into<String>) -> Self {
        Self::CorruptJournal {
            line,
            reason: reason.into(),
        }
    }
}

impl From<DiskCacheError> for ImageError {
    fn from(err: DiskCacheError) -> Self {
        match err {
            DiskCacheError::Cancelled => Self::Cancelled,
            other => Self::io(other.to_string()),
        }
    }
}
