//! Cache error type.

use thiserror::Error;
use xrd_core::Status;

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Failures surfaced by the cache.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// Local disk I/O failed.
    #[error("cache i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A cinfo sidecar is unreadable or inconsistent; the cached copy is
    /// invalidated.
    #[error("corrupt cinfo for {path}: {detail}")]
    CorruptCinfo {
        /// Affected cache path.
        path: String,
        /// What failed to parse or validate.
        detail: String,
    },

    /// The upstream read for a block failed after retries.
    #[error("upstream failure: {0}")]
    Upstream(Status),

    /// A read landed outside the file.
    #[error("read beyond end of file: offset {offset}, file size {file_size}")]
    BeyondEof {
        /// Requested offset.
        offset: u64,
        /// Known file size.
        file_size: u64,
    },

    /// The file is no longer attached.
    #[error("cache file detached")]
    Detached,
}

impl From<Status> for CacheError {
    fn from(status: Status) -> Self {
        Self::Upstream(status)
    }
}
