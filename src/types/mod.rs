#![forbid(unsafe_code)]
//! Identifiers and the error type shared by every cache component.

use std::fmt;
use std::time::Duration;

/// Logical page number within its origin file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Physical file a page logically belongs to.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum FileOrigin {
    /// No backing file yet (new page). Never valid for a load.
    None = 0,
    /// Primary data file.
    Data = 1,
    /// Write-ahead log file.
    Log = 2,
}

impl FileOrigin {
    /// Returns the on-disk tag byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns a lowercase name suitable for log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            FileOrigin::None => "none",
            FileOrigin::Data => "data",
            FileOrigin::Log => "log",
        }
    }
}

impl TryFrom<u8> for FileOrigin {
    type Error = CacheError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FileOrigin::None),
            1 => Ok(FileOrigin::Data),
            2 => Ok(FileOrigin::Log),
            _ => Err(CacheError::InvalidState("unknown file origin")),
        }
    }
}

/// Identity of a cached page: `(page_id, origin)`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageKey {
    /// Page number.
    pub page_id: PageId,
    /// File the page belongs to.
    pub origin: FileOrigin,
}

impl PageKey {
    /// Builds a key from its parts.
    pub const fn new(page_id: PageId, origin: FileOrigin) -> Self {
        Self { page_id, origin }
    }
}

/// Error type for cache operations.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// I/O failure reported by a page loader.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Per-key shared/exclusive access could not be obtained in time.
    #[error("lock timeout on page {key} after {waited:?}")]
    LockTimeout {
        /// Page that was contended.
        key: PageKey,
        /// How long the caller waited before giving up.
        waited: Duration,
    },
    /// Operation attempted after the cache was disposed.
    #[error("cache engine disposed")]
    EngineDisposed,
    /// Caller bug: malformed key, unsupported size, or mismatched release.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl CacheError {
    /// Whether the caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::LockTimeout { .. })
    }
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.page_id)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<PageId> for u64 {
    fn from(value: PageId) -> Self {
        value.0
    }
}
