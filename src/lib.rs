//! Concurrent page buffer cache for a paged storage engine.
//!
//! Pages are identified by `(page_id, origin)` and loaded through a caller
//! supplied [`PageLoader`]. Readers share a buffer, writers hold it alone, and
//! idle buffers are pooled per size class until the cleanup manager reclaims them.

#![warn(missing_docs)]

pub mod primitives;
pub mod types;

pub use primitives::bytes::BufferSlice;
pub use primitives::cache::{
    CacheOptions, CacheStats, CleanupOutcome, CleanupStats, ConfigError, MemoryCache,
    MemoryCacheConfig, PageBufferManager, PageLoader, ReadablePage, WritablePage,
};
pub use primitives::io::{FileIo, FileLoader, StdFileIo};
pub use types::{CacheError, FileOrigin, PageId, PageKey, Result};
