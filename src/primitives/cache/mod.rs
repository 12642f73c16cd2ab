//! Page buffer cache.
//!
//! [`MemoryCache`] hands out shared or exclusive access to page buffers keyed by
//! `(page_id, origin)`, loading each page at most once per residency. Released
//! buffers return to a [`FreePool`] bucket for their size class, and the
//! [`PageBufferManager`] drops the ones that stay idle too long.

mod buffer;
mod free_pool;
mod manager;
mod memory;
mod options;

pub use buffer::PageBuffer;
pub use free_pool::FreePool;
pub use manager::{
    should_reclaim, CleanupOutcome, CleanupStats, CleanupTotals, PageBufferManager,
};
pub use memory::{CacheStats, MemoryCache, PageLoader, ReadablePage, WritablePage};
pub use options::{CacheOptions, ConfigError, MemoryCacheConfig, DEFAULT_PAGE_SIZE};
