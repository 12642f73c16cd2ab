use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::primitives::bytes::BufferSlice;
use crate::types::{PageKey, Result};

/// A buffer slice plus the bookkeeping the cache needs to share, pool and reclaim it.
///
/// Metadata is only mutated while the owner holds it exclusively: either the
/// per-key slot lock of the live entry, or a free-pool bucket lock.
pub struct PageBuffer {
    id: u64,
    key: Option<PageKey>,
    size_class: usize,
    slice: Arc<RwLock<BufferSlice>>,
    share_counter: u32,
    writer: bool,
    dirty: bool,
    timestamp_free: Option<Instant>,
}

impl PageBuffer {
    pub(crate) fn new(id: u64, size_class: usize) -> Self {
        Self {
            id,
            key: None,
            size_class,
            slice: Arc::new(RwLock::new(BufferSlice::new(size_class))),
            share_counter: 0,
            writer: false,
            dirty: false,
            timestamp_free: None,
        }
    }

    /// Allocation serial, stable for the lifetime of the buffer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Page currently held, `None` while pooled.
    pub fn key(&self) -> Option<PageKey> {
        self.key
    }

    /// Capacity of the backing allocation.
    pub fn size_class(&self) -> usize {
        self.size_class
    }

    /// Number of readers holding the buffer.
    pub fn share_counter(&self) -> u32 {
        self.share_counter
    }

    /// Whether a writer holds the buffer exclusively.
    pub fn has_writer(&self) -> bool {
        self.writer
    }

    /// Whether the buffer was acquired for writing and not yet discarded.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// When the buffer entered the free pool.
    pub fn timestamp_free(&self) -> Option<Instant> {
        self.timestamp_free
    }

    /// Whether any reader or writer references the buffer.
    pub fn is_referenced(&self) -> bool {
        self.share_counter > 0 || self.writer
    }

    pub(crate) fn slice(&self) -> &Arc<RwLock<BufferSlice>> {
        &self.slice
    }

    /// Binds a free buffer to `key`, exposing `required` bytes of its capacity.
    pub(crate) fn assign(&mut self, key: PageKey, required: usize) -> Result<()> {
        debug_assert!(!self.is_referenced(), "assigning a referenced buffer");
        self.slice.write().set_window(0, required)?;
        self.key = Some(key);
        self.timestamp_free = None;
        Ok(())
    }

    /// Readers attach; returns true when this moved the buffer from idle to referenced.
    pub(crate) fn add_reader(&mut self) -> bool {
        let was_idle = !self.is_referenced();
        self.share_counter += 1;
        was_idle
    }

    /// Returns true when the last reader left, or `None` when there was no reader.
    pub(crate) fn remove_reader(&mut self) -> Option<bool> {
        if self.share_counter == 0 {
            return None;
        }
        self.share_counter -= 1;
        Some(!self.is_referenced())
    }

    pub(crate) fn can_write(&self) -> bool {
        !self.is_referenced()
    }

    pub(crate) fn begin_write(&mut self) {
        debug_assert!(self.can_write());
        self.writer = true;
        self.dirty = true;
    }

    /// Clears the writer flag; false when no writer was present.
    pub(crate) fn end_write(&mut self) -> bool {
        if !self.writer {
            return false;
        }
        self.writer = false;
        self.dirty = false;
        true
    }

    /// Detaches the buffer from its page and stamps the time it became free.
    pub(crate) fn mark_free(&mut self, now: Instant) {
        self.key = None;
        self.share_counter = 0;
        self.writer = false;
        self.dirty = false;
        self.timestamp_free = Some(now);
    }

    #[cfg(test)]
    pub(crate) fn set_timestamp_free(&mut self, at: Option<Instant>) {
        self.timestamp_free = at;
    }

    /// Zeroes the content. Fails softly if someone still holds a guard on it.
    pub(crate) fn clear(&mut self) -> bool {
        match self.slice.try_write() {
            Some(mut slice) => {
                slice.clear();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("size_class", &self.size_class)
            .field("share_counter", &self.share_counter)
            .field("writer", &self.writer)
            .field("dirty", &self.dirty)
            .finish()
    }
}
