use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Condvar, Mutex, MutexGuard, RawRwLock, RwLock,
};
use rustc_hash::{FxHashMap, FxHasher};
use tracing::{debug, info, warn};

use super::buffer::PageBuffer;
use super::free_pool::FreePool;
use super::manager::{CleanupStats, PageBufferManager};
use super::options::{CacheOptions, MemoryCacheConfig};
use crate::primitives::bytes::BufferSlice;
use crate::types::{CacheError, FileOrigin, PageId, PageKey, Result};

const LIVE_SHARDS: usize = 16;

/// Fills a buffer with the content of the page stored at `position`.
///
/// Implementations must populate the whole slice and must not keep a reference
/// to it once `load` returns.
pub trait PageLoader {
    /// Loads the page at byte `position` into `target`.
    fn load(&self, position: u64, target: &mut BufferSlice) -> Result<()>;
}

impl<F> PageLoader for F
where
    F: Fn(u64, &mut BufferSlice) -> Result<()>,
{
    fn load(&self, position: u64, target: &mut BufferSlice) -> Result<()> {
        self(position, target)
    }
}

/// Snapshot of cache counters.
#[derive(Default, Clone, Debug)]
pub struct CacheStats {
    /// Acquisitions served by an already-loaded live buffer.
    pub hits: u64,
    /// Acquisitions that ran the loader.
    pub misses: u64,
    /// Loader invocations that failed.
    pub load_failures: u64,
    /// Buffers allocated fresh.
    pub allocations: u64,
    /// Buffers taken from the free pool.
    pub reuses: u64,
    /// Readable acquisitions released.
    pub releases: u64,
    /// Writable acquisitions discarded.
    pub discards: u64,
    /// Acquisitions that gave up waiting.
    pub lock_timeouts: u64,
    /// Buffers referenced by at least one reader or writer.
    pub pages_in_use: usize,
    /// Keys present in the live set, including ones only being waited on.
    pub live_entries: usize,
    /// Buffers sitting in the free pool.
    pub free_pages: usize,
    /// Cleanup passes that swept the pool.
    pub cleanup_passes: u64,
    /// Buffers inspected by cleanup.
    pub cleanup_inspected: u64,
    /// Buffers reclaimed by cleanup.
    pub cleanup_reclaimed: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} in_use={} free={} reclaimed={}",
            self.hits, self.misses, self.pages_in_use, self.free_pages, self.cleanup_reclaimed
        )
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    load_failures: AtomicU64,
    allocations: AtomicU64,
    reuses: AtomicU64,
    releases: AtomicU64,
    discards: AtomicU64,
    lock_timeouts: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotPhase {
    Empty,
    Loading,
    Ready,
}

struct SlotState {
    phase: SlotPhase,
    buffer: Option<PageBuffer>,
    /// Visible length of the published buffer.
    window: usize,
    /// Threads holding or waiting on this key; the slot leaves the live set at zero.
    pins: u32,
    waiting_writers: u32,
}

/// Live-set entry for one key. All arbitration for the key happens under `state`.
struct Slot {
    key: PageKey,
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl Slot {
    fn new(key: PageKey) -> Self {
        Self {
            key,
            state: Mutex::new(SlotState {
                phase: SlotPhase::Empty,
                buffer: None,
                window: 0,
                pins: 0,
                waiting_writers: 0,
            }),
            changed: Condvar::new(),
        }
    }
}

type LiveShard = Mutex<FxHashMap<PageKey, Arc<Slot>>>;

/// Concurrent page buffer cache keyed by `(page_id, origin)`.
///
/// - Readers of a key share one buffer; a writer holds it alone.
/// - A miss runs the loader exactly once per key while other callers wait.
/// - Unreferenced buffers go to a per-size-class free pool and are reclaimed
///   by [`PageBufferManager`] after idling.
pub struct MemoryCache {
    options: CacheOptions,
    page_size: usize,
    shards: Box<[LiveShard]>,
    pool: Arc<FreePool>,
    manager: PageBufferManager,
    in_use: AtomicUsize,
    next_buffer_id: AtomicU64,
    disposed: AtomicBool,
    counters: CacheCounters,
}

impl MemoryCache {
    /// Creates a cache with the given size classes and cleanup settings.
    pub fn new(size_classes: &[usize], config: MemoryCacheConfig) -> Result<Self> {
        Self::with_options(CacheOptions::new(size_classes, config))
    }

    /// Creates a cache from full options.
    pub fn with_options(options: CacheOptions) -> Result<Self> {
        let options = options.validate()?;
        let pool = Arc::new(FreePool::new(&options.size_classes));
        let manager = PageBufferManager::new(options.cleanup.clone(), pool.clone());
        let shards = (0..LIVE_SHARDS)
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        Ok(Self {
            page_size: options.effective_page_size(),
            options,
            shards,
            pool,
            manager,
            in_use: AtomicUsize::new(0),
            next_buffer_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            counters: CacheCounters::default(),
        })
    }

    /// Options the cache was built with, after normalization.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Required size used by the unsized acquisition methods.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Acquires shared access to a page, loading it on first use.
    pub fn get_readable_page<L>(
        &self,
        page_id: PageId,
        origin: FileOrigin,
        loader: &L,
    ) -> Result<ReadablePage<'_>>
    where
        L: PageLoader + ?Sized,
    {
        self.get_readable_page_sized(page_id, origin, self.page_size, loader)
    }

    /// Acquires shared access to a page needing `required` bytes.
    pub fn get_readable_page_sized<L>(
        &self,
        page_id: PageId,
        origin: FileOrigin,
        required: usize,
        loader: &L,
    ) -> Result<ReadablePage<'_>>
    where
        L: PageLoader + ?Sized,
    {
        let key = PageKey::new(page_id, origin);
        let (slot, slice) = self.acquire(key, required, AccessMode::Read, loader)?;
        Ok(ReadablePage {
            cache: self,
            key,
            slot: Some(slot),
            guard: Some(slice.read_arc()),
        })
    }

    /// Acquires exclusive access to a page, loading it on first use.
    ///
    /// Waits until no reader or other writer holds the key.
    pub fn get_writable_page<L>(
        &self,
        page_id: PageId,
        origin: FileOrigin,
        loader: &L,
    ) -> Result<WritablePage<'_>>
    where
        L: PageLoader + ?Sized,
    {
        self.get_writable_page_sized(page_id, origin, self.page_size, loader)
    }

    /// Acquires exclusive access to a page needing `required` bytes.
    pub fn get_writable_page_sized<L>(
        &self,
        page_id: PageId,
        origin: FileOrigin,
        required: usize,
        loader: &L,
    ) -> Result<WritablePage<'_>>
    where
        L: PageLoader + ?Sized,
    {
        let key = PageKey::new(page_id, origin);
        let (slot, slice) = self.acquire(key, required, AccessMode::Write, loader)?;
        Ok(WritablePage {
            cache: self,
            key,
            slot: Some(slot),
            guard: Some(slice.write_arc()),
        })
    }

    /// Abandons a writable acquisition. The written content is dropped and the
    /// next acquisition of the key reloads it.
    ///
    /// Fails with `InvalidState` when `page` belongs to another cache; the page is
    /// still released to its own cache.
    pub fn discard_page(&self, page: WritablePage<'_>) -> Result<()> {
        if !std::ptr::eq(page.cache, self) {
            return Err(CacheError::InvalidState(
                "page discarded against a different cache",
            ));
        }
        drop(page);
        Ok(())
    }

    /// Buffers currently referenced by at least one reader or writer.
    pub fn pages_in_use(&self) -> usize {
        self.in_use.load(AtomicOrdering::Acquire)
    }

    /// Buffers sitting in the free pool.
    pub fn free_pages(&self) -> usize {
        self.pool.len()
    }

    /// Readers currently holding `(page_id, origin)`, or `None` if the key is not live.
    pub fn share_count(&self, page_id: PageId, origin: FileOrigin) -> Option<u32> {
        let slot = self.lookup(&PageKey::new(page_id, origin))?;
        let state = slot.state.lock();
        state.buffer.as_ref().map(PageBuffer::share_counter)
    }

    /// Whether a writer currently holds `(page_id, origin)`.
    pub fn has_writer(&self, page_id: PageId, origin: FileOrigin) -> bool {
        self.lookup(&PageKey::new(page_id, origin))
            .map(|slot| {
                let state = slot.state.lock();
                state.buffer.as_ref().is_some_and(PageBuffer::has_writer)
            })
            .unwrap_or(false)
    }

    /// Runs a cleanup pass over the free pool.
    pub fn cleanup(&self) -> CleanupStats {
        self.manager.cleanup()
    }

    /// The idle-buffer manager.
    pub fn manager(&self) -> &PageBufferManager {
        &self.manager
    }

    /// Returns a snapshot of cache counters.
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let totals = self.manager.totals();
        CacheStats {
            hits: c.hits.load(AtomicOrdering::Relaxed),
            misses: c.misses.load(AtomicOrdering::Relaxed),
            load_failures: c.load_failures.load(AtomicOrdering::Relaxed),
            allocations: c.allocations.load(AtomicOrdering::Relaxed),
            reuses: c.reuses.load(AtomicOrdering::Relaxed),
            releases: c.releases.load(AtomicOrdering::Relaxed),
            discards: c.discards.load(AtomicOrdering::Relaxed),
            lock_timeouts: c.lock_timeouts.load(AtomicOrdering::Relaxed),
            pages_in_use: self.pages_in_use(),
            live_entries: self.shards.iter().map(|s| s.lock().len()).sum(),
            free_pages: self.pool.len(),
            cleanup_passes: totals.passes,
            cleanup_inspected: totals.inspected,
            cleanup_reclaimed: totals.reclaimed,
        }
    }

    /// Shuts the cache down: later acquisitions fail with `EngineDisposed`,
    /// waiters wake up and fail, and pooled buffers are released.
    ///
    /// Outstanding pages may still be released; their buffers are dropped.
    pub fn dispose(&self) {
        if self.disposed.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        for shard in self.shards.iter() {
            let map = shard.lock();
            for slot in map.values() {
                let _state = slot.state.lock();
                slot.changed.notify_all();
            }
        }
        let drained = self.drain_pool();
        info!(
            drained,
            pages_in_use = self.pages_in_use(),
            "cache.dispose"
        );
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(AtomicOrdering::Acquire)
    }

    fn drain_pool(&self) -> usize {
        let drained = self.pool.drain();
        let count = drained.len();
        for mut buffer in drained {
            buffer.clear();
        }
        count
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(CacheError::EngineDisposed);
        }
        Ok(())
    }

    fn shard(&self, key: &PageKey) -> &LiveShard {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn lookup(&self, key: &PageKey) -> Option<Arc<Slot>> {
        self.shard(key).lock().get(key).cloned()
    }

    fn acquire<L>(
        &self,
        key: PageKey,
        required: usize,
        mode: AccessMode,
        loader: &L,
    ) -> Result<(Arc<Slot>, Arc<RwLock<BufferSlice>>)>
    where
        L: PageLoader + ?Sized,
    {
        self.ensure_open()?;
        if key.origin == FileOrigin::None {
            return Err(CacheError::InvalidState("cannot load a page with no origin"));
        }
        if required == 0 {
            return Err(CacheError::InvalidState("page size must be non-zero"));
        }
        let size_class = self
            .pool
            .class_for(required)
            .ok_or(CacheError::InvalidState("no buffer size class fits the page"))?;
        let slot = self.pin(key);
        match self.acquire_pinned(&slot, required, size_class, mode, loader) {
            Ok(slice) => Ok((slot, slice)),
            Err(err) => {
                self.unpin(&slot);
                Err(err)
            }
        }
    }

    fn acquire_pinned<L>(
        &self,
        slot: &Slot,
        required: usize,
        size_class: usize,
        mode: AccessMode,
        loader: &L,
    ) -> Result<Arc<RwLock<BufferSlice>>>
    where
        L: PageLoader + ?Sized,
    {
        let started = Instant::now();
        let deadline = started + self.options.lock_timeout;
        let mut queued_writer = false;
        let mut loaded_here = false;
        let mut state = slot.state.lock();
        loop {
            if self.is_disposed() {
                self.leave_queue(&mut state, slot, &mut queued_writer);
                return Err(CacheError::EngineDisposed);
            }
            match state.phase {
                SlotPhase::Empty => {
                    state.phase = SlotPhase::Loading;
                    let loaded = MutexGuard::unlocked(&mut state, || {
                        self.load_buffer(slot.key, required, size_class, loader)
                    });
                    match loaded {
                        Ok(buffer) => {
                            state.buffer = Some(buffer);
                            state.window = required;
                            state.phase = SlotPhase::Ready;
                            loaded_here = true;
                            slot.changed.notify_all();
                            continue;
                        }
                        Err(err) => {
                            state.phase = SlotPhase::Empty;
                            self.leave_queue(&mut state, slot, &mut queued_writer);
                            slot.changed.notify_all();
                            return Err(err);
                        }
                    }
                }
                SlotPhase::Loading => {}
                SlotPhase::Ready => {
                    let st = &mut *state;
                    if st.window < required {
                        self.leave_queue(st, slot, &mut queued_writer);
                        return Err(CacheError::InvalidState(
                            "cached page is smaller than the requested size",
                        ));
                    }
                    let Some(buffer) = st.buffer.as_mut() else {
                        self.leave_queue(st, slot, &mut queued_writer);
                        return Err(CacheError::InvalidState("ready slot without a buffer"));
                    };
                    let granted = match mode {
                        AccessMode::Read if !buffer.has_writer() && st.waiting_writers == 0 => {
                            if buffer.add_reader() {
                                self.in_use.fetch_add(1, AtomicOrdering::AcqRel);
                            }
                            true
                        }
                        AccessMode::Write if buffer.can_write() => {
                            buffer.begin_write();
                            self.in_use.fetch_add(1, AtomicOrdering::AcqRel);
                            if queued_writer {
                                st.waiting_writers -= 1;
                                queued_writer = false;
                            }
                            true
                        }
                        AccessMode::Write => {
                            if !queued_writer {
                                st.waiting_writers += 1;
                                queued_writer = true;
                            }
                            false
                        }
                        AccessMode::Read => false,
                    };
                    if granted {
                        let counter = if loaded_here {
                            &self.counters.misses
                        } else {
                            &self.counters.hits
                        };
                        CacheCounters::bump(counter);
                        return Ok(buffer.slice().clone());
                    }
                }
            }
            if slot.changed.wait_until(&mut state, deadline).timed_out() {
                self.leave_queue(&mut state, slot, &mut queued_writer);
                CacheCounters::bump(&self.counters.lock_timeouts);
                let waited = started.elapsed();
                warn!(
                    key = %slot.key,
                    mode = mode.as_str(),
                    waited_ms = waited.as_millis() as u64,
                    "cache.lock.timeout"
                );
                return Err(CacheError::LockTimeout {
                    key: slot.key,
                    waited,
                });
            }
        }
    }

    /// Drops a queued writer's claim so blocked readers can proceed.
    fn leave_queue(&self, state: &mut SlotState, slot: &Slot, queued_writer: &mut bool) {
        if *queued_writer {
            state.waiting_writers -= 1;
            *queued_writer = false;
            slot.changed.notify_all();
        }
    }

    fn load_buffer<L>(
        &self,
        key: PageKey,
        required: usize,
        size_class: usize,
        loader: &L,
    ) -> Result<PageBuffer>
    where
        L: PageLoader + ?Sized,
    {
        let (mut buffer, reused) = match self.pool.pop(size_class) {
            Some(buffer) => {
                CacheCounters::bump(&self.counters.reuses);
                (buffer, true)
            }
            None => {
                CacheCounters::bump(&self.counters.allocations);
                let id = self.next_buffer_id.fetch_add(1, AtomicOrdering::Relaxed);
                (PageBuffer::new(id, size_class), false)
            }
        };
        buffer.assign(key, required)?;
        let position = key
            .page_id
            .0
            .checked_mul(required as u64)
            .ok_or(CacheError::InvalidState("page position overflows u64"))?;
        let result = {
            let mut slice = buffer.slice().write();
            loader.load(position, &mut slice)
        };
        match result {
            Ok(()) => {
                debug!(
                    key = %key,
                    position,
                    size_class,
                    reused,
                    buffer = buffer.id(),
                    "cache.load.miss"
                );
                Ok(buffer)
            }
            Err(err) => {
                CacheCounters::bump(&self.counters.load_failures);
                warn!(key = %key, position, error = %err, "cache.load.failed");
                buffer.clear();
                Err(err)
            }
        }
    }

    fn pin(&self, key: PageKey) -> Arc<Slot> {
        let mut map = self.shard(&key).lock();
        let slot = map
            .entry(key)
            .or_insert_with(|| Arc::new(Slot::new(key)))
            .clone();
        slot.state.lock().pins += 1;
        slot
    }

    /// Drops one pin; the last pin removes the key from the live set and recycles its buffer.
    fn unpin(&self, slot: &Arc<Slot>) {
        let buffer = {
            let mut map = self.shard(&slot.key).lock();
            let mut state = slot.state.lock();
            debug_assert!(state.pins > 0, "unpin without pin");
            state.pins = state.pins.saturating_sub(1);
            if state.pins > 0 {
                return;
            }
            if map
                .get(&slot.key)
                .is_some_and(|live| Arc::ptr_eq(live, slot))
            {
                map.remove(&slot.key);
            }
            state.phase = SlotPhase::Empty;
            state.buffer.take()
        };
        if let Some(buffer) = buffer {
            self.recycle(buffer);
        }
    }

    fn recycle(&self, mut buffer: PageBuffer) {
        debug_assert!(!buffer.is_referenced(), "recycling a referenced buffer");
        if self.is_disposed() {
            buffer.clear();
            return;
        }
        buffer.mark_free(Instant::now());
        if let Err(mut rejected) = self.pool.push(buffer) {
            rejected.clear();
            return;
        }
        // A dispose that raced the check above may have drained before the push.
        if self.is_disposed() {
            self.drain_pool();
            return;
        }
        if self.options.auto_cleanup {
            self.manager.cleanup();
        }
    }

    fn release_reader(&self, slot: &Arc<Slot>) {
        {
            let mut state = slot.state.lock();
            match state.buffer.as_mut().and_then(PageBuffer::remove_reader) {
                Some(true) => {
                    self.in_use.fetch_sub(1, AtomicOrdering::AcqRel);
                }
                Some(false) => {}
                None => debug!(key = %slot.key, "cache.release.stale"),
            }
            slot.changed.notify_all();
        }
        CacheCounters::bump(&self.counters.releases);
        self.unpin(slot);
    }

    fn discard_writer(&self, slot: &Arc<Slot>) {
        let invalidated = {
            let mut state = slot.state.lock();
            let ended = state
                .buffer
                .as_mut()
                .map(PageBuffer::end_write)
                .unwrap_or(false);
            let invalidated = if ended {
                self.in_use.fetch_sub(1, AtomicOrdering::AcqRel);
                state.phase = SlotPhase::Empty;
                state.buffer.take()
            } else {
                debug!(key = %slot.key, "cache.discard.stale");
                None
            };
            slot.changed.notify_all();
            invalidated
        };
        if let Some(buffer) = invalidated {
            self.recycle(buffer);
        }
        CacheCounters::bump(&self.counters.discards);
        self.unpin(slot);
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("size_classes", &self.options.size_classes)
            .field("page_size", &self.page_size)
            .field("pages_in_use", &self.pages_in_use())
            .field("free_pages", &self.free_pages())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Shared access to a cached page. Released on [`release`](Self::release) or drop.
pub struct ReadablePage<'a> {
    cache: &'a MemoryCache,
    key: PageKey,
    slot: Option<Arc<Slot>>,
    /// Taken only on release, which consumes the handle; accessors always see `Some`.
    guard: Option<ArcRwLockReadGuard<RawRwLock, BufferSlice>>,
}

impl ReadablePage<'_> {
    /// The page's key.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// The page's buffer slice.
    pub fn slice(&self) -> &BufferSlice {
        self.guard.as_ref().expect("page guard missing")
    }

    /// The page content.
    pub fn data(&self) -> &[u8] {
        self.slice().as_slice()
    }

    /// Reads a little-endian u32 at `off`.
    pub fn read_u32(&self, off: usize) -> Result<u32> {
        self.slice().read_u32(off)
    }

    /// Gives up shared access.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        drop(self.guard.take());
        if let Some(slot) = self.slot.take() {
            self.cache.release_reader(&slot);
        }
    }
}

impl Drop for ReadablePage<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for ReadablePage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadablePage").field("key", &self.key).finish()
    }
}

/// Exclusive access to a cached page. Discarded on [`MemoryCache::discard_page`] or drop.
pub struct WritablePage<'a> {
    cache: &'a MemoryCache,
    key: PageKey,
    slot: Option<Arc<Slot>>,
    /// Taken only on release, which consumes the handle; accessors always see `Some`.
    guard: Option<ArcRwLockWriteGuard<RawRwLock, BufferSlice>>,
}

impl WritablePage<'_> {
    /// The page's key.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// The page's buffer slice.
    pub fn slice(&self) -> &BufferSlice {
        self.guard.as_ref().expect("page guard missing")
    }

    /// The page's buffer slice, mutably.
    pub fn slice_mut(&mut self) -> &mut BufferSlice {
        self.guard.as_mut().expect("page guard missing")
    }

    /// The page content.
    pub fn data(&self) -> &[u8] {
        self.slice().as_slice()
    }

    /// The page content, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.slice_mut().as_mut_slice()
    }

    fn discard_inner(&mut self) {
        drop(self.guard.take());
        if let Some(slot) = self.slot.take() {
            self.cache.discard_writer(&slot);
        }
    }
}

impl Drop for WritablePage<'_> {
    fn drop(&mut self) {
        self.discard_inner();
    }
}

impl fmt::Debug for WritablePage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritablePage").field("key", &self.key).finish()
    }
}
