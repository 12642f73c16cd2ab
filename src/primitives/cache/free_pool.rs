use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::buffer::PageBuffer;

struct Bucket {
    size_class: usize,
    queue: Mutex<VecDeque<PageBuffer>>,
}

/// Outcome of sweeping one bucket.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepResult {
    pub inspected: usize,
    pub reclaimed: usize,
}

/// Idle page buffers, one FIFO bucket per size class.
///
/// Buckets lock independently so pops for one class never wait on another.
/// `len` only changes while the bucket being modified is locked.
pub struct FreePool {
    buckets: Box<[Bucket]>,
    len: AtomicUsize,
}

impl FreePool {
    /// Builds one bucket per entry; `size_classes` must be sorted ascending and unique.
    pub(crate) fn new(size_classes: &[usize]) -> Self {
        debug_assert!(size_classes.windows(2).all(|w| w[0] < w[1]));
        let buckets = size_classes
            .iter()
            .map(|&size_class| Bucket {
                size_class,
                queue: Mutex::new(VecDeque::new()),
            })
            .collect();
        Self {
            buckets,
            len: AtomicUsize::new(0),
        }
    }

    /// Configured size classes in ascending order.
    pub fn size_classes(&self) -> impl Iterator<Item = usize> + '_ {
        self.buckets.iter().map(|b| b.size_class)
    }

    /// Smallest size class able to hold `required` bytes.
    pub fn class_for(&self, required: usize) -> Option<usize> {
        self.buckets
            .iter()
            .map(|b| b.size_class)
            .find(|&size| size >= required)
    }

    /// Total pooled buffers across all buckets.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns true when no buffer is pooled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pooled buffers in one size class.
    pub fn len_of(&self, size_class: usize) -> usize {
        self.bucket(size_class)
            .map(|b| b.queue.lock().len())
            .unwrap_or(0)
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn pop(&self, size_class: usize) -> Option<PageBuffer> {
        let bucket = self.bucket(size_class)?;
        let mut queue = bucket.queue.lock();
        let buffer = queue.pop_front()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(buffer)
    }

    /// Enqueues an idle buffer. Buffers of unknown size classes are handed back.
    pub(crate) fn push(&self, buffer: PageBuffer) -> Result<(), PageBuffer> {
        debug_assert!(!buffer.is_referenced(), "pooling a referenced buffer");
        debug_assert!(buffer.key().is_none(), "pooling a keyed buffer");
        let Some(bucket) = self.bucket(buffer.size_class()) else {
            return Err(buffer);
        };
        let mut queue = bucket.queue.lock();
        queue.push_back(buffer);
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Dequeues at most `budget` buffers from the front of bucket `idx`; those for which
    /// `reclaim` returns true are removed and handed to `release`, the rest re-enqueued at
    /// the back. Buffers past the budget stay where they are.
    pub(crate) fn sweep_bucket<R, F>(
        &self,
        idx: usize,
        budget: usize,
        mut reclaim: R,
        mut release: F,
    ) -> SweepResult
    where
        R: FnMut(&PageBuffer) -> bool,
        F: FnMut(PageBuffer),
    {
        let Some(bucket) = self.buckets.get(idx) else {
            return SweepResult::default();
        };
        let mut removed = Vec::new();
        let mut result = SweepResult::default();
        {
            let mut queue = bucket.queue.lock();
            let take = budget.min(queue.len());
            let mut kept = Vec::with_capacity(take);
            for _ in 0..take {
                let Some(buffer) = queue.pop_front() else {
                    break;
                };
                result.inspected += 1;
                if reclaim(&buffer) {
                    removed.push(buffer);
                } else {
                    kept.push(buffer);
                }
            }
            queue.extend(kept);
            result.reclaimed = removed.len();
            self.len.fetch_sub(result.reclaimed, Ordering::AcqRel);
        }
        for buffer in removed {
            release(buffer);
        }
        result
    }

    /// Removes every pooled buffer.
    pub(crate) fn drain(&self) -> Vec<PageBuffer> {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            let mut queue = bucket.queue.lock();
            self.len.fetch_sub(queue.len(), Ordering::AcqRel);
            out.extend(queue.drain(..));
        }
        out
    }

    fn bucket(&self, size_class: usize) -> Option<&Bucket> {
        self.buckets
            .binary_search_by_key(&size_class, |b| b.size_class)
            .ok()
            .map(|idx| &self.buckets[idx])
    }
}

impl std::fmt::Debug for FreePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreePool")
            .field("size_classes", &self.size_classes().collect::<Vec<_>>())
            .field("len", &self.len())
            .finish()
    }
}
