#![allow(missing_docs)]

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Once};
use std::thread;
use std::time::Duration;

use pagebuf::{
    BufferSlice, CacheError, CacheOptions, FileOrigin, MemoryCache, MemoryCacheConfig, PageId,
    Result,
};
use tracing_subscriber::EnvFilter;

const THREADS: usize = 20;
const OPS_PER_THREAD: usize = 1_000;
const SEED: u64 = 0x0c4c_4e5e;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pagebuf=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn pattern(position: u64) -> u8 {
    (position % 255) as u8
}

fn fill_by_position(position: u64, target: &mut BufferSlice) -> Result<()> {
    target.fill(pattern(position));
    Ok(())
}

#[test]
fn random_readers_and_writers_leave_nothing_in_use() {
    init_tracing();
    let cache = MemoryCache::new(&[128], MemoryCacheConfig::default()).unwrap();
    thread::scope(|s| {
        for t in 0..THREADS {
            let cache = &cache;
            s.spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(SEED + t as u64);
                for _ in 0..OPS_PER_THREAD {
                    let page = rng.gen_range(1..100u64);
                    let origin = if rng.gen_bool(0.5) {
                        FileOrigin::Data
                    } else {
                        FileOrigin::Log
                    };
                    let expected = pattern(page * 128);
                    if rng.gen_bool(0.2) {
                        let mut writer = cache
                            .get_writable_page(PageId(page), origin, &fill_by_position)
                            .unwrap();
                        assert_eq!(writer.data()[0], expected);
                        writer.data_mut().fill(expected.wrapping_add(1));
                        cache.discard_page(writer).unwrap();
                    } else {
                        let reader = cache
                            .get_readable_page(PageId(page), origin, &fill_by_position)
                            .unwrap();
                        assert!(reader.data().iter().all(|&b| b == expected));
                        reader.release();
                    }
                }
            });
        }
    });
    assert_eq!(cache.pages_in_use(), 0);
    let stats = cache.stats();
    assert_eq!(stats.live_entries, 0);
    assert_eq!(stats.lock_timeouts, 0);
    assert_eq!(
        stats.hits + stats.misses,
        (THREADS * OPS_PER_THREAD) as u64
    );
}

#[test]
fn mixed_size_classes_under_contention() {
    init_tracing();
    const SIZES: [usize; 4] = [200, 256, 500, 1000];
    let cache = MemoryCache::new(&[256, 512, 1024], MemoryCacheConfig::default()).unwrap();
    thread::scope(|s| {
        for t in 0..8 {
            let cache = &cache;
            s.spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ t as u64);
                for _ in 0..500 {
                    let page = rng.gen_range(0..64u64);
                    let required = SIZES[(page % 4) as usize];
                    let expected = pattern(page * required as u64);
                    if rng.gen_bool(0.5) {
                        let mut writer = cache
                            .get_writable_page_sized(
                                PageId(page),
                                FileOrigin::Data,
                                required,
                                &fill_by_position,
                            )
                            .unwrap();
                        assert_eq!(writer.data().len(), required);
                        assert!(writer.data().iter().all(|&b| b == expected));
                        writer.data_mut().fill(expected.wrapping_add(1));
                        cache.discard_page(writer).unwrap();
                    } else {
                        let reader = cache
                            .get_readable_page_sized(
                                PageId(page),
                                FileOrigin::Data,
                                required,
                                &fill_by_position,
                            )
                            .unwrap();
                        assert_eq!(reader.data().len(), required);
                        assert!(reader.data().iter().all(|&b| b == expected));
                    }
                }
            });
        }
    });
    assert_eq!(cache.pages_in_use(), 0);
    let stats = cache.stats();
    assert_eq!(stats.lock_timeouts, 0);
    assert!(stats.discards > 0);
    assert_eq!(stats.live_entries, 0);
}

#[test]
fn simultaneous_misses_run_the_loader_once() {
    init_tracing();
    let cache = MemoryCache::new(&[128], MemoryCacheConfig::default()).unwrap();
    let loads = AtomicUsize::new(0);
    let slow_loader = |position: u64, target: &mut BufferSlice| -> Result<()> {
        loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(25));
        target.fill(pattern(position));
        Ok(())
    };
    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                let reader = cache
                    .get_readable_page(PageId(42), FileOrigin::Data, &slow_loader)
                    .unwrap();
                assert_eq!(reader.data()[0], pattern(42 * 128));
                barrier.wait();
                assert_eq!(
                    cache.share_count(PageId(42), FileOrigin::Data),
                    Some(THREADS as u32)
                );
                barrier.wait();
            });
        }
    });
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.pages_in_use(), 0);
}

#[test]
fn writers_are_mutually_exclusive() {
    init_tracing();
    let cache = MemoryCache::new(&[128], MemoryCacheConfig::default()).unwrap();
    let inside = AtomicUsize::new(0);
    let max_inside = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..200 {
                    let writer = cache
                        .get_writable_page(PageId(7), FileOrigin::Log, &fill_by_position)
                        .unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    assert_eq!(cache.share_count(PageId(7), FileOrigin::Log), Some(0));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    drop(writer);
                }
            });
        }
    });
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().discards, 1_600);
    assert_eq!(cache.pages_in_use(), 0);
}

#[test]
fn held_reader_times_out_a_writer() {
    init_tracing();
    let mut options = CacheOptions::new(&[128], MemoryCacheConfig::default());
    options.lock_timeout = Duration::from_millis(30);
    let cache = MemoryCache::with_options(options).unwrap();
    let reader = cache
        .get_readable_page(PageId(1), FileOrigin::Data, &fill_by_position)
        .unwrap();
    let err = thread::scope(|s| {
        s.spawn(|| {
            cache
                .get_writable_page(PageId(1), FileOrigin::Data, &fill_by_position)
                .map(drop)
        })
        .join()
        .unwrap()
        .unwrap_err()
    });
    assert!(err.is_retryable());
    match err {
        CacheError::LockTimeout { key, waited } => {
            assert_eq!(key.page_id, PageId(1));
            assert!(waited >= Duration::from_millis(30));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The timed-out writer no longer blocks new readers.
    let second = cache
        .get_readable_page(PageId(1), FileOrigin::Data, &fill_by_position)
        .unwrap();
    assert_eq!(cache.share_count(PageId(1), FileOrigin::Data), Some(2));
    drop((reader, second));
    assert_eq!(cache.pages_in_use(), 0);
}
