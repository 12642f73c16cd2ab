#![allow(missing_docs)]

use std::sync::Once;
use std::time::{Duration, Instant};

use pagebuf::{
    BufferSlice, CacheError, CacheOptions, CleanupOutcome, FileOrigin, MemoryCache,
    MemoryCacheConfig, PageId, Result,
};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pagebuf=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn fill_by_position(position: u64, target: &mut BufferSlice) -> Result<()> {
    target.fill((position % 255) as u8);
    Ok(())
}

fn manual_cache(config: MemoryCacheConfig) -> MemoryCache {
    let mut options = CacheOptions::new(&[128, 256], config);
    options.auto_cleanup = false;
    MemoryCache::with_options(options).unwrap()
}

fn hold_and_release(cache: &MemoryCache, pages: std::ops::Range<u64>, required: usize) {
    let held: Vec<_> = pages
        .map(|id| {
            cache
                .get_readable_page_sized(PageId(id), FileOrigin::Data, required, &fill_by_position)
                .unwrap()
        })
        .collect();
    drop(held);
}

#[test]
fn released_pages_land_in_the_pool() {
    init_tracing();
    let cache = manual_cache(MemoryCacheConfig::default());
    hold_and_release(&cache, 0..10, 128);
    hold_and_release(&cache, 10..13, 200);
    assert_eq!(cache.pages_in_use(), 0);
    assert_eq!(cache.free_pages(), 13);
    assert_eq!(cache.stats().allocations, 13);

    hold_and_release(&cache, 20..30, 100);
    let stats = cache.stats();
    assert_eq!(stats.allocations, 13);
    assert_eq!(stats.reuses, 10);
}

#[test]
fn idle_buffers_are_reclaimed_in_batches() {
    init_tracing();
    let cache = manual_cache(MemoryCacheConfig {
        batch_size: 4,
        ..MemoryCacheConfig::default()
    });
    hold_and_release(&cache, 0..10, 128);
    let now = Instant::now();

    let fresh = cache.manager().cleanup_at(now);
    assert_eq!(fresh.outcome, CleanupOutcome::Ran);
    assert_eq!(fresh.inspected, 4);
    assert_eq!(fresh.reclaimed, 0);
    assert_eq!(cache.free_pages(), 10);

    let later = now + Duration::from_secs(61);
    assert_eq!(
        cache.manager().cleanup_at(later).outcome,
        CleanupOutcome::Throttled
    );
    let after_interval = later + Duration::from_secs(300);
    let swept = cache.manager().cleanup_at(after_interval);
    assert_eq!(swept.reclaimed, 4);
    assert_eq!(cache.free_pages(), 6);

    let stats = cache.stats();
    assert_eq!(stats.cleanup_passes, 2);
    assert_eq!(stats.cleanup_reclaimed, 4);
}

#[test]
fn auto_cleanup_keeps_pool_near_soft_cap() {
    init_tracing();
    let config = MemoryCacheConfig {
        max_free_pages: 2,
        max_idle_time: Duration::ZERO,
        ..MemoryCacheConfig::default()
    };
    let cache = MemoryCache::new(&[128], config).unwrap();
    let held: Vec<_> = (0..5)
        .map(|id| {
            cache
                .get_readable_page(PageId(id), FileOrigin::Log, &fill_by_position)
                .unwrap()
        })
        .collect();
    for page in held {
        page.release();
        assert!(cache.free_pages() <= 3);
    }
    assert_eq!(cache.free_pages(), 1);
    assert_eq!(cache.stats().cleanup_reclaimed, 4);
}

#[test]
fn empty_pool_cleanup_is_a_no_op() {
    let cache = manual_cache(MemoryCacheConfig::default());
    let stats = cache.cleanup();
    assert_eq!(stats.outcome, CleanupOutcome::EmptyPool);
    assert_eq!(cache.manager().last_run(), None);
}

#[test]
fn dispose_drops_pooled_buffers() {
    init_tracing();
    let cache = manual_cache(MemoryCacheConfig::default());
    hold_and_release(&cache, 0..6, 128);
    assert_eq!(cache.free_pages(), 6);
    cache.dispose();
    assert!(cache.is_disposed());
    assert_eq!(cache.free_pages(), 0);
    assert!(matches!(
        cache.get_writable_page(PageId(1), FileOrigin::Data, &fill_by_position),
        Err(CacheError::EngineDisposed)
    ));
    cache.dispose();
}

#[test]
fn cache_built_from_toml_file() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.toml");
    std::fs::write(
        &path,
        r#"
size_classes = [1024, 256]
page_size = 200
lock_timeout_ms = 500
auto_cleanup = false

[cleanup]
batch_size = 8
max_idle_time_ms = 0
"#,
    )
    .unwrap();
    let options = CacheOptions::load(&path).unwrap();
    let cache = MemoryCache::with_options(options).unwrap();
    assert_eq!(cache.page_size(), 200);
    assert_eq!(cache.options().size_classes, vec![256, 1024]);

    let page = cache
        .get_readable_page(PageId(3), FileOrigin::Data, &fill_by_position)
        .unwrap();
    assert_eq!(page.data().len(), 200);
    assert_eq!(page.slice().capacity(), 256);
    page.release();

    let swept = cache.cleanup();
    assert_eq!(swept.outcome, CleanupOutcome::Ran);
    assert_eq!(swept.reclaimed, 1);
    assert_eq!(cache.free_pages(), 0);
}
