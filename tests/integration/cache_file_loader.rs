#![allow(missing_docs)]

use std::io::Write;
use std::thread;

use pagebuf::{
    CacheError, FileIo, FileLoader, FileOrigin, MemoryCache, MemoryCacheConfig, PageId,
    StdFileIo,
};
use tempfile::{tempdir, NamedTempFile};

const PAGE: usize = 256;

fn page_file(pages: u8) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for id in 0..pages {
        file.write_all(&[id; PAGE]).unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn pages_are_read_at_page_offsets() {
    let file = page_file(8);
    let loader = FileLoader::open(file.path()).unwrap();
    let cache = MemoryCache::new(&[PAGE], MemoryCacheConfig::default()).unwrap();
    for id in 0..8u8 {
        let page = cache
            .get_readable_page(PageId(id.into()), FileOrigin::Data, &loader)
            .unwrap();
        assert!(page.data().iter().all(|&b| b == id), "page {id}");
    }
    assert_eq!(loader.io().len().unwrap(), 8 * PAGE as u64);
}

#[test]
fn pages_past_end_of_file_load_as_zeroes() {
    let file = page_file(2);
    let loader = FileLoader::new(StdFileIo::open(file.path()).unwrap());
    let cache = MemoryCache::new(&[PAGE], MemoryCacheConfig::default()).unwrap();
    let page = cache
        .get_readable_page(PageId(40), FileOrigin::Log, &loader)
        .unwrap();
    assert!(page.data().iter().all(|&b| b == 0));
}

#[test]
fn discarded_writes_are_reloaded_from_disk() {
    let file = page_file(4);
    let loader = FileLoader::open(file.path()).unwrap();
    let cache = MemoryCache::new(&[PAGE], MemoryCacheConfig::default()).unwrap();

    let mut writer = cache
        .get_writable_page(PageId(3), FileOrigin::Data, &loader)
        .unwrap();
    writer.slice_mut().write_u32(0, 0xDEAD_BEEF).unwrap();
    assert_eq!(writer.slice().read_u32(0).unwrap(), 0xDEAD_BEEF);
    cache.discard_page(writer).unwrap();

    let reader = cache
        .get_readable_page(PageId(3), FileOrigin::Data, &loader)
        .unwrap();
    assert_eq!(reader.read_u32(0).unwrap(), 0x0303_0303);
}

#[test]
fn shared_loader_across_threads() {
    let file = page_file(16);
    let loader = FileLoader::open(file.path()).unwrap();
    let cache = MemoryCache::new(&[PAGE], MemoryCacheConfig::default()).unwrap();
    thread::scope(|s| {
        for t in 0..4u64 {
            let (cache, loader) = (&cache, &loader);
            s.spawn(move || {
                for round in 0..64u64 {
                    let id = (t * 7 + round) % 16;
                    let page = cache
                        .get_readable_page(PageId(id), FileOrigin::Data, loader)
                        .unwrap();
                    assert_eq!(page.data()[PAGE - 1], id as u8);
                }
            });
        }
    });
    assert_eq!(cache.pages_in_use(), 0);
}

#[test]
fn missing_file_surfaces_io_error() {
    let dir = tempdir().unwrap();
    let err = FileLoader::open(dir.path().join("nope.db")).unwrap_err();
    assert!(matches!(err, CacheError::Io(_)));
}
