use std::fs;
use std::time::Duration;

use ma_range_cache::engine::directory::CacheDirectory;
use ma_range_cache::engine::fragment::ByteRange;
use ma_range_cache::engine::record::{CacheRecord, ContentMeta};
use ma_range_cache::engine::registry::ResourceRegistry;

const KB: u64 = 1024;
const URL: &str = "https://cdn.example.com/videos/trailer.mp4";

fn meta(len: u64) -> ContentMeta {
    ContentMeta {
        content_type: "video/mp4".to_string(),
        range_supported: true,
        content_length: len,
    }
}

#[test]
fn test_store_resumes_from_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheDirectory::new(dir.path());

    {
        let store = cache.open_store(URL, Duration::from_secs(1)).unwrap();
        store.set_content_meta(meta(64 * KB)).unwrap();
        store.write(&vec![0xABu8; 16 * KB as usize], 0).unwrap();
        store.write(&vec![0xCDu8; 8 * KB as usize], 32 * KB).unwrap();
        store.record_transfer(24 * KB, Duration::from_millis(500));
        // Dropping the store persists the sidecar.
    }

    assert!(cache.sidecar_path(URL).exists());
    let store = cache.open_store(URL, Duration::from_secs(1)).unwrap();
    let record = store.snapshot();
    assert_eq!(record.url, URL);
    assert_eq!(record.content_info, Some(meta(64 * KB)));
    assert_eq!(
        record.fragments.iter().copied().collect::<Vec<_>>(),
        vec![
            ByteRange::new(0, 16 * KB).unwrap(),
            ByteRange::new(32 * KB, 40 * KB).unwrap()
        ]
    );
    assert_eq!(record.download_speed_kbps(), 48.0);

    let data = store.read(&ByteRange::new(16 * KB - 2, 16 * KB).unwrap()).unwrap();
    assert_eq!(&data[..], &[0xAB, 0xAB]);
    let data = store.read(&ByteRange::new(32 * KB, 32 * KB + 4).unwrap()).unwrap();
    assert_eq!(&data[..], &[0xCD; 4]);
    assert!(store.read(&ByteRange::new(16 * KB - 2, 16 * KB + 2).unwrap()).is_err());
}

#[test]
fn test_corrupt_sidecar_means_empty_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheDirectory::new(dir.path());
    fs::write(cache.sidecar_path(URL), b"{ not json").unwrap();

    assert!(CacheRecord::load(&cache.sidecar_path(URL)).is_none());
    let store = cache.open_store(URL, Duration::from_secs(1)).unwrap();
    assert!(store.fragments().is_empty());
    assert!(store.content_meta().is_none());
}

#[test]
fn test_sidecar_past_end_of_data_file_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheDirectory::new(dir.path());

    let mut record = CacheRecord::new(URL);
    record.content_info = Some(meta(100));
    record.fragments.insert(ByteRange::new(0, 100).unwrap());
    record.save(&cache.sidecar_path(URL)).unwrap();
    // Data file is missing, so the sidecar cannot be trusted.

    let store = cache.open_store(URL, Duration::from_secs(1)).unwrap();
    assert!(store.fragments().is_empty());
}

#[test]
fn test_clear_skips_registered_urls() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheDirectory::new(dir.path());
    let busy = "https://cdn.example.com/videos/busy.mp4";
    let registry = ResourceRegistry::new();

    for url in [URL, busy] {
        let store = cache.open_store(url, Duration::from_secs(1)).unwrap();
        store.set_content_meta(meta(4 * KB)).unwrap();
        store.write(&[1u8; 1024], 0).unwrap();
    }
    assert!(cache.cache_size().unwrap() >= 8 * KB);

    registry.add(busy);
    assert!(!cache.clear_one(busy, &registry));
    assert_eq!(cache.clear_all(&registry).unwrap(), 2);

    assert!(!cache.data_path(URL).exists());
    assert!(!cache.sidecar_path(URL).exists());
    assert!(cache.data_path(busy).exists());
    assert!(cache.sidecar_path(busy).exists());

    registry.remove(busy);
    assert!(cache.clear_one(busy, &registry));
    assert!(!cache.data_path(busy).exists());
    assert_eq!(cache.cache_size().unwrap(), 0);
}
