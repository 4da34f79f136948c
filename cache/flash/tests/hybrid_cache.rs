//! End-to-end tests over the public driver surface.

use std::sync::{Arc, Mutex};

use cache_flash::{
    AdmissionConfig, BigHashConfig, BlockCacheConfig, CacheConfig, DestructorCallback,
    DestructorEvent, DeviceConfig, Status, create_cache,
};

fn hybrid_config(device: DeviceConfig) -> CacheConfig {
    CacheConfig::new(device)
        .with_small_item_max_size(256)
        .with_block_cache(BlockCacheConfig::new(0, 8 * 1024 * 1024).with_region_size(64 * 1024))
        .with_big_hash(BigHashConfig::new(8 * 1024 * 1024, 4 * 1024 * 1024).with_bloom_filter(4, 512))
}

#[test]
fn insert_lookup_remove_over_memory_device() {
    let cache = create_cache(hybrid_config(
        DeviceConfig::memory(16 * 1024 * 1024).with_block_size(512),
    ))
    .unwrap();

    let medium = vec![b'm'; 4000];
    assert_eq!(cache.insert(b"small-item", b"small-value"), Status::Ok);
    assert_eq!(cache.insert(b"medium-item", &medium), Status::Ok);

    let mut out = Vec::new();
    assert_eq!(cache.lookup(b"small-item", &mut out), Status::Ok);
    assert_eq!(out, b"small-value");
    assert_eq!(cache.lookup(b"medium-item", &mut out), Status::Ok);
    assert_eq!(out, medium);
    assert_eq!(cache.lookup(b"absent", &mut out), Status::NotFound);

    assert_eq!(cache.remove(b"small-item"), Status::Ok);
    assert_eq!(cache.lookup(b"small-item", &mut out), Status::NotFound);
    cache.shutdown();
}

#[test]
fn works_over_a_file_device() {
    let dir = tempfile::tempdir().unwrap();
    let device = DeviceConfig::file(dir.path().join("flash"), 16 * 1024 * 1024)
        .with_block_size(512);
    let cache = create_cache(hybrid_config(device)).unwrap();

    let value = vec![b'f'; 8192];
    assert_eq!(cache.insert(b"on-disk", &value), Status::Ok);
    cache.flush();

    let mut out = Vec::new();
    assert_eq!(cache.lookup(b"on-disk", &mut out), Status::Ok);
    assert_eq!(out, value);
    cache.shutdown();
}

#[test]
fn destructor_fires_recycled_then_removed() {
    let events: Arc<Mutex<Vec<(Vec<u8>, DestructorEvent)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: Arc<DestructorCallback> = Arc::new(move |key: &[u8], _value: &[u8], event| {
        sink.lock().unwrap().push((key.to_vec(), event));
    });

    // A single 512-byte bucket, so inserts beyond capacity evict FIFO.
    let config = CacheConfig::new(DeviceConfig::memory(1024 * 1024).with_block_size(512))
        .with_small_item_max_size(128)
        .with_big_hash(BigHashConfig::new(0, 512).with_bucket_size(512))
        .with_destructor_callback(callback);
    let cache = create_cache(config).unwrap();

    // Insert the watched key, then push enough entries through the bucket
    // to evict it.
    assert_eq!(cache.insert(b"watched", &[b'w'; 100]), Status::Ok);
    for i in 0..4u32 {
        let key = format!("filler-{i}");
        assert_eq!(cache.insert(key.as_bytes(), &[b'f'; 100]), Status::Ok);
    }
    cache.flush();

    let recycled: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|(key, _)| key == b"watched")
        .cloned()
        .collect();
    assert_eq!(recycled, vec![(b"watched".to_vec(), DestructorEvent::Recycled)]);

    // Reinsert the same key, then remove it explicitly.
    assert_eq!(cache.insert(b"watched", &[b'w'; 100]), Status::Ok);
    assert_eq!(cache.remove(b"watched"), Status::Ok);
    cache.shutdown();

    let watched: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|(key, _)| key == b"watched")
        .map(|(_, event)| *event)
        .collect();
    assert_eq!(
        watched,
        vec![DestructorEvent::Recycled, DestructorEvent::Removed]
    );
}

#[test]
fn reject_random_zero_probability_rejects_every_insert() {
    let config = hybrid_config(DeviceConfig::memory(16 * 1024 * 1024).with_block_size(512))
        .with_admission(AdmissionConfig::RejectRandom { probability: 0.0 });
    let cache = create_cache(config).unwrap();

    for i in 0..50u32 {
        let key = format!("key-{i}");
        assert_eq!(cache.insert(key.as_bytes(), b"value"), Status::Rejected);
    }
    cache.flush();
    assert_eq!(cache.items(), 0);
    cache.shutdown();
}

#[test]
fn reinserting_at_a_different_size_switches_engines() {
    let cache = create_cache(hybrid_config(
        DeviceConfig::memory(16 * 1024 * 1024).with_block_size(512),
    ))
    .unwrap();

    assert_eq!(cache.insert(b"morph", b"tiny"), Status::Ok);
    let grown = vec![b'g'; 2048];
    assert_eq!(cache.insert(b"morph", &grown), Status::Ok);
    cache.flush();

    let mut out = Vec::new();
    assert_eq!(cache.lookup(b"morph", &mut out), Status::Ok);
    assert_eq!(out, grown, "the newer, larger copy must win");
    assert_eq!(cache.items(), 1, "the stale small copy must be gone");
    cache.shutdown();
}

#[test]
fn many_keys_survive_a_flush() {
    let cache = create_cache(hybrid_config(
        DeviceConfig::memory(16 * 1024 * 1024).with_block_size(512),
    ))
    .unwrap();

    for i in 0..500u32 {
        let key = format!("key-{i:04}");
        let value = format!("value-{i:04}-{}", "x".repeat((i % 300) as usize));
        assert_eq!(cache.insert(key.as_bytes(), value.as_bytes()), Status::Ok);
    }
    cache.flush();

    let mut out = Vec::new();
    for i in 0..500u32 {
        let key = format!("key-{i:04}");
        let value = format!("value-{i:04}-{}", "x".repeat((i % 300) as usize));
        assert_eq!(cache.lookup(key.as_bytes(), &mut out), Status::Ok, "key {i}");
        assert_eq!(out, value.as_bytes());
    }
    cache.shutdown();
}
