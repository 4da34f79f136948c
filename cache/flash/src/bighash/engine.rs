//! The big hash engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::bloom::BloomFilter;
use super::bucket::{BUCKET_HEADER_SIZE, BucketPage, entry_size};
use crate::config::{BigHashConfig, DestructorCallback, DestructorEvent};
use crate::device::Device;
use crate::error::Status;
use crate::metrics;

const BUCKET_HASH_SEED: u64 = 0x5132_8df6_61bc_94e3;

/// Fixed-bucket store for small objects.
///
/// The bucket for a key is `hash(key) % num_buckets`; inserts and removes
/// rewrite the whole bucket under its lock, evicting the oldest entries
/// when the page overflows.
pub struct BigHash {
    device: Arc<Device>,
    base_offset: u64,
    bucket_size: u32,
    num_buckets: u64,
    locks: Vec<Mutex<()>>,
    bloom: Option<BloomFilter>,
    destructor: Option<Arc<DestructorCallback>>,
    items: AtomicU64,
}

impl BigHash {
    pub(crate) fn new(
        config: &BigHashConfig,
        device: Arc<Device>,
        destructor: Option<Arc<DestructorCallback>>,
    ) -> Arc<Self> {
        let num_buckets = config.size / u64::from(config.bucket_size);
        let bloom = config
            .bloom
            .map(|b| BloomFilter::new(num_buckets, b.num_hashes, b.bits_per_bucket));
        let locks = (0..num_buckets).map(|_| Mutex::new(())).collect();
        Arc::new(Self {
            device,
            base_offset: config.base_offset,
            bucket_size: config.bucket_size,
            num_buckets,
            locks,
            bloom,
            destructor,
            items: AtomicU64::new(0),
        })
    }

    fn bucket_of(&self, key: &[u8]) -> u64 {
        xxh3_64_with_seed(key, BUCKET_HASH_SEED) % self.num_buckets
    }

    fn bucket_offset(&self, bucket: u64) -> u64 {
        self.base_offset + bucket * u64::from(self.bucket_size)
    }

    fn read_bucket(&self, bucket: u64) -> Option<BucketPage> {
        let mut buf = vec![0u8; self.bucket_size as usize];
        if let Err(error) = self.device.read(self.bucket_offset(bucket), &mut buf) {
            warn!(bucket, %error, "bucket read failed");
            return None;
        }
        Some(BucketPage::decode(&buf))
    }

    fn write_bucket(&self, bucket: u64, page: &BucketPage) -> bool {
        let bytes = page.encode(self.bucket_size as usize);
        if let Err(error) = self.device.write(self.bucket_offset(bucket), &bytes) {
            warn!(bucket, %error, "bucket write failed");
            return false;
        }
        true
    }

    /// Rebuild the bucket's Bloom filter from its surviving keys.
    fn rebuild_bloom(&self, bucket: u64, page: &BucketPage) {
        if let Some(bloom) = &self.bloom {
            bloom.clear(bucket);
            for (key, _) in &page.entries {
                bloom.set(bucket, key);
            }
        }
    }

    /// Insert, replacing any existing copy of the key and evicting the
    /// oldest entries on overflow.
    pub(crate) fn insert(&self, key: &[u8], value: &[u8]) -> Status {
        if key.is_empty() || key.len() > u16::MAX as usize {
            return Status::Rejected;
        }
        let capacity = self.bucket_size as usize - BUCKET_HEADER_SIZE;
        if entry_size(key.len(), value.len()) > capacity {
            return Status::Rejected;
        }

        let bucket = self.bucket_of(key);
        let _guard = self.locks[bucket as usize].lock();

        let Some(mut page) = self.read_bucket(bucket) else {
            return Status::DeviceError;
        };

        let replaced = page.take(key);
        page.entries.push((key.to_vec(), value.to_vec()));

        let mut evicted = Vec::new();
        while page.used_bytes() > self.bucket_size as usize {
            // FIFO within the bucket: the oldest entry goes first.
            evicted.push(page.entries.remove(0));
        }

        if !self.write_bucket(bucket, &page) {
            return Status::DeviceError;
        }

        if replaced.is_some() || !evicted.is_empty() {
            self.rebuild_bloom(bucket, &page);
        } else if let Some(bloom) = &self.bloom {
            bloom.set(bucket, key);
        }

        let removed = replaced.is_some() as u64 + evicted.len() as u64;
        if removed == 0 {
            self.items.fetch_add(1, Ordering::Relaxed);
        } else {
            // Net change: +1 new entry, -removed old ones.
            self.items.fetch_sub(removed - 1, Ordering::Relaxed);
        }

        if let Some((old_key, old_value)) = replaced {
            self.notify_destructor(&old_key, &old_value, DestructorEvent::Removed);
        }
        for (evicted_key, evicted_value) in evicted {
            metrics::BIGHASH_EVICTIONS.increment();
            self.notify_destructor(&evicted_key, &evicted_value, DestructorEvent::Recycled);
        }
        Status::Ok
    }

    /// Read a key into `out`. A Bloom-filter miss answers without any
    /// device read.
    pub(crate) fn lookup(&self, key: &[u8], out: &mut Vec<u8>) -> Status {
        let bucket = self.bucket_of(key);
        if let Some(bloom) = &self.bloom {
            if !bloom.test(bucket, key) {
                metrics::BLOOM_REJECTS.increment();
                return Status::NotFound;
            }
        }

        let _guard = self.locks[bucket as usize].lock();
        let Some(page) = self.read_bucket(bucket) else {
            return Status::DeviceError;
        };
        match page.find(key) {
            Some(value) => {
                out.clear();
                out.extend_from_slice(value);
                Status::Ok
            }
            None => Status::NotFound,
        }
    }

    /// Remove a key, firing the destructor callback on success.
    pub(crate) fn remove(&self, key: &[u8]) -> Status {
        let bucket = self.bucket_of(key);
        if let Some(bloom) = &self.bloom {
            if !bloom.test(bucket, key) {
                metrics::BLOOM_REJECTS.increment();
                return Status::NotFound;
            }
        }

        let _guard = self.locks[bucket as usize].lock();
        let Some(mut page) = self.read_bucket(bucket) else {
            return Status::DeviceError;
        };
        let Some((removed_key, removed_value)) = page.take(key) else {
            return Status::NotFound;
        };
        if !self.write_bucket(bucket, &page) {
            return Status::DeviceError;
        }
        self.rebuild_bloom(bucket, &page);
        self.items.fetch_sub(1, Ordering::Relaxed);
        self.notify_destructor(&removed_key, &removed_value, DestructorEvent::Removed);
        Status::Ok
    }

    /// Number of live entries.
    pub(crate) fn items(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }

    fn notify_destructor(&self, key: &[u8], value: &[u8], event: DestructorEvent) {
        if let Some(callback) = &self.destructor {
            callback(key, value, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    const BLOCK: u32 = 512;

    fn test_engine(config: BigHashConfig) -> (Arc<BigHash>, Arc<Device>) {
        let device = Arc::new(Device::memory(1024 * 1024, BLOCK, 64 * 1024).unwrap());
        let engine = BigHash::new(&config, Arc::clone(&device), None);
        (engine, device)
    }

    fn small_config() -> BigHashConfig {
        // 16 buckets of 512 bytes.
        BigHashConfig::new(0, 16 * 512).with_bucket_size(512)
    }

    #[test]
    fn insert_lookup_remove_roundtrip() {
        let (engine, _device) = test_engine(small_config());
        assert_eq!(engine.insert(b"small-key", b"small-value"), Status::Ok);

        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"small-key", &mut out), Status::Ok);
        assert_eq!(out, b"small-value");

        assert_eq!(engine.remove(b"small-key"), Status::Ok);
        assert_eq!(engine.lookup(b"small-key", &mut out), Status::NotFound);
        assert_eq!(engine.remove(b"small-key"), Status::NotFound);
        assert_eq!(engine.items(), 0);
    }

    #[test]
    fn replacing_insert_updates_value() {
        let (engine, _device) = test_engine(small_config());
        assert_eq!(engine.insert(b"key", b"one"), Status::Ok);
        assert_eq!(engine.insert(b"key", b"two"), Status::Ok);
        assert_eq!(engine.items(), 1);

        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"key", &mut out), Status::Ok);
        assert_eq!(out, b"two");
    }

    #[test]
    fn bucket_overflow_evicts_fifo() {
        let events: Arc<StdMutex<Vec<(Vec<u8>, DestructorEvent)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: Arc<DestructorCallback> =
            Arc::new(move |key: &[u8], _value: &[u8], event| {
                sink.lock().unwrap().push((key.to_vec(), event));
            });

        // One bucket so every key collides.
        let config = BigHashConfig::new(0, 512).with_bucket_size(512);
        let device = Arc::new(Device::memory(1024 * 1024, BLOCK, 64 * 1024).unwrap());
        let engine = BigHash::new(&config, device, Some(callback));

        // 100-byte values: a 512-byte bucket fits four entries at most.
        let value = [b'v'; 100];
        for i in 0..6u32 {
            let key = format!("entry-{i}");
            assert_eq!(engine.insert(key.as_bytes(), &value), Status::Ok);
        }

        // The two oldest entries must have been recycled, in FIFO order.
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], (b"entry-0".to_vec(), DestructorEvent::Recycled));
        assert_eq!(events[1], (b"entry-1".to_vec(), DestructorEvent::Recycled));
        drop(events);

        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"entry-0", &mut out), Status::NotFound);
        assert_eq!(engine.lookup(b"entry-5", &mut out), Status::Ok);
    }

    #[test]
    fn oversized_entries_are_rejected() {
        let (engine, _device) = test_engine(small_config());
        let huge = vec![0u8; 512];
        assert_eq!(engine.insert(b"too-big", &huge), Status::Rejected);
    }

    #[test]
    fn bloom_filter_short_circuits_absent_keys() {
        let config = small_config().with_bloom_filter(4, 512);
        let (engine, device) = test_engine(config);

        for i in 0..40u32 {
            let key = format!("present-{i}");
            assert_eq!(engine.insert(key.as_bytes(), b"v"), Status::Ok);
        }

        // Every inserted key must be found: the filter never produces a
        // false miss.
        let mut out = Vec::new();
        for i in 0..40u32 {
            let key = format!("present-{i}");
            assert_eq!(engine.lookup(key.as_bytes(), &mut out), Status::Ok);
        }

        // Unrelated keys mostly resolve in the filter with no device read.
        let reads_before = device.read_count();
        let mut misses = 0;
        let mut filter_rejects = 0;
        for i in 0..100u32 {
            let key = format!("absent-{i}");
            let before = device.read_count();
            assert_eq!(engine.lookup(key.as_bytes(), &mut out), Status::NotFound);
            misses += 1;
            if device.read_count() == before {
                filter_rejects += 1;
            }
        }
        assert_eq!(misses, 100);
        assert!(
            filter_rejects >= 95,
            "expected most misses to skip the bucket read, got {filter_rejects}"
        );
        assert!(device.read_count() - reads_before <= 5);
    }

    #[test]
    fn removal_rebuilds_the_filter() {
        let config = small_config().with_bloom_filter(4, 512);
        let (engine, device) = test_engine(config);

        assert_eq!(engine.insert(b"keep", b"1"), Status::Ok);
        assert_eq!(engine.insert(b"drop", b"2"), Status::Ok);
        assert_eq!(engine.remove(b"drop"), Status::Ok);

        // After the rebuild the removed key is (very likely) filtered, and
        // the kept key still reads back.
        let mut out = Vec::new();
        let reads_before = device.read_count();
        assert_eq!(engine.lookup(b"drop", &mut out), Status::NotFound);
        let _ = reads_before; // the reject may or may not touch the device
        assert_eq!(engine.lookup(b"keep", &mut out), Status::Ok);
        assert_eq!(out, b"1");
    }
}
