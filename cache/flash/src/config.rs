//! Tagged-variant configuration records for the flash engine pair.
//!
//! Construction consumes one [`CacheConfig`]; every policy choice is an
//! enumerated value validated when the config is frozen by
//! [`create_cache`](crate::create_cache), not a mutable builder object.

use std::path::PathBuf;
use std::sync::Arc;

use crate::block::ENTRY_HEADER_SIZE;
use crate::bighash::{BUCKET_ENTRY_OVERHEAD, BUCKET_HEADER_SIZE};
use crate::device::Device;
use crate::error::{Error, Result};

/// Why an item left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructorEvent {
    /// The item was evicted (region reclaim or in-bucket overflow).
    Recycled,
    /// The item was removed explicitly, or replaced by a newer insert.
    Removed,
}

/// Callback fired exactly once per accepted insert, at eviction or
/// removal. Must be non-blocking; it runs on scheduler workers.
///
/// The value slice may be empty when the bytes were no longer readable at
/// the point the item left (a block-cache entry replaced by a newer insert
/// of the same key).
pub type DestructorCallback = dyn Fn(&[u8], &[u8], DestructorEvent) + Send + Sync;

/// Device selection plus I/O granularity.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    /// Block size; all device offsets and lengths are multiples of this.
    pub block_size: u32,
    /// Largest single write issued to the backend; bigger writes split.
    pub max_write_size: u32,
}

#[derive(Debug, Clone)]
pub enum DeviceKind {
    /// Single file (or block device node) of `size` bytes.
    File { path: PathBuf, size: u64 },
    /// RAID-0 across `paths`, each file `fdsize` bytes, striped at
    /// `stripe_size`.
    Raid {
        paths: Vec<PathBuf>,
        fdsize: u64,
        stripe_size: u64,
    },
    /// RAM-backed device for tests and ephemeral caches.
    Memory { size: u64 },
}

impl DeviceConfig {
    const DEFAULT_BLOCK_SIZE: u32 = 4096;
    const DEFAULT_MAX_WRITE_SIZE: u32 = 1024 * 1024;

    pub fn file(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            kind: DeviceKind::File {
                path: path.into(),
                size,
            },
            block_size: Self::DEFAULT_BLOCK_SIZE,
            max_write_size: Self::DEFAULT_MAX_WRITE_SIZE,
        }
    }

    pub fn raid(paths: Vec<PathBuf>, fdsize: u64, stripe_size: u64) -> Self {
        Self {
            kind: DeviceKind::Raid {
                paths,
                fdsize,
                stripe_size,
            },
            block_size: Self::DEFAULT_BLOCK_SIZE,
            max_write_size: Self::DEFAULT_MAX_WRITE_SIZE,
        }
    }

    pub fn memory(size: u64) -> Self {
        Self {
            kind: DeviceKind::Memory { size },
            block_size: Self::DEFAULT_BLOCK_SIZE,
            max_write_size: Self::DEFAULT_MAX_WRITE_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_max_write_size(mut self, max_write_size: u32) -> Self {
        self.max_write_size = max_write_size;
        self
    }

    /// Logical size of the configured device.
    pub fn total_size(&self) -> u64 {
        match &self.kind {
            DeviceKind::File { size, .. } => *size,
            DeviceKind::Raid { paths, fdsize, .. } => fdsize * paths.len() as u64,
            DeviceKind::Memory { size } => *size,
        }
    }

    pub(crate) fn build(&self) -> Result<Device> {
        match &self.kind {
            DeviceKind::File { path, size } => {
                Device::file(path, *size, self.block_size, self.max_write_size)
            }
            DeviceKind::Raid {
                paths,
                fdsize,
                stripe_size,
            } => Device::raid(
                paths,
                *fdsize,
                *stripe_size,
                self.block_size,
                self.max_write_size,
            ),
            DeviceKind::Memory { size } => {
                Device::memory(*size, self.block_size, self.max_write_size)
            }
        }
    }
}

/// Region eviction policy selection.
#[derive(Debug, Clone, Default)]
pub enum EvictionConfig {
    #[default]
    Lru,
    Fifo,
    SegmentedFifo { segment_ratio: Vec<u32> },
}

/// Reclaim-time reinsertion policy selection.
#[derive(Debug, Clone, Default)]
pub enum ReinsertionConfig {
    #[default]
    None,
    /// Reinsert items whose hit counter reached `threshold`.
    Hits { threshold: u8 },
    /// Reinsert `percent` of items, decided independently per item.
    Percentage { percent: u32 },
}

/// Block-cache engine layout and policies.
#[derive(Debug, Clone)]
pub struct BlockCacheConfig {
    /// First device byte owned by the engine.
    pub base_offset: u64,
    /// Bytes owned by the engine; a whole number of regions.
    pub size: u64,
    pub region_size: u32,
    /// Checksum entries and verify on read.
    pub checksum: bool,
    pub eviction: EvictionConfig,
    /// Ascending slot sizes; empty selects the stack allocator.
    pub size_classes: Vec<u32>,
    /// Recommended read-side buffer; zero means one block.
    pub read_buffer_size: u32,
    /// Clean regions the reclaim loop maintains.
    pub clean_regions_pool: u32,
    /// Sealed region buffers allowed to flush asynchronously; zero flushes
    /// at seal time on the inserting job.
    pub num_in_mem_buffers: u32,
    pub reinsertion: ReinsertionConfig,
}

impl BlockCacheConfig {
    pub fn new(base_offset: u64, size: u64) -> Self {
        Self {
            base_offset,
            size,
            region_size: 16 * 1024 * 1024,
            checksum: false,
            eviction: EvictionConfig::default(),
            size_classes: Vec::new(),
            read_buffer_size: 0,
            clean_regions_pool: 1,
            num_in_mem_buffers: 0,
            reinsertion: ReinsertionConfig::default(),
        }
    }

    pub fn with_region_size(mut self, region_size: u32) -> Self {
        self.region_size = region_size;
        self
    }

    pub fn with_checksum(mut self, enable: bool) -> Self {
        self.checksum = enable;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_size_classes(mut self, size_classes: Vec<u32>) -> Self {
        self.size_classes = size_classes;
        self
    }

    pub fn with_read_buffer_size(mut self, read_buffer_size: u32) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    pub fn with_clean_regions_pool(mut self, n: u32) -> Self {
        self.clean_regions_pool = n;
        self
    }

    pub fn with_num_in_mem_buffers(mut self, n: u32) -> Self {
        self.num_in_mem_buffers = n;
        self
    }

    pub fn with_reinsertion(mut self, reinsertion: ReinsertionConfig) -> Self {
        self.reinsertion = reinsertion;
        self
    }

    fn validate(&self, device: &DeviceConfig, metadata_size: u64) -> Result<()> {
        let block = u64::from(device.block_size);
        if self.region_size == 0 || u64::from(self.region_size) % block != 0 {
            return Err(Error::InvalidConfig(
                "region size must be a non-zero multiple of block size",
            ));
        }
        if self.size == 0 || self.size % u64::from(self.region_size) != 0 {
            return Err(Error::InvalidConfig(
                "block cache size must be a non-zero multiple of region size",
            ));
        }
        if self.size / u64::from(self.region_size) < 2 {
            return Err(Error::InvalidConfig("block cache needs at least two regions"));
        }
        if self.base_offset % block != 0 {
            return Err(Error::InvalidConfig("base offset must be block aligned"));
        }
        if self.base_offset < metadata_size {
            return Err(Error::InvalidConfig(
                "block cache overlaps the metadata region",
            ));
        }
        if self.base_offset + self.size > device.total_size() {
            return Err(Error::InvalidConfig("block cache exceeds the device"));
        }
        if self.read_buffer_size != 0 && u64::from(self.read_buffer_size) % block != 0 {
            return Err(Error::InvalidConfig(
                "read buffer size must be a multiple of block size",
            ));
        }
        if let EvictionConfig::SegmentedFifo { segment_ratio } = &self.eviction {
            if segment_ratio.is_empty() || segment_ratio.iter().any(|&r| r == 0) {
                return Err(Error::InvalidConfig(
                    "segment ratio parts must be non-empty and non-zero",
                ));
            }
        }
        if let ReinsertionConfig::Percentage { percent } = self.reinsertion {
            if percent > 100 {
                return Err(Error::InvalidConfig(
                    "reinsertion percentage must be at most 100",
                ));
            }
        }
        let mut previous = ENTRY_HEADER_SIZE as u32;
        for &class in &self.size_classes {
            if class <= previous {
                return Err(Error::InvalidConfig(
                    "size classes must be ascending and larger than the entry header",
                ));
            }
            if class > self.region_size {
                return Err(Error::InvalidConfig("size class exceeds region size"));
            }
            previous = class;
        }
        Ok(())
    }
}

/// Big-hash engine layout.
#[derive(Debug, Clone)]
pub struct BigHashConfig {
    pub base_offset: u64,
    /// Bytes owned by the engine; a whole number of buckets.
    pub size: u64,
    pub bucket_size: u32,
    pub bloom: Option<BloomConfig>,
}

/// Per-bucket Bloom filter parameters.
#[derive(Debug, Clone, Copy)]
pub struct BloomConfig {
    pub num_hashes: u32,
    pub bits_per_bucket: u32,
}

impl BigHashConfig {
    pub fn new(base_offset: u64, size: u64) -> Self {
        Self {
            base_offset,
            size,
            bucket_size: 4096,
            bloom: None,
        }
    }

    pub fn with_bucket_size(mut self, bucket_size: u32) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    pub fn with_bloom_filter(mut self, num_hashes: u32, bits_per_bucket: u32) -> Self {
        self.bloom = Some(BloomConfig {
            num_hashes,
            bits_per_bucket,
        });
        self
    }

    fn validate(&self, device: &DeviceConfig, metadata_size: u64) -> Result<()> {
        let block = u64::from(device.block_size);
        if self.bucket_size == 0 || u64::from(self.bucket_size) % block != 0 {
            return Err(Error::InvalidConfig(
                "bucket size must be a non-zero multiple of block size",
            ));
        }
        if self.size == 0 || self.size % u64::from(self.bucket_size) != 0 {
            return Err(Error::InvalidConfig(
                "big hash size must be a non-zero multiple of bucket size",
            ));
        }
        if self.base_offset % block != 0 {
            return Err(Error::InvalidConfig("base offset must be block aligned"));
        }
        if self.base_offset < metadata_size {
            return Err(Error::InvalidConfig("big hash overlaps the metadata region"));
        }
        if self.base_offset + self.size > device.total_size() {
            return Err(Error::InvalidConfig("big hash exceeds the device"));
        }
        if let Some(bloom) = &self.bloom {
            if bloom.num_hashes == 0 || bloom.bits_per_bucket == 0 {
                return Err(Error::InvalidConfig(
                    "bloom filter needs at least one hash and one bit",
                ));
            }
        }
        Ok(())
    }
}

/// Write admission policy selection.
#[derive(Debug, Clone, Default)]
pub enum AdmissionConfig {
    /// Admit everything.
    #[default]
    None,
    /// Admit with a fixed probability in `[0, 1]`.
    RejectRandom { probability: f64 },
    /// Servo the admission probability toward a device write budget. Zero
    /// for any optional field selects its default.
    DynamicRandom {
        /// Target device write rate, bytes/s.
        target_rate: u64,
        /// Key bytes ignored by the decision hash, so suffix-differing
        /// keys share a decision.
        suffix_length: usize,
        /// Item size whose admission probability is unscaled; larger
        /// items are admitted proportionally less.
        item_base_size: u32,
        /// Write rate beyond which the probability is cut harder.
        max_rate: u64,
        /// Per-update bound on how fast the probability shrinks.
        factor_lower_bound: f64,
        /// Per-update bound on how fast the probability grows.
        factor_upper_bound: f64,
    },
}

/// Scheduler pool shape.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub num_workers: usize,
    /// FIFO shards; keep well above the worker count so per-key ordering
    /// rarely serializes unrelated keys.
    pub num_shards: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            num_shards: 256,
        }
    }
}

/// Top-level flash cache configuration.
#[derive(Clone)]
pub struct CacheConfig {
    pub device: DeviceConfig,
    /// Device bytes `[0, metadata_size)` reserved for engine metadata.
    pub metadata_size: u64,
    pub max_concurrent_inserts: u32,
    /// Ceiling on queued (key, value) parcel bytes.
    pub max_parcel_memory: u64,
    /// Items at most this many serialized bytes route to the big hash.
    pub small_item_max_size: u32,
    pub block_cache: Option<BlockCacheConfig>,
    pub big_hash: Option<BigHashConfig>,
    pub admission: AdmissionConfig,
    pub scheduler: SchedulerConfig,
    pub destructor_callback: Option<Arc<DestructorCallback>>,
}

impl CacheConfig {
    pub fn new(device: DeviceConfig) -> Self {
        Self {
            device,
            metadata_size: 0,
            max_concurrent_inserts: 1024,
            max_parcel_memory: 256 * 1024 * 1024,
            small_item_max_size: 2048,
            block_cache: None,
            big_hash: None,
            admission: AdmissionConfig::default(),
            scheduler: SchedulerConfig::default(),
            destructor_callback: None,
        }
    }

    pub fn with_metadata_size(mut self, metadata_size: u64) -> Self {
        self.metadata_size = metadata_size;
        self
    }

    pub fn with_max_concurrent_inserts(mut self, limit: u32) -> Self {
        self.max_concurrent_inserts = limit;
        self
    }

    pub fn with_max_parcel_memory(mut self, limit: u64) -> Self {
        self.max_parcel_memory = limit;
        self
    }

    pub fn with_small_item_max_size(mut self, limit: u32) -> Self {
        self.small_item_max_size = limit;
        self
    }

    pub fn with_block_cache(mut self, config: BlockCacheConfig) -> Self {
        self.block_cache = Some(config);
        self
    }

    pub fn with_big_hash(mut self, config: BigHashConfig) -> Self {
        self.big_hash = Some(config);
        self
    }

    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_destructor_callback(mut self, callback: Arc<DestructorCallback>) -> Self {
        self.destructor_callback = Some(callback);
        self
    }

    /// Freeze-time validation of the whole record tree.
    pub fn validate(&self) -> Result<()> {
        if self.block_cache.is_none() && self.big_hash.is_none() {
            return Err(Error::InvalidConfig("at least one engine is required"));
        }
        if self.scheduler.num_workers == 0 {
            return Err(Error::InvalidConfig("scheduler needs at least one worker"));
        }
        if self.max_concurrent_inserts == 0 {
            return Err(Error::InvalidConfig(
                "max concurrent inserts must be non-zero",
            ));
        }
        if self.metadata_size % u64::from(self.device.block_size) != 0 {
            return Err(Error::InvalidConfig(
                "metadata size must be block aligned",
            ));
        }
        if let Some(block_cache) = &self.block_cache {
            block_cache.validate(&self.device, self.metadata_size)?;
        }
        if let Some(big_hash) = &self.big_hash {
            big_hash.validate(&self.device, self.metadata_size)?;
            let overhead = (BUCKET_HEADER_SIZE + BUCKET_ENTRY_OVERHEAD) as u32;
            if self.small_item_max_size + overhead > big_hash.bucket_size {
                return Err(Error::InvalidConfig(
                    "small item max size does not fit a bucket",
                ));
            }
        }
        if let (Some(block_cache), Some(big_hash)) = (&self.block_cache, &self.big_hash) {
            let bc = block_cache.base_offset..block_cache.base_offset + block_cache.size;
            let bh = big_hash.base_offset..big_hash.base_offset + big_hash.size;
            if bc.start < bh.end && bh.start < bc.end {
                return Err(Error::InvalidConfig("engine device ranges overlap"));
            }
        }
        match &self.admission {
            AdmissionConfig::None => {}
            AdmissionConfig::RejectRandom { probability } => {
                if !(0.0..=1.0).contains(probability) {
                    return Err(Error::InvalidConfig(
                        "admission probability must be within [0, 1]",
                    ));
                }
            }
            AdmissionConfig::DynamicRandom { target_rate, .. } => {
                if *target_rate == 0 {
                    return Err(Error::InvalidConfig(
                        "dynamic admission needs a non-zero target rate",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> CacheConfig {
        CacheConfig::new(DeviceConfig::memory(64 * 1024 * 1024))
            .with_block_cache(BlockCacheConfig::new(0, 32 * 1024 * 1024).with_region_size(1024 * 1024))
            .with_big_hash(BigHashConfig::new(32 * 1024 * 1024, 16 * 1024 * 1024))
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn engineless_config_rejected() {
        let cfg = CacheConfig::new(DeviceConfig::memory(1024 * 1024));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overlapping_ranges_rejected() {
        let cfg = CacheConfig::new(DeviceConfig::memory(64 * 1024 * 1024))
            .with_block_cache(BlockCacheConfig::new(0, 32 * 1024 * 1024).with_region_size(1024 * 1024))
            .with_big_hash(BigHashConfig::new(16 * 1024 * 1024, 16 * 1024 * 1024));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn metadata_reservation_is_enforced() {
        let cfg = CacheConfig::new(DeviceConfig::memory(64 * 1024 * 1024))
            .with_metadata_size(4096)
            .with_block_cache(BlockCacheConfig::new(0, 32 * 1024 * 1024).with_region_size(1024 * 1024));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unaligned_region_size_rejected() {
        let cfg = CacheConfig::new(DeviceConfig::memory(64 * 1024 * 1024))
            .with_block_cache(BlockCacheConfig::new(0, 3 * 1000).with_region_size(1000));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn descending_size_classes_rejected() {
        let cfg = CacheConfig::new(DeviceConfig::memory(64 * 1024 * 1024)).with_block_cache(
            BlockCacheConfig::new(0, 32 * 1024 * 1024)
                .with_region_size(1024 * 1024)
                .with_size_classes(vec![4096, 1024]),
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn small_items_must_fit_buckets() {
        let cfg = CacheConfig::new(DeviceConfig::memory(64 * 1024 * 1024))
            .with_small_item_max_size(8192)
            .with_big_hash(BigHashConfig::new(0, 16 * 1024 * 1024));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn admission_probability_range_checked() {
        let cfg = base_config().with_admission(AdmissionConfig::RejectRandom { probability: 1.5 });
        assert!(cfg.validate().is_err());
    }
}
