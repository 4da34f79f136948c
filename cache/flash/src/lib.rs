//! Flash engine pair behind an asynchronous job scheduler.
//!
//! This crate is the flash side of the hybrid cache: a block cache for
//! medium objects and a big hash for small ones, sharing one device and
//! one cooperative scheduler, multiplexed by a driver that owns admission
//! and back-pressure.
//!
//! # Architecture
//!
//! ```text
//! +------------------------------------------------------+
//! |                     FlashCache                       |
//! |   admission | parcel memory | concurrent inserts     |
//! +-----------------------+------------------------------+
//!                         |
//!                 +-------v-------+
//!                 | JobScheduler  |   per-key FIFO shards
//!                 +---+-------+---+
//!                     |       |
//!          +----------v-+   +-v----------+
//!          | BlockCache |   |  BigHash   |
//!          | regions,   |   | buckets,   |
//!          | reclaim    |   | bloom      |
//!          +----------+-+   +-+----------+
//!                     |       |
//!                 +---v-------v---+
//!                 |    Device     |   file | raid-0 | memory
//!                 +---------------+
//! ```
//!
//! Items whose serialized size is at most the configured small-item limit
//! route to the big hash; everything else goes to the block cache. All
//! configuration is tagged-variant records validated once, when
//! [`create_cache`] freezes them into a [`FlashCache`].
//!
//! # Example
//!
//! ```ignore
//! use cache_flash::{BigHashConfig, BlockCacheConfig, CacheConfig, DeviceConfig};
//!
//! let config = CacheConfig::new(DeviceConfig::file("/mnt/flash/cache", 64 << 30))
//!     .with_metadata_size(1 << 20)
//!     .with_block_cache(BlockCacheConfig::new(1 << 20, 48 << 30))
//!     .with_big_hash(BigHashConfig::new((1 << 20) + (48u64 << 30), 16 << 30).with_bloom_filter(4, 1024));
//!
//! let cache = cache_flash::create_cache(config)?;
//! let accepted = cache.insert(b"key", b"value");
//! ```

#![warn(clippy::all)]

mod admission;
mod bighash;
mod block;
mod config;
mod device;
mod driver;
mod error;
pub mod metrics;
mod scheduler;

pub use admission::{AdmissionPolicy, DynamicRandom, RejectRandom};
pub use config::{
    AdmissionConfig, BigHashConfig, BlockCacheConfig, BloomConfig, CacheConfig, DestructorCallback,
    DestructorEvent, DeviceConfig, DeviceKind, EvictionConfig, ReinsertionConfig, SchedulerConfig,
};
pub use device::{Device, DeviceEncryptor};
pub use driver::FlashCache;
pub use error::{Error, Result, Status};
pub use scheduler::{JobExitCode, JobScheduler};

/// Consume a frozen configuration and produce the cache.
pub fn create_cache(config: CacheConfig) -> Result<FlashCache> {
    FlashCache::create(config)
}
