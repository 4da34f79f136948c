//! Flash engine metrics.

use metriken::{Counter, Gauge, metric};

// Driver
#[metric(name = "flash_inserts", description = "Inserts accepted by the driver")]
pub static INSERTS: Counter = Counter::new();

#[metric(
    name = "flash_admission_rejects",
    description = "Inserts declined by the admission policy"
)]
pub static ADMISSION_REJECTS: Counter = Counter::new();

#[metric(
    name = "flash_queue_rejects",
    description = "Inserts declined by the parcel or concurrency throttles"
)]
pub static QUEUE_REJECTS: Counter = Counter::new();

#[metric(name = "flash_lookups", description = "Lookups submitted")]
pub static LOOKUPS: Counter = Counter::new();

#[metric(name = "flash_hits", description = "Lookups that returned a value")]
pub static HITS: Counter = Counter::new();

#[metric(name = "flash_removes", description = "Removes submitted")]
pub static REMOVES: Counter = Counter::new();

#[metric(
    name = "flash_parcel_memory",
    description = "Bytes of queued key/value parcels"
)]
pub static PARCEL_MEMORY: Gauge = Gauge::new();

// Block cache
#[metric(
    name = "block_regions_reclaimed",
    description = "Regions returned to the clean pool by reclaim"
)]
pub static REGIONS_RECLAIMED: Counter = Counter::new();

#[metric(
    name = "block_items_recycled",
    description = "Items dropped during region reclaim"
)]
pub static ITEMS_RECYCLED: Counter = Counter::new();

#[metric(
    name = "block_items_reinserted",
    description = "Items re-appended during region reclaim"
)]
pub static ITEMS_REINSERTED: Counter = Counter::new();

#[metric(
    name = "block_checksum_errors",
    description = "Entries dropped on checksum mismatch"
)]
pub static CHECKSUM_ERRORS: Counter = Counter::new();

// Big hash
#[metric(
    name = "bighash_bloom_rejects",
    description = "Lookups answered by the Bloom filter without a bucket read"
)]
pub static BLOOM_REJECTS: Counter = Counter::new();

#[metric(
    name = "bighash_evictions",
    description = "Entries evicted by in-bucket FIFO overflow"
)]
pub static BIGHASH_EVICTIONS: Counter = Counter::new();

// Device
#[metric(name = "device_read_errors", description = "Failed device reads")]
pub static DEVICE_READ_ERRORS: Counter = Counter::new();

#[metric(name = "device_write_errors", description = "Failed device writes")]
pub static DEVICE_WRITE_ERRORS: Counter = Counter::new();
