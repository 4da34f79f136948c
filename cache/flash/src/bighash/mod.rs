//! Bucket-structured store for small objects.
//!
//! The device range is divided into fixed-size buckets addressed by key
//! hash; every operation reads or rewrites one whole bucket under that
//! bucket's lock. An optional per-bucket Bloom filter answers most
//! negative lookups without touching the device.

mod bloom;
mod bucket;
mod engine;

pub use engine::BigHash;
pub(crate) use bucket::{BUCKET_ENTRY_OVERHEAD, BUCKET_HEADER_SIZE};
