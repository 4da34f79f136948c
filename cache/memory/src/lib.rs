//! Tiered slab memory with compressed intra-cache pointers.
//!
//! This crate provides the memory side of the hybrid cache: an ordered set
//! of memory tiers (DRAM, file-backed, shared-memory, or dax-device), each
//! owning one contiguous arena that is carved into fixed-size slabs, and a
//! 64-bit compressed pointer encoding `(tier, slab, alloc)` so that links
//! stored inside a tier remain valid across restarts.
//!
//! # Architecture
//!
//! ```text
//! +---------------------------------------------------+
//! |                  PtrCompressor                    |
//! |      compress / decompress across all tiers       |
//! +---------------------------------------------------+
//!        |                  |                  |
//!        v                  v                  v
//! +-------------+    +-------------+    +-------------+
//! | SlabAlloc 0 |    | SlabAlloc 1 |    | SlabAlloc 2 |
//! | (dram)      |    | (dax)       |    | (file)      |
//! | +---------+ |    | +---------+ |    | +---------+ |
//! | |  Arena  | |    | |  Arena  | |    | |  Arena  | |
//! | | slab .. | |    | | slab .. | |    | | slab .. | |
//! | +---------+ |    | +---------+ |    | +---------+ |
//! +-------------+    +-------------+    +-------------+
//! ```
//!
//! Tier identity is positional: tier `i` is the `i`-th entry of the ordered
//! tier list, and that ordinal is what a compressed pointer stores. The tier
//! list is fixed at construction; compressed pointers persisted inside a
//! file-backed or dax arena stay meaningful across restarts only while the
//! tier list, tier sizes, and the slab constants are unchanged.
//!
//! # Example
//!
//! ```ignore
//! use cache_memory::{CacheLayoutConfig, MemoryTierConfig, PtrCompressor};
//!
//! let mut config = CacheLayoutConfig::new();
//! config.set_cache_size(2 * 1024 * 1024 * 1024)?;
//! config.configure_tiers(vec![
//!     MemoryTierConfig::dax("/dev/dax0.0").with_ratio(5),
//!     MemoryTierConfig::file("/mnt/pmem/tier1").with_ratio(2),
//! ])?;
//!
//! let tiers = config.build_tiers()?;
//! let compressor = PtrCompressor::new(tiers);
//! ```

#![warn(clippy::all)]

mod allocator;
mod arena;
mod compressed;
mod compressor;
mod error;
mod slab;
mod tier;

pub use allocator::SlabAllocator;
pub use arena::{Arena, TierBacking};
pub use compressed::CompressedPtr;
pub use compressor::{PtrCompressor, SingleTierPtrCompressor};
pub use error::{MemoryError, MemoryResult};
pub use slab::{
    ALLOC_IDX_BITS, ALLOCS_PER_SLAB, MIN_ALLOC_BITS, MIN_ALLOC_SIZE, SLAB_SIZE, SLAB_SIZE_BITS,
    Slab,
};
pub use tier::{CacheLayoutConfig, MemoryTierConfig};
