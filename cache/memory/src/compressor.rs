//! Pointer compression across the ordered tier array.
//!
//! Cross-item references inside the cache never hold native addresses;
//! they go through a compressor so links persisted in a tier arena survive
//! restarts and remain valid regardless of where each arena gets mapped.

use std::sync::Arc;

use crate::allocator::SlabAllocator;
use crate::compressed::CompressedPtr;

/// Compresses and decompresses pointers across every tier of the cache.
///
/// The tier array is immutable for the cache's lifetime; a compressor is a
/// cheap read-only view and any number of them may run concurrently.
#[derive(Debug, Clone)]
pub struct PtrCompressor {
    tiers: Arc<[SlabAllocator]>,
}

impl PtrCompressor {
    /// Wrap the ordered tier-allocator array.
    pub fn new(tiers: Arc<[SlabAllocator]>) -> Self {
        Self { tiers }
    }

    /// Compress a native address into a `(tier, slab, alloc)` word.
    ///
    /// A null address compresses to the null sentinel. A non-null address
    /// that lies in no tier is a programmer error.
    #[inline]
    pub fn compress(&self, ptr: *const u8) -> CompressedPtr {
        if ptr.is_null() {
            return CompressedPtr::null();
        }
        for (tid, tier) in self.tiers.iter().enumerate() {
            if tier.contains(ptr) {
                let mut compressed = tier.compress(ptr);
                compressed.set_tier_id(tid as u32);
                return compressed;
            }
        }
        panic!("pointer does not belong to any tier");
    }

    /// Decompress a word back to a native address; the null sentinel maps
    /// to the null address.
    #[inline]
    pub fn decompress(&self, ptr: CompressedPtr) -> *mut u8 {
        if ptr.is_null() {
            return std::ptr::null_mut();
        }
        self.tiers[ptr.tier_id() as usize].decompress(ptr)
    }

    /// Number of tiers this compressor routes across.
    #[inline]
    pub fn num_tiers(&self) -> usize {
        self.tiers.len()
    }
}

impl PartialEq for PtrCompressor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tiers, &other.tiers)
    }
}

impl Eq for PtrCompressor {}

/// Compressor bound to a single tier, for callers that know their tier.
///
/// The tier bits of compressed output stay zero; this is the form
/// [`PtrCompressor`] stamps a tier ordinal onto.
pub struct SingleTierPtrCompressor<'a> {
    allocator: &'a SlabAllocator,
}

impl<'a> SingleTierPtrCompressor<'a> {
    /// Bind to one tier's allocator.
    pub fn new(allocator: &'a SlabAllocator) -> Self {
        Self { allocator }
    }

    /// Compress an address within the bound tier.
    #[inline]
    pub fn compress(&self, ptr: *const u8) -> CompressedPtr {
        if ptr.is_null() {
            return CompressedPtr::null();
        }
        self.allocator.compress(ptr)
    }

    /// Decompress a word produced against the bound tier.
    #[inline]
    pub fn decompress(&self, ptr: CompressedPtr) -> *mut u8 {
        if ptr.is_null() {
            return std::ptr::null_mut();
        }
        self.allocator.decompress(ptr)
    }
}

impl PartialEq for SingleTierPtrCompressor<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.allocator, other.allocator)
    }
}

impl Eq for SingleTierPtrCompressor<'_> {}
