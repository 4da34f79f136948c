//! Per-tier slab allocator.
//!
//! The allocator owns one arena and carves it into slab-aligned regions on
//! demand. Carving is monotonic: slabs are never returned to the tier, so
//! the free list for individual allocations lives one layer up, in the item
//! layer. Pointer compression and decompression are pure arithmetic over
//! the arena base and are safe for any number of concurrent readers.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::arena::{Arena, TierBacking};
use crate::compressed::{CompressedPtr, MAX_SLAB_IDX};
use crate::error::{MemoryError, MemoryResult};
use crate::slab::{MIN_ALLOC_BITS, MIN_ALLOC_SIZE, SLAB_SIZE, SLAB_SIZE_BITS, Slab};

/// Slab allocator for one memory tier.
#[derive(Debug)]
pub struct SlabAllocator {
    arena: Arena,
    num_slabs: usize,
    /// Number of slabs handed out so far.
    carved: AtomicUsize,
    /// Serializes carving; compression paths never take it.
    carve_lock: Mutex<()>,
}

impl SlabAllocator {
    /// Wrap an arena whose length is a whole number of slabs.
    pub fn new(arena: Arena) -> Self {
        debug_assert_eq!(arena.len() % SLAB_SIZE, 0, "arena not slab-aligned");
        let num_slabs = arena.len() >> SLAB_SIZE_BITS;
        debug_assert!(
            num_slabs < MAX_SLAB_IDX as usize,
            "arena exceeds addressable slabs"
        );
        Self {
            arena,
            num_slabs,
            carved: AtomicUsize::new(0),
            carve_lock: Mutex::new(()),
        }
    }

    /// Map a backing of `size` bytes (rounded up to whole slabs) and wrap
    /// it into an allocator.
    pub fn create(backing: &TierBacking, size: usize) -> std::io::Result<Self> {
        let rounded = size.div_ceil(SLAB_SIZE) * SLAB_SIZE;
        let arena = Arena::create(backing, rounded)?;
        Ok(Self::new(arena))
    }

    /// Carve the next slab from the arena.
    ///
    /// Returns `OutOfMemory` once the tier's capacity is exhausted; slabs
    /// are never handed back.
    pub fn carve_slab(&self) -> MemoryResult<Slab> {
        let _guard = self.carve_lock.lock();
        let idx = self.carved.load(Ordering::Relaxed);
        if idx >= self.num_slabs {
            return Err(MemoryError::OutOfMemory);
        }
        self.carved.store(idx + 1, Ordering::Release);
        // SAFETY: idx is below num_slabs, so the offset stays inside the
        // arena mapping.
        let ptr = unsafe { self.arena.as_ptr().add(idx << SLAB_SIZE_BITS) };
        Ok(Slab::new(ptr))
    }

    /// Number of slabs this tier can hold.
    #[inline]
    pub fn num_slabs(&self) -> usize {
        self.num_slabs
    }

    /// Number of slabs carved so far.
    #[inline]
    pub fn carved_slabs(&self) -> usize {
        self.carved.load(Ordering::Acquire)
    }

    /// Tier capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Whether `ptr` points into this tier's arena.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.arena.contains(ptr)
    }

    /// Compress an address inside this arena. The tier bits of the result
    /// are zero; [`PtrCompressor`] stamps the tier ordinal.
    ///
    /// The address must lie within the arena and be aligned to the minimum
    /// allocation size; violations are debug assertions only.
    ///
    /// [`PtrCompressor`]: crate::PtrCompressor
    #[inline]
    pub fn compress(&self, ptr: *const u8) -> CompressedPtr {
        debug_assert!(self.contains(ptr), "pointer outside arena");
        let offset = ptr as usize - self.arena.as_ptr() as usize;
        debug_assert_eq!(offset % MIN_ALLOC_SIZE, 0, "pointer under-aligned");
        let slab_idx = (offset >> SLAB_SIZE_BITS) as u32;
        let alloc_idx = ((offset & (SLAB_SIZE - 1)) >> MIN_ALLOC_BITS) as u32;
        CompressedPtr::compress(slab_idx, alloc_idx, 0)
    }

    /// Decompress the intra-tier part of a pointer back to an address.
    ///
    /// The pointer must be non-null and must have been produced against
    /// this tier's shape.
    #[inline]
    pub fn decompress(&self, ptr: CompressedPtr) -> *mut u8 {
        debug_assert!(!ptr.is_null());
        let offset = ((ptr.slab_idx() as usize) << SLAB_SIZE_BITS)
            + ((ptr.alloc_idx() as usize) << MIN_ALLOC_BITS);
        debug_assert!(offset < self.arena.len(), "pointer outside arena");
        // SAFETY: offset is within the arena mapping, checked above in
        // debug builds and guaranteed by the compression contract.
        unsafe { self.arena.as_ptr().add(offset) }
    }
}
