//! End-to-end tests over the public tier + compressed pointer surface.

use std::sync::Arc;

use cache_memory::{
    CacheLayoutConfig, CompressedPtr, MIN_ALLOC_SIZE, MemoryTierConfig, PtrCompressor, SLAB_SIZE,
    SlabAllocator,
};

#[test]
fn pointers_roundtrip_across_configured_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = CacheLayoutConfig::new();
    cfg.use_posix_for_shm();
    cfg.configure_tiers(vec![
        MemoryTierConfig::anonymous().with_size(2 * SLAB_SIZE),
        MemoryTierConfig::file(dir.path().join("tier1")).with_size(SLAB_SIZE),
    ])
    .unwrap();
    cfg.validate().unwrap();

    let tiers = cfg.build_tiers().unwrap();
    let compressor = PtrCompressor::new(Arc::clone(&tiers));

    let slab_a = tiers[0].carve_slab().unwrap();
    let slab_b = tiers[1].carve_slab().unwrap();

    // SAFETY: indexes are within each slab.
    let addr_a = unsafe { slab_a.alloc_ptr(12) };
    let addr_b = unsafe { slab_b.alloc_ptr(34) };

    let pa = compressor.compress(addr_a);
    let pb = compressor.compress(addr_b);
    assert_eq!(pa.tier_id(), 0);
    assert_eq!(pb.tier_id(), 1);
    assert_eq!(compressor.decompress(pa), addr_a);
    assert_eq!(compressor.decompress(pb), addr_b);
}

#[test]
fn persisted_words_stay_valid_across_remap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pmem-tier");
    let payload = b"linked-from-elsewhere";

    let raw = {
        let tier = SlabAllocator::create(
            &cache_memory::TierBacking::File { path: path.clone() },
            SLAB_SIZE,
        )
        .unwrap();
        let slab = tier.carve_slab().unwrap();
        // SAFETY: allocation 7 is within the slab and fits the payload.
        let addr = unsafe { slab.alloc_ptr(7) };
        assert!(payload.len() <= MIN_ALLOC_SIZE);
        // SAFETY: in-bounds write of the payload into the allocation.
        unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), addr, payload.len()) };
        tier.compress(addr).raw()
    };

    // Remap the same file: the arena may land at a different address, but
    // the compressed word still names the same allocation.
    let tier = SlabAllocator::create(&cache_memory::TierBacking::File { path }, SLAB_SIZE).unwrap();
    let addr = tier.decompress(CompressedPtr::from_raw(raw));
    let mut read_back = [0u8; 21];
    // SAFETY: the allocation was written before the remap and stays inside
    // the arena.
    unsafe { std::ptr::copy_nonoverlapping(addr, read_back.as_mut_ptr(), read_back.len()) };
    assert_eq!(&read_back, payload);
}
