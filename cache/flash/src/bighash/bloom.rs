//! Per-bucket Bloom filters over one flat atomic bit array.
//!
//! Readers test bits lock-free; all mutation happens under the owning
//! bucket's lock, so a filter is always a superset of its bucket's keys
//! and a negative answer is definitive.

use std::sync::atomic::{AtomicU64, Ordering};

use xxhash_rust::xxh3::xxh3_64_with_seed;

const SEED_STRIDE: u64 = 0x9e37_79b9_7f4a_7c15;

pub(crate) struct BloomFilter {
    num_hashes: u32,
    bits_per_filter: u64,
    words_per_filter: usize,
    words: Vec<AtomicU64>,
}

impl BloomFilter {
    pub(crate) fn new(num_filters: u64, num_hashes: u32, bits_per_filter: u32) -> Self {
        let words_per_filter = (bits_per_filter as usize).div_ceil(64);
        let total = words_per_filter * num_filters as usize;
        let words = (0..total).map(|_| AtomicU64::new(0)).collect();
        Self {
            num_hashes,
            bits_per_filter: u64::from(bits_per_filter),
            words_per_filter,
            words,
        }
    }

    fn bit_of(&self, key: &[u8], hash_idx: u32) -> u64 {
        let seed = u64::from(hash_idx + 1).wrapping_mul(SEED_STRIDE);
        xxh3_64_with_seed(key, seed) % self.bits_per_filter
    }

    /// Record `key` in `filter`.
    pub(crate) fn set(&self, filter: u64, key: &[u8]) {
        let base = filter as usize * self.words_per_filter;
        for hash_idx in 0..self.num_hashes {
            let bit = self.bit_of(key, hash_idx);
            let word = &self.words[base + (bit / 64) as usize];
            word.fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    /// Whether `key` may be present in `filter`. False is definitive.
    pub(crate) fn test(&self, filter: u64, key: &[u8]) -> bool {
        let base = filter as usize * self.words_per_filter;
        for hash_idx in 0..self.num_hashes {
            let bit = self.bit_of(key, hash_idx);
            let word = self.words[base + (bit / 64) as usize].load(Ordering::Relaxed);
            if word & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Reset `filter` ahead of a rebuild from surviving keys.
    pub(crate) fn clear(&self, filter: u64) {
        let base = filter as usize * self.words_per_filter;
        for word in &self.words[base..base + self.words_per_filter] {
            word.store(0, Ordering::Relaxed);
        }
    }
}
