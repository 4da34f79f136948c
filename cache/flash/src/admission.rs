//! Write admission policies.
//!
//! Flash endurance is the budget these policies spend: every admitted
//! insert costs device writes now and reclaim writes later. Reject-random
//! sheds a fixed fraction; dynamic-random servos its probability so the
//! observed write rate tracks a configured target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use xxhash_rust::xxh3::xxh3_64_with_seed;

const ADMISSION_HASH_SEED: u64 = 0x9a3c_55c1_70d1_4e21;

/// Decides, per insert, whether the engines should take the write.
pub trait AdmissionPolicy: Send + Sync {
    /// Whether to admit an item of `item_size` serialized bytes.
    fn accept(&self, key: &[u8], item_size: usize) -> bool;

    /// Feed back bytes actually written to the device.
    fn record_write(&self, bytes: u64) {
        let _ = bytes;
    }
}

/// Admit with a fixed probability.
pub struct RejectRandom {
    probability: f64,
    rng: Mutex<Xoshiro256PlusPlus>,
}

impl RejectRandom {
    /// `probability` is the chance an insert is admitted, in `[0, 1]`.
    pub fn new(probability: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&probability));
        Self {
            probability,
            rng: Mutex::new(Xoshiro256PlusPlus::from_entropy()),
        }
    }
}

impl AdmissionPolicy for RejectRandom {
    fn accept(&self, _key: &[u8], _item_size: usize) -> bool {
        self.probability >= 1.0 || self.rng.lock().r#gen::<f64>() < self.probability
    }
}

struct RateWindow {
    last_update: Instant,
    bytes_at_update: u64,
}

/// Admission probability servoed toward a target write rate.
///
/// The probability is adjusted once per interval by the ratio of target to
/// observed write rate, bounded per step by the configured factor range.
/// The decision itself hashes the key with its configured suffix removed,
/// so keys sharing a prefix receive identical admit/reject outcomes.
pub struct DynamicRandom {
    target_rate: u64,
    max_rate: u64,
    suffix_length: usize,
    item_base_size: u32,
    factor_lower: f64,
    factor_upper: f64,
    update_interval: Duration,
    /// Current probability, stored as f64 bits for lock-free reads.
    probability_bits: AtomicU64,
    bytes_written: AtomicU64,
    window: Mutex<RateWindow>,
}

impl DynamicRandom {
    const DEFAULT_FACTOR_LOWER: f64 = 0.5;
    const DEFAULT_FACTOR_UPPER: f64 = 2.0;
    const MIN_PROBABILITY: f64 = 0.001;

    /// Build a policy targeting `target_rate` bytes/s of device writes.
    ///
    /// Zero for `max_rate`, `factor_lower`, or `factor_upper` selects the
    /// default for that parameter.
    pub fn new(
        target_rate: u64,
        suffix_length: usize,
        item_base_size: u32,
        max_rate: u64,
        factor_lower: f64,
        factor_upper: f64,
    ) -> Self {
        Self::with_interval(
            target_rate,
            suffix_length,
            item_base_size,
            max_rate,
            factor_lower,
            factor_upper,
            Duration::from_secs(1),
        )
    }

    fn with_interval(
        target_rate: u64,
        suffix_length: usize,
        item_base_size: u32,
        max_rate: u64,
        factor_lower: f64,
        factor_upper: f64,
        update_interval: Duration,
    ) -> Self {
        debug_assert!(target_rate > 0);
        Self {
            target_rate,
            max_rate,
            suffix_length,
            item_base_size,
            factor_lower: if factor_lower > 0.0 {
                factor_lower
            } else {
                Self::DEFAULT_FACTOR_LOWER
            },
            factor_upper: if factor_upper > 0.0 {
                factor_upper
            } else {
                Self::DEFAULT_FACTOR_UPPER
            },
            update_interval,
            probability_bits: AtomicU64::new(1.0f64.to_bits()),
            bytes_written: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                last_update: Instant::now(),
                bytes_at_update: 0,
            }),
        }
    }

    /// Current admission probability.
    pub fn probability(&self) -> f64 {
        f64::from_bits(self.probability_bits.load(Ordering::Acquire))
    }

    /// Re-derive the probability if an interval has elapsed. Contention is
    /// shed rather than waited out; one caller per interval does the work.
    fn maybe_update(&self) {
        let Some(mut window) = self.window.try_lock() else {
            return;
        };
        let elapsed = window.last_update.elapsed();
        if elapsed < self.update_interval {
            return;
        }

        let written = self.bytes_written.load(Ordering::Relaxed);
        let delta = written.saturating_sub(window.bytes_at_update);
        let observed = (delta as f64 / elapsed.as_secs_f64()).max(1.0);

        let factor =
            (self.target_rate as f64 / observed).clamp(self.factor_lower, self.factor_upper);
        let mut probability = self.probability() * factor;
        if self.max_rate > 0 && observed > self.max_rate as f64 {
            probability *= self.max_rate as f64 / observed;
        }
        let probability = probability.clamp(Self::MIN_PROBABILITY, 1.0);

        self.probability_bits
            .store(probability.to_bits(), Ordering::Release);
        window.last_update = Instant::now();
        window.bytes_at_update = written;
    }

    fn decision_hash(&self, key: &[u8]) -> f64 {
        let keep = key.len().saturating_sub(self.suffix_length);
        let hash = xxh3_64_with_seed(&key[..keep], ADMISSION_HASH_SEED);
        hash as f64 / u64::MAX as f64
    }
}

impl AdmissionPolicy for DynamicRandom {
    fn accept(&self, key: &[u8], item_size: usize) -> bool {
        self.maybe_update();
        let mut probability = self.probability();
        if self.item_base_size > 0 && item_size > self.item_base_size as usize {
            // Larger items pay for their extra write bandwidth with a
            // proportionally lower admission chance.
            probability *= f64::from(self.item_base_size) / item_size as f64;
        }
        self.decision_hash(key) < probability
    }

    fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }
}
