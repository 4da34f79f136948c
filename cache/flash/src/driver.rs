//! The engine driver: admission, throttles, routing, and the job plane.
//!
//! An insert is admitted (or not) synchronously, then runs as a job keyed
//! by the key's hash; lookups and removes submit on the same hash and wait
//! for their job, so every operation on one key observes all operations
//! submitted before it. Across keys nothing is ordered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::admission::{AdmissionPolicy, DynamicRandom, RejectRandom};
use crate::bighash::BigHash;
use crate::block::BlockCache;
use crate::config::{AdmissionConfig, CacheConfig};
use crate::error::{Result, Status};
use crate::metrics;
use crate::scheduler::{JobExitCode, JobScheduler};

/// One-shot rendezvous between a blocking caller and its job.
struct WaitCell<T> {
    slot: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T> WaitCell<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn put(&self, value: T) {
        *self.slot.lock() = Some(value);
        self.cv.notify_one();
    }

    fn take(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.cv.wait_for(&mut slot, Duration::from_millis(10));
        }
    }
}

struct Throttles {
    max_parcel_memory: u64,
    parcel_memory: AtomicU64,
    max_concurrent_inserts: u32,
    concurrent_inserts: AtomicU32,
}

impl Throttles {
    /// Reserve an insert's parcel, or say why not. Never blocks.
    fn admit(&self, parcel_bytes: u64) -> Status {
        let inserts = self.concurrent_inserts.fetch_add(1, Ordering::AcqRel);
        if inserts >= self.max_concurrent_inserts {
            self.concurrent_inserts.fetch_sub(1, Ordering::AcqRel);
            return Status::QueueFull;
        }
        let parcels = self.parcel_memory.fetch_add(parcel_bytes, Ordering::AcqRel);
        if parcels + parcel_bytes > self.max_parcel_memory {
            self.parcel_memory.fetch_sub(parcel_bytes, Ordering::AcqRel);
            self.concurrent_inserts.fetch_sub(1, Ordering::AcqRel);
            return Status::QueueFull;
        }
        metrics::PARCEL_MEMORY.add(parcel_bytes as i64);
        Status::Ok
    }

    fn release(&self, parcel_bytes: u64) {
        self.parcel_memory.fetch_sub(parcel_bytes, Ordering::AcqRel);
        self.concurrent_inserts.fetch_sub(1, Ordering::AcqRel);
        metrics::PARCEL_MEMORY.sub(parcel_bytes as i64);
    }
}

/// The hybrid flash cache: block cache for medium objects, big hash for
/// small ones, one scheduler in front of both.
pub struct FlashCache {
    scheduler: Arc<JobScheduler>,
    block: Option<Arc<BlockCache>>,
    bighash: Option<Arc<BigHash>>,
    admission: Option<Arc<dyn AdmissionPolicy>>,
    small_item_max_size: u32,
    throttles: Arc<Throttles>,
}

enum Route {
    Small,
    Large,
}

impl FlashCache {
    /// Build a cache from a frozen configuration.
    pub fn create(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let device = Arc::new(config.device.build()?);
        let scheduler = Arc::new(JobScheduler::new(
            config.scheduler.num_workers,
            config.scheduler.num_shards,
        ));
        let destructor = config.destructor_callback.clone();

        let block = config.block_cache.as_ref().map(|cfg| {
            BlockCache::new(
                cfg,
                Arc::clone(&device),
                Arc::clone(&scheduler),
                destructor.clone(),
            )
        });
        let bighash = config
            .big_hash
            .as_ref()
            .map(|cfg| BigHash::new(cfg, Arc::clone(&device), destructor.clone()));

        let admission: Option<Arc<dyn AdmissionPolicy>> = match &config.admission {
            AdmissionConfig::None => None,
            AdmissionConfig::RejectRandom { probability } => {
                Some(Arc::new(RejectRandom::new(*probability)))
            }
            AdmissionConfig::DynamicRandom {
                target_rate,
                suffix_length,
                item_base_size,
                max_rate,
                factor_lower_bound,
                factor_upper_bound,
            } => Some(Arc::new(DynamicRandom::new(
                *target_rate,
                *suffix_length,
                *item_base_size,
                *max_rate,
                *factor_lower_bound,
                *factor_upper_bound,
            ))),
        };

        info!(
            block_cache = block.is_some(),
            big_hash = bighash.is_some(),
            workers = config.scheduler.num_workers,
            "flash cache created"
        );

        Ok(Self {
            scheduler,
            block,
            bighash,
            admission,
            small_item_max_size: config.small_item_max_size,
            throttles: Arc::new(Throttles {
                max_parcel_memory: config.max_parcel_memory,
                parcel_memory: AtomicU64::new(0),
                max_concurrent_inserts: config.max_concurrent_inserts,
                concurrent_inserts: AtomicU32::new(0),
            }),
        })
    }

    fn route(&self, serialized_size: usize) -> Option<Route> {
        let small = serialized_size <= self.small_item_max_size as usize;
        if small && self.bighash.is_some() {
            Some(Route::Small)
        } else if self.block.is_some() {
            Some(Route::Large)
        } else {
            None
        }
    }

    /// Insert a key/value pair. `Ok` means the parcel was accepted and
    /// will be applied in submission order for its key; `Rejected` and
    /// `QueueFull` are statuses, not failures.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Status {
        let serialized = key.len() + value.len();
        let Some(route) = self.route(serialized) else {
            return Status::Rejected;
        };

        if let Some(policy) = &self.admission {
            if !policy.accept(key, serialized) {
                metrics::ADMISSION_REJECTS.increment();
                return Status::Rejected;
            }
        }

        let parcel_bytes = serialized as u64;
        let admitted = self.throttles.admit(parcel_bytes);
        if admitted != Status::Ok {
            metrics::QUEUE_REJECTS.increment();
            return admitted;
        }

        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);
        let hash = xxh3_64(&key);
        let throttles = Arc::clone(&self.throttles);
        let admission = self.admission.clone();
        let block = self.block.clone();
        let bighash = self.bighash.clone();

        let enqueued = self.scheduler.enqueue_with_key(hash, "insert", move || {
            let status = match route {
                Route::Small => bighash
                    .as_ref()
                    .map(|engine| engine.insert(&key, &value))
                    .unwrap_or(Status::Rejected),
                Route::Large => block
                    .as_ref()
                    .map(|engine| engine.insert(&key, &value))
                    .unwrap_or(Status::Rejected),
            };
            if status == Status::Ok {
                // A key re-inserted at a different size changes engines;
                // drop any copy the other engine still holds.
                match route {
                    Route::Small => {
                        if let Some(engine) = &block {
                            engine.remove(&key);
                        }
                    }
                    Route::Large => {
                        if let Some(engine) = &bighash {
                            engine.remove(&key);
                        }
                    }
                }
                if let Some(policy) = &admission {
                    policy.record_write((key.len() + value.len()) as u64);
                }
            }
            throttles.release(parcel_bytes);
            JobExitCode::Done
        });
        if !enqueued {
            self.throttles.release(parcel_bytes);
            return Status::Rejected;
        }
        metrics::INSERTS.increment();
        Status::Ok
    }

    /// Read a key into `out`, observing every earlier operation on it.
    pub fn lookup(&self, key: &[u8], out: &mut Vec<u8>) -> Status {
        metrics::LOOKUPS.increment();
        let cell = Arc::new(WaitCell::new());
        let result = Arc::clone(&cell);
        let owned_key = Bytes::copy_from_slice(key);
        let hash = xxh3_64(&owned_key);
        let block = self.block.clone();
        let bighash = self.bighash.clone();

        let enqueued = self.scheduler.enqueue_with_key(hash, "lookup", move || {
            let mut value = Vec::new();
            let mut status = Status::NotFound;
            // A key may live in either engine depending on the size it was
            // inserted with; the small engine answers first.
            if let Some(engine) = &bighash {
                status = engine.lookup(&owned_key, &mut value);
            }
            if status == Status::NotFound {
                if let Some(engine) = &block {
                    status = engine.lookup(&owned_key, &mut value);
                }
            }
            result.put((status, value));
            JobExitCode::Done
        });
        if !enqueued {
            return Status::Rejected;
        }

        let (status, value) = cell.take();
        if status == Status::Ok {
            metrics::HITS.increment();
            *out = value;
        }
        status
    }

    /// Remove a key, observing every earlier operation on it.
    pub fn remove(&self, key: &[u8]) -> Status {
        metrics::REMOVES.increment();
        let cell = Arc::new(WaitCell::new());
        let result = Arc::clone(&cell);
        let owned_key = Bytes::copy_from_slice(key);
        let hash = xxh3_64(&owned_key);
        let block = self.block.clone();
        let bighash = self.bighash.clone();

        let enqueued = self.scheduler.enqueue_with_key(hash, "remove", move || {
            let mut status = Status::NotFound;
            if let Some(engine) = &bighash {
                status = engine.remove(&owned_key);
            }
            if status == Status::NotFound {
                if let Some(engine) = &block {
                    status = engine.remove(&owned_key);
                }
            }
            result.put(status);
            JobExitCode::Done
        });
        if !enqueued {
            return Status::Rejected;
        }
        cell.take()
    }

    /// Drain in-flight jobs and push open block-cache regions to the
    /// device.
    pub fn flush(&self) {
        self.scheduler.wait_until_idle();
        if let Some(block) = &self.block {
            block.flush();
        }
    }

    /// Flush, then stop the scheduler; subsequent operations return
    /// `Rejected`.
    pub fn shutdown(&self) {
        self.flush();
        self.scheduler.finish();
    }

    /// Live entries across both engines.
    pub fn items(&self) -> u64 {
        let block = self.block.as_ref().map(|e| e.items() as u64).unwrap_or(0);
        let small = self.bighash.as_ref().map(|e| e.items()).unwrap_or(0);
        block + small
    }
}
