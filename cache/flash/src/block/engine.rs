//! The block cache engine.
//!
//! Medium objects append into the open region of their allocator (one
//! allocator in stack mode, one per size class otherwise). Sealed regions
//! flush to the device whole and enter the eviction policy's order; the
//! reclaim path reads a victim region back, re-appends the items the
//! reinsertion policy keeps, drops the rest, and returns the region to the
//! clean pool.
//!
//! The in-memory index maps the key's 64-bit hash to `(region, offset,
//! slot, hits)`. Reads verify the stored key (and checksum, when enabled)
//! against the request, so a hash collision or a raced reclaim surfaces as
//! a miss, never as wrong bytes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::eviction::{EvictionPolicy, FifoPolicy, LruPolicy, SegmentedFifoPolicy};
use super::region::{
    ENTRY_HEADER_SIZE, EntryHeader, Region, RegionState, checksum_entry, stack_slot_size,
};
use super::reinsertion::ReinsertionPolicy;
use crate::config::{BlockCacheConfig, DestructorCallback, DestructorEvent, EvictionConfig};
use crate::device::Device;
use crate::error::Status;
use crate::metrics;
use crate::scheduler::{JobExitCode, JobScheduler};

const INDEX_SHARDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    region: u32,
    offset: u32,
    size: u32,
    hits: u8,
}

/// Sharded hash -> location map. Lock scope is one shard; the reclaim
/// loop's conditional updates keep raced lookups and inserts coherent.
struct Index {
    shards: Vec<RwLock<HashMap<u64, IndexEntry, RandomState>>>,
}

impl Index {
    fn new() -> Self {
        Self {
            shards: (0..INDEX_SHARDS)
                .map(|_| RwLock::new(HashMap::with_hasher(RandomState::new())))
                .collect(),
        }
    }

    fn shard(&self, hash: u64) -> &RwLock<HashMap<u64, IndexEntry, RandomState>> {
        &self.shards[(hash as usize) & (INDEX_SHARDS - 1)]
    }

    fn insert(&self, hash: u64, entry: IndexEntry) -> Option<IndexEntry> {
        self.shard(hash).write().insert(hash, entry)
    }

    fn get(&self, hash: u64) -> Option<IndexEntry> {
        self.shard(hash).read().get(&hash).copied()
    }

    /// Look up and bump the hit counter.
    fn touch(&self, hash: u64) -> Option<IndexEntry> {
        let mut shard = self.shard(hash).write();
        let entry = shard.get_mut(&hash)?;
        entry.hits = entry.hits.saturating_add(1);
        Some(*entry)
    }

    /// Remove only if the entry still points at the given location.
    fn remove_if_at(&self, hash: u64, region: u32, offset: u32) -> bool {
        let mut shard = self.shard(hash).write();
        match shard.get(&hash) {
            Some(entry) if entry.region == region && entry.offset == offset => {
                shard.remove(&hash);
                true
            }
            _ => false,
        }
    }

    /// Replace only if the entry still points at the given location.
    fn replace_if_at(&self, hash: u64, region: u32, offset: u32, new: IndexEntry) -> bool {
        let mut shard = self.shard(hash).write();
        match shard.get_mut(&hash) {
            Some(entry) if entry.region == region && entry.offset == offset => {
                *entry = new;
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

struct RegionAllocator {
    /// Fixed slot size for this allocator's regions; zero in stack mode.
    class_size: u32,
    /// The single open region, if any.
    open: Mutex<Option<u32>>,
}

enum AppendOutcome {
    Done { region: u32, offset: u32 },
    /// The open region filled up and was sealed; retry on a fresh one.
    Sealed,
    NoCleanRegion,
}

/// Region-structured log engine for medium objects.
pub struct BlockCache {
    /// Self-handle for jobs submitted to the scheduler.
    me: Weak<BlockCache>,
    device: Arc<Device>,
    scheduler: Arc<JobScheduler>,
    base_offset: u64,
    region_size: u32,
    checksum: bool,
    read_buffer_size: u32,
    clean_pool_target: u32,
    num_in_mem_buffers: u32,
    regions: Vec<Region>,
    clean: Mutex<VecDeque<u32>>,
    policy: Box<dyn EvictionPolicy>,
    reinsertion: ReinsertionPolicy,
    allocators: Vec<RegionAllocator>,
    index: Index,
    destructor: Option<Arc<DestructorCallback>>,
    in_flight_flushes: AtomicU32,
    reclaims_scheduled: AtomicU32,
}

impl BlockCache {
    pub(crate) fn new(
        config: &BlockCacheConfig,
        device: Arc<Device>,
        scheduler: Arc<JobScheduler>,
        destructor: Option<Arc<DestructorCallback>>,
    ) -> Arc<Self> {
        let num_regions = (config.size / u64::from(config.region_size)) as u32;
        let regions = (0..num_regions).map(|_| Region::new()).collect();
        let clean = (0..num_regions).collect();

        let policy: Box<dyn EvictionPolicy> = match &config.eviction {
            EvictionConfig::Lru => Box::new(LruPolicy::new()),
            EvictionConfig::Fifo => Box::new(FifoPolicy::new()),
            EvictionConfig::SegmentedFifo { segment_ratio } => {
                Box::new(SegmentedFifoPolicy::new(segment_ratio.clone()))
            }
        };

        let allocators = if config.size_classes.is_empty() {
            vec![RegionAllocator {
                class_size: 0,
                open: Mutex::new(None),
            }]
        } else {
            config
                .size_classes
                .iter()
                .map(|&class_size| RegionAllocator {
                    class_size,
                    open: Mutex::new(None),
                })
                .collect()
        };

        let read_buffer_size = if config.read_buffer_size == 0 {
            device.block_size()
        } else {
            config.read_buffer_size
        };

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            device,
            scheduler,
            base_offset: config.base_offset,
            region_size: config.region_size,
            checksum: config.checksum,
            read_buffer_size,
            clean_pool_target: config.clean_regions_pool,
            num_in_mem_buffers: config.num_in_mem_buffers,
            regions,
            clean: Mutex::new(clean),
            policy,
            reinsertion: ReinsertionPolicy::from_config(&config.reinsertion),
            allocators,
            index: Index::new(),
            destructor,
            in_flight_flushes: AtomicU32::new(0),
            reclaims_scheduled: AtomicU32::new(0),
        })
    }

    /// Append an item. `Ok` means the item is in the open region's buffer
    /// and indexed; durability follows at seal time.
    pub(crate) fn insert(&self, key: &[u8], value: &[u8]) -> Status {
        if key.is_empty() || key.len() > u16::MAX as usize {
            return Status::Rejected;
        }
        let needed = key.len() + value.len() + ENTRY_HEADER_SIZE;
        let Some((alloc_idx, slot)) = self.pick_allocator(needed) else {
            return Status::Rejected;
        };

        for _ in 0..3 {
            match self.try_append(alloc_idx, slot, key, value) {
                AppendOutcome::Done { region, offset } => {
                    let hash = xxh3_64(key);
                    let replaced = self.index.insert(
                        hash,
                        IndexEntry {
                            region,
                            offset,
                            size: slot,
                            hits: 0,
                        },
                    );
                    if replaced.is_some() {
                        // The older copy's bytes are not read back on this
                        // path, so the callback sees an empty value.
                        self.notify_destructor(key, &[], DestructorEvent::Removed);
                    }
                    return Status::Ok;
                }
                AppendOutcome::Sealed => continue,
                AppendOutcome::NoCleanRegion => {
                    self.maybe_schedule_reclaim();
                    return Status::OutOfSpace;
                }
            }
        }
        Status::OutOfSpace
    }

    /// Read an item into `out`.
    pub(crate) fn lookup(&self, key: &[u8], out: &mut Vec<u8>) -> Status {
        let hash = xxh3_64(key);
        let Some(entry) = self.index.touch(hash) else {
            return Status::NotFound;
        };
        let Some(slot) = self.read_slot(entry) else {
            return Status::DeviceError;
        };
        match self.parse_slot(&slot, key) {
            SlotContents::Entry { value } => {
                out.clear();
                out.extend_from_slice(value);
                self.policy.touch(entry.region);
                Status::Ok
            }
            SlotContents::WrongKey => Status::NotFound,
            SlotContents::Corrupt => {
                // Treated as a miss; the entry is dropped from the index.
                self.index.remove_if_at(hash, entry.region, entry.offset);
                metrics::CHECKSUM_ERRORS.increment();
                Status::NotFound
            }
        }
    }

    /// Remove an item, firing the destructor callback on success.
    pub(crate) fn remove(&self, key: &[u8]) -> Status {
        let hash = xxh3_64(key);
        let Some(entry) = self.index.get(hash) else {
            return Status::NotFound;
        };
        let Some(slot) = self.read_slot(entry) else {
            // Value is unreadable; the removal itself still proceeds.
            if self.index.remove_if_at(hash, entry.region, entry.offset) {
                self.notify_destructor(key, &[], DestructorEvent::Removed);
                return Status::Ok;
            }
            return Status::NotFound;
        };
        match self.parse_slot(&slot, key) {
            SlotContents::Entry { value } => {
                if self.index.remove_if_at(hash, entry.region, entry.offset) {
                    self.notify_destructor(key, value, DestructorEvent::Removed);
                    Status::Ok
                } else {
                    Status::NotFound
                }
            }
            SlotContents::WrongKey => Status::NotFound,
            SlotContents::Corrupt => {
                self.index.remove_if_at(hash, entry.region, entry.offset);
                metrics::CHECKSUM_ERRORS.increment();
                Status::NotFound
            }
        }
    }

    /// Seal and flush every open region, then wait out async flushes.
    pub(crate) fn flush(&self) {
        for allocator in &self.allocators {
            let rid = allocator.open.lock().take();
            if let Some(rid) = rid {
                self.regions[rid as usize].meta.write().state = RegionState::Sealed;
                self.flush_region(rid);
            }
        }
        while self.in_flight_flushes.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
    }

    /// Number of live index entries.
    pub(crate) fn items(&self) -> usize {
        self.index.len()
    }

    fn pick_allocator(&self, needed: usize) -> Option<(usize, u32)> {
        if self.allocators[0].class_size == 0 {
            let slot = stack_slot_size(0, needed - ENTRY_HEADER_SIZE);
            (slot <= self.region_size as usize).then_some((0, slot as u32))
        } else {
            self.allocators
                .iter()
                .position(|a| a.class_size as usize >= needed)
                .map(|idx| (idx, self.allocators[idx].class_size))
        }
    }

    fn try_append(
        &self,
        alloc_idx: usize,
        slot: u32,
        key: &[u8],
        value: &[u8],
    ) -> AppendOutcome {
        let allocator = &self.allocators[alloc_idx];
        let mut open = allocator.open.lock();

        let rid = match *open {
            Some(rid) => rid,
            None => {
                let Some(rid) = self.clean.lock().pop_front() else {
                    return AppendOutcome::NoCleanRegion;
                };
                {
                    let mut meta = self.regions[rid as usize].meta.write();
                    debug_assert_eq!(meta.state, RegionState::Clean);
                    meta.state = RegionState::Open;
                    meta.slot_size = allocator.class_size;
                    meta.write_offset = 0;
                    meta.num_items = 0;
                    meta.buffer = Some(BytesMut::zeroed(self.region_size as usize));
                }
                *open = Some(rid);
                self.maybe_schedule_reclaim();
                rid
            }
        };

        let mut meta = self.regions[rid as usize].meta.write();
        if meta.write_offset as usize + slot as usize > self.region_size as usize {
            meta.state = RegionState::Sealed;
            drop(meta);
            *open = None;
            drop(open);
            self.seal_region(rid);
            return AppendOutcome::Sealed;
        }

        let offset = meta.write_offset;
        let start = offset as usize;
        let end = start + slot as usize;
        let buffer = meta.buffer.as_mut().expect("open region has a buffer");
        buffer[start..start + value.len()].copy_from_slice(value);
        buffer[start + value.len()..start + value.len() + key.len()].copy_from_slice(key);
        let header = EntryHeader::new(key, value, self.checksum);
        buffer[end - ENTRY_HEADER_SIZE..end].copy_from_slice(&header.to_bytes());
        meta.write_offset += slot;
        meta.num_items += 1;
        AppendOutcome::Done {
            region: rid,
            offset,
        }
    }

    /// Queue the seal-time flush, or run it inline when the async buffer
    /// budget is spent (or the scheduler is gone).
    fn seal_region(&self, rid: u32) {
        if self.num_in_mem_buffers > 0 {
            let in_flight = self.in_flight_flushes.fetch_add(1, Ordering::AcqRel);
            if in_flight < self.num_in_mem_buffers {
                if let Some(engine) = self.me.upgrade() {
                    let enqueued = self.scheduler.enqueue("block-flush", move || {
                        engine.flush_region(rid);
                        engine.in_flight_flushes.fetch_sub(1, Ordering::AcqRel);
                        JobExitCode::Done
                    });
                    if enqueued {
                        return;
                    }
                }
            }
            self.in_flight_flushes.fetch_sub(1, Ordering::AcqRel);
        }
        self.flush_region(rid);
    }

    fn flush_region(&self, rid: u32) {
        let offset = self.base_offset + u64::from(rid) * u64::from(self.region_size);
        {
            let meta = self.regions[rid as usize].meta.read();
            if let Some(buffer) = meta.buffer.as_ref() {
                if let Err(error) = self.device.write(offset, buffer) {
                    warn!(region = rid, %error, "region flush failed; its entries will miss");
                }
            }
        }
        self.regions[rid as usize].meta.write().buffer = None;
        self.policy.track(rid);
    }

    fn maybe_schedule_reclaim(&self) {
        let clean_len = self.clean.lock().len() as u32;
        let scheduled = self.reclaims_scheduled.load(Ordering::Acquire);
        if clean_len + scheduled >= self.clean_pool_target {
            return;
        }
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        self.reclaims_scheduled.fetch_add(1, Ordering::AcqRel);
        let enqueued = self.scheduler.enqueue("block-reclaim", move || {
            engine.reclaim();
            engine.reclaims_scheduled.fetch_sub(1, Ordering::AcqRel);
            JobExitCode::Done
        });
        if !enqueued {
            self.reclaims_scheduled.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Reclaim one victim region back into the clean pool.
    pub(crate) fn reclaim(&self) {
        let Some(victim) = self.policy.evict() else {
            return;
        };

        let (data_end, slot_size, buffered) = {
            let mut meta = self.regions[victim as usize].meta.write();
            debug_assert_eq!(meta.state, RegionState::Sealed);
            meta.state = RegionState::Reclaiming;
            (
                meta.write_offset,
                meta.slot_size,
                meta.buffer.as_ref().map(|b| b.to_vec()),
            )
        };

        let data = match buffered {
            Some(data) => data,
            None => {
                let mut data = vec![0u8; self.region_size as usize];
                let offset = self.base_offset + u64::from(victim) * u64::from(self.region_size);
                if let Err(error) = self.device.read(offset, &mut data) {
                    warn!(region = victim, %error, "reclaim read failed; dropping region");
                    data.clear();
                }
                data
            }
        };

        if !data.is_empty() {
            self.walk_reclaimed_entries(victim, slot_size, data_end as usize, &data);
        }

        {
            let mut meta = self.regions[victim as usize].meta.write();
            meta.state = RegionState::Clean;
            meta.slot_size = 0;
            meta.write_offset = 0;
            meta.num_items = 0;
            meta.buffer = None;
        }
        self.clean.lock().push_back(victim);
        metrics::REGIONS_RECLAIMED.increment();
        debug!(region = victim, "region reclaimed");
    }

    /// Walk a region's slots back-to-front from its data end, deciding
    /// each surviving item's fate.
    fn walk_reclaimed_entries(&self, victim: u32, slot_size: u32, data_end: usize, data: &[u8]) {
        let mut pos = data_end.min(data.len());
        while pos >= ENTRY_HEADER_SIZE {
            let Some(header) = EntryHeader::from_bytes(&data[pos - ENTRY_HEADER_SIZE..pos]) else {
                break;
            };
            if header.key_len == 0 {
                break;
            }
            let raw = header.raw_size();
            let slot = if slot_size > 0 {
                slot_size as usize
            } else {
                stack_slot_size(header.key_len as usize, header.value_len as usize)
            };
            if raw > slot || slot > pos {
                warn!(region = victim, "corrupt entry chain; abandoning walk");
                break;
            }
            let start = pos - slot;
            let value = &data[start..start + header.value_len as usize];
            let key = &data[start + header.value_len as usize
                ..start + header.value_len as usize + header.key_len as usize];
            self.process_reclaimed_entry(victim, start as u32, key, value, header.checksum);
            pos = start;
        }
    }

    fn process_reclaimed_entry(
        &self,
        victim: u32,
        offset: u32,
        key: &[u8],
        value: &[u8],
        stored_checksum: u32,
    ) {
        let hash = xxh3_64(key);
        let Some(entry) = self.index.get(hash) else {
            return; // removed or replaced since it was written
        };
        if entry.region != victim || entry.offset != offset {
            return; // a newer copy lives elsewhere
        }

        if self.checksum && stored_checksum != checksum_entry(key, value) {
            self.index.remove_if_at(hash, victim, offset);
            metrics::CHECKSUM_ERRORS.increment();
            return;
        }

        if self.reinsertion.should_reinsert(entry.hits) {
            if let Some(new_entry) = self.append_for_reinsert(key, value) {
                if self.index.replace_if_at(hash, victim, offset, new_entry) {
                    metrics::ITEMS_REINSERTED.increment();
                }
                // A raced newer insert wins; the appended slot simply goes
                // stale and falls out at its own region's reclaim.
                return;
            }
        }

        if self.index.remove_if_at(hash, victim, offset) {
            self.notify_destructor(key, value, DestructorEvent::Recycled);
            metrics::ITEMS_RECYCLED.increment();
        }
    }

    /// Append without touching the index; reinsert updates it
    /// conditionally to avoid resurrecting over a raced newer insert.
    fn append_for_reinsert(&self, key: &[u8], value: &[u8]) -> Option<IndexEntry> {
        let needed = key.len() + value.len() + ENTRY_HEADER_SIZE;
        let (alloc_idx, slot) = self.pick_allocator(needed)?;
        for _ in 0..3 {
            match self.try_append(alloc_idx, slot, key, value) {
                AppendOutcome::Done { region, offset } => {
                    return Some(IndexEntry {
                        region,
                        offset,
                        size: slot,
                        hits: 0,
                    });
                }
                AppendOutcome::Sealed => continue,
                AppendOutcome::NoCleanRegion => return None,
            }
        }
        None
    }

    /// Fetch the slot bytes for an entry, from the region buffer while it
    /// exists, otherwise from the device.
    fn read_slot(&self, entry: IndexEntry) -> Option<Vec<u8>> {
        let region = &self.regions[entry.region as usize];
        {
            let meta = region.meta.read();
            if let Some(buffer) = &meta.buffer {
                let start = entry.offset as usize;
                let end = start + entry.size as usize;
                if end <= buffer.len() {
                    return Some(buffer[start..end].to_vec());
                }
                return None;
            }
        }

        let block = u64::from(self.device.block_size());
        let abs = self.base_offset
            + u64::from(entry.region) * u64::from(self.region_size)
            + u64::from(entry.offset);
        let aligned_start = abs / block * block;
        let aligned_end = (abs + u64::from(entry.size)).div_ceil(block) * block;
        let span = (aligned_end - aligned_start) as usize;
        let mut buf = Vec::with_capacity(span.max(self.read_buffer_size as usize));
        buf.resize(span, 0);
        if let Err(error) = self.device.read(aligned_start, &mut buf) {
            warn!(region = entry.region, %error, "entry read failed");
            return None;
        }
        let inner = (abs - aligned_start) as usize;
        Some(buf[inner..inner + entry.size as usize].to_vec())
    }

    fn parse_slot<'a>(&self, slot: &'a [u8], expected_key: &[u8]) -> SlotContents<'a> {
        let Some(header) = EntryHeader::from_bytes(&slot[slot.len() - ENTRY_HEADER_SIZE..]) else {
            return SlotContents::Corrupt;
        };
        if header.raw_size() > slot.len() {
            return SlotContents::Corrupt;
        }
        let value = &slot[..header.value_len as usize];
        let key = &slot
            [header.value_len as usize..header.value_len as usize + header.key_len as usize];
        if key != expected_key {
            return SlotContents::WrongKey;
        }
        if self.checksum && header.checksum != checksum_entry(key, value) {
            return SlotContents::Corrupt;
        }
        SlotContents::Entry { value }
    }

    fn notify_destructor(&self, key: &[u8], value: &[u8], event: DestructorEvent) {
        if let Some(callback) = &self.destructor {
            callback(key, value, event);
        }
    }
}

enum SlotContents<'a> {
    Entry { value: &'a [u8] },
    WrongKey,
    Corrupt,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReinsertionConfig;
    use std::sync::Mutex as StdMutex;

    const BLOCK: u32 = 512;
    const REGION: u32 = 4096;

    fn test_engine(config: BlockCacheConfig) -> (Arc<BlockCache>, Arc<Device>, Arc<JobScheduler>) {
        let device = Arc::new(Device::memory(1024 * 1024, BLOCK, 64 * 1024).unwrap());
        let scheduler = Arc::new(JobScheduler::new(1, 16));
        let engine = BlockCache::new(&config, Arc::clone(&device), Arc::clone(&scheduler), None);
        (engine, device, scheduler)
    }

    fn small_config() -> BlockCacheConfig {
        // 8 regions of 4 KiB.
        BlockCacheConfig::new(0, 8 * u64::from(REGION))
            .with_region_size(REGION)
            .with_eviction(EvictionConfig::Fifo)
    }

    #[test]
    fn insert_then_lookup_roundtrip() {
        let (engine, _device, _scheduler) = test_engine(small_config());
        assert_eq!(engine.insert(b"alpha", b"value-alpha"), Status::Ok);

        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"alpha", &mut out), Status::Ok);
        assert_eq!(out, b"value-alpha");
        assert_eq!(engine.lookup(b"beta", &mut out), Status::NotFound);
    }

    #[test]
    fn remove_drops_the_entry() {
        let (engine, _device, _scheduler) = test_engine(small_config());
        assert_eq!(engine.insert(b"key", b"value"), Status::Ok);
        assert_eq!(engine.remove(b"key"), Status::Ok);
        assert_eq!(engine.remove(b"key"), Status::NotFound);
        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"key", &mut out), Status::NotFound);
    }

    #[test]
    fn lookup_reads_from_device_after_flush() {
        let (engine, _device, _scheduler) = test_engine(small_config());
        assert_eq!(engine.insert(b"durable", b"survives the flush"), Status::Ok);
        engine.flush();

        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"durable", &mut out), Status::Ok);
        assert_eq!(out, b"survives the flush");
    }

    #[test]
    fn reclaim_purges_index_of_dropped_items() {
        let (engine, _device, scheduler) = test_engine(small_config());
        // ~60 byte slots: a 4 KiB region holds ~68 items; fill two regions.
        for i in 0..130u32 {
            let key = format!("key-{i:04}");
            let value = [b'x'; 40];
            assert_eq!(engine.insert(key.as_bytes(), &value), Status::Ok);
        }
        scheduler.wait_until_idle();
        let before = engine.items();
        assert!(before > 0);

        engine.flush();
        engine.reclaim();
        scheduler.wait_until_idle();

        // No reinsertion policy: every item of the victim region must be
        // gone from the index.
        let after = engine.items();
        assert!(after < before, "reclaim must purge victim entries");

        // All surviving keys must still be readable.
        let mut out = Vec::new();
        let mut live = 0;
        for i in 0..130u32 {
            let key = format!("key-{i:04}");
            if engine.lookup(key.as_bytes(), &mut out) == Status::Ok {
                live += 1;
            }
        }
        assert_eq!(live, after);
    }

    #[test]
    fn destructor_sees_recycled_on_reclaim_drop() {
        let events: Arc<StdMutex<Vec<(Vec<u8>, DestructorEvent)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: Arc<DestructorCallback> =
            Arc::new(move |key: &[u8], _value: &[u8], event| {
                sink.lock().unwrap().push((key.to_vec(), event));
            });

        let device = Arc::new(Device::memory(1024 * 1024, BLOCK, 64 * 1024).unwrap());
        let scheduler = Arc::new(JobScheduler::new(1, 16));
        let engine = BlockCache::new(&small_config(), device, scheduler, Some(callback));

        assert_eq!(engine.insert(b"victim", b"payload"), Status::Ok);
        engine.flush();
        engine.reclaim();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, b"victim");
        assert_eq!(events[0].1, DestructorEvent::Recycled);
    }

    #[test]
    fn hits_reinsertion_keeps_hot_items() {
        let config = small_config().with_reinsertion(ReinsertionConfig::Hits { threshold: 1 });
        let (engine, _device, scheduler) = test_engine(config);

        assert_eq!(engine.insert(b"hot", b"hot-value"), Status::Ok);
        assert_eq!(engine.insert(b"cold", b"cold-value"), Status::Ok);

        // Reading "hot" raises its hit counter past the threshold.
        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"hot", &mut out), Status::Ok);

        engine.flush();
        engine.reclaim();
        scheduler.wait_until_idle();

        assert_eq!(engine.lookup(b"hot", &mut out), Status::Ok);
        assert_eq!(out, b"hot-value");
        assert_eq!(engine.lookup(b"cold", &mut out), Status::NotFound);
    }

    #[test]
    fn checksum_mismatch_reads_as_miss_and_evicts() {
        let config = small_config().with_checksum(true);
        let (engine, device, _scheduler) = test_engine(config);

        assert_eq!(engine.insert(b"fragile", b"precious bytes"), Status::Ok);
        engine.flush();

        // Corrupt the region's first block on the device.
        let mut block = vec![0u8; BLOCK as usize];
        device.read(0, &mut block).unwrap();
        for b in block.iter_mut().take(8) {
            *b ^= 0xff;
        }
        device.write(0, &block).unwrap();

        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"fragile", &mut out), Status::NotFound);
        assert_eq!(engine.items(), 0, "corrupt entry must leave the index");
    }

    #[test]
    fn size_classes_segregate_regions() {
        let config = small_config().with_size_classes(vec![64, 256]);
        let (engine, _device, _scheduler) = test_engine(config);

        assert_eq!(engine.insert(b"small", b"tiny"), Status::Ok);
        let big_value = vec![b'v'; 180];
        assert_eq!(engine.insert(b"large", &big_value), Status::Ok);

        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"small", &mut out), Status::Ok);
        assert_eq!(out, b"tiny");
        assert_eq!(engine.lookup(b"large", &mut out), Status::Ok);
        assert_eq!(out, big_value);

        // Distinct classes keep distinct open regions.
        let open_a = engine.allocators[0].open.lock().expect("class 0 open");
        let open_b = engine.allocators[1].open.lock().expect("class 1 open");
        assert_ne!(open_a, open_b);
    }

    #[test]
    fn oversized_items_are_rejected() {
        let (engine, _device, _scheduler) = test_engine(small_config());
        let huge = vec![0u8; REGION as usize];
        assert_eq!(engine.insert(b"too-big", &huge), Status::Rejected);
    }

    #[test]
    fn replacing_insert_fires_removed_for_old_copy() {
        let events: Arc<StdMutex<Vec<DestructorEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: Arc<DestructorCallback> =
            Arc::new(move |_key: &[u8], _value: &[u8], event| {
                sink.lock().unwrap().push(event);
            });

        let device = Arc::new(Device::memory(1024 * 1024, BLOCK, 64 * 1024).unwrap());
        let scheduler = Arc::new(JobScheduler::new(1, 16));
        let engine = BlockCache::new(&small_config(), device, scheduler, Some(callback));

        assert_eq!(engine.insert(b"dup", b"one"), Status::Ok);
        assert_eq!(engine.insert(b"dup", b"two"), Status::Ok);
        assert_eq!(*events.lock().unwrap(), vec![DestructorEvent::Removed]);

        let mut out = Vec::new();
        assert_eq!(engine.lookup(b"dup", &mut out), Status::Ok);
        assert_eq!(out, b"two");
    }
}
