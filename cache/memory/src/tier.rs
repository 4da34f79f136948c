//! Memory-tier configuration and the capacity resolver.
//!
//! Each tier names a backing and exactly one of an absolute size or an
//! integer ratio. When the tier list is configured, the resolver turns the
//! mix into absolute byte counts and freezes the layout: tier ordering and
//! sizes are load-bearing for every compressed pointer persisted in a
//! tier arena, so nothing may change after the freeze.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::allocator::SlabAllocator;
use crate::arena::TierBacking;
use crate::error::{MemoryError, MemoryResult};

/// Configuration for one memory tier.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTierConfig {
    backing: TierBacking,
    /// Absolute size in bytes; 0 means unset.
    size: usize,
    /// Relative ratio in integer parts; 0 means unset.
    ratio: usize,
}

impl MemoryTierConfig {
    fn from_backing(backing: TierBacking) -> Self {
        Self {
            backing,
            size: 0,
            ratio: 0,
        }
    }

    /// Tier backed by anonymous DRAM.
    pub fn anonymous() -> Self {
        Self::from_backing(TierBacking::Anonymous { numa_node: None })
    }

    /// Tier backed by a regular file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::from_backing(TierBacking::File { path: path.into() })
    }

    /// Tier backed by a POSIX shared-memory object.
    pub fn posix_shm(name: impl Into<String>) -> Self {
        Self::from_backing(TierBacking::PosixShm { name: name.into() })
    }

    /// Tier backed by a System V shared-memory segment.
    pub fn sysv_shm(key: i32) -> Self {
        Self::from_backing(TierBacking::SysvShm { key })
    }

    /// Tier backed by a dax device.
    pub fn dax(path: impl Into<PathBuf>) -> Self {
        Self::from_backing(TierBacking::Dax { path: path.into() })
    }

    /// Set the absolute size in bytes. Mutually exclusive with a ratio
    /// across the whole tier list.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the integer ratio. Mutually exclusive with a size across the
    /// whole tier list.
    pub fn with_ratio(mut self, ratio: usize) -> Self {
        self.ratio = ratio;
        self
    }

    /// Bind an anonymous-DRAM tier to a NUMA node. Ignored for other
    /// backings.
    pub fn with_numa_node(mut self, node: u32) -> Self {
        if let TierBacking::Anonymous { numa_node } = &mut self.backing {
            *numa_node = Some(node);
        }
        self
    }

    /// The tier's backing.
    pub fn backing(&self) -> &TierBacking {
        &self.backing
    }

    /// Resolved (or explicitly set) size in bytes; 0 while unset.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Configured ratio; 0 while unset.
    pub fn ratio(&self) -> usize {
        self.ratio
    }

    /// Whether this backing maps shared or file-backed memory.
    fn is_shared(&self) -> bool {
        matches!(
            self.backing,
            TierBacking::File { .. } | TierBacking::PosixShm { .. } | TierBacking::SysvShm { .. }
        )
    }
}

/// Driver-level memory layout: total size, persistence root, and the
/// ordered tier list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheLayoutConfig {
    total_cache_size: usize,
    cache_dir: Option<PathBuf>,
    use_posix_shm: bool,
    tiers: Vec<MemoryTierConfig>,
    frozen: bool,
}

impl CacheLayoutConfig {
    /// Empty configuration; tiers and size must be set before building.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total cache size in bytes.
    ///
    /// Rejected once the tier layout is frozen, since persisted pointer
    /// graphs depend on the resolved sizes.
    pub fn set_cache_size(&mut self, bytes: usize) -> MemoryResult<&mut Self> {
        if self.frozen {
            return Err(MemoryError::ConfigFrozen);
        }
        self.total_cache_size = bytes;
        Ok(self)
    }

    /// Root directory for cache metadata persistence.
    pub fn enable_cache_persistence(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Select POSIX shared memory for shm-bearing tiers.
    pub fn use_posix_for_shm(&mut self) -> &mut Self {
        self.use_posix_shm = true;
        self
    }

    /// Install the ordered tier list, resolve per-tier sizes, and freeze
    /// the layout.
    ///
    /// Either every tier carries an absolute size (their sum becomes, or
    /// must equal, the total cache size) or every tier carries a ratio
    /// (split of the total, last tier absorbing the rounding remainder).
    pub fn configure_tiers(&mut self, tiers: Vec<MemoryTierConfig>) -> MemoryResult<&mut Self> {
        if self.frozen {
            return Err(MemoryError::ConfigFrozen);
        }
        if tiers.is_empty() {
            return Err(MemoryError::NoTiers);
        }

        let sized = tiers.iter().filter(|t| t.size > 0).count();
        let ratioed = tiers.iter().filter(|t| t.ratio > 0).count();
        if tiers.iter().any(|t| t.size > 0 && t.ratio > 0) {
            return Err(MemoryError::MixedSizesAndRatios);
        }
        if tiers.iter().any(|t| t.size == 0 && t.ratio == 0) {
            return Err(MemoryError::TierNotSized);
        }
        if sized > 0 && ratioed > 0 {
            return Err(MemoryError::MixedSizesAndRatios);
        }

        let mut tiers = tiers;
        if sized == tiers.len() {
            let sum: usize = tiers.iter().map(|t| t.size).sum();
            if self.total_cache_size == 0 {
                self.total_cache_size = sum;
            } else if sum != self.total_cache_size {
                return Err(MemoryError::SizeSumMismatch);
            }
        } else {
            self.resolve_ratios(&mut tiers)?;
        }

        debug_assert_eq!(
            tiers.iter().map(|t| t.size).sum::<usize>(),
            self.total_cache_size
        );
        debug!(
            total = self.total_cache_size,
            tiers = tiers.len(),
            "froze memory tier layout"
        );
        self.tiers = tiers;
        self.frozen = true;
        Ok(self)
    }

    fn resolve_ratios(&self, tiers: &mut [MemoryTierConfig]) -> MemoryResult<()> {
        if self.total_cache_size == 0 {
            return Err(MemoryError::CacheSizeNotSet);
        }
        let ratio_sum: usize = tiers.iter().map(|t| t.ratio).sum();
        if ratio_sum > self.total_cache_size {
            return Err(MemoryError::PartitionsTooLarge);
        }
        let partition = self.total_cache_size / ratio_sum;
        let mut remaining = self.total_cache_size;
        let last = tiers.len() - 1;
        for (i, tier) in tiers.iter_mut().enumerate() {
            // The last tier absorbs the rounding remainder so the sizes sum
            // to the total exactly.
            tier.size = if i == last {
                remaining
            } else {
                partition * tier.ratio
            };
            if tier.size == 0 {
                return Err(MemoryError::ZeroPartition);
            }
            remaining -= tier.size.min(remaining);
        }
        Ok(())
    }

    /// Validate cross-cutting constraints that the resolver itself does
    /// not own.
    pub fn validate(&self) -> MemoryResult<()> {
        if !self.frozen {
            return Err(MemoryError::NoTiers);
        }
        if self.tiers.len() > 1
            && self.tiers.iter().any(|t| t.is_shared())
            && !self.use_posix_shm
        {
            return Err(MemoryError::PosixShmRequired);
        }
        Ok(())
    }

    /// Total cache size across tiers.
    pub fn cache_size(&self) -> usize {
        self.total_cache_size
    }

    /// Metadata persistence root, if any.
    pub fn cache_dir(&self) -> Option<&PathBuf> {
        self.cache_dir.as_ref()
    }

    /// The resolved tier list. Empty until configured.
    pub fn tiers(&self) -> &[MemoryTierConfig] {
        &self.tiers
    }

    /// Map every tier and wrap each arena into a slab allocator, in tier
    /// order.
    pub fn build_tiers(&self) -> std::io::Result<Arc<[SlabAllocator]>> {
        if !self.frozen {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tier layout not configured",
            ));
        }
        let mut allocators = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            allocators.push(SlabAllocator::create(&tier.backing, tier.size)?);
        }
        Ok(Arc::from(allocators))
    }
}
