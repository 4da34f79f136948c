//! Error types for tier configuration and slab carving.

use std::fmt;

/// Errors surfaced by the memory tier layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Tier list mixes absolute sizes and ratios.
    MixedSizesAndRatios,

    /// A tier has neither a size nor a ratio.
    TierNotSized,

    /// The tier list is empty.
    NoTiers,

    /// Ratios were given but no total cache size was set.
    CacheSizeNotSet,

    /// The ratio sum exceeds the total cache size, so at least one
    /// partition would be zero-sized.
    PartitionsTooLarge,

    /// Absolute tier sizes do not add up to the configured total.
    SizeSumMismatch,

    /// The resolver produced a zero-sized tier.
    ZeroPartition,

    /// Multi-tier configurations over file or shared-memory backings
    /// require the POSIX shm backing to be selected.
    PosixShmRequired,

    /// The configuration is frozen; sizes can no longer change.
    ConfigFrozen,

    /// The tier arena has no slab left to carve.
    OutOfMemory,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MixedSizesAndRatios => write!(f, "tiers mix absolute sizes and ratios"),
            Self::TierNotSized => write!(f, "tier has neither size nor ratio"),
            Self::NoTiers => write!(f, "no memory tiers configured"),
            Self::CacheSizeNotSet => write!(f, "ratios require a total cache size"),
            Self::PartitionsTooLarge => write!(f, "ratio sum exceeds total cache size"),
            Self::SizeSumMismatch => write!(f, "tier sizes do not sum to total cache size"),
            Self::ZeroPartition => write!(f, "resolved tier size is zero"),
            Self::PosixShmRequired => write!(f, "multi-tier config requires POSIX shm"),
            Self::ConfigFrozen => write!(f, "configuration is frozen"),
            Self::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Result type for memory tier operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(format!("{}", MemoryError::OutOfMemory), "out of memory");
        assert_eq!(
            format!("{}", MemoryError::MixedSizesAndRatios),
            "tiers mix absolute sizes and ratios"
        );
        assert_eq!(
            format!("{}", MemoryError::ConfigFrozen),
            "configuration is frozen"
        );
    }

    #[test]
    fn is_error() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<MemoryError>();
    }
}
