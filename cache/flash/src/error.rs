//! Construction errors and steady-state statuses.
//!
//! The split matters: configuration and I/O setup problems are real errors
//! raised at the boundary, while everything the engines report during
//! steady state is a [`Status`] that never unwinds across the job
//! scheduler.

use thiserror::Error;

/// Errors raised while building a cache from its configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration records failed freeze-time validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Device or arena setup failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for construction paths.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a steady-state cache operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation succeeded.
    Ok,

    /// Lookup or remove found no live entry for the key.
    NotFound,

    /// The admission policy declined the insert. Not an error; the caller
    /// simply moves on.
    Rejected,

    /// Parcel memory or the concurrent-insert ceiling is exhausted. The
    /// caller may retry once in-flight work drains.
    QueueFull,

    /// The owning engine has no capacity left; retry after reclaim frees
    /// space.
    OutOfSpace,

    /// A device read or write failed; the affected entry is treated as
    /// lost.
    DeviceError,
}

impl Status {
    /// Whether the operation took effect.
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_distinguishable() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Rejected.is_ok());
        assert_ne!(Status::Rejected, Status::QueueFull);
        assert_ne!(Status::QueueFull, Status::OutOfSpace);
    }

    #[test]
    fn config_error_displays_reason() {
        let err = Error::InvalidConfig("regions must be block aligned");
        assert_eq!(
            err.to_string(),
            "invalid configuration: regions must be block aligned"
        );
    }
}
