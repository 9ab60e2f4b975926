//! Error types for pool and bump allocation

use std::io;

/// Result type for memory operations
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// Memory operation errors
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Request exceeds the largest size a single block can serve.
    ///
    /// Fatal to the caller, non-fatal to the pool: subsequent allocations
    /// keep working.
    #[error("allocation of {requested} bytes exceeds maximum supported size of {max} bytes")]
    AllocationTooLarge {
        /// Requested size in bytes
        requested: usize,
        /// Maximum supported allocation size
        max: usize,
    },

    /// Alignment is not a power of two or exceeds the pool maximum.
    #[error("invalid alignment {align}: must be a power of two no larger than {max}")]
    InvalidAlignment {
        /// Requested alignment
        align: usize,
        /// Maximum supported alignment
        max: usize,
    },

    /// The memory backend failed to provide backing storage.
    #[error("backend failed to provide {requested} bytes")]
    Backend {
        /// Requested size in bytes
        requested: usize,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },
}

impl MemoryError {
    /// Creates a too-large allocation error
    pub fn too_large(requested: usize, max: usize) -> Self {
        Self::AllocationTooLarge { requested, max }
    }

    /// Creates an invalid alignment error
    pub fn invalid_alignment(align: usize, max: usize) -> Self {
        Self::InvalidAlignment { align, max }
    }

    /// Creates a backend failure error
    pub fn backend(requested: usize, source: io::Error) -> Self {
        Self::Backend { requested, source }
    }

    /// Whether the pool remains usable after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AllocationTooLarge { .. } | Self::InvalidAlignment { .. })
    }
}
