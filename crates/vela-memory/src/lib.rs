//! # vela-memory
//!
//! Block-pool arena allocation for massively parallel tree builds.
//!
//! A [`BlockPool`] owns a linked list of large backing blocks and serves
//! millions of short-lived node allocations through per-thread bump
//! regions:
//! - Lock-free fast path: one atomic fetch-add on the current block
//! - Slot-sharded refills to keep threads from serializing on one lock
//! - Bulk lifetime management: `reset` recycles every block between
//!   builds, `clear` returns memory to the backend
//! - Pluggable [`MemoryBackend`] over heap and OS-mapped (optionally
//!   huge-page) storage
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use vela_memory::{BlockPool, OsBackend};
//!
//! # fn main() -> vela_memory::MemoryResult<()> {
//! let pool = BlockPool::new(Arc::new(OsBackend), false);
//! pool.init(1 << 20, None)?;
//!
//! // Per-thread bump allocation during a build.
//! let local = pool.thread_local();
//! let node = local.alloc0(128, 16)?;
//! let leaf = local.alloc1(64, 16)?;
//! assert_ne!(node, leaf);
//!
//! // Recycle every block for the next build.
//! pool.cleanup();
//! pool.reset();
//! # Ok(())
//! # }
//! ```
//!
//! ## Scope
//!
//! Not a general-purpose allocator: alignment is capped at 64 bytes,
//! individual allocations cannot be freed, and lifetimes are managed in
//! bulk per build.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod error;
pub mod platform;
pub mod pool;

mod utils;

pub use backend::{Mapping, MemoryBackend, OsBackend};
pub use error::{MemoryError, MemoryResult};
pub use platform::{page_size, HUGE_PAGE_SIZE};
pub use pool::{
    BlockKind, BlockPool, FullStatistics, LocalAlloc, Statistics, ThreadBump, ThreadBumpPair,
    MAX_ALIGNMENT, MAX_ALLOCATION_SIZE, MAX_THREAD_BLOCK_SLOTS,
};

/// Convenient re-exports of the commonly used types.
pub mod prelude {
    pub use crate::{
        BlockKind, BlockPool, LocalAlloc, MemoryBackend, MemoryError, MemoryResult, OsBackend,
        Statistics,
    };
}
