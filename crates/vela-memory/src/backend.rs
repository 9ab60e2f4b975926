//! Backing-storage capability required by the block pool
//!
//! The pool never talks to the OS directly; every backing region flows
//! through a [`MemoryBackend`]. The default [`OsBackend`] forwards to the
//! [`platform`](crate::platform) module, while tests and embedders can
//! substitute counting or failing backends.

use std::io;
use std::ptr::NonNull;

pub use crate::platform::Mapping;

/// Provider of backing memory for a [`BlockPool`](crate::BlockPool).
///
/// Implementations must be callable from any thread: the pool acquires
/// blocks under its refill locks, but releases and the
/// [`memory_monitor`](MemoryBackend::memory_monitor) callback may fire from
/// whichever thread drives a lifecycle transition.
pub trait MemoryBackend: Send + Sync {
    /// Allocates `bytes` aligned to `align` from a small-block allocator.
    fn aligned_alloc(&self, bytes: usize, align: usize) -> io::Result<NonNull<u8>>;

    /// Frees memory returned by [`aligned_alloc`](MemoryBackend::aligned_alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must come from this backend's `aligned_alloc` with identical
    /// `bytes` and `align`, and must not be used afterwards.
    unsafe fn aligned_free(&self, ptr: NonNull<u8>, bytes: usize, align: usize);

    /// Maps `bytes` of anonymous memory, opportunistically huge-page backed.
    fn os_map(&self, bytes: usize) -> io::Result<Mapping>;

    /// Releases a mapping created by [`os_map`](MemoryBackend::os_map).
    ///
    /// # Safety
    ///
    /// The triple must describe a live mapping from this backend (possibly
    /// shrunk since), with no outstanding references into it.
    unsafe fn os_unmap(&self, ptr: NonNull<u8>, bytes: usize, huge: bool) -> io::Result<()>;

    /// Shrinks a mapping to roughly `used_bytes`, returning the new
    /// reserved size. Implementations may decline by returning
    /// `reserved_bytes` unchanged.
    ///
    /// # Safety
    ///
    /// Same contract as [`os_unmap`](MemoryBackend::os_unmap); the released
    /// tail must be unreferenced.
    unsafe fn os_shrink(
        &self,
        ptr: NonNull<u8>,
        used_bytes: usize,
        reserved_bytes: usize,
        huge: bool,
    ) -> usize;

    /// Advises the OS to promote `[ptr, ptr+bytes)` to huge pages.
    /// Advisory; failures are swallowed.
    fn os_advise(&self, ptr: NonNull<u8>, bytes: usize);

    /// Observes pool-level memory traffic.
    ///
    /// Invoked with a positive delta before a block is acquired and a
    /// negative delta after one is released; also fired when an allocation
    /// first touches memory beyond a block's committed region. `post`
    /// distinguishes after-the-fact accounting from pre-acquisition
    /// reservation.
    fn memory_monitor(&self, delta: isize, post: bool) {
        let _ = (delta, post);
    }
}

/// Default backend forwarding to the process heap and OS mapping calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsBackend;

impl OsBackend {
    /// Creates the default OS backend.
    pub const fn new() -> Self {
        Self
    }
}

impl MemoryBackend for OsBackend {
    fn aligned_alloc(&self, bytes: usize, align: usize) -> io::Result<NonNull<u8>> {
        crate::platform::aligned_alloc(bytes, align)
    }

    unsafe fn aligned_free(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        // SAFETY: forwarded contract.
        unsafe { crate::platform::aligned_free(ptr, bytes, align) }
    }

    fn os_map(&self, bytes: usize) -> io::Result<Mapping> {
        crate::platform::map_memory(bytes)
    }

    unsafe fn os_unmap(&self, ptr: NonNull<u8>, bytes: usize, huge: bool) -> io::Result<()> {
        // SAFETY: forwarded contract.
        unsafe { crate::platform::unmap_memory(ptr, bytes, huge) }
    }

    unsafe fn os_shrink(
        &self,
        ptr: NonNull<u8>,
        used_bytes: usize,
        reserved_bytes: usize,
        huge: bool,
    ) -> usize {
        // SAFETY: forwarded contract.
        unsafe { crate::platform::shrink_memory(ptr, used_bytes, reserved_bytes, huge) }
    }

    fn os_advise(&self, ptr: NonNull<u8>, bytes: usize) {
        crate::platform::advise_huge(ptr, bytes);
    }
}
