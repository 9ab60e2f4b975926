//! Per-thread bump allocation over pool-issued slabs
//!
//! Each thread owns a pair of bump allocators so that two interleaved
//! allocation streams (tree nodes vs. leaf payloads, typically) do not
//! pollute each other's slab. The pool keeps every pair in an explicit
//! registry keyed by thread id, so lifecycle operations can walk all
//! per-thread state without relying on TLS destructors.

use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::{MemoryError, MemoryResult};
use crate::pool::block::{MAX_ALIGNMENT, MAX_ALLOCATION_SIZE};
use crate::pool::BlockPool;
use crate::utils::align_pad;

/// Per-thread small-allocation cursor over a slab carved from the pool.
///
/// Not synchronized: during a build only the owning thread touches it;
/// the registry walks it only at quiescent lifecycle points.
pub struct ThreadBump {
    ptr: Cell<*mut u8>,
    cur: Cell<usize>,
    end: Cell<usize>,
    slab_size: Cell<usize>,
    bytes_used: Cell<usize>,
    bytes_wasted: Cell<usize>,
}

impl ThreadBump {
    pub(crate) fn new(slab_size: usize) -> Self {
        Self {
            ptr: Cell::new(std::ptr::null_mut()),
            cur: Cell::new(0),
            end: Cell::new(0),
            slab_size: Cell::new(slab_size),
            bytes_used: Cell::new(0),
            bytes_wasted: Cell::new(0),
        }
    }

    /// Drops the slab reference and zeroes the local accounting. The slab
    /// itself stays with its block; the pool reclaims it on reset/clear.
    pub fn reset(&self) {
        self.ptr.set(std::ptr::null_mut());
        self.cur.set(0);
        self.end.set(0);
        self.bytes_used.set(0);
        self.bytes_wasted.set(0);
    }

    /// Bytes handed out by this bump.
    pub fn used_bytes(&self) -> usize {
        self.bytes_used.get()
    }

    /// Alignment padding plus retired-slab tails, plus the unused tail of
    /// the live slab (reported, not consumed).
    pub fn wasted_bytes(&self) -> usize {
        self.bytes_wasted.get() + (self.end.get() - self.cur.get())
    }

    /// Allocates `bytes` aligned to `align` (≤ 64), refilling from `pool`
    /// on overflow.
    pub fn alloc(
        &self,
        pool: &BlockPool,
        bytes: usize,
        align: usize,
    ) -> MemoryResult<NonNull<u8>> {
        if !align.is_power_of_two() || align > MAX_ALIGNMENT {
            return Err(MemoryError::invalid_alignment(align, MAX_ALIGNMENT));
        }
        // A zero-sized request still receives a unique grant.
        let bytes = bytes.max(1);
        if let Some(ptr) = self.try_bump(bytes, align) {
            self.bytes_used.set(self.bytes_used.get() + bytes);
            return Ok(ptr);
        }

        // Oversize escape: a request that would burn most of a slab goes
        // straight to the pool and leaves the current slab untouched.
        if 4 * bytes > self.slab_size.get() {
            let (ptr, _) = pool.allocate(bytes, MAX_ALIGNMENT, false)?;
            self.bytes_used.set(self.bytes_used.get() + bytes);
            return Ok(ptr);
        }

        // Partial refill: accept the trailing slack of the pool's current
        // block before forcing a fresh one.
        let (slab, granted) = pool.allocate(self.slab_size.get(), MAX_ALIGNMENT, true)?;
        self.retire_slab(slab, granted);
        if let Some(ptr) = self.try_bump(bytes, align) {
            self.bytes_used.set(self.bytes_used.get() + bytes);
            return Ok(ptr);
        }

        // The partial grant was too small; take a full slab and grow the
        // slab size for the next refill.
        let grown = (2 * self.slab_size.get()).min(MAX_ALLOCATION_SIZE);
        self.slab_size.set(grown);
        let (slab, granted) = pool.allocate(grown, MAX_ALIGNMENT, false)?;
        self.retire_slab(slab, granted);
        match self.try_bump(bytes, align) {
            Some(ptr) => {
                self.bytes_used.set(self.bytes_used.get() + bytes);
                Ok(ptr)
            }
            // A full slab is at least 4x the request plus worst-case padding.
            None => unreachable!("fresh slab cannot fail a small allocation"),
        }
    }

    fn try_bump(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        let cur = self.cur.get();
        // The slab base is 64-aligned, so offset alignment equals address
        // alignment.
        let pad = align_pad(cur, align);
        if cur + pad + bytes > self.end.get() {
            return None;
        }
        self.cur.set(cur + pad + bytes);
        self.bytes_wasted.set(self.bytes_wasted.get() + pad);
        // SAFETY: [cur+pad, cur+pad+bytes) is within the live slab and only
        // the owning thread advances this cursor.
        Some(unsafe { NonNull::new_unchecked(self.ptr.get().add(cur + pad)) })
    }

    fn retire_slab(&self, slab: NonNull<u8>, granted: usize) {
        self.bytes_wasted
            .set(self.bytes_wasted.get() + (self.end.get() - self.cur.get()));
        self.ptr.set(slab.as_ptr());
        self.cur.set(0);
        self.end.set(granted);
    }
}

/// The two bump allocators of one thread.
///
/// In single mode the second stream aliases the first, so both route into
/// one slab.
pub struct ThreadBumpPair {
    a0: ThreadBump,
    a1: ThreadBump,
    single: bool,
}

// SAFETY: a pair is only ever driven by its owning thread while a build is
// running; the registry hands out clones of the Arc but cross-thread access
// happens exclusively at quiescent lifecycle points (cleanup/reset), after
// every worker has finished. The Cell fields are therefore never raced.
unsafe impl Send for ThreadBumpPair {}
unsafe impl Sync for ThreadBumpPair {}

impl ThreadBumpPair {
    pub(crate) fn new(slab_size: usize, single: bool) -> Self {
        Self {
            a0: ThreadBump::new(slab_size),
            a1: ThreadBump::new(slab_size),
            single,
        }
    }

    /// First allocation stream.
    pub fn alloc0(&self) -> &ThreadBump {
        &self.a0
    }

    /// Second allocation stream; aliases the first in single mode.
    pub fn alloc1(&self) -> &ThreadBump {
        if self.single {
            &self.a0
        } else {
            &self.a1
        }
    }

    /// Resets both bumps.
    pub fn reset(&self) {
        self.a0.reset();
        self.a1.reset();
    }

    /// Bytes handed out by both streams.
    pub fn used_bytes(&self) -> usize {
        self.a0.used_bytes() + self.a1.used_bytes()
    }

    /// Waste accumulated by both streams.
    pub fn wasted_bytes(&self) -> usize {
        self.a0.wasted_bytes() + self.a1.wasted_bytes()
    }
}

/// Calling thread's view of the pool: both bump streams plus the pool
/// handle needed for refills.
pub struct LocalAlloc<'pool> {
    pool: &'pool BlockPool,
    pair: Arc<ThreadBumpPair>,
}

impl<'pool> LocalAlloc<'pool> {
    pub(crate) fn new(pool: &'pool BlockPool, pair: Arc<ThreadBumpPair>) -> Self {
        Self { pool, pair }
    }

    /// Allocates from the first stream.
    pub fn alloc0(&self, bytes: usize, align: usize) -> MemoryResult<NonNull<u8>> {
        self.pair.alloc0().alloc(self.pool, bytes, align)
    }

    /// Allocates from the second stream.
    pub fn alloc1(&self, bytes: usize, align: usize) -> MemoryResult<NonNull<u8>> {
        self.pair.alloc1().alloc(self.pool, bytes, align)
    }

    /// The underlying pair, e.g. for accounting.
    pub fn pair(&self) -> &ThreadBumpPair {
        &self.pair
    }
}

/// Registry of all per-thread pairs, keyed by thread id.
///
/// Lazily inserts on first access from a thread; lifecycle operations
/// iterate or drain it at quiescent points.
pub(crate) struct ThreadRegistry {
    pairs: Mutex<HashMap<ThreadId, Arc<ThreadBumpPair>>>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self { pairs: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn get_or_insert(&self, slab_size: usize, single: bool) -> Arc<ThreadBumpPair> {
        let mut pairs = self.pairs.lock();
        pairs
            .entry(std::thread::current().id())
            .or_insert_with(|| Arc::new(ThreadBumpPair::new(slab_size, single)))
            .clone()
    }

    /// Folds every pair's accounting into `(used, wasted)` and empties the
    /// registry. Quiescent callers only.
    pub(crate) fn drain_accounting(&self) -> (usize, usize) {
        let mut pairs = self.pairs.lock();
        let mut used = 0;
        let mut wasted = 0;
        for pair in pairs.values() {
            used += pair.used_bytes();
            wasted += pair.wasted_bytes();
        }
        pairs.clear();
        (used, wasted)
    }

    /// Resets every pair in place. Quiescent callers only.
    pub(crate) fn reset_all(&self) {
        for pair in self.pairs.lock().values() {
            pair.reset();
        }
    }

    /// Sums live accounting without draining.
    pub(crate) fn accounting(&self) -> (usize, usize) {
        let pairs = self.pairs.lock();
        let used = pairs.values().map(|p| p.used_bytes()).sum();
        let wasted = pairs.values().map(|p| p.wasted_bytes()).sum();
        (used, wasted)
    }
}
