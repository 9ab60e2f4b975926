//! Block-pool arena allocator
//!
//! The pool owns a linked list of large backing blocks and hands slabs to
//! per-thread bump allocators. Allocation on a block is lock-free (one
//! fetch-add with a post-check); refills serialize on a per-slot or
//! pool-wide mutex whose critical sections are single list splices.
//! Lifecycle operations (`init`, `reset`, `cleanup`, `shrink`, `clear`)
//! require quiescence: no concurrent allocation may be in flight.
//!
//! ## Invariants
//!
//! - A block's consumed bytes never exceed its reservation (grants are
//!   bounds-checked after the cursor fetch-add).
//! - Grants from one block are disjoint; grants from different blocks are
//!   trivially disjoint.
//! - `Shared` blocks are never returned to the backend; `reset` drops them
//!   from the free list so the caller can re-add them per build.

mod block;
mod stats;
mod thread_local;

pub use block::{BlockKind, MAX_ALIGNMENT, MAX_ALLOCATION_SIZE};
pub use stats::{FullStatistics, Statistics};
pub use thread_local::{LocalAlloc, ThreadBump, ThreadBumpPair};

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "tracing")]
use tracing::{debug, trace};

use crate::backend::MemoryBackend;
use crate::error::{MemoryError, MemoryResult};
use crate::platform;
use crate::utils::align_up;

use block::{remove_shared_blocks, Block, BlockIter, HEADER_SIZE};
use thread_local::ThreadRegistry;

/// Number of slot-sharded refill lanes. Threads hash into a slot; threads
/// sharing a slot serialize only when refilling.
pub const MAX_THREAD_BLOCK_SLOTS: usize = 8;

/// Block-pool arena allocator with per-thread bump regions.
///
/// Created over a [`MemoryBackend`]; blocks are either heap allocations or
/// OS mappings depending on the `os_allocation` constructor flag. Between
/// builds, [`reset`](Self::reset) recycles every block without returning
/// memory; [`clear`](Self::clear) returns everything to the backend.
pub struct BlockPool {
    backend: Arc<dyn MemoryBackend>,
    atype: BlockKind,

    /// Pool-wide refill lock; guards `used`/`free` list splices.
    mutex: Mutex<()>,
    /// Per-slot refill locks; guard block creation for one slot.
    slot_mutex: [Mutex<()>; MAX_THREAD_BLOCK_SLOTS],
    slot_mask: AtomicUsize,

    /// Block currently bump-allocated from, per slot. Read unsynchronized
    /// on the fast path; stale reads are safe (a stale block just fails
    /// its cursor check).
    thread_used: [AtomicPtr<Block>; MAX_THREAD_BLOCK_SLOTS],
    /// Chains of blocks created on the slot path, pinned until they are
    /// spliced into `used` on fixup.
    thread_head: [AtomicPtr<Block>; MAX_THREAD_BLOCK_SLOTS],

    used: AtomicPtr<Block>,
    free: AtomicPtr<Block>,

    single_mode: AtomicBool,
    default_block_size: AtomicUsize,
    grow_size: AtomicUsize,
    log2_grow_scale: AtomicUsize,

    bytes_used: AtomicUsize,
    bytes_wasted: AtomicUsize,

    registry: ThreadRegistry,
}

// SAFETY: the raw block pointers all reference regions owned by the pool
// (or, for Shared blocks, pinned by the add_shared contract) until clear().
// Cross-thread mutation of the lists happens under the pool mutexes or at
// documented quiescent points; block cursors are atomic.
unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// Creates a pool over `backend`. With `os_allocation` every created
    /// block is an OS mapping; otherwise blocks come from the backend's
    /// aligned small-block allocator.
    pub fn new(backend: Arc<dyn MemoryBackend>, os_allocation: bool) -> Self {
        let page = platform::page_size();
        Self {
            backend,
            atype: if os_allocation { BlockKind::OsMapped } else { BlockKind::AlignedSmall },
            mutex: Mutex::new(()),
            slot_mutex: [const { Mutex::new(()) }; MAX_THREAD_BLOCK_SLOTS],
            slot_mask: AtomicUsize::new(0),
            thread_used: [const { AtomicPtr::new(std::ptr::null_mut()) };
                MAX_THREAD_BLOCK_SLOTS],
            thread_head: [const { AtomicPtr::new(std::ptr::null_mut()) };
                MAX_THREAD_BLOCK_SLOTS],
            used: AtomicPtr::new(std::ptr::null_mut()),
            free: AtomicPtr::new(std::ptr::null_mut()),
            single_mode: AtomicBool::new(false),
            default_block_size: AtomicUsize::new(page),
            grow_size: AtomicUsize::new(page),
            log2_grow_scale: AtomicUsize::new(0),
            bytes_used: AtomicUsize::new(0),
            bytes_wasted: AtomicUsize::new(0),
            registry: ThreadRegistry::new(),
        }
    }

    /// The backend this pool draws from.
    pub fn backend(&self) -> &dyn MemoryBackend {
        &*self.backend
    }

    /// Initializes the pool for a build of roughly `bytes_allocate` bytes,
    /// pre-creating one free block (`bytes_reserve` defaults to the
    /// allocation size). Re-initializing a pool that still holds blocks
    /// degrades to [`reset`](Self::reset).
    ///
    /// Quiescent callers only.
    pub fn init(&self, bytes_allocate: usize, bytes_reserve: Option<usize>) -> MemoryResult<()> {
        self.fix_used_blocks();
        // Distribute refills over all slots for the fully parallel build.
        self.slot_mask.store(MAX_THREAD_BLOCK_SLOTS - 1, Ordering::Relaxed);
        if !self.used.load(Ordering::Relaxed).is_null()
            || !self.free.load(Ordering::Relaxed).is_null()
        {
            self.reset();
            return Ok(());
        }
        let bytes_reserve = bytes_reserve.unwrap_or(bytes_allocate);
        let block = Block::create(
            &*self.backend,
            bytes_allocate,
            bytes_reserve,
            std::ptr::null_mut(),
            self.atype,
        )?;
        self.free.store(block.as_ptr(), Ordering::Release);
        self.apply_size_tuning(bytes_allocate);
        #[cfg(feature = "tracing")]
        debug!(bytes_allocate, bytes_reserve, "pool initialized");
        Ok(())
    }

    /// Sets growth tuning from a size estimate without pre-allocating.
    /// `single_mode` collapses each thread's bump pair onto one slab;
    /// `compact` disables slot sharding. Re-initializing a pool that still
    /// holds blocks degrades to [`reset`](Self::reset).
    ///
    /// Quiescent callers only.
    pub fn init_estimate(&self, bytes_allocate: usize, single_mode: bool, compact: bool) {
        self.fix_used_blocks();
        if !self.used.load(Ordering::Relaxed).is_null()
            || !self.free.load(Ordering::Relaxed).is_null()
        {
            self.reset();
            return;
        }
        self.single_mode.store(single_mode, Ordering::Relaxed);
        self.apply_size_tuning(bytes_allocate);
        let mask = if compact { 0 } else { Self::slot_mask_for(bytes_allocate) };
        self.slot_mask.store(mask, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        debug!(bytes_allocate, single_mode, compact, "pool estimate configured");
    }

    fn apply_size_tuning(&self, bytes_allocate: usize) {
        let page = platform::page_size();
        self.default_block_size.store(
            (bytes_allocate / 4).clamp(128, page + MAX_ALIGNMENT),
            Ordering::Relaxed,
        );
        // Always consume whole pages when growing.
        let rounded = align_up(bytes_allocate.max(1), page);
        self.grow_size
            .store(rounded.clamp(page, MAX_ALLOCATION_SIZE), Ordering::Relaxed);
        self.log2_grow_scale.store(0, Ordering::Relaxed);
    }

    fn slot_mask_for(bytes_allocate: usize) -> usize {
        let mut mask = 0;
        if MAX_THREAD_BLOCK_SLOTS >= 2 && bytes_allocate > 4 * MAX_ALLOCATION_SIZE {
            mask = 0x1;
        }
        if MAX_THREAD_BLOCK_SLOTS >= 4 && bytes_allocate > 8 * MAX_ALLOCATION_SIZE {
            mask = 0x3;
        }
        if MAX_THREAD_BLOCK_SLOTS >= 8 && bytes_allocate > 16 * MAX_ALLOCATION_SIZE {
            mask = 0x7;
        }
        mask
    }

    /// Obtains the calling thread's bump allocator pair, inserting it into
    /// the registry on first use.
    pub fn thread_local(&self) -> LocalAlloc<'_> {
        let pair = self.registry.get_or_insert(
            self.default_block_size.load(Ordering::Relaxed),
            self.single_mode.load(Ordering::Relaxed),
        );
        LocalAlloc::new(self, pair)
    }

    /// Thread-safe allocation of `bytes` aligned to `align` (≤ 64).
    ///
    /// With `partial` set the pool may grant fewer bytes than requested
    /// (the trailing slack of the current block), never zero; otherwise the
    /// grant is exactly `bytes`. Requests beyond
    /// [`MAX_ALLOCATION_SIZE`] fail with
    /// [`MemoryError::AllocationTooLarge`].
    pub fn allocate(
        &self,
        bytes: usize,
        align: usize,
        partial: bool,
    ) -> MemoryResult<(NonNull<u8>, usize)> {
        if !align.is_power_of_two() || align > MAX_ALIGNMENT {
            return Err(MemoryError::invalid_alignment(align, MAX_ALIGNMENT));
        }
        // A zero-sized request still receives a unique grant.
        let bytes = bytes.max(1);

        loop {
            let slot = self.thread_slot();
            let my_block = self.thread_used[slot].load(Ordering::Acquire);

            if let Some(b) = NonNull::new(my_block) {
                // SAFETY: blocks reachable from thread_used stay alive until
                // clear(), which demands quiescence; a stale pointer is still
                // a valid block.
                if let Some(grant) = unsafe { b.as_ref() }.carve(&*self.backend, bytes, partial) {
                    return Ok(grant);
                }
            }

            if bytes > MAX_ALLOCATION_SIZE {
                return Err(MemoryError::too_large(bytes, MAX_ALLOCATION_SIZE));
            }

            // With no free blocks, slots create blocks in parallel instead of
            // serializing on the pool-wide mutex.
            if self.free.load(Ordering::Acquire).is_null() {
                let _guard = self.slot_mutex[slot].lock();
                if self.thread_used[slot].load(Ordering::Relaxed) == my_block {
                    let alloc_size = self
                        .grow_size
                        .load(Ordering::Relaxed)
                        .max(bytes)
                        .min(MAX_ALLOCATION_SIZE);
                    let block = Block::create(
                        &*self.backend,
                        alloc_size,
                        alloc_size,
                        self.thread_head[slot].load(Ordering::Relaxed),
                        self.atype,
                    )?;
                    #[cfg(feature = "tracing")]
                    trace!(slot, alloc_size, "created slot block");
                    self.thread_head[slot].store(block.as_ptr(), Ordering::Relaxed);
                    self.thread_used[slot].store(block.as_ptr(), Ordering::Release);
                }
                continue;
            }

            {
                let _guard = self.mutex.lock();
                if self.thread_used[slot].load(Ordering::Relaxed) == my_block {
                    let free_head = self.free.load(Ordering::Relaxed);
                    if let Some(b) = NonNull::new(free_head) {
                        // Recycle the free head: splice into used and publish
                        // as this slot's block.
                        // SAFETY: list mutation under the pool mutex; the
                        // block is alive and unreferenced by other slots.
                        unsafe {
                            let next_free = b.as_ref().next();
                            b.as_ref().set_next(self.used.load(Ordering::Relaxed));
                            self.used.store(free_head, Ordering::Release);
                            self.thread_used[slot].store(free_head, Ordering::Release);
                            self.free.store(next_free, Ordering::Relaxed);
                        }
                    } else {
                        // Grow: successive refills geometrically enlarge
                        // blocks to amortize backend round-trips.
                        let scale = self.next_grow_scale();
                        let alloc_size = self
                            .grow_size
                            .load(Ordering::Relaxed)
                            .saturating_mul(scale)
                            .min(MAX_ALLOCATION_SIZE + MAX_ALIGNMENT)
                            - MAX_ALIGNMENT;
                        let block = Block::create(
                            &*self.backend,
                            alloc_size,
                            alloc_size,
                            self.used.load(Ordering::Relaxed),
                            self.atype,
                        )?;
                        #[cfg(feature = "tracing")]
                        trace!(slot, alloc_size, scale, "grew pool block");
                        self.used.store(block.as_ptr(), Ordering::Release);
                        self.thread_used[slot].store(block.as_ptr(), Ordering::Release);
                    }
                }
            }
        }
    }

    /// Splices a caller-owned region into the free list as a `Shared`
    /// block. Regions smaller than 4 KiB after alignment are ignored.
    /// Shared blocks are dropped (not freed) on [`reset`](Self::reset) and
    /// never reach the backend.
    ///
    /// # Safety
    ///
    /// The region `[ptr, ptr+bytes)` must stay valid and otherwise
    /// untouched until the next `reset` or `clear`, whichever comes first.
    pub unsafe fn add_shared(&self, ptr: NonNull<u8>, bytes: usize) {
        let base = ptr.as_ptr() as usize;
        let aligned = align_up(base, MAX_ALIGNMENT);
        let ofs = aligned - base;
        let Some(remaining) = bytes.checked_sub(ofs) else { return };
        if remaining < 4096 {
            return;
        }

        let _guard = self.mutex.lock();
        // SAFETY: the aligned base owns `remaining` bytes per the caller's
        // contract; the header is written in place and the payload follows.
        let block = unsafe {
            Block::init_at(
                NonNull::new_unchecked(ptr.as_ptr().add(ofs)),
                remaining - HEADER_SIZE,
                remaining - HEADER_SIZE,
                self.free.load(Ordering::Relaxed),
                ofs,
                BlockKind::Shared,
                false,
            )
        };
        self.free.store(block.as_ptr(), Ordering::Release);
        #[cfg(feature = "tracing")]
        debug!(bytes = remaining, "spliced shared region into free list");
    }

    /// Splices all per-slot block chains into the used list.
    ///
    /// The only operation observing every per-slot list at once; callers
    /// ensure no allocation races it (quiescence).
    fn fix_used_blocks(&self) {
        for slot in 0..MAX_THREAD_BLOCK_SLOTS {
            while let Some(b) = NonNull::new(self.thread_head[slot].load(Ordering::Acquire)) {
                // SAFETY: quiescent list surgery; every block stays reachable.
                unsafe {
                    let chain_next = b.as_ref().next();
                    b.as_ref().set_next(self.used.load(Ordering::Relaxed));
                    self.used.store(b.as_ptr(), Ordering::Relaxed);
                    self.thread_head[slot].store(chain_next, Ordering::Relaxed);
                }
            }
        }
    }

    /// Recycles every block for the next build: used blocks rewind and move
    /// to the free list, shared blocks drop out, thread-local state wipes.
    /// All previously granted pointers become invalid.
    ///
    /// Quiescent callers only.
    pub fn reset(&self) {
        self.fix_used_blocks();
        self.bytes_used.store(0, Ordering::Relaxed);
        self.bytes_wasted.store(0, Ordering::Relaxed);

        while let Some(b) = NonNull::new(self.used.load(Ordering::Relaxed)) {
            // SAFETY: quiescent list surgery.
            unsafe {
                let next_used = b.as_ref().next();
                b.as_ref().reset_block();
                b.as_ref().set_next(self.free.load(Ordering::Relaxed));
                self.free.store(b.as_ptr(), Ordering::Relaxed);
                self.used.store(next_used, Ordering::Relaxed);
            }
        }

        // Shared regions are re-added by the caller per build.
        // SAFETY: quiescent, exclusively owned chain.
        let pruned = unsafe { remove_shared_blocks(self.free.load(Ordering::Relaxed)) };
        self.free.store(pruned, Ordering::Relaxed);

        for slot in 0..MAX_THREAD_BLOCK_SLOTS {
            self.thread_used[slot].store(std::ptr::null_mut(), Ordering::Relaxed);
            self.thread_head[slot].store(std::ptr::null_mut(), Ordering::Relaxed);
        }
        self.registry.reset_all();
        #[cfg(feature = "tracing")]
        debug!("pool reset");
    }

    /// Folds all thread-local accounting into the pool counters and drops
    /// the per-thread state.
    ///
    /// Quiescent callers only.
    pub fn cleanup(&self) {
        self.fix_used_blocks();
        let (used, wasted) = self.registry.drain_accounting();
        self.bytes_used.fetch_add(used, Ordering::Relaxed);
        self.bytes_wasted.fetch_add(wasted, Ordering::Relaxed);
    }

    /// Shrinks every OS-mapped used block to its touched size and releases
    /// all free blocks.
    ///
    /// Quiescent callers only.
    pub fn shrink(&self) {
        self.fix_used_blocks();
        // SAFETY: quiescent; used chain is stable and unused tails are
        // unreferenced.
        unsafe {
            for b in BlockIter::new(self.used.load(Ordering::Relaxed)) {
                b.as_ref().shrink_block(&*self.backend);
            }
        }
        let free_head = self.free.swap(std::ptr::null_mut(), Ordering::Relaxed);
        // SAFETY: the free chain was just detached; nothing references it.
        unsafe { Self::release_list(free_head, &*self.backend) };
        #[cfg(feature = "tracing")]
        debug!("pool shrunk to used size");
    }

    /// Returns all memory to the backend. All granted pointers become
    /// invalid.
    ///
    /// Quiescent callers only.
    pub fn clear(&self) {
        self.cleanup();
        self.bytes_used.store(0, Ordering::Relaxed);
        self.bytes_wasted.store(0, Ordering::Relaxed);
        let used = self.used.swap(std::ptr::null_mut(), Ordering::Relaxed);
        let free = self.free.swap(std::ptr::null_mut(), Ordering::Relaxed);
        // SAFETY: both chains just detached; quiescence guarantees no
        // outstanding references into their blocks.
        unsafe {
            Self::release_list(used, &*self.backend);
            Self::release_list(free, &*self.backend);
        }
        for slot in 0..MAX_THREAD_BLOCK_SLOTS {
            self.thread_used[slot].store(std::ptr::null_mut(), Ordering::Relaxed);
            self.thread_head[slot].store(std::ptr::null_mut(), Ordering::Relaxed);
        }
        #[cfg(feature = "tracing")]
        debug!("pool cleared");
    }

    /// # Safety
    ///
    /// `head`'s chain must be detached and unreferenced.
    unsafe fn release_list(head: *mut Block, backend: &dyn MemoryBackend) {
        let mut cur = head;
        while let Some(b) = NonNull::new(cur) {
            // SAFETY: forwarded contract; next is read before the block dies.
            unsafe {
                cur = b.as_ref().next();
                Block::release(b, backend);
            }
        }
    }

    /// Bytes handed out to callers: pool counters plus live thread locals.
    pub fn used_bytes(&self) -> usize {
        let (live, _) = self.registry.accounting();
        self.bytes_used.load(Ordering::Relaxed) + live
    }

    /// Padding and retired-tail bytes: pool counters plus live thread
    /// locals.
    pub fn wasted_bytes(&self) -> usize {
        let (_, live) = self.registry.accounting();
        self.bytes_wasted.load(Ordering::Relaxed) + live
    }

    /// Footprint of all blocks matching the filter. `huge` only
    /// discriminates OS-mapped blocks.
    pub fn statistics_for(&self, kind: Option<BlockKind>, huge: Option<bool>) -> Statistics {
        let _guard = self.mutex.lock();
        let mut stats = Statistics::default();
        // SAFETY: both chains are stable under the pool mutex.
        unsafe {
            for head in [self.free.load(Ordering::Relaxed), self.used.load(Ordering::Relaxed)] {
                for b in BlockIter::new(head) {
                    let b = b.as_ref();
                    if !b.matches(kind, huge) {
                        continue;
                    }
                    stats.bytes_allocated += b.total_allocated_bytes();
                    stats.bytes_reserved += b.total_reserved_bytes();
                    stats.bytes_free += b.free_bytes();
                }
            }
        }
        stats
    }

    /// Full per-kind footprint breakdown.
    pub fn full_statistics(&self) -> FullStatistics {
        FullStatistics {
            bytes_used: self.used_bytes(),
            bytes_wasted: self.wasted_bytes(),
            all: self.statistics_for(None, None),
            aligned: self.statistics_for(Some(BlockKind::AlignedSmall), None),
            os_small: self.statistics_for(Some(BlockKind::OsMapped), Some(false)),
            os_huge: self.statistics_for(Some(BlockKind::OsMapped), Some(true)),
            shared: self.statistics_for(Some(BlockKind::Shared), None),
        }
    }

    fn thread_slot(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) & self.slot_mask.load(Ordering::Relaxed)
    }

    fn next_grow_scale(&self) -> usize {
        let scale = self.log2_grow_scale.fetch_add(1, Ordering::Relaxed) + 1;
        1 << scale.min(16)
    }

    #[cfg(test)]
    fn slot_mask(&self) -> usize {
        self.slot_mask.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _guard = self.mutex.lock();
        let mut dbg = f.debug_struct("BlockPool");
        dbg.field("slot_mask", &self.slot_mask.load(Ordering::Relaxed))
            .field("single_mode", &self.single_mode.load(Ordering::Relaxed))
            .field("default_block_size", &self.default_block_size.load(Ordering::Relaxed))
            .field("grow_size", &self.grow_size.load(Ordering::Relaxed));
        // SAFETY: chains stable under the pool mutex.
        unsafe {
            let used: Vec<_> = BlockIter::new(self.used.load(Ordering::Relaxed))
                .map(|b| format!("{:?}", b.as_ref()))
                .collect();
            let free: Vec<_> = BlockIter::new(self.free.load(Ordering::Relaxed))
                .map(|b| format!("{:?}", b.as_ref()))
                .collect();
            dbg.field("used", &used).field("free", &free);
        }
        dbg.finish()
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OsBackend;

    fn pool() -> BlockPool {
        BlockPool::new(Arc::new(OsBackend), false)
    }

    #[test]
    fn slot_mask_thresholds() {
        assert_eq!(BlockPool::slot_mask_for(MAX_ALLOCATION_SIZE), 0);
        assert_eq!(BlockPool::slot_mask_for(5 * MAX_ALLOCATION_SIZE), 0x1);
        assert_eq!(BlockPool::slot_mask_for(9 * MAX_ALLOCATION_SIZE), 0x3);
        assert_eq!(BlockPool::slot_mask_for(17 * MAX_ALLOCATION_SIZE), 0x7);
    }

    #[test]
    fn init_uses_all_slots() {
        let p = pool();
        p.init(1 << 20, None).unwrap();
        assert_eq!(p.slot_mask(), MAX_THREAD_BLOCK_SLOTS - 1);
    }

    #[test]
    fn init_estimate_compact_single_slot() {
        let p = pool();
        p.init_estimate(1 << 26, false, true);
        assert_eq!(p.slot_mask(), 0);
    }

    #[test]
    fn grow_scale_caps() {
        let p = pool();
        for _ in 0..100 {
            let scale = p.next_grow_scale();
            assert!(scale <= 1 << 16);
        }
        assert_eq!(p.next_grow_scale(), 1 << 16);
    }

    #[test]
    fn reinit_degrades_to_reset() {
        let p = pool();
        p.init(1 << 16, None).unwrap();
        let (ptr, _) = p.allocate(128, 64, false).unwrap();
        unsafe { ptr.as_ptr().write(7) };
        p.init(1 << 16, None).unwrap();
        // Old grant space is recycled, not freed: the same sequence maps no
        // new memory.
        let reserved_before = p.statistics_for(None, None).bytes_reserved;
        let _ = p.allocate(128, 64, false).unwrap();
        assert_eq!(p.statistics_for(None, None).bytes_reserved, reserved_before);
    }
}
