//! Intrusive block headers backing the pool
//!
//! A block is a single backing region with a 64-byte header at its base
//! and the allocatable payload behind it. Carving from a block is
//! lock-free: one fetch-add on the cursor plus a post-check. The cursor
//! may transiently overshoot `reserve_end` on failed attempts; it is never
//! rolled back, so every bound check compares the post-add value and
//! accounting accessors clamp.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::backend::MemoryBackend;
use crate::error::{MemoryError, MemoryResult};
use crate::platform::{self, HUGE_PAGE_SIZE};
use crate::utils::{align_up, is_aligned};

/// Maximum alignment the pool supports; also the carve granularity and
/// the header size.
pub const MAX_ALIGNMENT: usize = 64;

/// Largest single allocation a block can serve.
pub const MAX_ALLOCATION_SIZE: usize = 4 * 1024 * 1024 - MAX_ALIGNMENT;

/// How a block's backing region was obtained, and therefore how it must
/// be returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Heap allocation through the backend's aligned small-block allocator
    AlignedSmall,
    /// Anonymous OS mapping
    OsMapped,
    /// Caller-owned region spliced in via `add_shared`; never freed by the pool
    Shared,
}

/// Block header; the payload starts immediately behind it.
#[repr(C, align(64))]
pub(crate) struct Block {
    /// Bytes consumed from the payload; monotonic within a reset epoch.
    /// May exceed `reserve_end` after failed carve attempts.
    cursor: AtomicUsize,
    /// High-water mark of the touched payload region
    alloc_end: AtomicUsize,
    /// Payload capacity
    reserve_end: AtomicUsize,
    /// Next block in its list; mutated under the pool locks or at
    /// quiescent lifecycle points only
    next: AtomicPtr<Block>,
    /// Alignment padding consumed in front of the header (shared blocks)
    /// or charged by the aligned allocation itself
    wasted: usize,
    kind: BlockKind,
    huge: bool,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<Block>();

// The header doubles as the payload alignment spacer.
const _: () = assert!(HEADER_SIZE == MAX_ALIGNMENT);

impl Block {
    /// Creates a block sized for `bytes_allocate` committed / `bytes_reserve`
    /// reserved payload bytes, linked in front of `next`.
    ///
    /// Sizes are rounded up to whole pages including the header. An
    /// `AlignedSmall` request of exactly two huge pages is promoted: the
    /// first block of a chain becomes an OS mapping (full huge-page
    /// alignment), later ones stay on the heap but get huge-page advice.
    pub(crate) fn create(
        backend: &dyn MemoryBackend,
        bytes_allocate: usize,
        bytes_reserve: usize,
        next: *mut Block,
        kind: BlockKind,
    ) -> MemoryResult<NonNull<Block>> {
        let page = platform::page_size();
        let alloc_total = align_up(HEADER_SIZE + bytes_allocate, page);
        let reserve_total = align_up(HEADER_SIZE + bytes_reserve.max(bytes_allocate), page);

        match kind {
            BlockKind::OsMapped => Self::create_mapped(backend, alloc_total, reserve_total, next),
            BlockKind::AlignedSmall => {
                if alloc_total == 2 * HUGE_PAGE_SIZE && next.is_null() {
                    return Self::create_mapped(backend, alloc_total, reserve_total, next);
                }
                backend.memory_monitor((alloc_total + MAX_ALIGNMENT) as isize, false);
                let ptr = backend
                    .aligned_alloc(alloc_total, MAX_ALIGNMENT)
                    .map_err(|e| MemoryError::backend(alloc_total, e))?;
                if alloc_total == 2 * HUGE_PAGE_SIZE {
                    // Hint the kernel to transparently promote the covered
                    // huge-page frames; the first and last may not be fully
                    // backed, which the advice call tolerates.
                    let base = ptr.as_ptr() as usize & !(HUGE_PAGE_SIZE - 1);
                    for i in 0..3 {
                        if let Some(p) = NonNull::new((base + i * HUGE_PAGE_SIZE) as *mut u8) {
                            backend.os_advise(p, HUGE_PAGE_SIZE);
                        }
                    }
                }
                // SAFETY: ptr owns alloc_total fresh bytes aligned to the
                // header alignment; payload capacity excludes the header.
                Ok(unsafe {
                    Self::init_at(
                        ptr,
                        alloc_total - HEADER_SIZE,
                        alloc_total - HEADER_SIZE,
                        next,
                        MAX_ALIGNMENT,
                        BlockKind::AlignedSmall,
                        false,
                    )
                })
            }
            BlockKind::Shared => unreachable!("shared blocks are constructed in place"),
        }
    }

    fn create_mapped(
        backend: &dyn MemoryBackend,
        alloc_total: usize,
        reserve_total: usize,
        next: *mut Block,
    ) -> MemoryResult<NonNull<Block>> {
        backend.memory_monitor(alloc_total as isize, false);
        let mapping = backend
            .os_map(reserve_total)
            .map_err(|e| MemoryError::backend(reserve_total, e))?;
        // SAFETY: the mapping owns mapping.bytes fresh bytes at page
        // alignment, which satisfies the header alignment.
        Ok(unsafe {
            Self::init_at(
                mapping.ptr,
                alloc_total.min(mapping.bytes) - HEADER_SIZE,
                mapping.bytes - HEADER_SIZE,
                next,
                0,
                BlockKind::OsMapped,
                mapping.huge,
            )
        })
    }

    /// Writes a block header at `ptr` and returns it.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to [`MAX_ALIGNMENT`] and own at least
    /// `HEADER_SIZE + reserve_end` bytes with no other references.
    pub(crate) unsafe fn init_at(
        ptr: NonNull<u8>,
        alloc_end: usize,
        reserve_end: usize,
        next: *mut Block,
        wasted: usize,
        kind: BlockKind,
        huge: bool,
    ) -> NonNull<Block> {
        debug_assert!(is_aligned(ptr.as_ptr() as usize, MAX_ALIGNMENT));
        let block = ptr.cast::<Block>();
        // SAFETY: caller guarantees ownership and alignment of the header bytes.
        unsafe {
            block.as_ptr().write(Block {
                cursor: AtomicUsize::new(0),
                alloc_end: AtomicUsize::new(alloc_end),
                reserve_end: AtomicUsize::new(reserve_end),
                next: AtomicPtr::new(next),
                wasted,
                kind,
                huge,
            });
        }
        block
    }

    /// Base address of the backing region (the header itself).
    pub(crate) fn base_ptr(&self) -> NonNull<u8> {
        // SAFETY: self is a live reference, its address is non-null.
        unsafe { NonNull::new_unchecked(self as *const Block as *mut u8) }
    }

    /// Start of the allocatable payload.
    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: payload begins directly behind the header within the same
        // backing region.
        unsafe { (self as *const Block as *mut u8).add(HEADER_SIZE) }
    }

    /// Lock-free carve of `bytes` from this block.
    ///
    /// Requests are rounded up to [`MAX_ALIGNMENT`], so every grant is
    /// 64-aligned by construction. With `partial` set the trailing slack of
    /// the block may satisfy the request with fewer bytes; a grant is never
    /// empty. Returns the granted pointer and byte count, or `None` when
    /// the block cannot serve the request.
    pub(crate) fn carve(
        &self,
        backend: &dyn MemoryBackend,
        bytes: usize,
        partial: bool,
    ) -> Option<(NonNull<u8>, usize)> {
        debug_assert!(bytes > 0);
        let rounded = align_up(bytes, MAX_ALIGNMENT);
        let reserve_end = self.reserve_end.load(Ordering::Relaxed);

        // Cheap pre-check so exhausted blocks do not inflate the cursor.
        if !partial && self.cursor.load(Ordering::Relaxed) + rounded > reserve_end {
            return None;
        }
        let start = self.cursor.fetch_add(rounded, Ordering::Relaxed);
        if !partial && start + rounded > reserve_end {
            return None;
        }
        if start >= reserve_end {
            return None;
        }
        let span = rounded.min(reserve_end - start);

        let alloc_end = self.alloc_end.load(Ordering::Relaxed);
        if start + span > alloc_end {
            // First touch beyond the committed region.
            backend.memory_monitor((start + span - alloc_end.max(start)) as isize, true);
        }

        // SAFETY: [start, start+span) is within the payload (checked above)
        // and exclusively ours: the fetch-add hands every carve a disjoint
        // cursor range.
        let ptr = unsafe { NonNull::new_unchecked(self.payload_ptr().add(start)) };
        let granted = if partial { span } else { bytes };
        Some((ptr, granted))
    }

    /// Rewinds the cursor for reuse, folding the touched region into the
    /// committed high-water mark. Quiescent callers only.
    pub(crate) fn reset_block(&self) {
        let reserve_end = self.reserve_end.load(Ordering::Relaxed);
        let cur = self.cursor.load(Ordering::Relaxed).min(reserve_end);
        let alloc_end = self.alloc_end.load(Ordering::Relaxed);
        self.alloc_end.store(alloc_end.max(cur), Ordering::Relaxed);
        self.cursor.store(0, Ordering::Relaxed);
    }

    /// Returns the unused tail of an OS-mapped block to the system.
    ///
    /// # Safety
    ///
    /// Quiescent callers only; no outstanding allocation may reach past the
    /// used prefix.
    pub(crate) unsafe fn shrink_block(&self, backend: &dyn MemoryBackend) {
        if self.kind != BlockKind::OsMapped {
            return;
        }
        let reserved = self.reserve_end.load(Ordering::Relaxed);
        // SAFETY: forwarded contract; the tail past the used prefix is
        // unreferenced by the caller's guarantee.
        let new_total = unsafe {
            backend.os_shrink(
                self.base_ptr(),
                HEADER_SIZE + self.used_bytes(),
                HEADER_SIZE + reserved,
                self.huge,
            )
        };
        let new_payload = new_total - HEADER_SIZE;
        backend.memory_monitor(
            new_payload as isize - self.alloc_end.load(Ordering::Relaxed) as isize,
            true,
        );
        self.reserve_end.store(new_payload, Ordering::Relaxed);
        self.alloc_end.store(new_payload, Ordering::Relaxed);
        self.cursor
            .store(self.cursor.load(Ordering::Relaxed).min(new_payload), Ordering::Relaxed);
    }

    /// Returns the backing region to the backend according to its kind.
    ///
    /// # Safety
    ///
    /// `block` must be unreachable from every list afterwards; no
    /// allocation served from it may still be referenced.
    pub(crate) unsafe fn release(block: NonNull<Block>, backend: &dyn MemoryBackend) {
        // SAFETY: caller hands over sole ownership of the block.
        let b = unsafe { block.as_ref() };
        let reserved = b.reserve_end.load(Ordering::Relaxed);
        let freed = (b.wasted + HEADER_SIZE + b.allocated_bytes()) as isize;
        match b.kind {
            BlockKind::AlignedSmall => {
                // SAFETY: the region was produced by aligned_alloc with this
                // exact size and alignment.
                unsafe {
                    backend.aligned_free(b.base_ptr(), HEADER_SIZE + reserved, MAX_ALIGNMENT);
                }
                backend.memory_monitor(-freed, true);
            }
            BlockKind::OsMapped => {
                let huge = b.huge;
                let ptr = b.base_ptr();
                // SAFETY: reserve_end tracks shrink adjustments, so the
                // triple matches the live mapping.
                let _ = unsafe { backend.os_unmap(ptr, HEADER_SIZE + reserved, huge) };
                backend.memory_monitor(-freed, true);
            }
            BlockKind::Shared => {}
        }
    }

    pub(crate) fn kind(&self) -> BlockKind {
        self.kind
    }

    pub(crate) fn next(&self) -> *mut Block {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, next: *mut Block) {
        self.next.store(next, Ordering::Release);
    }

    /// Payload capacity in bytes.
    pub(crate) fn payload_capacity(&self) -> usize {
        self.reserve_end.load(Ordering::Relaxed)
    }

    /// Payload bytes actually consumed by grants.
    pub(crate) fn used_bytes(&self) -> usize {
        self.cursor
            .load(Ordering::Relaxed)
            .min(self.reserve_end.load(Ordering::Relaxed))
    }

    /// Committed payload bytes (touched high-water, clamped to capacity).
    pub(crate) fn allocated_bytes(&self) -> usize {
        let reserve_end = self.reserve_end.load(Ordering::Relaxed);
        self.alloc_end
            .load(Ordering::Relaxed)
            .max(self.cursor.load(Ordering::Relaxed))
            .min(reserve_end)
    }

    /// Total footprint charged for consumed bytes: payload + header + padding.
    pub(crate) fn total_allocated_bytes(&self) -> usize {
        self.used_bytes() + HEADER_SIZE + self.wasted
    }

    /// Total footprint of the reservation.
    pub(crate) fn total_reserved_bytes(&self) -> usize {
        self.reserve_end.load(Ordering::Relaxed) + HEADER_SIZE + self.wasted
    }

    /// Committed-but-unconsumed payload bytes.
    pub(crate) fn free_bytes(&self) -> usize {
        self.allocated_bytes() - self.used_bytes()
    }

    /// Whether this block matches a statistics filter.
    pub(crate) fn matches(&self, kind: Option<BlockKind>, huge: Option<bool>) -> bool {
        match kind {
            None => true,
            Some(k) if k != self.kind => false,
            Some(BlockKind::OsMapped) => huge.map_or(true, |h| h == self.huge),
            Some(_) => true,
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            BlockKind::AlignedSmall => "A",
            BlockKind::OsMapped if self.huge => "OH",
            BlockKind::OsMapped => "O",
            BlockKind::Shared => "S",
        };
        write!(
            f,
            "{}[{}, {}, {}]",
            tag,
            self.used_bytes(),
            self.total_allocated_bytes(),
            self.total_reserved_bytes()
        )
    }
}

/// Iterator over an intrusive block chain.
///
/// Construction is unsafe: the caller asserts the chain is stable for the
/// iterator's lifetime (pool lock held, or a quiescent lifecycle point).
pub(crate) struct BlockIter {
    cur: *mut Block,
}

impl BlockIter {
    /// # Safety
    ///
    /// See the type docs: `head`'s chain must stay valid and unmodified
    /// while the iterator lives.
    pub(crate) unsafe fn new(head: *mut Block) -> Self {
        Self { cur: head }
    }
}

impl Iterator for BlockIter {
    type Item = NonNull<Block>;

    fn next(&mut self) -> Option<NonNull<Block>> {
        let block = NonNull::new(self.cur)?;
        // SAFETY: construction contract keeps every block in the chain alive.
        self.cur = unsafe { block.as_ref().next() };
        Some(block)
    }
}

/// Unlinks all `Shared` blocks from a chain, returning the new head.
///
/// # Safety
///
/// Quiescent callers only; the chain must be exclusively owned for the
/// duration of the call.
pub(crate) unsafe fn remove_shared_blocks(head: *mut Block) -> *mut Block {
    let mut new_head = head;
    // SAFETY: exclusive chain ownership per the function contract.
    unsafe {
        // Skip leading shared blocks.
        while let Some(b) = NonNull::new(new_head) {
            if b.as_ref().kind() != BlockKind::Shared {
                break;
            }
            new_head = b.as_ref().next();
        }
        let mut prev = new_head;
        while let Some(p) = NonNull::new(prev) {
            let mut next = p.as_ref().next();
            while let Some(n) = NonNull::new(next) {
                if n.as_ref().kind() != BlockKind::Shared {
                    break;
                }
                next = n.as_ref().next();
            }
            p.as_ref().set_next(next);
            prev = next;
        }
    }
    new_head
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OsBackend;

    fn new_block(payload: usize) -> NonNull<Block> {
        Block::create(&OsBackend, payload, payload, std::ptr::null_mut(), BlockKind::AlignedSmall)
            .expect("block creation failed")
    }

    #[test]
    fn header_is_one_cache_line() {
        assert_eq!(HEADER_SIZE, 64);
    }

    #[test]
    fn carve_grants_are_disjoint_and_aligned() {
        let block = new_block(4096);
        let b = unsafe { block.as_ref() };
        let (p0, g0) = b.carve(&OsBackend, 48, false).unwrap();
        let (p1, _) = b.carve(&OsBackend, 80, false).unwrap();
        assert_eq!(g0, 48);
        assert_eq!(p0.as_ptr() as usize % MAX_ALIGNMENT, 0);
        assert_eq!(p1.as_ptr() as usize % MAX_ALIGNMENT, 0);
        // 48 rounds to one full cache line plus one more.
        assert_eq!(p1.as_ptr() as usize - p0.as_ptr() as usize, 64);
        unsafe { Block::release(block, &OsBackend) };
    }

    #[test]
    fn carve_rejects_when_exhausted() {
        let block = new_block(256);
        let b = unsafe { block.as_ref() };
        let capacity = b.payload_capacity();
        assert!(b.carve(&OsBackend, capacity, false).is_some());
        assert!(b.carve(&OsBackend, 64, false).is_none());
        unsafe { Block::release(block, &OsBackend) };
    }

    #[test]
    fn partial_carve_returns_tail() {
        let block = new_block(256);
        let b = unsafe { block.as_ref() };
        let capacity = b.payload_capacity();
        let (_, g) = b.carve(&OsBackend, capacity - 64, false).unwrap();
        assert_eq!(g, capacity - 64);
        let (_, tail) = b.carve(&OsBackend, 4096, true).unwrap();
        assert_eq!(tail, 64);
        // Exhausted now, even partially.
        assert!(b.carve(&OsBackend, 64, true).is_none());
        unsafe { Block::release(block, &OsBackend) };
    }

    #[test]
    fn reset_rewinds_cursor() {
        let block = new_block(1024);
        let b = unsafe { block.as_ref() };
        b.carve(&OsBackend, 512, false).unwrap();
        assert!(b.used_bytes() >= 512);
        b.reset_block();
        assert_eq!(b.used_bytes(), 0);
        assert!(b.allocated_bytes() >= 512);
        unsafe { Block::release(block, &OsBackend) };
    }

    #[test]
    fn shared_blocks_unlink() {
        let backend = OsBackend;
        let a = new_block(256);
        let mut region = vec![0u8; 8192];
        let shared_base = align_up(region.as_mut_ptr() as usize, MAX_ALIGNMENT);
        let shared = unsafe {
            Block::init_at(
                NonNull::new(shared_base as *mut u8).unwrap(),
                4096,
                4096,
                a.as_ptr(),
                shared_base - region.as_ptr() as usize,
                BlockKind::Shared,
                false,
            )
        };
        let head = unsafe { remove_shared_blocks(shared.as_ptr()) };
        assert_eq!(head, a.as_ptr());
        unsafe { Block::release(a, &backend) };
    }
}
