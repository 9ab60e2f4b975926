//! Platform memory primitives for the block pool
//!
//! Direct wrappers over the OS virtual-memory interface: anonymous
//! mappings with an opportunistic huge-page attempt, tail decommit for
//! shrinking, and transparent-huge-page advice. Each function carries
//! per-platform blocks with a portable `std::alloc` fallback.

use std::io;
use std::ptr::NonNull;
use std::sync::LazyLock;

/// Conventional huge page size (2 MiB) used for rounding and advice.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

static PAGE_SIZE: LazyLock<usize> = LazyLock::new(query_page_size);

/// Base page size of the running system.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn query_page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf with a valid name has no preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
        4096
    }

    #[cfg(windows)]
    {
        use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};

        // SAFETY: GetSystemInfo fills the provided out-struct and cannot fail.
        unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        4096
    }
}

/// An anonymous memory mapping obtained from the OS.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    /// Base address of the mapping
    pub ptr: NonNull<u8>,
    /// Actual mapped size; may exceed the request when huge pages rounded it up
    pub bytes: usize,
    /// Whether the mapping is backed by huge pages
    pub huge: bool,
}

// SAFETY: a Mapping is a plain (address, size, flag) triple; ownership of
// the region is managed by the caller, so moving the descriptor between
// threads carries no aliasing obligations of its own.
unsafe impl Send for Mapping {}

/// Maps `bytes` of anonymous read-write memory.
///
/// Sizes of at least [`HUGE_PAGE_SIZE`] first attempt an explicit
/// huge-page mapping; on failure the request falls back to base pages.
pub fn map_memory(bytes: usize) -> io::Result<Mapping> {
    #[cfg(unix)]
    {
        use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        #[cfg(target_os = "linux")]
        if bytes >= HUGE_PAGE_SIZE {
            let rounded = crate::utils::align_up(bytes, HUGE_PAGE_SIZE);
            // SAFETY: anonymous mapping with no address hint; the result is
            // checked against MAP_FAILED before use.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    rounded,
                    PROT_READ | PROT_WRITE,
                    MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_HUGETLB,
                    -1,
                    0,
                )
            };
            if ptr != MAP_FAILED {
                let ptr = NonNull::new(ptr as *mut u8)
                    .expect("mmap returned success with a null address");
                return Ok(Mapping { ptr, bytes: rounded, huge: true });
            }
            // No huge pages configured; fall through to base pages.
        }

        // SAFETY: same as above, base-page path.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8).expect("mmap returned success with a null address");
        advise_huge(ptr, bytes);
        Ok(Mapping { ptr, bytes, huge: false })
    }

    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

        // SAFETY: reserving and committing fresh pages; the result is
        // null-checked before use. Large-page allocation needs a privilege
        // most processes lack, so only base pages are requested.
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                bytes,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        match NonNull::new(ptr as *mut u8) {
            Some(ptr) => Ok(Mapping { ptr, bytes, huge: false }),
            None => Err(io::Error::last_os_error()),
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let ptr = aligned_alloc(bytes, page_size())?;
        Ok(Mapping { ptr, bytes, huge: false })
    }
}

/// Releases a mapping created by [`map_memory`].
///
/// # Safety
///
/// `ptr`/`bytes`/`huge` must describe a live mapping exactly as returned
/// (or as later adjusted by [`shrink_memory`]), and no references into the
/// region may outlive the call.
pub unsafe fn unmap_memory(ptr: NonNull<u8>, bytes: usize, huge: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        let _ = huge;
        // SAFETY: caller guarantees the region is a live mapping of this size.
        let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, bytes) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;

        let _ = (bytes, huge);
        // SAFETY: caller guarantees ptr is the base of a VirtualAlloc region.
        let rc = unsafe { VirtualFree(ptr.as_ptr() as *mut std::ffi::c_void, 0, MEM_RELEASE) };
        if rc == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = huge;
        // SAFETY: the fallback maps through aligned_alloc.
        unsafe { aligned_free(ptr, bytes, page_size()) };
        Ok(())
    }
}

/// Returns the tail of a mapping to the OS, keeping the first
/// `used_bytes` (rounded up to the page granularity) resident.
///
/// Returns the new reserved size. A failure to shrink leaves the mapping
/// untouched and reports the original size; shrinking is an optimization,
/// not a correctness requirement.
///
/// # Safety
///
/// Same contract as [`unmap_memory`]; additionally no references into the
/// released tail may exist.
pub unsafe fn shrink_memory(
    ptr: NonNull<u8>,
    used_bytes: usize,
    reserved_bytes: usize,
    huge: bool,
) -> usize {
    let granularity = if huge { HUGE_PAGE_SIZE } else { page_size() };
    let keep = crate::utils::align_up(used_bytes, granularity).min(reserved_bytes);
    if keep == reserved_bytes {
        return reserved_bytes;
    }

    #[cfg(unix)]
    {
        // SAFETY: [keep, reserved_bytes) is a page-aligned suffix of the
        // caller's live mapping and the caller guarantees it is unreferenced.
        let rc = unsafe {
            libc::munmap(
                ptr.as_ptr().add(keep) as *mut libc::c_void,
                reserved_bytes - keep,
            )
        };
        if rc == -1 {
            return reserved_bytes;
        }
        keep
    }

    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_DECOMMIT;

        // SAFETY: decommitting a page-aligned suffix of a committed region.
        let rc = unsafe {
            VirtualFree(
                ptr.as_ptr().add(keep) as *mut std::ffi::c_void,
                reserved_bytes - keep,
                MEM_DECOMMIT,
            )
        };
        if rc == 0 {
            return reserved_bytes;
        }
        keep
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = ptr;
        reserved_bytes
    }
}

/// Advises the OS to back `[ptr, ptr+bytes)` with transparent huge pages.
///
/// Purely advisory; failures (unaligned span, unsupported platform) are
/// ignored.
pub fn advise_huge(ptr: NonNull<u8>, bytes: usize) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: madvise never writes through the pointer; an invalid range
        // only yields an error return, which advice deliberately ignores.
        unsafe {
            libc::madvise(ptr.as_ptr() as *mut libc::c_void, bytes, libc::MADV_HUGEPAGE);
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (ptr, bytes);
    }
}

/// Allocates `bytes` aligned to `align` from the process heap.
pub fn aligned_alloc(bytes: usize, align: usize) -> io::Result<NonNull<u8>> {
    let layout = std::alloc::Layout::from_size_align(bytes, align)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: layout has non-zero size at every call site (block creation
    // always includes the header).
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

/// Frees memory obtained from [`aligned_alloc`].
///
/// # Safety
///
/// `ptr` must come from [`aligned_alloc`] with the same `bytes`/`align`.
pub unsafe fn aligned_free(ptr: NonNull<u8>, bytes: usize, align: usize) {
    let layout = std::alloc::Layout::from_size_align(bytes, align)
        .expect("layout was valid at allocation time");
    // SAFETY: caller passes the allocation's own layout.
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_sane() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 4096);
    }

    #[test]
    fn map_unmap_roundtrip() {
        let mapping = map_memory(64 * 1024).expect("mapping failed");
        // Touch both ends of the mapping.
        unsafe {
            mapping.ptr.as_ptr().write(0xA5);
            mapping.ptr.as_ptr().add(mapping.bytes - 1).write(0x5A);
            assert_eq!(mapping.ptr.as_ptr().read(), 0xA5);
            unmap_memory(mapping.ptr, mapping.bytes, mapping.huge).expect("unmap failed");
        }
    }

    #[test]
    fn shrink_keeps_used_prefix() {
        let mapping = map_memory(16 * page_size()).expect("mapping failed");
        unsafe {
            mapping.ptr.as_ptr().write(1);
            let new_size = shrink_memory(mapping.ptr, page_size(), mapping.bytes, mapping.huge);
            assert!(new_size >= page_size());
            assert!(new_size <= mapping.bytes);
            assert_eq!(mapping.ptr.as_ptr().read(), 1);
            unmap_memory(mapping.ptr, new_size, mapping.huge).expect("unmap failed");
        }
    }

    #[test]
    fn aligned_alloc_alignment() {
        for align in [8usize, 16, 32, 64] {
            let ptr = aligned_alloc(256, align).expect("alloc failed");
            assert_eq!(ptr.as_ptr() as usize % align, 0);
            unsafe { aligned_free(ptr, 256, align) };
        }
    }
}
