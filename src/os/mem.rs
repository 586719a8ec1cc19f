use std::{io, ptr};

use libc::{
    madvise, mmap, mprotect, munmap, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE,
    MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
};
use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::{
    error::{Error, Result},
    util::{hint::cold, num::round_up},
};

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// A range of address space that is reserved but (initially) has no physical
/// memory behind it. Sub-ranges are committed and decommitted independently,
/// which is what lets us give back memory that isn't at the top of the range.
///
/// Reads or writes to an uncommitted page fault.
pub struct ReservedRegion {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the region is just an address range, it is never aliased by
// anything that would care which thread unmaps it
unsafe impl Send for ReservedRegion {}

impl ReservedRegion {
    /// `mmap()` a `PROT_NONE`, `MAP_NORESERVE` range of at least `size` bytes
    /// (rounded up to whole pages).
    ///
    /// # Errors
    /// - [`Error::OutOfAddressSpace`] if the mapping can't be made
    pub fn reserve(size: usize) -> Result<ReservedRegion> {
        if size == 0 {
            return Err(Error::OutOfAddressSpace { size, errno: 0 });
        }
        let size = round_up(size, *PAGE_SIZE);
        // SAFETY: anonymous private mapping at a kernel-chosen address, we
        // don't touch any existing mapping
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_NONE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return cold(|| {
                let errno = errno();
                warn!("mmap({size}) failed, errno = {errno}");
                Err(Error::OutOfAddressSpace { size, errno })
            });
        }
        debug!("reserved {size} bytes at {ptr:p}");
        Ok(ReservedRegion {
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Back `len` bytes at `offset` with physical memory (read/write). Pages
    /// come back zeroed.
    ///
    /// # Panics
    /// - If the range is not page aligned or not inside the region
    pub fn commit(&self, offset: usize, len: usize) -> Result<()> {
        self.assert_page_range(offset, len);
        // SAFETY: the range is page aligned and inside our own mapping
        let rc = unsafe { mprotect(self.ptr.add(offset) as _, len, PROT_READ | PROT_WRITE) };
        if rc != 0 {
            return cold(|| {
                let errno = errno();
                warn!("commit of {len} bytes at offset {offset} failed, errno = {errno}");
                Err(Error::OutOfAddressSpace { size: len, errno })
            });
        }
        Ok(())
    }

    /// Drop the physical memory behind `len` bytes at `offset` and make the
    /// range inaccessible again.
    ///
    /// # Panics
    /// - If the range is not page aligned or not inside the region
    pub fn decommit(&self, offset: usize, len: usize) {
        self.assert_page_range(offset, len);
        // SAFETY: the range is page aligned and inside our own mapping. The
        // caller has given up every pointer into it.
        unsafe {
            let addr = self.ptr.add(offset) as *mut libc::c_void;
            if madvise(addr, len, MADV_DONTNEED) != 0 {
                warn!("madvise(DONTNEED) at offset {offset} failed, errno = {}", errno());
            }
            if mprotect(addr, len, PROT_NONE) != 0 {
                warn!("mprotect(NONE) at offset {offset} failed, errno = {}", errno());
            }
        }
    }

    fn assert_page_range(&self, offset: usize, len: usize) {
        assert!(
            offset % *PAGE_SIZE == 0 && len % *PAGE_SIZE == 0,
            "range {offset}+{len} is not page aligned"
        );
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.size),
            "range {offset}+{len} is outside a region of {} bytes",
            self.size
        );
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - `self.ptr` came from `mmap()`, so it is page aligned
        // - `self.size` is exactly what we mapped
        unsafe {
            if munmap(self.ptr as _, self.size) != 0 {
                warn!("munmap({:p}) failed, errno = {}", self.ptr, errno());
            }
        }
        debug!("released {} bytes at {:p}", self.size, self.ptr);
    }
}
