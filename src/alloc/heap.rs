use std::ffi::c_void;

/// The general purpose heap: whatever `malloc()` the process links against.
/// Everything the block allocator can't (or won't) serve ends up here.
///
/// Unlike the Rust global allocator, this one does not need a size on `free()`,
/// which is what the C side of the interpreter expects.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHeap;

impl SystemHeap {
    /// Null on failure
    pub fn malloc(&self, size: usize) -> *mut u8 {
        // SAFETY: `malloc()` has no preconditions
        unsafe { libc::malloc(size) as *mut u8 }
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this heap. On success the
    /// old pointer is dead. A null return with `size != 0` is a failure and
    /// leaves it untouched, but with `size == 0` the old pointer may have been
    /// freed (glibc does), so it must be treated as dead either way.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        libc::realloc(ptr as *mut c_void, size) as *mut u8
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this heap
    pub unsafe fn free(&self, ptr: *mut u8) {
        libc::free(ptr as *mut c_void)
    }
}
