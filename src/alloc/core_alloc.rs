//! The front door for the interpreter's core allocations.
//!
//! Either the embedder has installed its own allocator triple (in which case
//! everything goes straight to it), or we take the default path: block-sized
//! requests go to the [`Dlc`] and everything else, including whatever the
//! `Dlc` can't serve, goes to the [`SystemHeap`].

use std::{cmp, ffi::c_void, ptr};

use log::{debug, trace};

use crate::error::{Error, Result};

use super::{
    dlc::{Dlc, DlcConfig, DlcStats},
    heap::SystemHeap,
};

pub type AllocFn = unsafe extern "C" fn(size: usize, context: *mut c_void) -> *mut c_void;
pub type ReallocFn =
    unsafe extern "C" fn(ptr: *mut c_void, size: usize, context: *mut c_void) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(ptr: *mut c_void, context: *mut c_void);

/// An embedder-supplied allocator. Each function is optional on its own: a
/// missing one means "default path" for that operation only.
#[derive(Clone, Copy, Debug)]
pub struct AllocatorVTable {
    pub alloc: Option<AllocFn>,
    pub realloc: Option<ReallocFn>,
    pub free: Option<FreeFn>,
    /// Passed back verbatim as the last argument of every call
    pub context: *mut c_void,
}

// SAFETY: the context pointer is opaque to us, whoever installs the table
// vouches for calling it from any thread (see `CoreAllocator::set_allocator`)
unsafe impl Send for AllocatorVTable {}

impl AllocatorVTable {
    pub const fn unset() -> Self {
        Self {
            alloc: None,
            realloc: None,
            free: None,
            context: ptr::null_mut(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.alloc.is_some() || self.realloc.is_some() || self.free.is_some()
    }
}

impl Default for AllocatorVTable {
    fn default() -> Self {
        Self::unset()
    }
}

pub struct CoreAllocator {
    vtable: AllocatorVTable,
    dlc: Option<Dlc>,
    heap: SystemHeap,
}

impl CoreAllocator {
    /// No custom allocator, no block region: everything goes to the heap
    /// until [`CoreAllocator::init_dlc()`] is called.
    pub const fn new() -> Self {
        Self {
            vtable: AllocatorVTable::unset(),
            dlc: None,
            heap: SystemHeap,
        }
    }

    /// Route every subsequent call through `vtable`.
    ///
    /// # Safety
    ///
    /// - Each function in `vtable` must behave like its libc namesake for the
    ///   given context, and be callable from whichever thread allocates
    /// - Install this before anything has been allocated: pointers handed
    ///   out by the old path must not be passed to the new one
    pub unsafe fn set_allocator(&mut self, vtable: AllocatorVTable) {
        debug!("custom allocator installed: {}", vtable.is_set());
        self.vtable = vtable;
    }

    pub fn vtable(&self) -> AllocatorVTable {
        self.vtable
    }

    pub fn init_dlc(&mut self, config: DlcConfig) -> Result<()> {
        if self.dlc.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        self.dlc = Some(Dlc::init(config)?);
        Ok(())
    }

    /// Release the block region. Every block must have been freed.
    pub fn fini_dlc(&mut self) -> Result<()> {
        self.dlc.take().ok_or(Error::NotInitialized)?.fini();
        Ok(())
    }

    pub fn dlc(&self) -> Option<&Dlc> {
        self.dlc.as_ref()
    }

    pub fn stats(&self) -> Option<DlcStats> {
        self.dlc.as_ref().map(Dlc::stats)
    }

    /// `true` iff `ptr` is a live block of the block region
    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        self.dlc.as_ref().is_some_and(|dlc| dlc.is_allocated(ptr))
    }

    /// Null on failure
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        match self.vtable.alloc {
            // SAFETY: vouched for by `set_allocator()`
            Some(alloc) => unsafe { alloc(size, self.vtable.context) as *mut u8 },
            None => self.default_malloc(size),
        }
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from this allocator
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self.vtable.realloc {
            Some(realloc) => realloc(ptr as *mut c_void, size, self.vtable.context) as *mut u8,
            None => self.default_realloc(ptr, size),
        }
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from this allocator
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        match self.vtable.free {
            Some(free) => free(ptr as *mut c_void, self.vtable.context),
            None => self.default_free(ptr),
        }
    }

    /// The block region first, then the heap
    pub fn default_malloc(&mut self, size: usize) -> *mut u8 {
        if let Some(p) = self.dlc.as_mut().and_then(|dlc| dlc.alloc(size)) {
            return p.as_ptr();
        }
        self.heap.malloc(size)
    }

    /// A block never grows in place: it moves to the heap and stays there.
    /// If the heap can't take it, null is returned and the block is still
    /// live.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from the default path
    pub unsafe fn default_realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        let Some(dlc) = self.dlc.as_mut().filter(|dlc| dlc.is_allocated(ptr)) else {
            return self.heap.realloc(ptr, size);
        };
        let new = self.heap.malloc(size);
        if new.is_null() {
            return new;
        }
        let len = cmp::min(dlc.block_size(), size);
        ptr::copy_nonoverlapping(ptr as *const u8, new, len);
        dlc.free(ptr);
        trace!("migrated block {ptr:p} to heap {new:p} ({size} bytes)");
        new
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from the default path
    pub unsafe fn default_free(&mut self, ptr: *mut u8) {
        match self.dlc.as_mut() {
            Some(dlc) if dlc.is_allocated(ptr) => dlc.free(ptr),
            _ => self.heap.free(ptr),
        }
    }
}

impl Default for CoreAllocator {
    fn default() -> Self {
        Self::new()
    }
}
