//! Heap wrappers that remember every pointer they hand out, so that whatever
//! native extension code forgot to free can still be swept up at shutdown.
//!
//! The bookkeeping nodes themselves come from the Rust global allocator, never
//! from the tracked heap, so recording an allocation can't recurse into the
//! tracker.

use log::{debug, warn};

use crate::util::chain::Chain;

use super::heap::SystemHeap;

pub struct AllocTracker {
    live: Chain<*mut u8>,
    tracking: bool,
    heap: SystemHeap,
}

// SAFETY: the recorded pointers are only ever handed back to `free()`, which
// doesn't care which thread does it
unsafe impl Send for AllocTracker {}

impl AllocTracker {
    /// Tracking starts switched on
    pub const fn new() -> Self {
        Self {
            live: Chain::new(),
            tracking: true,
            heap: SystemHeap,
        }
    }

    /// With tracking off the wrappers are plain passthroughs. Pointers that
    /// were recorded stay recorded.
    pub fn track_allocations(&mut self, flag: bool) {
        self.tracking = flag;
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Number of pointers currently considered live
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    pub fn is_tracked(&self, ptr: *const u8) -> bool {
        self.live.iter().any(|p| *p as *const u8 == ptr)
    }

    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        let ptr = self.heap.malloc(size);
        if self.tracking && !ptr.is_null() {
            self.live.push(ptr);
        }
        ptr
    }

    /// # Safety
    ///
    /// Same contract as [`SystemHeap::realloc()`]
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        let new = self.heap.realloc(ptr, size);
        if !self.tracking {
            return new;
        }
        if new.is_null() {
            if size == 0 && !ptr.is_null() {
                // The old pointer is gone, sweeping it later would free it twice
                self.live.remove(|p| *p == ptr);
            }
            return new;
        }
        match self.live.find_mut(|p| !ptr.is_null() && *p == ptr) {
            Some(slot) => *slot = new,
            // A fresh allocation, or one made while tracking was off
            None => self.live.push(new),
        }
        new
    }

    /// # Safety
    ///
    /// Same contract as [`SystemHeap::free()`]
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        self.heap.free(ptr);
        if self.tracking && !ptr.is_null() {
            self.live.remove(|p| *p == ptr);
        }
    }

    /// Free every pointer still recorded, newest first, and empty the list.
    /// Returns how many were swept. Does nothing with tracking off, since
    /// recorded pointers may have been freed untracked since.
    ///
    /// # Safety
    ///
    /// Nobody may use any tracked pointer afterwards
    pub unsafe fn free_all_allocations(&mut self) -> usize {
        if !self.tracking {
            warn!(
                "tracking is off, leaving {} recorded allocations alone",
                self.live.len()
            );
            return 0;
        }
        let mut swept = 0;
        while let Some(ptr) = self.live.pop() {
            self.heap.free(ptr);
            swept += 1;
        }
        debug!("swept {swept} outstanding allocations");
        swept
    }
}

impl Default for AllocTracker {
    fn default() -> Self {
        Self::new()
    }
}
