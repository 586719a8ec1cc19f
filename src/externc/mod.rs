//! The C side: everything the interpreter runtime and the native bindings call.
//! Each piece of process-wide state lives in its own `Mutex`, so the default
//! allocation path is serialized.
//!
//! Custom allocator functions are always called with no lock held, so they are
//! free to call back in here (e.g. `dlc_vtable_alloc()`).

use std::{
    ffi::c_void,
    os::unix::thread::JoinHandleExt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use libc::{c_int, c_long};
use log::error;

use crate::{
    alloc::{
        core_alloc::{AllocFn, AllocatorVTable, CoreAllocator, FreeFn, ReallocFn},
        dlc::{DlcConfig, DlcStats},
        tracker::AllocTracker,
    },
    thread::{
        exit::{self, register_thread_exit_callback as register},
        launch::{self, Launcher},
        lock::{LockRegistry, ThreadLock},
    },
};

static CORE: Mutex<CoreAllocator> = Mutex::new(CoreAllocator::new());
static TRACKER: Mutex<AllocTracker> = Mutex::new(AllocTracker::new());
static LOCKS: Mutex<LockRegistry> = Mutex::new(LockRegistry::new());

/// A panic while holding one of these (e.g. a double free) takes the process
/// down anyway, so poisoning carries no information
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn custom_allocator() -> AllocatorVTable {
    lock(&CORE).vtable()
}

/// Install the embedder's allocator. Any of the three may be null, in which
/// case that operation takes the default path.
///
/// # Safety
/// See [`CoreAllocator::set_allocator()`]
#[no_mangle]
pub unsafe extern "C" fn set_allocator(
    alloc: Option<AllocFn>,
    realloc: Option<ReallocFn>,
    free: Option<FreeFn>,
    context: *mut c_void,
) {
    lock(&CORE).set_allocator(AllocatorVTable {
        alloc,
        realloc,
        free,
        context,
    });
}

fn init_with(config: DlcConfig) -> c_int {
    match lock(&CORE).init_dlc(config) {
        Ok(()) => 0,
        Err(e) => {
            error!("DLC init failed: {e}");
            -1
        }
    }
}

/// Reserve the block region, sized from `DLC_BLOCK_SIZE` / `DLC_MAX_SIZE`
/// (or the built-in defaults). `0` on success, `-1` on failure.
#[no_mangle]
pub extern "C" fn region_alloc_init() -> c_int {
    match DlcConfig::from_env() {
        Ok(config) => init_with(config),
        Err(e) => {
            error!("DLC init failed: {e}");
            -1
        }
    }
}

/// [`region_alloc_init()`] with an explicit geometry
#[no_mangle]
pub extern "C" fn region_alloc_init_sized(block_size: usize, max_size: usize) -> c_int {
    init_with(DlcConfig {
        block_size,
        max_size,
    })
}

/// Release the block region. Every block must have been freed.
#[no_mangle]
pub extern "C" fn region_alloc_fini() {
    if let Err(e) = lock(&CORE).fini_dlc() {
        error!("DLC fini: {e}");
    }
}

#[no_mangle]
pub extern "C" fn region_malloc(size: usize) -> *mut c_void {
    let custom = custom_allocator();
    match custom.alloc {
        // SAFETY: vouched for by whoever called `set_allocator()`
        Some(alloc) => unsafe { alloc(size, custom.context) },
        None => lock(&CORE).default_malloc(size) as *mut c_void,
    }
}

/// # Safety
/// `ptr` must be null or a live pointer from [`region_malloc()`] /
/// [`region_realloc()`]
#[no_mangle]
pub unsafe extern "C" fn region_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let custom = custom_allocator();
    match custom.realloc {
        Some(realloc) => realloc(ptr, size, custom.context),
        None => lock(&CORE).default_realloc(ptr as *mut u8, size) as *mut c_void,
    }
}

/// # Safety
/// `ptr` must be null or a live pointer from [`region_malloc()`] /
/// [`region_realloc()`]
#[no_mangle]
pub unsafe extern "C" fn region_free(ptr: *mut c_void) {
    let custom = custom_allocator();
    match custom.free {
        Some(free) => free(ptr, custom.context),
        None => lock(&CORE).default_free(ptr as *mut u8),
    }
}

/// Non-zero iff `ptr` is a live block of the block region
#[no_mangle]
pub extern "C" fn region_is_allocated(ptr: *const c_void) -> c_int {
    lock(&CORE).is_allocated(ptr as *const u8) as c_int
}

/// Both counts are 0 if the region isn't initialized. Null out-pointers are
/// skipped.
///
/// # Safety
/// Non-null pointers must be valid for writes
#[no_mangle]
pub unsafe extern "C" fn region_stats(allocated_blocks: *mut c_int, free_blocks: *mut c_int) {
    let stats = lock(&CORE)
        .stats()
        .unwrap_or(DlcStats { allocated: 0, free: 0 });
    if let Some(out) = allocated_blocks.as_mut() {
        *out = stats.allocated as c_int;
    }
    if let Some(out) = free_blocks.as_mut() {
        *out = stats.free as c_int;
    }
}

/// The default path with the custom-allocator signature, so an embedder can
/// route through the block region explicitly with `set_allocator()`
#[no_mangle]
pub extern "C" fn dlc_vtable_alloc(size: usize, _context: *mut c_void) -> *mut c_void {
    lock(&CORE).default_malloc(size) as *mut c_void
}

/// # Safety
/// Same as [`region_realloc()`]
#[no_mangle]
pub unsafe extern "C" fn dlc_vtable_realloc(
    ptr: *mut c_void,
    size: usize,
    _context: *mut c_void,
) -> *mut c_void {
    lock(&CORE).default_realloc(ptr as *mut u8, size) as *mut c_void
}

/// # Safety
/// Same as [`region_free()`]
#[no_mangle]
pub unsafe extern "C" fn dlc_vtable_free(ptr: *mut c_void, _context: *mut c_void) {
    lock(&CORE).default_free(ptr as *mut u8)
}

#[no_mangle]
pub extern "C" fn track_allocations(track_flag: bool) {
    lock(&TRACKER).track_allocations(track_flag);
}

#[no_mangle]
pub extern "C" fn malloc_wrapper(bytes: usize) -> *mut c_void {
    lock(&TRACKER).malloc(bytes) as *mut c_void
}

/// # Safety
/// `ptr` must be null or a live pointer from the wrappers
#[no_mangle]
pub unsafe extern "C" fn realloc_wrapper(ptr: *mut c_void, bytes: usize) -> *mut c_void {
    lock(&TRACKER).realloc(ptr as *mut u8, bytes) as *mut c_void
}

/// # Safety
/// `ptr` must be null or a live pointer from the wrappers
#[no_mangle]
pub unsafe extern "C" fn free_wrapper(ptr: *mut c_void) {
    lock(&TRACKER).free(ptr as *mut u8)
}

/// How many pointers the wrappers currently consider live
#[no_mangle]
pub extern "C" fn outstanding_allocations() -> usize {
    lock(&TRACKER).outstanding()
}

/// Free everything the wrappers still consider live. Meant for interpreter
/// shutdown.
///
/// # Safety
/// No pointer from the wrappers may be used afterwards
#[no_mangle]
pub unsafe extern "C" fn free_all_allocations() {
    lock(&TRACKER).free_all_allocations();
}

struct SendPtr(*mut c_void);

// SAFETY: handing the thread argument over is the whole point; the caller of
// `start_new_thread()` vouches for it
unsafe impl Send for SendPtr {}

/// Run `func(arg)` on a new detached thread with a run loop installed, on a
/// stack of the size set by [`thread_set_stacksize()`]. Returns the thread's
/// id, or `-1` if it couldn't be started.
#[no_mangle]
pub extern "C" fn start_new_thread(
    func: Option<extern "C" fn(*mut c_void)>,
    arg: *mut c_void,
) -> c_long {
    let Some(func) = func else {
        return -1;
    };
    let arg = SendPtr(arg);
    match Launcher::new().spawn(move || {
        let arg = arg;
        func(arg.0)
    }) {
        // Dropping the handle detaches the thread
        Ok(handle) => handle.as_pthread_t() as c_long,
        Err(_) => -1,
    }
}

/// Stack size for threads started from now on. `0` means the platform
/// default. Returns `0` on success, `-1` (and changes nothing) if `size` is
/// below the minimum.
#[no_mangle]
pub extern "C" fn thread_set_stacksize(size: usize) -> c_int {
    match launch::set_default_stack_size(size) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            -1
        }
    }
}

/// `0` for the platform default
#[no_mangle]
pub extern "C" fn thread_get_stacksize() -> usize {
    launch::default_stack_size().unwrap_or(0)
}

/// `0` on success, `-1` if `func` is null
#[no_mangle]
pub extern "C" fn register_thread_exit_callback(func: Option<extern "C" fn()>) -> c_int {
    match func {
        Some(func) => {
            register(move || func());
            0
        }
        None => -1,
    }
}

#[no_mangle]
pub extern "C" fn finalize_thread() {
    exit::finalize_thread();
}

/// Run the calling thread's exit callbacks now. For the main thread, whose
/// thread-locals may never be destroyed.
#[no_mangle]
pub extern "C" fn run_thread_exit_functions() {
    exit::run_thread_exit_functions();
}

/// Null is never returned
#[no_mangle]
pub extern "C" fn thread_allocate_lock() -> *const c_void {
    Arc::as_ptr(&lock(&LOCKS).allocate_lock()) as *const c_void
}

/// # Safety
/// `lock_ptr` must come from [`thread_allocate_lock()`] and not be freed yet
#[no_mangle]
pub unsafe extern "C" fn thread_free_lock(lock_ptr: *const c_void) {
    if lock_ptr.is_null() {
        return;
    }
    if !lock(&LOCKS).free_lock(lock_ptr as *const ThreadLock) {
        error!("freeing unknown thread lock {lock_ptr:p}");
    }
}

/// `1` if the lock was taken
///
/// # Safety
/// `lock_ptr` must come from [`thread_allocate_lock()`] and not be freed yet
#[no_mangle]
pub unsafe extern "C" fn thread_acquire_lock(lock_ptr: *const c_void, waitflag: c_int) -> c_int {
    (*(lock_ptr as *const ThreadLock)).acquire(waitflag != 0) as c_int
}

/// # Safety
/// `lock_ptr` must come from [`thread_allocate_lock()`] and not be freed yet
#[no_mangle]
pub unsafe extern "C" fn thread_release_lock(lock_ptr: *const c_void) {
    (*(lock_ptr as *const ThreadLock)).release()
}

/// Free every thread lock that is still outstanding. Meant for interpreter
/// shutdown.
///
/// # Safety
/// No lock from [`thread_allocate_lock()`] may be used afterwards
#[no_mangle]
pub unsafe extern "C" fn free_thread_locks() {
    lock(&LOCKS).free_thread_locks();
}
