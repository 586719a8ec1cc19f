use std::{
    ffi::c_void,
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Mutex, MutexGuard,
    },
    time::Duration,
};

use dlc::{externc::*, os::mem::PAGE_SIZE};

/// The C API works on process-wide state; one test at a time
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn stats() -> (i32, i32) {
    let (mut allocated, mut free) = (-1, -1);
    unsafe { region_stats(&mut allocated, &mut free) };
    (allocated, free)
}

#[test]
fn three_block_region_end_to_end() {
    let _guard = serial();
    let bs = *PAGE_SIZE;
    assert_eq!(region_alloc_init_sized(bs, 3 * bs), 0);
    assert_ne!(region_alloc_init_sized(bs, 3 * bs), 0);

    let blocks: Vec<_> = (0..3).map(|_| region_malloc(bs)).collect();
    for (i, b) in blocks.iter().enumerate() {
        assert!(!b.is_null());
        assert_eq!(region_is_allocated(*b), 1);
        assert!(blocks[..i].iter().all(|other| other != b));
    }
    assert_eq!(stats(), (3, 0));

    // Exhausted: the heap takes over
    let overflow = region_malloc(bs);
    assert!(!overflow.is_null());
    assert_eq!(region_is_allocated(overflow), 0);
    assert_eq!(stats(), (3, 0));

    unsafe { region_free(blocks[1]) };
    assert_eq!(stats(), (2, 1));
    let reused = region_malloc(bs);
    assert_eq!(reused, blocks[1]);
    assert_eq!(stats(), (3, 0));

    unsafe {
        region_free(overflow);
        region_free(reused);
        region_free(blocks[0]);
        region_free(blocks[2]);
    }
    assert_eq!(stats(), (0, 3));
    region_alloc_fini();
    assert_eq!(stats(), (0, 0));
}

#[test]
fn realloc_moves_blocks_out_of_the_region() {
    let _guard = serial();
    let bs = *PAGE_SIZE;
    assert_eq!(region_alloc_init_sized(bs, 2 * bs), 0);
    unsafe {
        let block = region_malloc(bs) as *mut u8;
        ptr::write_bytes(block, 0xAB, bs);
        let moved = region_realloc(block as *mut c_void, 3 * bs) as *mut u8;
        assert!(!moved.is_null());
        assert_eq!(region_is_allocated(moved as *const c_void), 0);
        assert_eq!(stats(), (0, 2));
        assert!((0..bs).all(|i| *moved.add(i) == 0xAB));
        region_free(moved as *mut c_void);
    }
    region_alloc_fini();
}

static VTABLE_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counted_alloc(size: usize, context: *mut c_void) -> *mut c_void {
    VTABLE_CALLS.fetch_add(1, Ordering::Relaxed);
    dlc_vtable_alloc(size, context)
}

#[test]
fn vtable_routes_back_into_the_region() {
    let _guard = serial();
    let bs = *PAGE_SIZE;
    assert_eq!(region_alloc_init_sized(bs, bs), 0);
    unsafe {
        set_allocator(
            Some(counted_alloc),
            Some(dlc_vtable_realloc),
            Some(dlc_vtable_free),
            ptr::null_mut(),
        );
        let p = region_malloc(bs);
        assert_eq!(VTABLE_CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(region_is_allocated(p), 1);
        assert_eq!(stats(), (1, 0));
        region_free(p);
        assert_eq!(stats(), (0, 1));

        // Only the free function set: allocation takes the default path
        set_allocator(None, None, Some(dlc_vtable_free), ptr::null_mut());
        let q = region_malloc(bs);
        assert_eq!(VTABLE_CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(region_is_allocated(q), 1);
        region_free(q);

        set_allocator(None, None, None, ptr::null_mut());
    }
    region_alloc_fini();
}

#[test]
fn tracker_sweeps_forgotten_allocations() {
    let _guard = serial();
    track_allocations(true);
    unsafe {
        free_all_allocations();
        let a = malloc_wrapper(64);
        let b = malloc_wrapper(128);
        let b = realloc_wrapper(b, 4096);
        let c = malloc_wrapper(32);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert_eq!(outstanding_allocations(), 3);
        free_wrapper(a);
        // A zero-size realloc may free `c` outright, it must not be swept again
        let c = realloc_wrapper(c, 0);
        assert_eq!(outstanding_allocations(), if c.is_null() { 1 } else { 2 });
        // `b` (and whatever `c` became) is left for the sweep
        free_all_allocations();
        assert_eq!(outstanding_allocations(), 0);
        free_all_allocations();
        assert_eq!(outstanding_allocations(), 0);
    }
}

static THREAD_EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn record(event: &'static str) {
    THREAD_EVENTS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(event);
}

extern "C" fn first_cleanup() {
    record("first");
}

extern "C" fn second_cleanup() {
    record("second");
}

extern "C" fn thread_body(arg: *mut c_void) {
    let done = unsafe { Box::from_raw(arg as *mut mpsc::Sender<()>) };
    assert_eq!(register_thread_exit_callback(Some(first_cleanup)), 0);
    assert_eq!(register_thread_exit_callback(Some(second_cleanup)), 0);
    record("body");
    // Disconnecting tells the test the body is done
    drop(done);
}

#[test]
fn launched_threads_run_exit_callbacks_in_reverse() {
    let _guard = serial();
    THREAD_EVENTS.lock().unwrap_or_else(|e| e.into_inner()).clear();
    let (tx, rx) = mpsc::channel::<()>();
    let arg = Box::into_raw(Box::new(tx)) as *mut c_void;
    let id = start_new_thread(Some(thread_body), arg);
    assert_ne!(id, -1);
    assert!(rx.recv().is_err());
    // The thread is detached; wait for its locals to be torn down
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while THREAD_EVENTS.lock().unwrap_or_else(|e| e.into_inner()).len() < 3 {
        assert!(std::time::Instant::now() < deadline, "exit callbacks never ran");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        *THREAD_EVENTS.lock().unwrap_or_else(|e| e.into_inner()),
        vec!["body", "second", "first"]
    );
}

static STACK_SEEN: AtomicUsize = AtomicUsize::new(0);

extern "C" fn report_stack_size(arg: *mut c_void) {
    let done = unsafe { Box::from_raw(arg as *mut mpsc::Sender<()>) };
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) == 0 {
            let mut size = 0;
            libc::pthread_attr_getstacksize(&attr, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            STACK_SEEN.store(size, Ordering::Relaxed);
        }
    }
    drop(done);
}

#[test]
fn stack_size_applies_to_new_threads() {
    let _guard = serial();
    assert_eq!(thread_get_stacksize(), 0);
    assert_eq!(thread_set_stacksize(1024), -1);
    assert_eq!(thread_get_stacksize(), 0);

    let size = 4 << 20;
    assert_eq!(thread_set_stacksize(size), 0);
    assert_eq!(thread_get_stacksize(), size);
    let (tx, rx) = mpsc::channel::<()>();
    let arg = Box::into_raw(Box::new(tx)) as *mut c_void;
    assert_ne!(start_new_thread(Some(report_stack_size), arg), -1);
    assert!(rx.recv().is_err());
    // Well above the 2 MiB a thread gets by default, allowing for whatever
    // the platform carves out of the requested size
    assert!(STACK_SEEN.load(Ordering::Relaxed) >= size - size / 8);

    assert_eq!(thread_set_stacksize(0), 0);
    assert_eq!(thread_get_stacksize(), 0);
}

#[test]
fn null_thread_function_is_rejected() {
    assert_eq!(start_new_thread(None, ptr::null_mut()), -1);
    assert_eq!(register_thread_exit_callback(None), -1);
}

#[test]
fn outstanding_locks_are_swept() {
    let _guard = serial();
    let a = thread_allocate_lock();
    let b = thread_allocate_lock();
    unsafe {
        assert_eq!(thread_acquire_lock(a, 1), 1);
        thread_release_lock(a);
        thread_free_lock(a);
        assert_eq!(thread_acquire_lock(b, 0), 1);
        free_thread_locks();
    }
}
