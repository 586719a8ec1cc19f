//! Per-thread exit callbacks. Each thread keeps a [`Chain`] of callbacks in a
//! thread-local; when the thread exits the chain is run newest-first, so
//! something registered later (and possibly depending on something registered
//! earlier) is torn down first.
//!
//! All chains hang off a process-wide "key". [`finalize_thread()`] deletes the
//! key: chains registered under it are thrown away without running. The next
//! registration creates a fresh key.

use std::{
    cell::RefCell,
    mem,
    sync::atomic::{AtomicU64, Ordering},
};

use log::{debug, trace, warn};

use crate::util::chain::Chain;

type ExitFn = Box<dyn FnOnce()>;

/// `0` means there is no key
static KEY: AtomicU64 = AtomicU64::new(0);
static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

fn current_key() -> u64 {
    KEY.load(Ordering::Acquire)
}

/// Get the live key, creating one if there is none
fn ensure_key() -> u64 {
    let key = current_key();
    if key != 0 {
        return key;
    }
    let fresh = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
    match KEY.compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            debug!("thread exit key #{fresh} created");
            fresh
        }
        // Somebody else won the race
        Err(key) => key,
    }
}

struct ExitChain {
    key: u64,
    callbacks: Chain<ExitFn>,
}

impl ExitChain {
    const fn new() -> Self {
        Self {
            key: 0,
            callbacks: Chain::new(),
        }
    }
}

impl Drop for ExitChain {
    fn drop(&mut self) {
        if self.key == 0 || self.key != current_key() {
            // Never registered, or registered under a deleted key
            return;
        }
        trace!("running {} thread exit callbacks", self.callbacks.len());
        while let Some(f) = self.callbacks.pop() {
            f();
        }
    }
}

thread_local! {
    static EXIT_CHAIN: RefCell<ExitChain> = const { RefCell::new(ExitChain::new()) };
}

/// Run `f` when the current thread exits. Callbacks run in reverse order of
/// registration.
///
/// Registering while the thread's chain is already being torn down runs `f`
/// straight away.
pub fn register_thread_exit_callback<F>(f: F)
where
    F: FnOnce() + 'static,
{
    let key = ensure_key();
    let mut pending: Option<ExitFn> = Some(Box::new(f));
    _ = EXIT_CHAIN.try_with(|chain| {
        let mut chain = chain.borrow_mut();
        if chain.key != key {
            // Anything registered under a deleted key is unreachable now
            chain.callbacks = Chain::new();
            chain.key = key;
        }
        if let Some(f) = pending.take() {
            chain.callbacks.push(f);
        }
    });
    if let Some(f) = pending.take() {
        warn!("thread exit callback registered during thread teardown, running it now");
        f();
    }
}

/// Run (and forget) the current thread's exit callbacks now, instead of at
/// thread exit. Useful on the main thread, whose thread-locals are not
/// guaranteed to be destroyed.
///
/// Called while the thread's chain is already being torn down (e.g. from an
/// exit callback), there is nothing left to run.
pub fn run_thread_exit_functions() {
    let taken = EXIT_CHAIN.try_with(|chain| {
        let mut chain = chain.borrow_mut();
        if chain.key != current_key() {
            chain.callbacks = Chain::new();
        }
        mem::take(&mut chain.callbacks)
    });
    let Ok(mut callbacks) = taken else {
        trace!("thread exit chain already torn down");
        return;
    };
    // Not holding the borrow, so callbacks may register more callbacks
    while let Some(f) = callbacks.pop() {
        f();
    }
}

/// Delete the exit callback key. Callbacks registered so far never run.
pub fn finalize_thread() {
    let key = KEY.swap(0, Ordering::AcqRel);
    if key != 0 {
        debug!("thread exit key #{key} deleted");
    }
}
