//! The interpreter's coordination lock, and the process-wide registry that
//! makes sure every one of them is freed at shutdown, whether or not the
//! interpreter got round to freeing it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::util::chain::Chain;

/// A non-reentrant lock that can be released by a thread other than the one
/// that acquired it (which is why it isn't just a `Mutex<()>`).
#[derive(Debug, Default)]
pub struct ThreadLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl ThreadLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock. With `wait` this blocks until it's available and always
    /// returns `true`; without, it returns whether the lock was taken.
    pub fn acquire(&self, wait: bool) -> bool {
        let mut locked = self.state();
        if *locked && wait {
            locked = self
                .released
                .wait_while(locked, |locked| *locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if *locked {
            return false;
        }
        *locked = true;
        true
    }

    pub fn release(&self) {
        *self.state() = false;
        self.released.notify_one();
    }

    pub fn is_locked(&self) -> bool {
        *self.state()
    }
}

#[derive(Default)]
pub struct LockRegistry {
    locks: Chain<Arc<ThreadLock>>,
}

impl LockRegistry {
    pub const fn new() -> Self {
        Self {
            locks: Chain::new(),
        }
    }

    /// A new unlocked lock, remembered until it's freed
    pub fn allocate_lock(&mut self) -> Arc<ThreadLock> {
        let lock = Arc::new(ThreadLock::new());
        self.locks.push(Arc::clone(&lock));
        lock
    }

    /// Forget `lock`. `false` if it was never allocated here (or already
    /// freed).
    pub fn free_lock(&mut self, lock: *const ThreadLock) -> bool {
        self.locks.remove(|l| Arc::as_ptr(l) == lock).is_some()
    }

    pub fn outstanding(&self) -> usize {
        self.locks.len()
    }

    pub fn contains(&self, lock: *const ThreadLock) -> bool {
        self.locks.iter().any(|l| Arc::as_ptr(l) == lock)
    }

    /// Drop every outstanding lock, newest first. Returns how many there
    /// were.
    pub fn free_thread_locks(&mut self) -> usize {
        let mut freed = 0;
        while self.locks.pop().is_some() {
            freed += 1;
        }
        debug!("freed {freed} outstanding thread locks");
        freed
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::{LockRegistry, ThreadLock};

    #[test]
    fn try_acquire_fails_while_held() {
        let lock = ThreadLock::new();
        assert!(lock.acquire(false));
        assert!(!lock.acquire(false));
        lock.release();
        assert!(lock.acquire(false));
    }

    #[test]
    fn waiting_acquire_is_woken_by_release_from_another_thread() {
        let lock = Arc::new(ThreadLock::new());
        assert!(lock.acquire(true));
        let releaser = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                lock.release();
            })
        };
        assert!(lock.acquire(true));
        assert!(lock.is_locked());
        releaser.join().unwrap();
    }

    #[test]
    fn registry_sweeps_only_what_is_left() {
        let mut registry = LockRegistry::new();
        let a = registry.allocate_lock();
        let b = registry.allocate_lock();
        let c = registry.allocate_lock();
        assert!(registry.free_lock(Arc::as_ptr(&b)));
        assert!(!registry.free_lock(Arc::as_ptr(&b)));
        assert!(registry.contains(Arc::as_ptr(&a)));
        assert!(!registry.contains(Arc::as_ptr(&b)));
        assert_eq!(registry.free_thread_locks(), 2);
        assert_eq!(registry.outstanding(), 0);
        // The registry's references are gone, only ours remain
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(Arc::strong_count(&c), 1);
    }
}
