//! Starting interpreter threads. A launched thread goes through
//!
//! ```plaintext
//! Created -> RunLoopInstalled -> Running -> Stopping -> Terminated
//! ```
//!
//! The run loop is there so that code on the new thread can use bindings that
//! complete asynchronously. The thread function itself is reached through a
//! [`RunOnce`] task that is completed the moment it's added, so the loop is
//! already spinning by the time the function runs.
//!
//! Threads that will never touch such bindings can skip the loop with
//! [`Launcher::with_run_loop(false)`](Launcher::with_run_loop).

use std::{
    cell::Cell,
    cmp, process,
    sync::atomic::{AtomicUsize, Ordering},
    thread::{self, JoinHandle},
};

use log::{debug, error, trace};

use crate::error::{Error, Result};

use super::run_loop::{RunLoop, RunOnce};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchState {
    Created,
    RunLoopInstalled,
    Running,
    Stopping,
    Terminated,
}

thread_local! {
    static STATE: Cell<Option<LaunchState>> = const { Cell::new(None) };
}

fn set_state(state: LaunchState) {
    trace!("launch state -> {state:?}");
    STATE.with(|s| s.set(Some(state)));
}

/// Where the current thread is in its launch lifecycle. `None` for threads
/// that weren't started by a [`Launcher`].
pub fn launch_state() -> Option<LaunchState> {
    STATE.try_with(Cell::get).ok().flatten()
}

/// Smallest stack a launched thread may be given
pub const THREAD_STACK_MIN: usize = 0x8000;

/// `0` means the platform default
static STACK_SIZE: AtomicUsize = AtomicUsize::new(0);

fn stack_size_min() -> usize {
    cmp::max(libc::PTHREAD_STACK_MIN, THREAD_STACK_MIN)
}

/// Set the stack size every [`Launcher::new()`] starts out with. `0` goes back
/// to the platform default.
///
/// # Errors
/// - [`Error::StackTooSmall`] if `size` is non-zero and below
///   `max(PTHREAD_STACK_MIN, THREAD_STACK_MIN)`. The setting is unchanged.
pub fn set_default_stack_size(size: usize) -> Result<()> {
    let min = stack_size_min();
    if size != 0 && size < min {
        return Err(Error::StackTooSmall { size, min });
    }
    STACK_SIZE.store(size, Ordering::Relaxed);
    debug!("default thread stack size -> {size}");
    Ok(())
}

/// `None` for the platform default
pub fn default_stack_size() -> Option<usize> {
    match STACK_SIZE.load(Ordering::Relaxed) {
        0 => None,
        size => Some(size),
    }
}

/// What the new thread is going to run. Built on the spawning thread and
/// consumed on the new one; if the spawn fails it is dropped on the spawning
/// thread instead.
pub struct LaunchContext {
    func: Box<dyn FnOnce() + Send>,
}

impl LaunchContext {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }

    fn run(self) {
        (self.func)()
    }
}

#[derive(Clone, Debug)]
pub struct Launcher {
    run_loop: bool,
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher {
    /// A launcher that installs a run loop, with the default name and the
    /// process-wide stack size (see [`set_default_stack_size()`])
    pub fn new() -> Self {
        Self {
            run_loop: true,
            name: None,
            stack_size: default_stack_size(),
        }
    }

    pub fn with_run_loop(mut self, run_loop: bool) -> Self {
        self.run_loop = run_loop;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Start `f` on a new thread.
    ///
    /// # Errors
    /// - [`Error::Spawn`] if the OS can't create the thread
    pub fn spawn<F>(self, f: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let context = LaunchContext::new(f);
        let run_loop = self.run_loop;
        let handle = builder
            .spawn(move || launchpad(context, run_loop))
            .map_err(|e| {
                error!("could not spawn thread: {e}");
                Error::Spawn(e)
            })?;
        debug!("launched thread {:?} (run loop: {run_loop})", handle.thread().id());
        Ok(handle)
    }
}

/// The first thing that runs on a launched thread
fn launchpad(context: LaunchContext, with_run_loop: bool) {
    set_state(LaunchState::Created);
    if !with_run_loop {
        set_state(LaunchState::Running);
        context.run();
        set_state(LaunchState::Terminated);
        return;
    }

    let run_loop = match RunLoop::new().install() {
        Ok(run_loop) => run_loop,
        // Interpreter code can't run here without the loop, and the spawning
        // thread has already moved on, so nobody could handle this
        Err(e) => {
            error!("interpreter thread: could not install run loop: {e}");
            process::abort();
        }
    };
    set_state(LaunchState::RunLoopInstalled);

    let root = run_loop.add(Box::new(RunOnce::new(move || {
        set_state(LaunchState::Running);
        context.run();
    })));
    // Pending and completed in one go: the first dispatch is the thread
    // function
    root.complete(0);
    run_loop.start();

    set_state(LaunchState::Stopping);
    drop(run_loop.remove(root.task()));
    drop(run_loop);
    set_state(LaunchState::Terminated);
}
