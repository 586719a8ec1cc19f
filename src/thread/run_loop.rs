//! A cooperative, single-threaded run loop: tasks sit idle until someone
//! completes their request (possibly from another thread), and then the loop
//! calls them back on its own thread, one at a time.
//!
//! ```plaintext
//!  any thread                      run loop thread
//! +-----------------+   channel   +--------------------------+
//! | Completer::     | ----------> | RunLoop::start()         |
//! |   complete(st)  |             |   recv -> task.run(st)   |
//! +-----------------+             |   ... until stop()       |
//!                                 +--------------------------+
//! ```
//!
//! At most one [`RunLoop`] is installed per thread; bindings that complete
//! asynchronously find it through [`RunLoop::current()`].

use std::{
    cell::{Cell, RefCell},
    fmt,
    ops::Deref,
    rc::Rc,
};

use crossbeam::channel::{self, Receiver, Sender};
use log::{trace, warn};

use crate::error::{Error, Result};

pub type TaskId = usize;

pub trait ActiveTask {
    /// Called on the run loop's thread when a request of this task completes
    fn run(&mut self, status: i32, run_loop: &RunLoop);
}

struct Completion {
    task: TaskId,
    status: i32,
}

/// The handle used to signal that a task's request has completed. Can be sent
/// to, and completed from, any thread.
#[derive(Clone)]
pub struct Completer {
    task: TaskId,
    tx: Sender<Completion>,
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Completer(#{})", self.task)
    }
}

impl Completer {
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Queue a completion for the task. `false` if the run loop is gone.
    pub fn complete(&self, status: i32) -> bool {
        self.tx
            .send(Completion {
                task: self.task,
                status,
            })
            .is_ok()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<RunLoop>>> = const { RefCell::new(None) };
}

pub struct RunLoop {
    tasks: RefCell<Vec<Option<Box<dyn ActiveTask>>>>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    stop_requested: Cell<bool>,
    depth: Cell<usize>,
}

impl RunLoop {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tasks: RefCell::new(Vec::new()),
            tx,
            rx,
            stop_requested: Cell::new(false),
            depth: Cell::new(0),
        }
    }

    /// Make this the current thread's run loop, until the returned guard is
    /// dropped.
    ///
    /// # Errors
    /// - [`Error::RunLoopInstalled`] if this thread already has one
    pub fn install(self) -> Result<InstalledRunLoop> {
        let run_loop = Rc::new(self);
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_some() {
                return Err(Error::RunLoopInstalled);
            }
            *current = Some(Rc::clone(&run_loop));
            Ok(())
        })?;
        trace!("run loop installed");
        Ok(InstalledRunLoop { run_loop })
    }

    /// The run loop installed on this thread, if any. Always `None` once the
    /// thread's locals are being torn down.
    pub fn current() -> Option<Rc<RunLoop>> {
        CURRENT
            .try_with(|current| current.borrow().clone())
            .ok()
            .flatten()
    }

    /// Register a task. It stays idle until the returned [`Completer`] is
    /// completed.
    pub fn add(&self, task: Box<dyn ActiveTask>) -> Completer {
        let mut tasks = self.tasks.borrow_mut();
        let task_id = match tasks.iter().position(Option::is_none) {
            Some(free) => {
                tasks[free] = Some(task);
                free
            }
            None => {
                tasks.push(Some(task));
                tasks.len() - 1
            }
        };
        Completer {
            task: task_id,
            tx: self.tx.clone(),
        }
    }

    /// Unregister a task. A task can't remove itself from inside `run()`.
    pub fn remove(&self, task: TaskId) -> Option<Box<dyn ActiveTask>> {
        self.tasks.borrow_mut().get_mut(task)?.take()
    }

    pub fn nr_tasks(&self) -> usize {
        self.tasks.borrow().iter().flatten().count()
    }

    pub fn is_running(&self) -> bool {
        self.depth.get() != 0
    }

    /// Dispatch completions until [`RunLoop::stop()`] is called. Blocks while
    /// nothing has completed.
    pub fn start(&self) {
        self.depth.set(self.depth.get() + 1);
        while !self.stop_requested.get() {
            // We hold a sender ourselves, so this can't disconnect
            let Ok(completion) = self.rx.recv() else {
                break;
            };
            self.dispatch(completion);
        }
        self.stop_requested.set(false);
        self.depth.set(self.depth.get() - 1);
    }

    /// Make the innermost `start()` return once the current dispatch is done
    pub fn stop(&self) {
        if !self.is_running() {
            warn!("stop() on a run loop that isn't running");
        }
        self.stop_requested.set(true);
    }

    fn dispatch(&self, completion: Completion) {
        let Completion { task, status } = completion;
        // Taken out for the duration of `run()`, so the task can add tasks
        let taken = self.tasks.borrow_mut().get_mut(task).and_then(Option::take);
        let Some(mut active) = taken else {
            warn!("stray completion for task #{task}");
            return;
        };
        trace!("dispatching task #{task} (status {status})");
        active.run(status, self);
        if let Some(slot) = self.tasks.borrow_mut().get_mut(task) {
            *slot = Some(active);
        }
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for an installed run loop. Dropping it uninstalls the loop; the loop
/// itself (and its tasks) go away once the last `Rc` does.
pub struct InstalledRunLoop {
    run_loop: Rc<RunLoop>,
}

impl Deref for InstalledRunLoop {
    type Target = RunLoop;

    fn deref(&self) -> &RunLoop {
        &self.run_loop
    }
}

impl Drop for InstalledRunLoop {
    fn drop(&mut self) {
        // Might be mid thread-teardown, in which case there's nothing to undo
        _ = CURRENT.try_with(|current| current.borrow_mut().take());
        trace!("run loop uninstalled");
    }
}

/// A task that calls a function on its first completion and then stops the
/// loop it runs in. Used as a trampoline onto a freshly installed loop.
pub struct RunOnce<F> {
    f: Option<F>,
}

impl<F> RunOnce<F>
where
    F: FnOnce(),
{
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }
}

impl<F> ActiveTask for RunOnce<F>
where
    F: FnOnce(),
{
    fn run(&mut self, _: i32, run_loop: &RunLoop) {
        if let Some(f) = self.f.take() {
            f();
        }
        run_loop.stop();
    }
}
