// crates/canopen-rs/src/exec.rs

//! Cooperative task queue and completion promises.
//!
//! Protocol engines run inside `MasterNode` calls (the "lock held" side);
//! application callbacks are posted here as tasks and executed by the
//! embedding program between node calls (the "lock released" side). The
//! same drain loop works whether the embedder is a bare single-threaded
//! event loop or a dedicated worker feeding off one node.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use core::cell::RefCell;

type Task = Box<dyn FnOnce()>;

/// Handle to a posted task, used for `Executor::abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(u64);

/// A cooperative run-to-completion task queue.
///
/// `post` never executes the task inline; tasks run only from
/// `run_pending`. A task, once started, runs to completion.
#[derive(Default)]
pub struct Executor {
    queue: VecDeque<(TaskHandle, Task)>,
    next_id: u64,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a task and returns immediately.
    pub fn post(&mut self, task: impl FnOnce() + 'static) -> TaskHandle {
        let handle = TaskHandle(self.next_id);
        self.next_id += 1;
        self.queue.push_back((handle, Box::new(task)));
        handle
    }

    /// Aborts a queued task. Succeeds only if the task has not yet run.
    pub fn abort(&mut self, handle: TaskHandle) -> bool {
        let before = self.queue.len();
        self.queue.retain(|(h, _)| *h != handle);
        self.queue.len() != before
    }

    /// Runs every queued task, including tasks posted by tasks during this
    /// drain. Returns the number of tasks executed.
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;
        while let Some((_, task)) = self.queue.pop_front() {
            task();
            count += 1;
        }
        count
    }

    /// Drops every queued task without running it.
    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }
}

struct PromiseInner<T> {
    value: Option<T>,
    resolved: bool,
}

/// A single-assignment completion cell shared between an engine and the
/// application.
///
/// The engine resolves it exactly once; the application polls or takes the
/// value. Clones share the same cell.
pub struct Promise<T> {
    inner: Rc<RefCell<PromiseInner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(PromiseInner {
                value: None,
                resolved: false,
            })),
        }
    }

    /// Resolves the promise. The first resolution wins; later calls return
    /// false and discard their value.
    pub fn resolve(&self, value: T) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.resolved {
            return false;
        }
        inner.value = Some(value);
        inner.resolved = true;
        true
    }

    /// True once `resolve` has been called.
    pub fn is_resolved(&self) -> bool {
        self.inner.borrow().resolved
    }

    /// Takes the resolved value, leaving the promise resolved but empty.
    pub fn take(&self) -> Option<T> {
        self.inner.borrow_mut().value.take()
    }
}

impl<T: Clone> Promise<T> {
    /// Returns a copy of the resolved value without consuming it.
    pub fn peek(&self) -> Option<T> {
        self.inner.borrow().value.clone()
    }
}
