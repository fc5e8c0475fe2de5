#![forbid(unsafe_code)]

//! Task lifecycle: one-shot and recurring units of queued work.
//!
//! # State machine
//!
//! ```text
//! Pending ──run──▶ Running ──▶ Completed
//!    │                │
//!    └──cancel──▶ Canceled ◀───┘ (recurring cancel during run)
//! ```
//!
//! # Invariants
//!
//! 1. `Completed` and `Canceled` are terminal; no transition leaves them.
//! 2. `Pending → Canceled` dequeues the task before it runs and rejects
//!    its result with [`TaskError::Aborted`].
//! 3. Canceling a one-shot task while `Running` is a no-op; the run
//!    finishes naturally.
//! 4. Canceling a recurring task prevents future reschedules but never
//!    aborts a run already in progress.
//! 5. An async task stays `Running` until its returned pending result
//!    settles; it never returns to `Pending`.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use web_time::{Duration, Instant};

use crate::clock::Clock;
use crate::result::{SettledValue, TaskError, TaskResult, TaskValue};

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Enqueued, not yet run.
    Pending,
    /// Callback invoked; for async tasks, the returned result has not yet
    /// settled.
    Running,
    /// Finished (successfully or with a failure recorded on the result).
    Completed,
    /// Canceled before completion.
    Canceled,
}

/// What a task callback hands back to the queue.
pub enum TaskReturn {
    /// Synchronous completion with a value.
    Value(TaskValue),
    /// Asynchronous continuation: the task completes when this pending
    /// result settles.
    Pending(TaskResult),
    /// Synchronous failure.
    Fail(TaskError),
}

impl TaskReturn {
    /// Convenience for callbacks that complete with no interesting value.
    #[must_use]
    pub fn done() -> Self {
        Self::Value(Rc::new(()))
    }
}

pub(crate) type TaskCallback = Box<dyn FnMut() -> TaskReturn>;

/// Hooks a task needs from its owning queue.
pub(crate) trait TaskHost {
    /// Remove a still-pending task from the FIFO. Returns `true` if found.
    fn remove_pending(&self, id: u64) -> bool;
    /// Adjust the not-yet-settled async operation count.
    fn async_started(&self);
    fn async_settled(&self);
}

pub(crate) struct TaskInner {
    id: u64,
    status: Cell<TaskStatus>,
    callback: RefCell<Option<TaskCallback>>,
    /// Lazily created on first `result()` request.
    result: RefCell<Option<TaskResult>>,
    /// Recorded outcome so late `result()` requests settle immediately.
    outcome: RefCell<Option<SettledValue>>,
    host: Weak<dyn TaskHost>,
}

impl TaskInner {
    pub(crate) fn new(id: u64, callback: TaskCallback, host: Weak<dyn TaskHost>) -> Self {
        Self {
            id,
            status: Cell::new(TaskStatus::Pending),
            callback: RefCell::new(Some(callback)),
            result: RefCell::new(None),
            outcome: RefCell::new(None),
            host,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.status.get()
    }

    /// Run the task callback. Called by the queue with the task already
    /// dequeued; a canceled task is skipped by the caller.
    pub(crate) fn run(self: Rc<Self>) {
        debug_assert_eq!(self.status.get(), TaskStatus::Pending);
        self.status.set(TaskStatus::Running);
        let callback = self.callback.borrow_mut().take();
        let Some(mut callback) = callback else {
            self.finish(Err(TaskError::Failed("task callback missing".into())));
            return;
        };
        match callback() {
            TaskReturn::Value(value) => self.finish(Ok(value)),
            TaskReturn::Fail(error) => self.finish(Err(error)),
            TaskReturn::Pending(pending) => {
                if let Some(host) = self.host.upgrade() {
                    host.async_started();
                }
                let task = Rc::downgrade(&self);
                let host = self.host.clone();
                pending.on_settled(move |outcome| {
                    if let Some(host) = host.upgrade() {
                        host.async_settled();
                    }
                    if let Some(task) = task.upgrade() {
                        task.finish(outcome.clone());
                    }
                });
            }
        }
    }

    fn finish(&self, outcome: SettledValue) {
        if matches!(
            self.status.get(),
            TaskStatus::Completed | TaskStatus::Canceled
        ) {
            return;
        }
        self.status.set(TaskStatus::Completed);
        *self.outcome.borrow_mut() = Some(outcome.clone());
        let result = self.result.borrow().clone();
        if let Some(result) = result {
            result.settle(outcome);
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        if self.status.get() != TaskStatus::Pending {
            return false;
        }
        if let Some(host) = self.host.upgrade() {
            host.remove_pending(self.id);
        }
        self.status.set(TaskStatus::Canceled);
        let outcome: SettledValue = Err(TaskError::Aborted);
        *self.outcome.borrow_mut() = Some(outcome.clone());
        let result = self.result.borrow().clone();
        if let Some(result) = result {
            result.settle(outcome);
        }
        tracing::trace!(task_id = self.id, "canceled pending task");
        true
    }

    pub(crate) fn result(&self) -> Result<TaskResult, TaskError> {
        if self.status.get() == TaskStatus::Running {
            return Err(TaskError::ResultWhileRunning);
        }
        let mut slot = self.result.borrow_mut();
        if let Some(result) = slot.as_ref() {
            return Ok(result.clone());
        }
        let result = match self.outcome.borrow().as_ref() {
            Some(Ok(value)) => TaskResult::fulfilled(Rc::clone(value)),
            Some(Err(error)) => TaskResult::rejected(error.clone()),
            None => TaskResult::deferred().0,
        };
        *slot = Some(result.clone());
        Ok(result)
    }
}

/// Handle to a one-shot queued task.
#[derive(Clone)]
pub struct Task {
    pub(crate) inner: Rc<TaskInner>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status.get())
            .finish()
    }
}

impl Task {
    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.inner.status()
    }

    /// The task's settled/pending result cell.
    ///
    /// Created lazily; repeated requests return handles to the same cell.
    /// Requesting the result while the task is `Running` is a usage error
    /// (awaiting it from inside the run can never settle) and fails fast.
    pub fn result(&self) -> Result<TaskResult, TaskError> {
        self.inner.result()
    }

    /// Cancel the task if it is still pending.
    ///
    /// Returns `true` if the task was dequeued and canceled. Canceling a
    /// running or finished task is a no-op returning `false`.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }
}

pub(crate) struct RecurringInner {
    id: u64,
    callback: RefCell<Box<dyn FnMut()>>,
    interval: Duration,
    next_due: Cell<Instant>,
    canceled: Cell<bool>,
    runs: Cell<u64>,
}

impl RecurringInner {
    pub(crate) fn new(
        id: u64,
        callback: Box<dyn FnMut()>,
        interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            id,
            callback: RefCell::new(callback),
            interval,
            next_due: Cell::new(now + interval),
            canceled: Cell::new(false),
            runs: Cell::new(0),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        !self.canceled.get() && self.next_due.get() <= now
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.get()
    }

    /// Run one iteration and, unless canceled during the run, reschedule
    /// at the fixed interval.
    pub(crate) fn run(&self, clock: &Clock) {
        if self.canceled.get() {
            return;
        }
        (self.callback.borrow_mut())();
        self.runs.set(self.runs.get() + 1);
        if !self.canceled.get() {
            self.next_due.set(clock.now() + self.interval);
        }
    }

    pub(crate) fn cancel(&self) {
        self.canceled.set(true);
    }

    pub(crate) fn runs(&self) -> u64 {
        self.runs.get()
    }
}

/// Handle to a self-rescheduling task.
///
/// After each run the task is rescheduled at its fixed interval until
/// canceled. Cancellation is cooperative: it prevents future reschedules
/// but a run already in progress completes naturally.
#[derive(Clone)]
pub struct RecurringTask {
    pub(crate) inner: Rc<RecurringInner>,
}

impl std::fmt::Debug for RecurringTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringTask")
            .field("id", &self.inner.id)
            .field("interval", &self.inner.interval)
            .field("canceled", &self.inner.canceled.get())
            .field("runs", &self.inner.runs.get())
            .finish()
    }
}

impl RecurringTask {
    /// Stop future reschedules. Safe to call from inside the task's own
    /// callback.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether the task has been canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    /// Number of completed runs.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.inner.runs()
    }
}
