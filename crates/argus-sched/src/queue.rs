#![forbid(unsafe_code)]

//! The single shared FIFO task queue.
//!
//! All deferred work in the engine funnels through one [`TaskQueue`].
//! Enqueuing requests a flush; requests made before the flush runs
//! coalesce into one. The queue has no event loop of its own: the
//! embedder (or a test) drives it by calling [`TaskQueue::flush`] when a
//! request is outstanding. `flush()` drains strictly in FIFO order and
//! keeps draining items enqueued by the items it runs, so one flush call
//! is atomic with respect to everything outside it.
//!
//! Recurring tasks are admitted to the FIFO once per flush when due
//! against the queue's [`Clock`]; a 0-interval recurring task therefore
//! runs once per flush, not unboundedly within one.
//!
//! # Invariants
//!
//! 1. Tasks run in exact enqueue order.
//! 2. Items enqueued during a flush are drained by that same flush.
//! 3. Re-entrant `flush()` calls are no-ops.
//! 4. A failing task rejects its own result; the flush continues with
//!    subsequent items.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use web_time::Duration;

use crate::clock::Clock;
use crate::result::TaskResult;
use crate::task::{
    RecurringInner, RecurringTask, Task, TaskHost, TaskInner, TaskReturn, TaskStatus,
};

enum QueueItem {
    Task(Rc<TaskInner>),
    Recurring(Rc<RecurringInner>),
}

struct QueueInner {
    clock: Clock,
    fifo: RefCell<VecDeque<QueueItem>>,
    recurring: RefCell<Vec<Rc<RecurringInner>>>,
    flush_requested: Cell<bool>,
    flushing: Cell<bool>,
    pending_async: Cell<usize>,
    next_id: Cell<u64>,
}

impl TaskHost for QueueInner {
    fn remove_pending(&self, id: u64) -> bool {
        let mut fifo = self.fifo.borrow_mut();
        let before = fifo.len();
        fifo.retain(|item| match item {
            QueueItem::Task(task) => task.id() != id,
            QueueItem::Recurring(_) => true,
        });
        fifo.len() < before
    }

    fn async_started(&self) {
        self.pending_async.set(self.pending_async.get() + 1);
    }

    fn async_settled(&self) {
        let count = self.pending_async.get();
        debug_assert!(count > 0, "async settle without matching start");
        self.pending_async.set(count.saturating_sub(1));
    }
}

/// The shared cooperative task queue.
///
/// Cheaply cloneable; all clones share the same queue state.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Rc<QueueInner>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.inner.fifo.borrow().len())
            .field("recurring", &self.inner.recurring.borrow().len())
            .field("flush_requested", &self.inner.flush_requested.get())
            .field("pending_async", &self.inner.pending_async.get())
            .finish()
    }
}

impl TaskQueue {
    /// Create a queue over the real wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Clock::real())
    }

    /// Create a queue over an explicit clock (manual clocks make
    /// recurring-task behavior deterministic in tests).
    #[must_use]
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            inner: Rc::new(QueueInner {
                clock,
                fifo: RefCell::new(VecDeque::new()),
                recurring: RefCell::new(Vec::new()),
                flush_requested: Cell::new(false),
                flushing: Cell::new(false),
                pending_async: Cell::new(0),
                next_id: Cell::new(1),
            }),
        }
    }

    /// The queue's clock.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    fn host(&self) -> std::rc::Weak<dyn TaskHost> {
        let weak: std::rc::Weak<QueueInner> = Rc::downgrade(&self.inner);
        weak
    }

    /// Enqueue a callback and request a flush.
    pub fn queue_task(&self, mut callback: impl FnMut() + 'static) -> Task {
        self.queue_async_task(move || {
            callback();
            TaskReturn::done()
        })
    }

    /// Enqueue a callback that may complete asynchronously.
    ///
    /// A [`TaskReturn::Pending`] return keeps the task `Running` until the
    /// returned result settles; the not-yet-settled operation is counted
    /// so [`TaskQueue::yield_tasks`] can report full drain.
    pub fn queue_async_task(&self, callback: impl FnMut() -> TaskReturn + 'static) -> Task {
        let inner = Rc::new(TaskInner::new(
            self.next_id(),
            Box::new(callback),
            self.host(),
        ));
        self.inner
            .fifo
            .borrow_mut()
            .push_back(QueueItem::Task(Rc::clone(&inner)));
        self.request_flush();
        Task { inner }
    }

    /// Register a recurring task with a fixed interval.
    ///
    /// The first run happens at the first flush after `interval` has
    /// elapsed (immediately for a zero interval).
    pub fn queue_recurring_task(
        &self,
        callback: impl FnMut() + 'static,
        interval: Duration,
    ) -> RecurringTask {
        let inner = Rc::new(RecurringInner::new(
            self.next_id(),
            Box::new(callback),
            interval,
            self.inner.clock.now(),
        ));
        self.inner.recurring.borrow_mut().push(Rc::clone(&inner));
        self.request_flush();
        RecurringTask { inner }
    }

    /// A result that settles after the next full flush.
    #[must_use]
    pub fn next_tick(&self) -> TaskResult {
        self.queue_task(|| {})
            .result()
            .expect("freshly queued task is pending, result is available")
    }

    fn request_flush(&self) {
        if !self.inner.flush_requested.get() {
            self.inner.flush_requested.set(true);
            tracing::trace!("flush requested");
        }
    }

    /// Whether a flush has been requested and not yet run.
    ///
    /// Embedders poll this (or check after their own event dispatch) to
    /// decide when to call [`TaskQueue::flush`]; multiple enqueues before
    /// the flush coalesce into this single request.
    #[must_use]
    pub fn flush_requested(&self) -> bool {
        self.inner.flush_requested.get()
    }

    /// Number of items currently in the FIFO.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.fifo.borrow().len()
    }

    /// Whether the FIFO is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.fifo.borrow().is_empty()
    }

    /// Number of async operations started but not yet settled.
    #[must_use]
    pub fn pending_async_count(&self) -> usize {
        self.inner.pending_async.get()
    }

    /// Drain the queue in FIFO order.
    ///
    /// Due recurring tasks are admitted once at the start; items enqueued
    /// by running items are drained within this same call. Re-entrant
    /// calls (from inside a running task) are no-ops.
    pub fn flush(&self) {
        let inner = &self.inner;
        if inner.flushing.get() {
            return;
        }
        inner.flushing.set(true);
        inner.flush_requested.set(false);
        self.admit_due_recurring();
        loop {
            let item = inner.fifo.borrow_mut().pop_front();
            let Some(item) = item else { break };
            match item {
                QueueItem::Task(task) => {
                    if task.status() == TaskStatus::Pending {
                        task.run();
                    }
                }
                QueueItem::Recurring(recurring) => recurring.run(&inner.clock),
            }
        }
        inner.flushing.set(false);
    }

    /// Flush until the FIFO is empty.
    ///
    /// Returns `true` if all asynchronous work has also settled, i.e. the
    /// queue is fully drained; `false` if async operations remain pending
    /// (they settle cooperatively, outside the queue's control). Called
    /// from inside a running task this cannot drain (the outer flush
    /// owns the queue) and reports the current state instead.
    pub fn yield_tasks(&self) -> bool {
        while !self.inner.flushing.get() {
            self.flush();
            if self.inner.fifo.borrow().is_empty() {
                break;
            }
        }
        self.inner.pending_async.get() == 0 && self.inner.fifo.borrow().is_empty()
    }

    fn admit_due_recurring(&self) {
        let now = self.inner.clock.now();
        let mut recurring = self.inner.recurring.borrow_mut();
        recurring.retain(|task| !task.is_canceled());
        let mut fifo = self.inner.fifo.borrow_mut();
        for task in recurring.iter() {
            if task.is_due(now) {
                fifo.push_back(QueueItem::Recurring(Rc::clone(task)));
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use crate::clock::ManualClock;
    use crate::result::TaskError;

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnMut()>) {
        let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let log_for_make = Rc::clone(&log);
        let make = move |tag: u32| -> Box<dyn FnMut()> {
            let log = Rc::clone(&log_for_make);
            Box::new(move || log.borrow_mut().push(tag))
        };
        (log, make)
    }

    #[test]
    fn fifo_order_preserved() {
        let queue = TaskQueue::new();
        let (log, make) = recorder();
        queue.queue_task(make(1));
        queue.queue_task(make(2));
        queue.queue_task(make(3));
        queue.flush();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn flush_requests_coalesce() {
        let queue = TaskQueue::new();
        assert!(!queue.flush_requested());
        queue.queue_task(|| {});
        queue.queue_task(|| {});
        assert!(queue.flush_requested());
        queue.flush();
        assert!(!queue.flush_requested());
        assert!(queue.is_empty());
    }

    #[test]
    fn items_enqueued_mid_flush_drain_same_flush() {
        let queue = TaskQueue::new();
        let (log, make) = recorder();
        let inner_queue = queue.clone();
        let mut tail = Some(make(2));
        queue.queue_task({
            let log = Rc::clone(&log);
            move || {
                log.borrow_mut().push(1);
                if let Some(tail) = tail.take() {
                    inner_queue.queue_task(tail);
                }
            }
        });
        queue.flush();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn cancel_pending_dequeues_and_rejects() {
        let queue = TaskQueue::new();
        let task = queue.queue_task(|| panic!("must not run"));
        let result = task.result().expect("pending result");
        assert!(task.cancel());
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(matches!(result.settled(), Some(Err(TaskError::Aborted))));
        queue.flush();
        // Terminal state: a second cancel is a no-op.
        assert!(!task.cancel());
    }

    #[test]
    fn completed_result_resolves_with_return_value() {
        let queue = TaskQueue::new();
        let task = queue.queue_async_task(|| TaskReturn::Value(Rc::new(41i32 + 1)));
        queue.flush();
        assert_eq!(task.status(), TaskStatus::Completed);
        let a = task.result().expect("completed result");
        let b = task.result().expect("completed result");
        for result in [a, b] {
            let value = result.settled().expect("settled").expect("ok");
            assert_eq!(value.downcast_ref::<i32>(), Some(&42));
        }
    }

    #[test]
    fn failing_task_does_not_halt_queue() {
        let queue = TaskQueue::new();
        let (log, make) = recorder();
        let failing = queue.queue_async_task(|| TaskReturn::Fail(TaskError::Failed("bad".into())));
        let result = failing.result().expect("pending result");
        queue.queue_task(make(7));
        queue.flush();
        assert!(matches!(result.settled(), Some(Err(TaskError::Failed(_)))));
        assert_eq!(*log.borrow(), vec![7]);
    }

    #[test]
    fn async_task_tracks_pending_counter() {
        let queue = TaskQueue::new();
        let (pending, deferred) = TaskResult::deferred();
        let mut handoff = Some(pending);
        let task = queue.queue_async_task(move || {
            TaskReturn::Pending(handoff.take().expect("single run"))
        });
        let result = task.result().expect("pending result");

        assert!(!queue.yield_tasks(), "async op still pending");
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(task.result().is_err(), "result while running fails fast");

        deferred.resolve(Rc::new("late"));
        assert!(queue.yield_tasks());
        assert_eq!(task.status(), TaskStatus::Completed);
        let value = result.settled().expect("settled").expect("ok");
        assert_eq!(value.downcast_ref::<&str>(), Some(&"late"));
    }

    #[test]
    fn recurring_task_reschedules_until_canceled() {
        let manual = ManualClock::new();
        let queue = TaskQueue::with_clock(Clock::manual(manual.clone()));
        let (log, make) = recorder();
        let task = queue.queue_recurring_task(make(9), Duration::from_millis(10));

        queue.flush();
        assert_eq!(task.runs(), 0, "not yet due");

        manual.advance(Duration::from_millis(10));
        queue.flush();
        assert_eq!(task.runs(), 1);

        // Not due again until another interval elapses.
        queue.flush();
        assert_eq!(task.runs(), 1);

        manual.advance(Duration::from_millis(10));
        queue.flush();
        assert_eq!(task.runs(), 2);

        task.cancel();
        manual.advance(Duration::from_millis(10));
        queue.flush();
        assert_eq!(task.runs(), 2);
        assert_eq!(*log.borrow(), vec![9, 9]);
    }

    #[test]
    fn zero_interval_recurring_runs_once_per_flush() {
        let queue = TaskQueue::new();
        let task = queue.queue_recurring_task(|| {}, Duration::ZERO);
        queue.flush();
        assert_eq!(task.runs(), 1);
        queue.flush();
        assert_eq!(task.runs(), 2);
    }

    #[test]
    fn recurring_self_cancel_runs_exactly_once() {
        let queue = TaskQueue::new();
        let slot: Rc<RefCell<Option<RecurringTask>>> = Rc::new(RefCell::new(None));
        let slot_in_task = Rc::clone(&slot);
        let task = queue.queue_recurring_task(
            move || {
                if let Some(task) = slot_in_task.borrow().as_ref() {
                    task.cancel();
                }
            },
            Duration::ZERO,
        );
        *slot.borrow_mut() = Some(task.clone());

        queue.flush();
        queue.flush();
        queue.flush();
        assert_eq!(task.runs(), 1);
        assert!(task.is_canceled());
    }

    #[test]
    fn next_tick_settles_after_queued_work() {
        let queue = TaskQueue::new();
        let (log, make) = recorder();
        queue.queue_task(make(1));
        queue.queue_task(make(2));
        let tick = queue.next_tick();
        assert!(!tick.is_settled());
        queue.flush();
        assert!(tick.is_settled());
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn reentrant_flush_is_noop() {
        let queue = TaskQueue::new();
        let (log, make) = recorder();
        let inner_queue = queue.clone();
        let mut tail = Some(make(2));
        queue.queue_task({
            let log = Rc::clone(&log);
            move || {
                log.borrow_mut().push(1);
                if let Some(tail) = tail.take() {
                    inner_queue.queue_task(tail);
                }
                // Must not recurse; the outer flush drains the new item.
                inner_queue.flush();
            }
        });
        queue.flush();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }
}
