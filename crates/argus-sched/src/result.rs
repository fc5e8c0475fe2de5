#![forbid(unsafe_code)]

//! Settled/pending result cells for queued tasks.
//!
//! [`TaskResult`] is a single-threaded promise-like cell: it is either
//! pending (holding settle callbacks) or settled exactly once with a
//! type-erased value or a [`TaskError`]. [`Deferred`] is the resolver
//! half handed to code that completes asynchronous work.
//!
//! # Invariants
//!
//! 1. A result settles at most once; later settle attempts are ignored.
//! 2. Settle callbacks registered before settlement run exactly once, in
//!    registration order, at settlement time.
//! 3. Settle callbacks registered after settlement run immediately.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

/// Errors surfaced through the scheduler.
#[derive(Debug, Clone)]
pub enum TaskError {
    /// The task was canceled while still pending.
    Aborted,
    /// The task callback reported a failure.
    Failed(String),
    /// `Task::result()` was requested while the task was running.
    ///
    /// Awaiting a task from inside its own run can never settle; this is
    /// reported immediately instead.
    ResultWhileRunning,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted => write!(f, "task was canceled before it ran"),
            Self::Failed(msg) => write!(f, "task failed: {msg}"),
            Self::ResultWhileRunning => {
                write!(f, "task result requested while the task is running")
            }
        }
    }
}

impl std::error::Error for TaskError {}

/// Type-erased value a task settles with.
pub type TaskValue = Rc<dyn Any>;

/// Outcome of a settled task.
pub type SettledValue = Result<TaskValue, TaskError>;

type SettleCallback = Box<dyn FnOnce(&SettledValue)>;

enum ResultState {
    Pending(Vec<SettleCallback>),
    Settled(SettledValue),
}

/// A single-settlement result cell for a queued task.
///
/// Cloning yields another handle to the same cell.
#[derive(Clone)]
pub struct TaskResult {
    state: Rc<RefCell<ResultState>>,
}

impl std::fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settled = matches!(&*self.state.borrow(), ResultState::Settled(_));
        f.debug_struct("TaskResult")
            .field("settled", &settled)
            .finish()
    }
}

impl TaskResult {
    /// Create a pending result together with its resolver half.
    #[must_use]
    pub fn deferred() -> (Self, Deferred) {
        let result = Self {
            state: Rc::new(RefCell::new(ResultState::Pending(Vec::new()))),
        };
        let deferred = Deferred {
            result: result.clone(),
        };
        (result, deferred)
    }

    /// Create an already-fulfilled result.
    #[must_use]
    pub fn fulfilled(value: TaskValue) -> Self {
        Self {
            state: Rc::new(RefCell::new(ResultState::Settled(Ok(value)))),
        }
    }

    /// Create an already-rejected result.
    #[must_use]
    pub fn rejected(error: TaskError) -> Self {
        Self {
            state: Rc::new(RefCell::new(ResultState::Settled(Err(error)))),
        }
    }

    /// Whether the result has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(&*self.state.borrow(), ResultState::Settled(_))
    }

    /// The settled outcome, if any.
    #[must_use]
    pub fn settled(&self) -> Option<SettledValue> {
        match &*self.state.borrow() {
            ResultState::Settled(outcome) => Some(outcome.clone()),
            ResultState::Pending(_) => None,
        }
    }

    /// Run `callback` when the result settles (immediately if it already
    /// has).
    pub fn on_settled(&self, callback: impl FnOnce(&SettledValue) + 'static) {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            ResultState::Pending(callbacks) => {
                callbacks.push(Box::new(callback));
            }
            ResultState::Settled(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                callback(&outcome);
            }
        }
    }

    pub(crate) fn settle(&self, outcome: SettledValue) {
        let callbacks = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                ResultState::Settled(_) => return,
                ResultState::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = ResultState::Settled(outcome.clone());
                    callbacks
                }
            }
        };
        for callback in callbacks {
            callback(&outcome);
        }
    }
}

/// Resolver half of a [`TaskResult::deferred`] pair.
///
/// Used by asynchronous task callbacks: return the pending [`TaskResult`]
/// from the callback and settle the `Deferred` when the work finishes.
pub struct Deferred {
    result: TaskResult,
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.result.is_settled())
            .finish()
    }
}

impl Deferred {
    /// Fulfill the paired result.
    pub fn resolve(self, value: TaskValue) {
        self.result.settle(Ok(value));
    }

    /// Reject the paired result.
    pub fn reject(self, error: TaskError) {
        self.result.settle(Err(error));
    }
}
