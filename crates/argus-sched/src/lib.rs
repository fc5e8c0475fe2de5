#![forbid(unsafe_code)]

//! Cooperative single-threaded task scheduling for Argus.
//!
//! One shared FIFO [`TaskQueue`] carries every piece of deferred work in
//! the engine: flush requests coalesce, drains are strict FIFO and atomic
//! with respect to everything outside them, and recurring tasks
//! reschedule themselves against a pluggable [`Clock`] so tests drive
//! time explicitly.
//!
//! There is no thread pool and no preemption anywhere in this crate:
//! "async" means "deferred to a later drain of the same queue", and
//! cancellation is cooperative and only effective before a run starts.

pub mod clock;
pub mod queue;
pub mod result;
pub mod task;

pub use clock::{Clock, ManualClock};
pub use queue::TaskQueue;
pub use result::{Deferred, SettledValue, TaskError, TaskResult, TaskValue};
pub use task::{RecurringTask, Task, TaskReturn, TaskStatus};
