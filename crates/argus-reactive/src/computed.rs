#![forbid(unsafe_code)]

//! Implicit-dependency computed observer.
//!
//! Two states:
//!
//! - **Unsubscribed**: pure pull. `get_value` re-evaluates the getter
//!   every time, holds no cache and subscribes to nothing. Reads the
//!   getter makes may still be tracked by an *outer* active tracker.
//! - **Subscribed**: push + cache. The getter's reads are tracked by the
//!   observer's own [`DependencyTracker`]; the result is cached with a
//!   dirty flag, and dependency changes trigger a recompute-and-notify
//!   cycle — synchronously in `Sync` flush mode, via one coalesced
//!   queued task in `Async` mode.
//!
//! # Invariants
//!
//! 1. In the unsubscribed state no dependency subscription exists.
//! 2. A recompute that leaves the observer dirty (the getter mutated its
//!    own dependency) fails fast with a reentrancy error, never loops.
//! 3. Equal recompute results (per the configured equality) notify no
//!    one.
//! 4. A failed recompute leaves the dirty flag set, so a later attempt
//!    retries cleanly.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use argus_sched::{TaskError, TaskReturn};

use crate::error::ObserverError;
use crate::index_map::IndexMap;
use crate::object::{Key, ObjectHandle, WeakObject};
use crate::observer::{Accessor, Observer, ObserverFlags};
use crate::registry::{CoerceFn, ComputedSpec, EqualityFn, FlushMode, GetterFn, SetterFn};
use crate::runtime::{Runtime, WeakRuntime};
use crate::subscribers::{Subscriber, SubscriberRecord};
use crate::tracker::DependencyTracker;
use crate::value::Value;

/// Computed property observer with implicit dependency tracking.
pub struct ComputedObserver {
    rt: WeakRuntime,
    owner: WeakObject,
    key: Key,
    get: GetterFn,
    set: Option<SetterFn>,
    equality: Option<EqualityFn>,
    coerce: Option<CoerceFn>,
    flush: FlushMode,
    tracker: DependencyTracker,
    record: SubscriberRecord,
    /// Present exactly while subscribed.
    cache: RefCell<Option<Value>>,
    dirty: Cell<bool>,
    /// Guards against synchronous re-entrant recomputation while the
    /// getter is on the stack.
    evaluating: Cell<bool>,
    /// Coalescing flag for the async flush task.
    queued: Cell<bool>,
    self_weak: RefCell<Weak<ComputedObserver>>,
}

impl std::fmt::Debug for ComputedObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedObserver")
            .field("key", &self.key)
            .field("dirty", &self.dirty.get())
            .field("subscribed", &(self.record.count() > 0))
            .field("deps", &self.tracker.dep_count())
            .finish()
    }
}

impl ComputedObserver {
    pub(crate) fn new(rt: &Runtime, owner: &ObjectHandle, key: Key, spec: &ComputedSpec) -> Rc<Self> {
        let observer = Rc::new(Self {
            rt: rt.downgrade(),
            owner: owner.downgrade(),
            key,
            get: Rc::clone(&spec.get),
            set: spec.set.clone(),
            equality: spec.equality.clone(),
            coerce: spec.coerce.clone(),
            flush: spec.flush,
            tracker: DependencyTracker::new(),
            record: SubscriberRecord::new(rt.batch_context()),
            cache: RefCell::new(None),
            dirty: Cell::new(false),
            evaluating: Cell::new(false),
            queued: Cell::new(false),
            self_weak: RefCell::new(Weak::new()),
        });
        *observer.self_weak.borrow_mut() = Rc::downgrade(&observer);
        let observer_dyn: Rc<dyn Subscriber> = observer.clone();
        let subscriber: Weak<dyn Subscriber> = Rc::downgrade(&observer_dyn);
        observer.tracker.bind(subscriber);
        observer
    }

    /// Whether the cached value is stale.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Number of currently tracked dependencies (zero while
    /// unsubscribed).
    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.tracker.dep_count()
    }

    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match &self.equality {
            Some(equality) => equality(a, b),
            None => a == b,
        }
    }

    /// Evaluate under this observer's own tracker (subscribed state).
    fn evaluate_tracked(&self) -> Result<Value, ObserverError> {
        let Some(rt) = self.rt.upgrade() else {
            return Ok(Value::Void);
        };
        let Some(owner) = self.owner.upgrade() else {
            return Ok(Value::Void);
        };
        self.evaluating.set(true);
        self.dirty.set(false);
        let result = rt.tracked(&self.tracker, |cx| (self.get)(cx, &owner));
        self.evaluating.set(false);
        match result {
            Ok(value) => {
                if self.dirty.get() {
                    Err(ObserverError::ReentrantRecompute {
                        key: self.key.to_string(),
                    })
                } else {
                    Ok(value)
                }
            }
            Err(err) => {
                self.dirty.set(true);
                Err(err)
            }
        }
    }

    /// Evaluate without touching this observer's tracker (pull mode).
    fn evaluate_pull(&self) -> Result<Value, ObserverError> {
        let Some(rt) = self.rt.upgrade() else {
            return Ok(Value::Void);
        };
        let Some(owner) = self.owner.upgrade() else {
            return Ok(Value::Void);
        };
        (self.get)(&rt.eval_cx(), &owner)
    }

    /// Recompute, cache, and notify on change.
    fn flush_now(&self) -> Result<(), ObserverError> {
        let old = self.cache.borrow().clone();
        let new = self.evaluate_tracked()?;
        *self.cache.borrow_mut() = Some(new.clone());
        let old = old.unwrap_or(Value::Void);
        if !self.values_equal(&new, &old) {
            self.record.notify(&new, &old);
        }
        Ok(())
    }

    fn on_dependency_changed(&self) {
        if self.evaluating.get() {
            // The getter mutated state it also reads; remember it and let
            // the post-evaluation check fail fast.
            self.dirty.set(true);
            return;
        }
        self.dirty.set(true);
        if self.record.count() == 0 {
            return;
        }
        match self.flush {
            FlushMode::Sync => {
                if let Err(err) = self.flush_now() {
                    match err {
                        ObserverError::ReentrantRecompute { .. } => {
                            panic!("{err}");
                        }
                        other => tracing::warn!(
                            key = %self.key,
                            error = %other,
                            "computed recompute failed; staying dirty"
                        ),
                    }
                }
            }
            FlushMode::Async => self.enqueue_flush(),
        }
    }

    fn enqueue_flush(&self) {
        if self.queued.replace(true) {
            return;
        }
        let Some(rt) = self.rt.upgrade() else {
            self.queued.set(false);
            return;
        };
        let weak = self.self_weak.borrow().clone();
        rt.queue().queue_async_task(move || {
            let Some(observer) = weak.upgrade() else {
                return TaskReturn::done();
            };
            observer.queued.set(false);
            if !observer.dirty.get() || observer.record.count() == 0 {
                return TaskReturn::done();
            }
            match observer.flush_now() {
                Ok(()) => TaskReturn::done(),
                Err(err) => TaskReturn::Fail(TaskError::Failed(err.to_string())),
            }
        });
    }

    /// First subscriber arrived: compute the initial cache under
    /// tracking. The initial value is cached, not notified.
    fn activate(&self) {
        match self.evaluate_tracked() {
            Ok(value) => *self.cache.borrow_mut() = Some(value),
            Err(err) => tracing::warn!(
                key = %self.key,
                error = %err,
                "initial computed evaluation failed; staying dirty"
            ),
        }
    }

    /// Last subscriber left: tear down dependency subscriptions and drop
    /// the cache.
    fn deactivate(&self) {
        self.tracker.clear();
        *self.cache.borrow_mut() = None;
        self.dirty.set(false);
    }
}

impl Accessor for ComputedObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        if self.record.count() > 0 {
            if self.dirty.get() || self.cache.borrow().is_none() {
                self.flush_now()?;
            }
            let cached = self.cache.borrow().clone();
            return Ok(cached.unwrap_or(Value::Void));
        }
        self.evaluate_pull()
    }

    fn set_value(&self, value: Value) -> Result<(), ObserverError> {
        let Some(set) = self.set.clone() else {
            return Err(ObserverError::ReadOnly {
                key: self.key.to_string(),
            });
        };
        let value = match &self.coerce {
            Some(coerce) => coerce(value),
            None => value,
        };
        let cached = self.cache.borrow().clone();
        if let Some(cached) = cached
            && self.values_equal(&value, &cached)
        {
            return Ok(());
        }
        let Some(rt) = self.rt.upgrade() else {
            return Ok(());
        };
        let Some(owner) = self.owner.upgrade() else {
            return Ok(());
        };
        rt.untracked(|cx| set(cx, &owner, value))?;
        if self.record.count() > 0 {
            self.dirty.set(true);
            match self.flush {
                FlushMode::Sync => self.flush_now()?,
                FlushMode::Async => self.enqueue_flush(),
            }
        }
        Ok(())
    }
}

impl Observer for ComputedObserver {
    fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let was_empty = self.record.count() == 0;
        let added = self.record.subscribe(subscriber);
        if added && was_empty {
            self.activate();
        }
        added
    }

    fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let removed = self.record.unsubscribe(subscriber);
        if removed && self.record.count() == 0 {
            self.deactivate();
        }
        removed
    }

    fn flags(&self) -> ObserverFlags {
        ObserverFlags::NO_NATIVE_NOTIFY
    }
}

impl Subscriber for ComputedObserver {
    fn handle_change(&self, _new: &Value, _old: &Value) {
        self.on_dependency_changed();
    }

    fn handle_collection_change(&self, _map: &IndexMap) {
        self.on_dependency_changed();
    }

    fn handle_dirty(&self) {
        self.dirty.set(true);
        self.record.notify_dirty();
    }

    fn wants_dirty(&self) -> bool {
        true
    }
}
