#![forbid(unsafe_code)]

//! Polling fallback for state the engine cannot intercept.
//!
//! A property backed by a native accessor with no declared computed
//! metadata has no change notification at all; the locator falls back to
//! a [`DirtyCheckedObserver`]. All dirty-checked observers share one
//! recurring task at interval zero that only does its comparison work
//! every `ticks_per_check` ticks, bounding CPU cost. On a detected
//! difference, subscribers are notified synchronously, bypassing any
//! open batch.
//!
//! Policy knobs ([`DirtyCheckSettings`]):
//!
//! - `disabled`: the shared task keeps ticking but skips comparisons.
//! - `throw_on_create`: *creating* a dirty-checked observer fails with a
//!   usage error — checked once at creation time, never per tick — so a
//!   host can forbid silent polling outright.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use argus_sched::{RecurringTask, TaskQueue};
use web_time::Duration;

use crate::error::ObserverError;
use crate::object::{Key, ObjectHandle, WeakObject};
use crate::observer::{Accessor, Observer, ObserverFlags};
use crate::subscribers::{Subscriber, SubscriberRecord};
use crate::value::Value;

/// Global dirty-check policy.
#[derive(Debug, Clone, Copy)]
pub struct DirtyCheckSettings {
    /// Skip all comparisons (the shared task still ticks).
    pub disabled: bool,
    /// Fail observer creation instead of silently polling.
    pub throw_on_create: bool,
    /// Run the comparison sweep once every this many ticks.
    pub ticks_per_check: u32,
}

impl Default for DirtyCheckSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            throw_on_create: false,
            ticks_per_check: 6,
        }
    }
}

struct DirtyInner {
    queue: TaskQueue,
    settings: Cell<DirtyCheckSettings>,
    tracked: RefCell<Vec<Weak<DirtyCheckedObserver>>>,
    elapsed: Cell<u32>,
    task: RefCell<Option<RecurringTask>>,
}

/// Shared dirty-check coordinator, owned by the runtime.
#[derive(Clone)]
pub struct DirtyChecker {
    inner: Rc<DirtyInner>,
}

impl std::fmt::Debug for DirtyChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyChecker")
            .field("tracked", &self.inner.tracked.borrow().len())
            .field("running", &self.inner.task.borrow().is_some())
            .finish()
    }
}

impl DirtyChecker {
    pub(crate) fn new(queue: TaskQueue, settings: DirtyCheckSettings) -> Self {
        Self {
            inner: Rc::new(DirtyInner {
                queue,
                settings: Cell::new(settings),
                tracked: RefCell::new(Vec::new()),
                elapsed: Cell::new(0),
                task: RefCell::new(None),
            }),
        }
    }

    /// Current policy.
    #[must_use]
    pub fn settings(&self) -> DirtyCheckSettings {
        self.inner.settings.get()
    }

    /// Adjust the policy.
    pub fn configure(&self, configure: impl FnOnce(&mut DirtyCheckSettings)) {
        let mut settings = self.inner.settings.get();
        configure(&mut settings);
        self.inner.settings.set(settings);
    }

    /// Number of currently tracked properties.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.inner
            .tracked
            .borrow()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub(crate) fn create_observer(
        &self,
        object: &ObjectHandle,
        key: Key,
        record: SubscriberRecord,
    ) -> Result<Rc<DirtyCheckedObserver>, ObserverError> {
        if self.settings().throw_on_create {
            return Err(ObserverError::DirtyCheckDisallowed {
                key: key.to_string(),
            });
        }
        tracing::debug!(key = %key, "falling back to dirty checking");
        let observer = Rc::new(DirtyCheckedObserver {
            object: object.downgrade(),
            key,
            checker: self.clone(),
            record,
            last: RefCell::new(Value::Void),
            self_weak: RefCell::new(Weak::new()),
        });
        *observer.self_weak.borrow_mut() = Rc::downgrade(&observer);
        Ok(observer)
    }

    fn add(&self, observer: &Rc<DirtyCheckedObserver>) {
        self.inner.tracked.borrow_mut().push(Rc::downgrade(observer));
        self.ensure_task();
    }

    fn remove(&self, observer: &DirtyCheckedObserver) {
        let target = observer as *const DirtyCheckedObserver;
        self.inner.tracked.borrow_mut().retain(|weak| {
            weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), target)
        });
        if self.inner.tracked.borrow().is_empty()
            && let Some(task) = self.inner.task.borrow_mut().take()
        {
            task.cancel();
        }
    }

    fn ensure_task(&self) {
        if self.inner.task.borrow().is_some() {
            return;
        }
        let weak = Rc::downgrade(&self.inner);
        let task = self.inner.queue.queue_recurring_task(
            move || {
                if let Some(inner) = weak.upgrade() {
                    DirtyChecker { inner }.tick();
                }
            },
            Duration::ZERO,
        );
        *self.inner.task.borrow_mut() = Some(task);
    }

    fn tick(&self) {
        let settings = self.settings();
        let elapsed = self.inner.elapsed.get() + 1;
        if elapsed < settings.ticks_per_check.max(1) {
            self.inner.elapsed.set(elapsed);
            return;
        }
        self.inner.elapsed.set(0);
        if settings.disabled {
            return;
        }
        let tracked: Vec<Rc<DirtyCheckedObserver>> = {
            let mut list = self.inner.tracked.borrow_mut();
            list.retain(|weak| weak.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in tracked {
            observer.poll();
        }
    }
}

/// Polling observer for one uninterceptable property.
pub struct DirtyCheckedObserver {
    object: WeakObject,
    key: Key,
    checker: DirtyChecker,
    record: SubscriberRecord,
    last: RefCell<Value>,
    self_weak: RefCell<Weak<DirtyCheckedObserver>>,
}

impl std::fmt::Debug for DirtyCheckedObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyCheckedObserver")
            .field("key", &self.key)
            .finish()
    }
}

impl DirtyCheckedObserver {
    fn current(&self) -> Value {
        self.object
            .upgrade()
            .map_or(Value::Void, |object| object.get(&self.key))
    }

    /// One comparison sweep: strict-equality compare, synchronous
    /// unbatched notify on difference.
    fn poll(&self) {
        let new = self.current();
        let old = self.last.borrow().clone();
        if new != old {
            *self.last.borrow_mut() = new.clone();
            self.record.notify_now(&new, &old);
        }
    }
}

impl Accessor for DirtyCheckedObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        Ok(self.current())
    }

    fn set_value(&self, value: Value) -> Result<(), ObserverError> {
        match self.object.upgrade() {
            Some(object) => object.set_accessor_value(&self.key, value),
            None => Ok(()),
        }
    }
}

impl Observer for DirtyCheckedObserver {
    fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let was_empty = self.record.count() == 0;
        let added = self.record.subscribe(subscriber);
        if added
            && was_empty
            && let Some(me) = self.self_weak.borrow().upgrade()
        {
            *self.last.borrow_mut() = self.current();
            self.checker.add(&me);
        }
        added
    }

    fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let removed = self.record.unsubscribe(subscriber);
        if removed && self.record.count() == 0 {
            self.checker.remove(self);
        }
        removed
    }

    fn flags(&self) -> ObserverFlags {
        ObserverFlags::POLLED | ObserverFlags::NO_NATIVE_NOTIFY
    }
}
