#![forbid(unsafe_code)]

//! Dependency tracking for computed-style observers.
//!
//! While a computed getter evaluates, its [`DependencyTracker`] sits on
//! top of the runtime's [`TrackerStack`]; every read funneled through the
//! locator resolves a sub-observer and reports it to the top tracker.
//! Dependencies are version-stamped: an entry whose stamp is stale after
//! an evaluation was not touched this time (the untaken branch of a
//! conditional) and is unsubscribed and dropped, so conditional
//! dependencies stay exact.
//!
//! # Invariants
//!
//! 1. After a completed evaluation, every tracked dependency's stamp
//!    equals the evaluation's version.
//! 2. Subscribing a dependency happens at most once per observer
//!    (idempotent via the subscriber record).
//! 3. Teardown (`clear`) unsubscribes symmetrically with everything
//!    subscribed during evaluations.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::observer::Observer;
use crate::subscribers::Subscriber;

struct DepEntry {
    observer: Rc<dyn Observer>,
    stamp: u64,
}

struct TrackerInner {
    version: Cell<u64>,
    deps: RefCell<SmallVec<[DepEntry; 4]>>,
    /// The owning observer, as the subscriber registered on dependencies.
    subscriber: RefCell<Weak<dyn Subscriber>>,
}

/// Version-stamped dependency set owned by one computed-style observer.
///
/// Cheaply cloneable; clones share state (the tracker stack holds
/// clones during evaluation).
#[derive(Clone)]
pub struct DependencyTracker {
    inner: Rc<TrackerInner>,
}

impl std::fmt::Debug for DependencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyTracker")
            .field("version", &self.inner.version.get())
            .field("deps", &self.inner.deps.borrow().len())
            .finish()
    }
}

impl DependencyTracker {
    #[must_use]
    pub fn new() -> Self {
        let unbound: Weak<dyn Subscriber> = Weak::<InertSubscriber>::new();
        Self {
            inner: Rc::new(TrackerInner {
                version: Cell::new(0),
                deps: RefCell::new(SmallVec::new()),
                subscriber: RefCell::new(unbound),
            }),
        }
    }

    /// Bind the owning observer. Must be called before the first
    /// evaluation; dependencies are subscribed with this subscriber.
    pub fn bind(&self, subscriber: Weak<dyn Subscriber>) {
        *self.inner.subscriber.borrow_mut() = subscriber;
    }

    /// Current evaluation version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    /// Number of tracked dependencies.
    #[must_use]
    pub fn dep_count(&self) -> usize {
        self.inner.deps.borrow().len()
    }

    /// Start a new evaluation round.
    pub(crate) fn new_version(&self) {
        self.inner.version.set(self.inner.version.get() + 1);
    }

    /// Record a dependency read during the current evaluation,
    /// subscribing to it when seen for the first time.
    pub fn observe(&self, observer: &Rc<dyn Observer>) {
        let version = self.inner.version.get();
        let mut deps = self.inner.deps.borrow_mut();
        if let Some(entry) = deps
            .iter_mut()
            .find(|entry| Rc::ptr_eq(&entry.observer, observer))
        {
            entry.stamp = version;
            return;
        }
        if let Some(subscriber) = self.inner.subscriber.borrow().upgrade() {
            observer.subscribe(&subscriber);
        }
        deps.push(DepEntry {
            observer: Rc::clone(observer),
            stamp: version,
        });
    }

    /// Drop (and unsubscribe) every dependency not touched in the current
    /// evaluation round.
    pub(crate) fn prune_stale(&self) {
        let version = self.inner.version.get();
        let subscriber = self.inner.subscriber.borrow().upgrade();
        self.inner.deps.borrow_mut().retain(|entry| {
            if entry.stamp == version {
                return true;
            }
            if let Some(subscriber) = &subscriber {
                entry.observer.unsubscribe(subscriber);
            }
            false
        });
    }

    /// Unsubscribe and drop every dependency (observer lost its last
    /// subscriber).
    pub(crate) fn clear(&self) {
        let subscriber = self.inner.subscriber.borrow().upgrade();
        for entry in self.inner.deps.borrow_mut().drain(..) {
            if let Some(subscriber) = &subscriber {
                entry.observer.unsubscribe(subscriber);
            }
        }
    }
}

impl Default for DependencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Placeholder subscriber type for unbound trackers.
struct InertSubscriber;

impl Subscriber for InertSubscriber {
    fn handle_change(&self, _new: &crate::value::Value, _old: &crate::value::Value) {}
}

/// The runtime-owned stack of active trackers.
///
/// Evaluations push their tracker; nested computed evaluations nest
/// naturally. A `None` frame is an *untracked mask*: reads under it
/// report to no one, which is how explicit-dependency observers keep
/// their push-mode recomputes from polluting an outer tracker.
pub(crate) struct TrackerStack {
    frames: RefCell<Vec<Option<DependencyTracker>>>,
}

impl TrackerStack {
    pub(crate) fn new() -> Self {
        Self {
            frames: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, frame: Option<DependencyTracker>) {
        self.frames.borrow_mut().push(frame);
    }

    pub(crate) fn pop(&self) {
        let popped = self.frames.borrow_mut().pop();
        debug_assert!(popped.is_some(), "tracker stack underflow");
    }

    /// The tracker reads should report to, unless masked.
    pub(crate) fn current(&self) -> Option<DependencyTracker> {
        self.frames.borrow().last().cloned().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectHandle;
    use crate::property::SetterObserver;
    use crate::subscribers::{BatchContext, SubscriberRecord};
    use crate::value::Value;

    struct NullSubscriber;

    impl Subscriber for NullSubscriber {
        fn handle_change(&self, _new: &Value, _old: &Value) {}
    }

    fn setter(obj: &ObjectHandle, key: &str) -> Rc<dyn Observer> {
        SetterObserver::new(
            obj,
            Rc::from(key),
            SubscriberRecord::new(BatchContext::new()),
        )
    }

    #[test]
    fn observe_subscribes_once_and_stamps() {
        let obj = ObjectHandle::new();
        let dep = setter(&obj, "a");
        let tracker = DependencyTracker::new();
        let owner: Rc<dyn Subscriber> = Rc::new(NullSubscriber);
        tracker.bind(Rc::downgrade(&owner));

        tracker.new_version();
        tracker.observe(&dep);
        tracker.observe(&dep);
        assert_eq!(tracker.dep_count(), 1);
        tracker.prune_stale();
        assert_eq!(tracker.dep_count(), 1);
    }

    #[test]
    fn untouched_dependency_is_pruned_and_unsubscribed() {
        let obj = ObjectHandle::new();
        let a = setter(&obj, "a");
        let b = setter(&obj, "b");
        let tracker = DependencyTracker::new();
        let owner: Rc<dyn Subscriber> = Rc::new(NullSubscriber);
        tracker.bind(Rc::downgrade(&owner));

        tracker.new_version();
        tracker.observe(&a);
        tracker.observe(&b);
        tracker.prune_stale();
        assert_eq!(tracker.dep_count(), 2);

        // Next round only touches `a`; `b` must be dropped and
        // unsubscribed (its record no longer knows the owner).
        tracker.new_version();
        tracker.observe(&a);
        tracker.prune_stale();
        assert_eq!(tracker.dep_count(), 1);
        assert!(!b.unsubscribe(&owner), "already unsubscribed");
        assert!(a.unsubscribe(&owner), "still subscribed");
    }

    #[test]
    fn clear_tears_down_everything() {
        let obj = ObjectHandle::new();
        let a = setter(&obj, "a");
        let tracker = DependencyTracker::new();
        let owner: Rc<dyn Subscriber> = Rc::new(NullSubscriber);
        tracker.bind(Rc::downgrade(&owner));

        tracker.new_version();
        tracker.observe(&a);
        tracker.clear();
        assert_eq!(tracker.dep_count(), 0);
        assert!(!a.unsubscribe(&owner));
    }

    #[test]
    fn stack_masking() {
        let stack = TrackerStack::new();
        let tracker = DependencyTracker::new();
        stack.push(Some(tracker.clone()));
        assert!(stack.current().is_some());
        stack.push(None);
        assert!(stack.current().is_none(), "masked");
        stack.pop();
        assert!(stack.current().is_some());
        stack.pop();
        assert!(stack.current().is_none());
    }
}
