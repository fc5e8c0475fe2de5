#![forbid(unsafe_code)]

//! Observed insertion-ordered sets.
//!
//! Membership uses the value model's strict equality, so a set can hold
//! one of each primitive value and any number of distinct handles.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::ObserverError;
use crate::index_map::IndexMap;
use crate::observer::{Accessor, Observer, ObserverFlags};
use crate::property::CollectionLengthObserver;
use crate::subscribers::{Subscriber, SubscriberRecord};
use crate::value::Value;

struct SetInner {
    items: RefCell<Vec<Value>>,
    observer: RefCell<Option<Rc<SetObserver>>>,
}

/// Shared handle to an observed insertion-ordered set.
#[derive(Clone)]
pub struct SetHandle {
    inner: Rc<SetInner>,
}

impl std::fmt::Debug for SetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetHandle")
            .field("len", &self.len())
            .field("observed", &self.inner.observer.borrow().is_some())
            .finish()
    }
}

impl SetHandle {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SetInner {
                items: RefCell::new(Vec::new()),
                observer: RefCell::new(None),
            }),
        }
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// Stable identity.
    #[must_use]
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn downgrade(&self) -> WeakSet {
        WeakSet(Rc::downgrade(&self.inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.items.borrow().is_empty()
    }

    /// Whether `value` is a member.
    #[must_use]
    pub fn contains(&self, value: &Value) -> bool {
        self.inner.items.borrow().iter().any(|v| v == value)
    }

    /// Members in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Value> {
        self.inner.items.borrow().clone()
    }

    fn observer(&self) -> Option<Rc<SetObserver>> {
        self.inner.observer.borrow().clone()
    }

    /// Add `value`. Returns whether the set changed.
    pub fn add(&self, value: Value) -> bool {
        if self.contains(&value) {
            return false;
        }
        let old_len = self.len();
        self.inner.items.borrow_mut().push(value);
        if let Some(observer) = self.observer() {
            let mut map = IndexMap::identity(old_len);
            map.push_new();
            observer.record.notify_collection(&map);
        }
        true
    }

    /// Remove `value`. Returns whether it was present.
    pub fn delete(&self, value: &Value) -> bool {
        let Some(index) = self.inner.items.borrow().iter().position(|v| v == value) else {
            return false;
        };
        let old_len = self.len();
        let removed = self.inner.items.borrow_mut().remove(index);
        if let Some(observer) = self.observer() {
            let mut map = IndexMap::identity(old_len);
            map.remove_slot(index, removed);
            observer.record.notify_collection(&map);
        }
        true
    }

    /// Remove every member.
    pub fn clear(&self) {
        let old: Vec<Value> = std::mem::take(&mut *self.inner.items.borrow_mut());
        if let Some(observer) = self.observer()
            && !old.is_empty()
        {
            let mut map = IndexMap::identity(old.len());
            for item in old {
                map.remove_slot(0, item);
            }
            observer.record.notify_collection(&map);
        }
    }

    /// The observer for this set, creating it on first request.
    pub(crate) fn ensure_observer(&self, record: impl FnOnce() -> SubscriberRecord) -> Rc<SetObserver> {
        let mut slot = self.inner.observer.borrow_mut();
        if let Some(observer) = slot.as_ref() {
            return Rc::clone(observer);
        }
        let observer = Rc::new(SetObserver {
            set: WeakSet(Rc::downgrade(&self.inner)),
            record: record(),
            length_observer: RefCell::new(None),
        });
        *slot = Some(Rc::clone(&observer));
        observer
    }
}

impl Default for SetHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub(crate) struct WeakSet(Weak<SetInner>);

impl WeakSet {
    pub(crate) fn upgrade(&self) -> Option<SetHandle> {
        self.0.upgrade().map(|inner| SetHandle { inner })
    }
}

/// Change observer for one set instance.
pub struct SetObserver {
    set: WeakSet,
    pub(crate) record: SubscriberRecord,
    length_observer: RefCell<Option<Rc<CollectionLengthObserver>>>,
}

impl SetObserver {
    pub(crate) fn cached_length_observer(&self) -> Option<Rc<CollectionLengthObserver>> {
        self.length_observer.borrow().clone()
    }

    pub(crate) fn cache_length_observer(&self, observer: Rc<CollectionLengthObserver>) {
        *self.length_observer.borrow_mut() = Some(observer);
    }
}

impl Accessor for SetObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        Ok(self.set.upgrade().map_or(Value::Void, Value::Set))
    }

    fn set_value(&self, _value: Value) -> Result<(), ObserverError> {
        Err(ObserverError::ReadOnly { key: "set".into() })
    }
}

impl Observer for SetObserver {
    fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        self.record.subscribe(subscriber)
    }

    fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        self.record.unsubscribe(subscriber)
    }

    fn flags(&self) -> ObserverFlags {
        ObserverFlags::COLLECTION
    }
}
