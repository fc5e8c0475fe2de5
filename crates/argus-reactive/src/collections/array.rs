#![forbid(unsafe_code)]

//! Observed arrays.
//!
//! # Invariants
//!
//! 1. Unobserved mutators never allocate an index map.
//! 2. Each observed mutation emits exactly one notification, whose index
//!    map is computed against the pre-mutation state.
//! 3. `set` with an equal value is a no-op (no notification).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::error::ObserverError;
use crate::index_map::{IndexMap, Slot};
use crate::observer::{Accessor, Observer, ObserverFlags};
use crate::property::{ArrayIndexObserver, CollectionLengthObserver};
use crate::subscribers::{Subscriber, SubscriberRecord};
use crate::value::Value;

struct ArrayInner {
    items: RefCell<Vec<Value>>,
    observer: RefCell<Option<Rc<ArrayObserver>>>,
}

/// Shared handle to an observed array.
#[derive(Clone)]
pub struct ArrayHandle {
    inner: Rc<ArrayInner>,
}

impl std::fmt::Debug for ArrayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayHandle")
            .field("len", &self.len())
            .field("observed", &self.inner.observer.borrow().is_some())
            .finish()
    }
}

impl ArrayHandle {
    /// Create an empty array.
    #[must_use]
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Create an array over existing items.
    #[must_use]
    pub fn from_vec(items: Vec<Value>) -> Self {
        Self {
            inner: Rc::new(ArrayInner {
                items: RefCell::new(items),
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

    pub(crate) fn downgrade(&self) -> WeakArray {
        WeakArray(Rc::downgrade(&self.inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.items.borrow().is_empty()
    }

    /// The item at `index`, if in bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.inner.items.borrow().get(index).cloned()
    }

    /// Copy of the current items.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Value> {
        self.inner.items.borrow().clone()
    }

    fn observer(&self) -> Option<Rc<ArrayObserver>> {
        self.inner.observer.borrow().clone()
    }

    fn notify(&self, observer: &ArrayObserver, map: IndexMap) {
        if !map.is_empty() {
            observer.record.notify_collection(&map);
        }
    }

    /// Append an item.
    pub fn push(&self, value: Value) {
        let observer = self.observer();
        let map = observer.as_ref().map(|_| {
            let mut map = IndexMap::identity(self.len());
            map.push_new();
            map
        });
        self.inner.items.borrow_mut().push(value);
        if let Some(observer) = observer {
            self.notify(&observer, map.unwrap_or_default());
        }
    }

    /// Remove and return the last item.
    pub fn pop(&self) -> Option<Value> {
        let last = self.len().checked_sub(1)?;
        self.remove(last)
    }

    /// Insert an item at `index` (clamped to the current length).
    pub fn insert(&self, index: usize, value: Value) {
        let index = index.min(self.len());
        let observer = self.observer();
        let map = observer.as_ref().map(|_| {
            let mut map = IndexMap::identity(self.len());
            map.insert_new(index);
            map
        });
        self.inner.items.borrow_mut().insert(index, value);
        if let Some(observer) = observer {
            self.notify(&observer, map.unwrap_or_default());
        }
    }

    /// Remove and return the item at `index`, if in bounds.
    pub fn remove(&self, index: usize) -> Option<Value> {
        if index >= self.len() {
            return None;
        }
        let removed = self.inner.items.borrow_mut().remove(index);
        if let Some(observer) = self.observer() {
            let mut map = IndexMap::identity(self.len() + 1);
            map.remove_slot(index, removed.clone());
            self.notify(&observer, map);
        }
        Some(removed)
    }

    /// Remove `delete_count` items at `start`, then insert `items` there.
    /// Returns the removed items.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<Value>) -> Vec<Value> {
        let len = self.len();
        let start = start.min(len);
        let delete_count = delete_count.min(len - start);
        let observer = self.observer();

        let removed: Vec<Value> = {
            let mut storage = self.inner.items.borrow_mut();
            let removed: Vec<Value> = storage
                .splice(start..start + delete_count, items.iter().cloned())
                .collect();
            removed
        };
        if let Some(observer) = observer {
            let mut map = IndexMap::identity(len);
            for item in &removed {
                map.remove_slot(start, item.clone());
            }
            for offset in 0..items.len() {
                map.insert_new(start + offset);
            }
            self.notify(&observer, map);
        }
        removed
    }

    /// Write the item at `index`, extending the array with `Void` padding
    /// when `index` is past the end. Equal values are a no-op.
    pub fn set(&self, index: usize, value: Value) {
        let len = self.len();
        if index < len {
            if self.inner.items.borrow()[index] == value {
                return;
            }
            self.inner.items.borrow_mut()[index] = value;
            if let Some(observer) = self.observer() {
                let mut map = IndexMap::identity(len);
                map.mark_changed(index);
                self.notify(&observer, map);
            }
            return;
        }
        let observer = self.observer();
        let map = observer.as_ref().map(|_| {
            let mut map = IndexMap::identity(len);
            for _ in len..=index {
                map.push_new();
            }
            map
        });
        {
            let mut storage = self.inner.items.borrow_mut();
            storage.resize(index, Value::Void);
            storage.push(value);
        }
        if let Some(observer) = observer {
            self.notify(&observer, map.unwrap_or_default());
        }
    }

    /// Reverse the array in place.
    pub fn reverse(&self) {
        let len = self.len();
        self.inner.items.borrow_mut().reverse();
        if let Some(observer) = self.observer()
            && len > 1
        {
            let mut map = IndexMap::identity(len);
            map.set_slots((0..len).rev().map(Slot::Prior).collect());
            self.notify(&observer, map);
        }
    }

    /// Remove every item.
    pub fn clear(&self) {
        let old: Vec<Value> = std::mem::take(&mut *self.inner.items.borrow_mut());
        if let Some(observer) = self.observer()
            && !old.is_empty()
        {
            let mut map = IndexMap::identity(old.len());
            for item in old {
                map.remove_slot(0, item);
            }
            self.notify(&observer, map);
        }
    }

    /// The observer for this array, creating it on first request.
    /// Idempotent: one observer per array identity.
    pub(crate) fn ensure_observer(&self, record: impl FnOnce() -> SubscriberRecord) -> Rc<ArrayObserver> {
        let mut slot = self.inner.observer.borrow_mut();
        if let Some(observer) = slot.as_ref() {
            return Rc::clone(observer);
        }
        let observer = Rc::new(ArrayObserver {
            array: WeakArray(Rc::downgrade(&self.inner)),
            record: record(),
            length_observer: RefCell::new(None),
            index_observers: RefCell::new(AHashMap::new()),
        });
        *slot = Some(Rc::clone(&observer));
        observer
    }
}

impl Default for ArrayHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub(crate) struct WeakArray(Weak<ArrayInner>);

impl WeakArray {
    pub(crate) fn upgrade(&self) -> Option<ArrayHandle> {
        self.0.upgrade().map(|inner| ArrayHandle { inner })
    }
}

/// Change observer for one array instance.
pub struct ArrayObserver {
    array: WeakArray,
    pub(crate) record: SubscriberRecord,
    length_observer: RefCell<Option<Rc<CollectionLengthObserver>>>,
    index_observers: RefCell<AHashMap<usize, Rc<ArrayIndexObserver>>>,
}

impl ArrayObserver {
    pub(crate) fn cached_length_observer(&self) -> Option<Rc<CollectionLengthObserver>> {
        self.length_observer.borrow().clone()
    }

    pub(crate) fn cache_length_observer(&self, observer: Rc<CollectionLengthObserver>) {
        *self.length_observer.borrow_mut() = Some(observer);
    }

    pub(crate) fn cached_index_observer(&self, index: usize) -> Option<Rc<ArrayIndexObserver>> {
        self.index_observers.borrow().get(&index).cloned()
    }

    pub(crate) fn cache_index_observer(&self, index: usize, observer: Rc<ArrayIndexObserver>) {
        self.index_observers.borrow_mut().insert(index, observer);
    }
}

impl Accessor for ArrayObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        Ok(self
            .array
            .upgrade()
            .map_or(Value::Void, Value::Array))
    }

    fn set_value(&self, _value: Value) -> Result<(), ObserverError> {
        Err(ObserverError::ReadOnly {
            key: "array".into(),
        })
    }
}

impl Observer for ArrayObserver {
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
