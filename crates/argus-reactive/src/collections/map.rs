#![forbid(unsafe_code)]

//! Observed insertion-ordered maps.
//!
//! Entries keep insertion order, which is what the index map's slot
//! positions describe. Keys compare by the value model's strict equality
//! (identity for handles), so lookup is a linear scan — maps observed by
//! UI bindings are small.
//!
//! # Invariants
//!
//! 1. `set` on an existing key with an unchanged value is a no-op.
//! 2. `set` on an existing key with a changed value marks that slot
//!    changed-in-place, never a move.
//! 3. `set` of a brand-new key appends a `New` slot.
//! 4. `delete`/`clear` record every removed slot and its value.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::ObserverError;
use crate::index_map::IndexMap;
use crate::observer::{Accessor, Observer, ObserverFlags};
use crate::property::CollectionLengthObserver;
use crate::subscribers::{Subscriber, SubscriberRecord};
use crate::value::Value;

struct MapInner {
    entries: RefCell<Vec<(Value, Value)>>,
    observer: RefCell<Option<Rc<MapObserver>>>,
}

/// Shared handle to an observed insertion-ordered map.
#[derive(Clone)]
pub struct MapHandle {
    inner: Rc<MapInner>,
}

impl std::fmt::Debug for MapHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapHandle")
            .field("len", &self.len())
            .field("observed", &self.inner.observer.borrow().is_some())
            .finish()
    }
}

impl MapHandle {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(MapInner {
                entries: RefCell::new(Vec::new()),
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

    pub(crate) fn downgrade(&self) -> WeakMap {
        WeakMap(Rc::downgrade(&self.inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.borrow().is_empty()
    }

    fn position(&self, key: &Value) -> Option<usize> {
        self.inner
            .entries
            .borrow()
            .iter()
            .position(|(k, _)| k == key)
    }

    /// The value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.inner
            .entries
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn has(&self, key: &Value) -> bool {
        self.position(key).is_some()
    }

    /// Keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> Vec<Value> {
        self.inner
            .entries
            .borrow()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Values in insertion order.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.inner
            .entries
            .borrow()
            .iter()
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.inner.entries.borrow().clone()
    }

    fn observer(&self) -> Option<Rc<MapObserver>> {
        self.inner.observer.borrow().clone()
    }

    /// Insert or update `key`.
    pub fn set(&self, key: Value, value: Value) {
        match self.position(&key) {
            Some(index) => {
                if self.inner.entries.borrow()[index].1 == value {
                    return;
                }
                self.inner.entries.borrow_mut()[index].1 = value;
                if let Some(observer) = self.observer() {
                    let mut map = IndexMap::identity(self.len());
                    map.mark_changed(index);
                    observer.record.notify_collection(&map);
                }
            }
            None => {
                let old_len = self.len();
                self.inner.entries.borrow_mut().push((key, value));
                if let Some(observer) = self.observer() {
                    let mut map = IndexMap::identity(old_len);
                    map.push_new();
                    observer.record.notify_collection(&map);
                }
            }
        }
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &Value) -> bool {
        let Some(index) = self.position(key) else {
            return false;
        };
        let old_len = self.len();
        let (_, removed) = self.inner.entries.borrow_mut().remove(index);
        if let Some(observer) = self.observer() {
            let mut map = IndexMap::identity(old_len);
            map.remove_slot(index, removed);
            observer.record.notify_collection(&map);
        }
        true
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let old: Vec<(Value, Value)> = std::mem::take(&mut *self.inner.entries.borrow_mut());
        if let Some(observer) = self.observer()
            && !old.is_empty()
        {
            let mut map = IndexMap::identity(old.len());
            for (_, value) in old {
                map.remove_slot(0, value);
            }
            observer.record.notify_collection(&map);
        }
    }

    /// The observer for this map, creating it on first request.
    pub(crate) fn ensure_observer(&self, record: impl FnOnce() -> SubscriberRecord) -> Rc<MapObserver> {
        let mut slot = self.inner.observer.borrow_mut();
        if let Some(observer) = slot.as_ref() {
            return Rc::clone(observer);
        }
        let observer = Rc::new(MapObserver {
            map: WeakMap(Rc::downgrade(&self.inner)),
            record: record(),
            length_observer: RefCell::new(None),
        });
        *slot = Some(Rc::clone(&observer));
        observer
    }
}

impl Default for MapHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub(crate) struct WeakMap(Weak<MapInner>);

impl WeakMap {
    pub(crate) fn upgrade(&self) -> Option<MapHandle> {
        self.0.upgrade().map(|inner| MapHandle { inner })
    }
}

/// Change observer for one map instance.
pub struct MapObserver {
    map: WeakMap,
    pub(crate) record: SubscriberRecord,
    length_observer: RefCell<Option<Rc<CollectionLengthObserver>>>,
}

impl MapObserver {
    pub(crate) fn cached_length_observer(&self) -> Option<Rc<CollectionLengthObserver>> {
        self.length_observer.borrow().clone()
    }

    pub(crate) fn cache_length_observer(&self, observer: Rc<CollectionLengthObserver>) {
        *self.length_observer.borrow_mut() = Some(observer);
    }
}

impl Accessor for MapObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        Ok(self.map.upgrade().map_or(Value::Void, Value::Map))
    }

    fn set_value(&self, _value: Value) -> Result<(), ObserverError> {
        Err(ObserverError::ReadOnly { key: "map".into() })
    }
}

impl Observer for MapObserver {
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
