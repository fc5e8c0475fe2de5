#![forbid(unsafe_code)]

//! Leaf property observers and accessors.
//!
//! - [`SetterObserver`]: interception for plain data properties. Cached
//!   in the owning object's observer table; `ObjectHandle::set` routes
//!   writes through it from then on.
//! - [`PrimitiveObserver`]: reads on primitive values (`"length"` of a
//!   string). Primitives never change, so subscription is inert.
//! - [`PlainPropertyAccessor`]: non-observing read/write fast path.
//! - [`CollectionLengthObserver`] / [`ArrayIndexObserver`]: value-style
//!   observers derived from a collection observer's change stream.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::collections::array::WeakArray;
use crate::collections::map::WeakMap;
use crate::collections::set::WeakSet;
use crate::error::ObserverError;
use crate::index_map::IndexMap;
use crate::object::{Key, ObjectHandle, WeakObject};
use crate::observer::{Accessor, Observer, ObserverFlags};
use crate::subscribers::{Subscriber, SubscriberRecord};
use crate::value::Value;

// ---------------------------------------------------------------------------
// SetterObserver
// ---------------------------------------------------------------------------

/// Intercepting observer for one plain data property.
pub struct SetterObserver {
    object: WeakObject,
    key: Key,
    record: SubscriberRecord,
}

impl SetterObserver {
    pub(crate) fn new(object: &ObjectHandle, key: Key, record: SubscriberRecord) -> Rc<Self> {
        Rc::new(Self {
            object: object.downgrade(),
            key,
            record,
        })
    }
}

impl Accessor for SetterObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        Ok(self
            .object
            .upgrade()
            .map_or(Value::Void, |object| object.raw_get(&self.key)))
    }

    fn set_value(&self, value: Value) -> Result<(), ObserverError> {
        let Some(object) = self.object.upgrade() else {
            return Ok(());
        };
        let old = object.raw_get(&self.key);
        if value == old {
            return Ok(());
        }
        object.raw_set(&self.key, value.clone());
        self.record.notify(&value, &old);
        Ok(())
    }
}

impl Observer for SetterObserver {
    fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        self.record.subscribe(subscriber)
    }

    fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        self.record.unsubscribe(subscriber)
    }
}

// ---------------------------------------------------------------------------
// PrimitiveObserver
// ---------------------------------------------------------------------------

/// Read-only observer over a property of a primitive value.
///
/// Primitives are immutable, so subscription is accepted but inert.
pub struct PrimitiveObserver {
    value: Value,
    key: Key,
}

impl PrimitiveObserver {
    pub(crate) fn new(value: Value, key: Key) -> Rc<Self> {
        Rc::new(Self { value, key })
    }
}

impl Accessor for PrimitiveObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        match (&self.value, &*self.key) {
            (Value::Str(s), "length") => Ok(Value::Int(s.chars().count() as i64)),
            _ => Ok(Value::Void),
        }
    }

    fn set_value(&self, _value: Value) -> Result<(), ObserverError> {
        Err(ObserverError::ReadOnly {
            key: self.key.to_string(),
        })
    }
}

impl Observer for PrimitiveObserver {
    fn subscribe(&self, _subscriber: &Rc<dyn Subscriber>) -> bool {
        false
    }

    fn unsubscribe(&self, _subscriber: &Rc<dyn Subscriber>) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// PlainPropertyAccessor
// ---------------------------------------------------------------------------

/// Non-observing accessor for object properties.
///
/// Writes still route through `ObjectHandle::set`, so an attached
/// observer is honored; the accessor itself adds no subscription
/// machinery.
pub struct PlainPropertyAccessor {
    object: WeakObject,
    key: Key,
}

impl PlainPropertyAccessor {
    pub(crate) fn new(object: &ObjectHandle, key: Key) -> Rc<Self> {
        Rc::new(Self {
            object: object.downgrade(),
            key,
        })
    }
}

impl Accessor for PlainPropertyAccessor {
    fn get_value(&self) -> Result<Value, ObserverError> {
        Ok(self
            .object
            .upgrade()
            .map_or(Value::Void, |object| object.get(&self.key)))
    }

    fn set_value(&self, value: Value) -> Result<(), ObserverError> {
        match self.object.upgrade() {
            Some(object) => object.set(&self.key, value),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// CollectionLengthObserver
// ---------------------------------------------------------------------------

pub(crate) enum CollectionTarget {
    Array(WeakArray),
    Map(WeakMap),
    Set(WeakSet),
}

impl CollectionTarget {
    fn len(&self) -> Option<usize> {
        match self {
            Self::Array(a) => a.upgrade().map(|a| a.len()),
            Self::Map(m) => m.upgrade().map(|m| m.len()),
            Self::Set(s) => s.upgrade().map(|s| s.len()),
        }
    }
}

/// Observes a collection's `length`/`size` as a value property.
///
/// Subscribes itself to the collection observer while it has subscribers
/// of its own, translating collection changes into `(new_len, old_len)`
/// value notifications.
pub struct CollectionLengthObserver {
    target: CollectionTarget,
    source: Weak<dyn Observer>,
    record: SubscriberRecord,
    last: RefCell<Value>,
    self_weak: RefCell<Weak<CollectionLengthObserver>>,
}

impl CollectionLengthObserver {
    pub(crate) fn new(
        target: CollectionTarget,
        source: &Rc<dyn Observer>,
        record: SubscriberRecord,
    ) -> Rc<Self> {
        let observer = Rc::new(Self {
            target,
            source: Rc::downgrade(source),
            record,
            last: RefCell::new(Value::Void),
            self_weak: RefCell::new(Weak::new()),
        });
        *observer.self_weak.borrow_mut() = Rc::downgrade(&observer);
        observer
    }

    fn current(&self) -> Value {
        self.target
            .len()
            .map_or(Value::Void, |len| Value::Int(len as i64))
    }

    fn start(&self) {
        *self.last.borrow_mut() = self.current();
        let me = self.self_weak.borrow().upgrade();
        if let (Some(source), Some(me)) = (self.source.upgrade(), me) {
            let me: Rc<dyn Subscriber> = me;
            source.subscribe(&me);
        }
    }

    fn stop(&self) {
        let me = self.self_weak.borrow().upgrade();
        if let (Some(source), Some(me)) = (self.source.upgrade(), me) {
            let me: Rc<dyn Subscriber> = me;
            source.unsubscribe(&me);
        }
    }
}

impl Accessor for CollectionLengthObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        Ok(self.current())
    }

    fn set_value(&self, _value: Value) -> Result<(), ObserverError> {
        Err(ObserverError::ReadOnly {
            key: "length".into(),
        })
    }
}

impl Observer for CollectionLengthObserver {
    fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let was_empty = self.record.count() == 0;
        let added = self.record.subscribe(subscriber);
        if added && was_empty {
            self.start();
        }
        added
    }

    fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let removed = self.record.unsubscribe(subscriber);
        if removed && self.record.count() == 0 {
            self.stop();
        }
        removed
    }

    fn flags(&self) -> ObserverFlags {
        ObserverFlags::COLLECTION
    }
}

impl Subscriber for CollectionLengthObserver {
    fn handle_change(&self, _new: &Value, _old: &Value) {}

    fn handle_collection_change(&self, _map: &IndexMap) {
        let new = self.current();
        let old = self.last.borrow().clone();
        if new != old {
            *self.last.borrow_mut() = new.clone();
            self.record.notify(&new, &old);
        }
    }
}

// ---------------------------------------------------------------------------
// ArrayIndexObserver
// ---------------------------------------------------------------------------

/// Observes one array slot as a value property.
pub struct ArrayIndexObserver {
    array: WeakArray,
    index: usize,
    source: Weak<dyn Observer>,
    record: SubscriberRecord,
    last: RefCell<Value>,
    started: Cell<bool>,
    self_weak: RefCell<Weak<ArrayIndexObserver>>,
}

impl ArrayIndexObserver {
    pub(crate) fn new(
        array: WeakArray,
        index: usize,
        source: &Rc<dyn Observer>,
        record: SubscriberRecord,
    ) -> Rc<Self> {
        let observer = Rc::new(Self {
            array,
            index,
            source: Rc::downgrade(source),
            record,
            last: RefCell::new(Value::Void),
            started: Cell::new(false),
            self_weak: RefCell::new(Weak::new()),
        });
        *observer.self_weak.borrow_mut() = Rc::downgrade(&observer);
        observer
    }

    fn current(&self) -> Value {
        self.array
            .upgrade()
            .and_then(|array| array.get(self.index))
            .unwrap_or(Value::Void)
    }
}

impl Accessor for ArrayIndexObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        Ok(self.current())
    }

    fn set_value(&self, value: Value) -> Result<(), ObserverError> {
        if let Some(array) = self.array.upgrade() {
            array.set(self.index, value);
        }
        Ok(())
    }
}

impl Observer for ArrayIndexObserver {
    fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let was_empty = self.record.count() == 0;
        let added = self.record.subscribe(subscriber);
        if added && was_empty && !self.started.replace(true) {
            *self.last.borrow_mut() = self.current();
            let me = self.self_weak.borrow().upgrade();
            if let (Some(source), Some(me)) = (self.source.upgrade(), me) {
                let me: Rc<dyn Subscriber> = me;
                source.subscribe(&me);
            }
        }
        added
    }

    fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let removed = self.record.unsubscribe(subscriber);
        if removed && self.record.count() == 0 && self.started.replace(false) {
            let me = self.self_weak.borrow().upgrade();
            if let (Some(source), Some(me)) = (self.source.upgrade(), me) {
                let me: Rc<dyn Subscriber> = me;
                source.unsubscribe(&me);
            }
        }
        removed
    }
}

impl Subscriber for ArrayIndexObserver {
    fn handle_change(&self, _new: &Value, _old: &Value) {}

    fn handle_collection_change(&self, _map: &IndexMap) {
        let new = self.current();
        let old = self.last.borrow().clone();
        if new != old {
            *self.last.borrow_mut() = new.clone();
            self.record.notify(&new, &old);
        }
    }
}
