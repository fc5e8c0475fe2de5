#![forbid(unsafe_code)]

//! Dynamic observed objects.
//!
//! An [`ObjectHandle`] is an `Rc`-shared, string-keyed bag of [`Value`]s:
//! the "arbitrary mutable object state" the engine observes. Each object
//! exclusively owns its observer lookup table, so an observer created for
//! `(object, key)` lives exactly as long as the object does.
//!
//! Properties come in two shapes:
//!
//! - **Plain data properties** in the property map. Writes through
//!   [`ObjectHandle::set`] route through an attached observer when one
//!   exists, which is how setter interception works.
//! - **Native accessors**: get/set closures registered with
//!   [`ObjectHandle::define_accessor`], modeling state the engine cannot
//!   intercept (a host object's live getter). Reads always call the
//!   closure; change detection for these falls back to dirty checking
//!   unless the computed registry declares them.
//!
//! Reading a *computed* property goes through the runtime surface
//! (`Runtime::get_observer(..).get_value()` or `EvalCx::get`); the object
//! itself stores only raw state.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::error::ObserverError;
use crate::observer::Observer;
use crate::value::Value;

/// Property key type.
pub type Key = Rc<str>;

/// A native get/set pair for state the engine cannot intercept.
#[derive(Clone)]
pub struct NativeAccessor {
    /// Reads the current value.
    pub get: Rc<dyn Fn(&ObjectHandle) -> Value>,
    /// Writes a new value, when the state is writable.
    pub set: Option<Rc<dyn Fn(&ObjectHandle, Value)>>,
}

pub(crate) struct ObjectInner {
    kind: Rc<str>,
    properties: RefCell<AHashMap<Key, Value>>,
    accessors: RefCell<AHashMap<Key, NativeAccessor>>,
    observers: RefCell<AHashMap<Key, Rc<dyn Observer>>>,
}

/// Shared handle to a dynamic observed object.
#[derive(Clone)]
pub struct ObjectHandle {
    inner: Rc<ObjectInner>,
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("kind", &self.inner.kind)
            .field("properties", &self.inner.properties.borrow().len())
            .field("observers", &self.inner.observers.borrow().len())
            .finish()
    }
}

impl ObjectHandle {
    /// Create an object with no kind tag.
    #[must_use]
    pub fn new() -> Self {
        Self::with_kind("")
    }

    /// Create an object tagged with `kind`, the key the computed registry
    /// matches declared computed properties against.
    #[must_use]
    pub fn with_kind(kind: impl AsRef<str>) -> Self {
        Self {
            inner: Rc::new(ObjectInner {
                kind: Rc::from(kind.as_ref()),
                properties: RefCell::new(AHashMap::new()),
                accessors: RefCell::new(AHashMap::new()),
                observers: RefCell::new(AHashMap::new()),
            }),
        }
    }

    /// The object's kind tag (empty when untagged).
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub(crate) fn kind_key(&self) -> Rc<str> {
        Rc::clone(&self.inner.kind)
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// Stable identity for side tables and cycle protection.
    #[must_use]
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn downgrade(&self) -> WeakObject {
        WeakObject(Rc::downgrade(&self.inner))
    }

    /// Read a property: native accessor first, then the property map.
    /// Absent properties read as [`Value::Void`].
    #[must_use]
    pub fn get(&self, key: &str) -> Value {
        let accessor = self.inner.accessors.borrow().get(key).cloned();
        if let Some(accessor) = accessor {
            return (accessor.get)(self);
        }
        self.inner
            .properties
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or(Value::Void)
    }

    /// Write a property.
    ///
    /// When an observer is attached for `key` the write routes through it
    /// (notifying subscribers, or failing for a read-only computed).
    /// Native accessors are written through their set closure; accessors
    /// without one are read-only. Otherwise this is a plain map write.
    pub fn set(&self, key: &str, value: Value) -> Result<(), ObserverError> {
        let observer = self.inner.observers.borrow().get(key).cloned();
        if let Some(observer) = observer {
            return observer.set_value(value);
        }
        let accessor = self.inner.accessors.borrow().get(key).cloned();
        if let Some(accessor) = accessor {
            return match &accessor.set {
                Some(set) => {
                    set(self, value);
                    Ok(())
                }
                None => Err(ObserverError::ReadOnly { key: key.into() }),
            };
        }
        self.raw_set(key, value);
        Ok(())
    }

    /// Whether the object has a data property or accessor named `key`.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.inner.properties.borrow().contains_key(key)
            || self.inner.accessors.borrow().contains_key(key)
    }

    /// Data property keys, in no particular order (deep observation
    /// walks these).
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.inner.properties.borrow().keys().cloned().collect()
    }

    /// Register a native accessor for `key`.
    pub fn define_accessor(
        &self,
        key: impl AsRef<str>,
        get: impl Fn(&ObjectHandle) -> Value + 'static,
        set: Option<Rc<dyn Fn(&ObjectHandle, Value)>>,
    ) {
        self.inner.accessors.borrow_mut().insert(
            Rc::from(key.as_ref()),
            NativeAccessor {
                get: Rc::new(get),
                set,
            },
        );
    }

    pub(crate) fn has_accessor(&self, key: &str) -> bool {
        self.inner.accessors.borrow().contains_key(key)
    }

    /// Property-map read bypassing accessors and observers.
    pub(crate) fn raw_get(&self, key: &str) -> Value {
        self.inner
            .properties
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or(Value::Void)
    }

    /// Property-map write bypassing observers (setter observers call this
    /// after deciding to notify).
    pub(crate) fn raw_set(&self, key: &str, value: Value) {
        self.inner
            .properties
            .borrow_mut()
            .insert(Rc::from(key), value);
    }

    /// Write through the native accessor for `key`, bypassing the
    /// observer table (dirty-checked observers route here to avoid
    /// re-entering themselves).
    pub(crate) fn set_accessor_value(&self, key: &str, value: Value) -> Result<(), ObserverError> {
        let accessor = self.inner.accessors.borrow().get(key).cloned();
        match accessor {
            Some(accessor) => match &accessor.set {
                Some(set) => {
                    set(self, value);
                    Ok(())
                }
                None => Err(ObserverError::ReadOnly { key: key.into() }),
            },
            None => {
                self.raw_set(key, value);
                Ok(())
            }
        }
    }

    pub(crate) fn cached_observer(&self, key: &str) -> Option<Rc<dyn Observer>> {
        self.inner.observers.borrow().get(key).cloned()
    }

    pub(crate) fn cache_observer(&self, key: &str, observer: Rc<dyn Observer>) {
        self.inner
            .observers
            .borrow_mut()
            .insert(Rc::from(key), observer);
    }
}

impl Default for ObjectHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak back-reference from an observer to its owning object.
#[derive(Clone)]
pub(crate) struct WeakObject(Weak<ObjectInner>);

impl WeakObject {
    pub(crate) fn upgrade(&self) -> Option<ObjectHandle> {
        self.0.upgrade().map(|inner| ObjectHandle { inner })
    }
}
