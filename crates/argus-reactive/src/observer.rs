#![forbid(unsafe_code)]

//! The polymorphic observer surface.
//!
//! Every piece of observable state is reached through an [`Observer`]:
//! get/set plus subscribe/unsubscribe. [`Accessor`] is the
//! non-subscribing subset used where a consumer only needs to read or
//! write. [`ObserverFlags`] is a classification tag consumed by host
//! layers (a DOM-aware binding layer, a renderer); the core never
//! branches on it.

use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::error::ObserverError;
use crate::subscribers::Subscriber;
use crate::value::Value;

bitflags! {
    /// Classification tags attached to observers for consumers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObserverFlags: u8 {
        /// Writes through this observer affect layout; hosts may want to
        /// defer them to a layout-safe phase.
        const LAYOUT_SENSITIVE = 1 << 0;
        /// The underlying state emits no native change notification.
        const NO_NATIVE_NOTIFY = 1 << 1;
        /// Changes are detected by polling, not interception.
        const POLLED = 1 << 2;
        /// The observer tracks a collection, not a single property.
        const COLLECTION = 1 << 3;
    }
}

/// Read/write access to one piece of observable state.
pub trait Accessor {
    /// Current value. Computed-style accessors may fail (their getter
    /// propagates errors); plain accessors are infallible in practice.
    fn get_value(&self) -> Result<Value, ObserverError>;

    /// Write a new value. Fails for read-only state.
    fn set_value(&self, value: Value) -> Result<(), ObserverError>;
}

/// An [`Accessor`] with change subscription.
pub trait Observer: Accessor {
    /// Idempotent add. Returns whether the subscriber set changed.
    fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool;

    /// Idempotent remove. Returns whether the subscriber set changed.
    fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool;

    /// Classification tags for consumers; not used by the core.
    fn flags(&self) -> ObserverFlags {
        ObserverFlags::empty()
    }
}

impl fmt::Debug for dyn Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("flags", &self.flags())
            .finish()
    }
}
