#![forbid(unsafe_code)]

//! Fine-grained reactive observation engine.
//!
//! Argus tracks which specific properties and collections a computation
//! depends on, caches computed results, and notifies dependents exactly
//! when — and only when — a dependency actually changes. The moving
//! parts:
//!
//! - [`Runtime`]: the explicit context object and observer locator. One
//!   per application root; owns the shared task queue, the batch
//!   context, the dirty checker, the active-tracker stack, and the
//!   computed registry.
//! - [`ObjectHandle`] / [`ArrayHandle`] / [`MapHandle`] / [`SetHandle`]:
//!   the observable state model.
//! - Observers, resolved through `Runtime::get_observer`: setter,
//!   primitive, computed (implicit dependencies), controlled computed
//!   (declared dependencies, optionally deep), expression, collection,
//!   length/index, and dirty-checked variants.
//! - [`SubscriberRecord`]: the pub/sub primitive every observer embeds,
//!   with two-phase (dirty + value) notification and batching.
//!
//! The engine is single-threaded and cooperative: `Rc`/`RefCell` state,
//! no locks, and "async" always means "deferred to a later drain of the
//! shared [`argus_sched::TaskQueue`]".
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use argus_reactive::{
//!     Accessor, ComputedSpec, FlushMode, ObjectHandle, Observer, Runtime, Subscriber, Value,
//! };
//!
//! struct Log(std::cell::RefCell<Vec<(Value, Value)>>);
//! impl Subscriber for Log {
//!     fn handle_change(&self, new: &Value, old: &Value) {
//!         self.0.borrow_mut().push((new.clone(), old.clone()));
//!     }
//! }
//!
//! let rt = Runtime::new();
//! let obj = ObjectHandle::with_kind("point");
//! obj.set("x", Value::Int(1)).unwrap();
//! obj.set("y", Value::Int(2)).unwrap();
//!
//! rt.computed_registry().register(
//!     "point",
//!     "sum",
//!     ComputedSpec::new(|cx, obj| {
//!         let x = cx.get_from(obj, "x")?.as_int().unwrap_or(0);
//!         let y = cx.get_from(obj, "y")?.as_int().unwrap_or(0);
//!         Ok(Value::Int(x + y))
//!     })
//!     .flush(FlushMode::Sync),
//! );
//!
//! let sum = rt.get_observer(&Value::Object(obj.clone()), "sum").unwrap();
//! assert_eq!(sum.get_value().unwrap(), Value::Int(3));
//!
//! let log: Rc<Log> = Rc::new(Log(Default::default()));
//! let sub: Rc<dyn Subscriber> = log.clone();
//! sum.subscribe(&sub);
//! obj.set("x", Value::Int(5)).unwrap();
//! assert_eq!(*log.0.borrow(), vec![(Value::Int(7), Value::Int(3))]);
//! ```

pub mod collections;
pub mod computed;
pub mod controlled;
pub mod dirty;
pub mod error;
pub mod expression;
pub mod index_map;
pub mod object;
pub mod observer;
pub mod property;
pub mod registry;
pub mod runtime;
pub mod subscribers;
pub mod tracker;
pub mod value;

pub use collections::{ArrayHandle, ArrayObserver, MapHandle, MapObserver, SetHandle, SetObserver};
pub use computed::ComputedObserver;
pub use controlled::ControlledComputedObserver;
pub use dirty::{DirtyCheckSettings, DirtyChecker, DirtyCheckedObserver};
pub use error::ObserverError;
pub use expression::{
    Expression, ExpressionMode, ExpressionObserver, ExpressionParser, PathExpression, PathParser,
};
pub use index_map::{IndexMap, Slot};
pub use object::{Key, NativeAccessor, ObjectHandle};
pub use observer::{Accessor, Observer, ObserverFlags};
pub use property::{
    ArrayIndexObserver, CollectionLengthObserver, PlainPropertyAccessor, PrimitiveObserver,
    SetterObserver,
};
pub use registry::{
    CoerceFn, ComputedRegistry, ComputedSpec, DependencyDecl, EqualityFn, FlushMode, GetterFn,
    SetterFn,
};
pub use runtime::{EvalCx, HostObserverDelegate, Runtime, RuntimeConfig};
pub use subscribers::{BatchContext, Subscriber, SubscriberRecord};
pub use tracker::DependencyTracker;
pub use value::Value;
