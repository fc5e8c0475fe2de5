#![forbid(unsafe_code)]

//! The runtime context and observer locator.
//!
//! [`Runtime`] is the explicit context object instantiated once per
//! application root: it owns the shared task queue, the batch context,
//! the dirty checker, the active-tracker stack, the computed registry,
//! and the host delegates. Everything that used to be a hidden global in
//! engines of this shape is a field here.
//!
//! # Resolution algorithm
//!
//! `get_observer(target, key)` picks the observer variant:
//!
//! 1. Host delegates claiming `(target, key)` win outright.
//! 2. Objects: the object's own observer table is consulted first
//!    (identical observer for repeated lookups), then the computed
//!    registry (`(kind, key)` → implicit or controlled computed), then a
//!    native accessor (dirty-check fallback, subject to policy), then a
//!    plain-property setter observer.
//! 3. Collections: `"length"`/`"size"` resolve to a length observer,
//!    numeric keys on arrays to an index observer.
//! 4. Anything else is a primitive observer (inert).
//!
//! # Evaluation context
//!
//! Computed getters, setters, and expressions receive an [`EvalCx`].
//! Reads made through it resolve sub-observers via the locator and
//! report them to whatever tracker is on top of the stack — that is the
//! entire implicit-dependency mechanism.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use argus_sched::{Clock, Task, TaskQueue, TaskResult, TaskReturn};
use web_time::Duration;

use crate::collections::{ArrayHandle, ArrayObserver, MapHandle, MapObserver, SetHandle, SetObserver};
use crate::computed::ComputedObserver;
use crate::controlled::ControlledComputedObserver;
use crate::dirty::{DirtyCheckSettings, DirtyChecker};
use crate::error::ObserverError;
use crate::expression::{ExpressionMode, ExpressionObserver, ExpressionParser};
use crate::object::{Key, ObjectHandle};
use crate::observer::{Accessor, Observer};
use crate::property::{
    ArrayIndexObserver, CollectionLengthObserver, CollectionTarget, PlainPropertyAccessor,
    PrimitiveObserver, SetterObserver,
};
use crate::registry::{ComputedRegistry, ComputedSpec, FlushMode};
use crate::subscribers::{BatchContext, SubscriberRecord};
use crate::tracker::{DependencyTracker, TrackerStack};
use crate::value::Value;

/// Lets a host environment special-case certain `(target, key)` pairs
/// before the generic resolution algorithm runs.
pub trait HostObserverDelegate {
    /// Whether this delegate wants to resolve `(target, key)`.
    fn handles(&self, target: &Value, key: &str) -> bool;

    /// Resolve an observer for a claimed pair.
    fn get_observer(
        &self,
        rt: &Runtime,
        target: &Value,
        key: &str,
    ) -> Result<Rc<dyn Observer>, ObserverError>;

    /// Resolve a write-oriented accessor for a claimed pair.
    fn get_accessor(
        &self,
        rt: &Runtime,
        target: &Value,
        key: &str,
    ) -> Result<Rc<dyn Accessor>, ObserverError>;
}

/// Construction-time configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Clock driving the task queue (manual in tests).
    pub clock: Clock,
    /// Dirty-check policy.
    pub dirty_check: DirtyCheckSettings,
}

struct RuntimeInner {
    queue: TaskQueue,
    batch: BatchContext,
    dirty: DirtyChecker,
    stack: TrackerStack,
    registry: ComputedRegistry,
    delegates: RefCell<Vec<Rc<dyn HostObserverDelegate>>>,
    parser: RefCell<Option<Rc<dyn ExpressionParser>>>,
}

/// The observation runtime: locator root plus scheduler access.
///
/// Cheaply cloneable; clones share the same runtime state.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("queue", &self.inner.queue)
            .field("dirty", &self.inner.dirty)
            .finish()
    }
}

impl Runtime {
    /// Create a runtime with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime from an explicit configuration.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        let queue = TaskQueue::with_clock(config.clock);
        Self {
            inner: Rc::new(RuntimeInner {
                dirty: DirtyChecker::new(queue.clone(), config.dirty_check),
                queue,
                batch: BatchContext::new(),
                stack: TrackerStack::new(),
                registry: ComputedRegistry::new(),
                delegates: RefCell::new(Vec::new()),
                parser: RefCell::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Rc::downgrade(&self.inner))
    }

    /// The shared task queue.
    #[must_use]
    pub fn queue(&self) -> TaskQueue {
        self.inner.queue.clone()
    }

    /// The dirty checker (policy configuration lives here).
    #[must_use]
    pub fn dirty_checker(&self) -> &DirtyChecker {
        &self.inner.dirty
    }

    /// The computed registry.
    #[must_use]
    pub fn computed_registry(&self) -> &ComputedRegistry {
        &self.inner.registry
    }

    /// Install the expression parser.
    pub fn set_expression_parser(&self, parser: Rc<dyn ExpressionParser>) {
        *self.inner.parser.borrow_mut() = Some(parser);
    }

    /// Register a host observer delegate; consulted in registration
    /// order before generic resolution.
    pub fn add_delegate(&self, delegate: Rc<dyn HostObserverDelegate>) {
        self.inner.delegates.borrow_mut().push(delegate);
    }

    pub(crate) fn batch_context(&self) -> BatchContext {
        self.inner.batch.clone()
    }

    fn subscriber_record(&self) -> SubscriberRecord {
        SubscriberRecord::new(self.batch_context())
    }

    // ── Scheduler surface ───────────────────────────────────────────────

    /// Enqueue a callback on the shared queue.
    pub fn queue_task(&self, callback: impl FnMut() + 'static) -> Task {
        self.inner.queue.queue_task(callback)
    }

    /// Enqueue a callback that may complete asynchronously.
    pub fn queue_async_task(&self, callback: impl FnMut() -> TaskReturn + 'static) -> Task {
        self.inner.queue.queue_async_task(callback)
    }

    /// Register a recurring task on the shared queue.
    pub fn queue_recurring_task(
        &self,
        callback: impl FnMut() + 'static,
        interval: Duration,
    ) -> argus_sched::RecurringTask {
        self.inner.queue.queue_recurring_task(callback, interval)
    }

    /// A result that settles after the next full flush.
    #[must_use]
    pub fn next_tick(&self) -> TaskResult {
        self.inner.queue.next_tick()
    }

    /// Flush until the queue is empty; `true` when async work has also
    /// settled.
    pub fn yield_tasks(&self) -> bool {
        self.inner.queue.yield_tasks()
    }

    /// Drain the shared queue once.
    pub fn flush(&self) {
        self.inner.queue.flush();
    }

    // ── Batching ────────────────────────────────────────────────────────

    /// Run `f` with notification batching: value notifications coalesce
    /// per observer and fire when the outermost batch closes.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        self.inner.batch.begin();
        let result = f();
        self.inner.batch.end();
        result
    }

    // ── Dependency tracking ─────────────────────────────────────────────

    /// Evaluate `f` under `tracker`: bump its version, collect reads,
    /// prune stale dependencies afterwards.
    pub(crate) fn tracked<T>(
        &self,
        tracker: &DependencyTracker,
        f: impl FnOnce(&EvalCx) -> T,
    ) -> T {
        tracker.new_version();
        self.inner.stack.push(Some(tracker.clone()));
        let result = f(&self.eval_cx());
        self.inner.stack.pop();
        tracker.prune_stale();
        result
    }

    /// Evaluate `f` with tracking masked: reads report to no tracker,
    /// including any outer one.
    pub fn untracked<T>(&self, f: impl FnOnce(&EvalCx) -> T) -> T {
        self.inner.stack.push(None);
        let result = f(&self.eval_cx());
        self.inner.stack.pop();
        result
    }

    pub(crate) fn eval_cx(&self) -> EvalCx {
        EvalCx { rt: self.clone() }
    }

    pub(crate) fn track_dependency(&self, observer: &Rc<dyn Observer>) {
        if let Some(tracker) = self.inner.stack.current() {
            tracker.observe(observer);
        }
    }

    // ── Locator surface ─────────────────────────────────────────────────

    /// Resolve (or create) the observer for `(target, key)`.
    ///
    /// Repeated lookups for the same object property return the
    /// identical observer.
    pub fn get_observer(&self, target: &Value, key: &str) -> Result<Rc<dyn Observer>, ObserverError> {
        for delegate in self.inner.delegates.borrow().iter() {
            if delegate.handles(target, key) {
                return delegate.get_observer(self, target, key);
            }
        }
        match target {
            Value::Object(object) => self.object_observer(object, key),
            Value::Array(array) => {
                if key == "length" {
                    Ok(self.array_length_observer(array))
                } else if let Ok(index) = key.parse::<usize>() {
                    Ok(self.array_index_observer(array, index))
                } else {
                    Ok(PrimitiveObserver::new(target.clone(), Rc::from(key)))
                }
            }
            Value::Map(map) => {
                if key == "size" {
                    Ok(self.map_length_observer(map))
                } else {
                    Ok(PrimitiveObserver::new(target.clone(), Rc::from(key)))
                }
            }
            Value::Set(set) => {
                if key == "size" {
                    Ok(self.set_length_observer(set))
                } else {
                    Ok(PrimitiveObserver::new(target.clone(), Rc::from(key)))
                }
            }
            _ => Ok(PrimitiveObserver::new(target.clone(), Rc::from(key))),
        }
    }

    fn object_observer(
        &self,
        object: &ObjectHandle,
        key: &str,
    ) -> Result<Rc<dyn Observer>, ObserverError> {
        if let Some(cached) = object.cached_observer(key) {
            return Ok(cached);
        }
        let key_rc: Key = Rc::from(key);
        let observer: Rc<dyn Observer> =
            if let Some(spec) = self.inner.registry.lookup(object.kind(), key) {
                self.build_computed(object, key_rc, &spec)
            } else if object.has_accessor(key) {
                self.inner
                    .dirty
                    .create_observer(object, key_rc, self.subscriber_record())?
            } else {
                SetterObserver::new(object, key_rc, self.subscriber_record())
            };
        object.cache_observer(key, Rc::clone(&observer));
        Ok(observer)
    }

    fn build_computed(&self, object: &ObjectHandle, key: Key, spec: &ComputedSpec) -> Rc<dyn Observer> {
        if spec.dependencies.is_some() {
            ControlledComputedObserver::new(self, object, key, spec)
        } else {
            ComputedObserver::new(self, object, key, spec)
        }
    }

    /// Resolve a computed observer for `(object, key)` from an explicit
    /// spec, bypassing the registry. Returns the cached observer if the
    /// pair was already resolved.
    pub fn get_computed_observer(
        &self,
        object: &ObjectHandle,
        key: &str,
        spec: &ComputedSpec,
    ) -> Rc<dyn Observer> {
        if let Some(cached) = object.cached_observer(key) {
            return cached;
        }
        let observer = self.build_computed(object, Rc::from(key), spec);
        object.cache_observer(key, Rc::clone(&observer));
        observer
    }

    /// An ad-hoc computed observer over `getter`, not cached anywhere:
    /// the caller owns it.
    pub fn get_getter_observer(
        &self,
        object: &ObjectHandle,
        getter: impl Fn(&EvalCx, &ObjectHandle) -> Result<Value, ObserverError> + 'static,
    ) -> Rc<ComputedObserver> {
        ComputedObserver::new(self, object, Rc::from("<getter>"), &ComputedSpec::new(getter))
    }

    /// Resolve a write-oriented accessor for `(target, key)`.
    ///
    /// Plain object properties get a non-observing accessor; everything
    /// with observation machinery reuses its observer.
    pub fn get_accessor(&self, target: &Value, key: &str) -> Result<Rc<dyn Accessor>, ObserverError> {
        for delegate in self.inner.delegates.borrow().iter() {
            if delegate.handles(target, key) {
                return delegate.get_accessor(self, target, key);
            }
        }
        if let Value::Object(object) = target {
            let plain = object.cached_observer(key).is_none()
                && self.inner.registry.lookup(object.kind(), key).is_none()
                && !object.has_accessor(key);
            if plain {
                return Ok(PlainPropertyAccessor::new(object, Rc::from(key)));
            }
        }
        let observer = self.get_observer(target, key)?;
        Ok(observer)
    }

    /// Observe `text` evaluated against `scope`, with synchronous flush.
    pub fn get_expression_observer(
        &self,
        scope: &ObjectHandle,
        text: &str,
    ) -> Result<Rc<ExpressionObserver>, ObserverError> {
        self.get_expression_observer_with(scope, text, FlushMode::Sync)
    }

    /// Observe `text` evaluated against `scope` with an explicit flush
    /// mode.
    pub fn get_expression_observer_with(
        &self,
        scope: &ObjectHandle,
        text: &str,
        flush: FlushMode,
    ) -> Result<Rc<ExpressionObserver>, ObserverError> {
        let parser = self
            .inner
            .parser
            .borrow()
            .clone()
            .ok_or(ObserverError::NoParser)?;
        let expression = parser.parse(text, ExpressionMode::Access)?;
        Ok(ExpressionObserver::new(self, scope, expression, flush))
    }

    /// The observer for an array instance (idempotent per identity).
    pub fn get_array_observer(&self, array: &ArrayHandle) -> Rc<ArrayObserver> {
        array.ensure_observer(|| self.subscriber_record())
    }

    /// The observer for a map instance (idempotent per identity).
    pub fn get_map_observer(&self, map: &MapHandle) -> Rc<MapObserver> {
        map.ensure_observer(|| self.subscriber_record())
    }

    /// The observer for a set instance (idempotent per identity).
    pub fn get_set_observer(&self, set: &SetHandle) -> Rc<SetObserver> {
        set.ensure_observer(|| self.subscriber_record())
    }

    fn array_length_observer(&self, array: &ArrayHandle) -> Rc<dyn Observer> {
        let collection = self.get_array_observer(array);
        if let Some(cached) = collection.cached_length_observer() {
            return cached;
        }
        let source: Rc<dyn Observer> = collection.clone();
        let observer = CollectionLengthObserver::new(
            CollectionTarget::Array(array.downgrade()),
            &source,
            self.subscriber_record(),
        );
        collection.cache_length_observer(Rc::clone(&observer));
        observer
    }

    fn map_length_observer(&self, map: &MapHandle) -> Rc<dyn Observer> {
        let collection = self.get_map_observer(map);
        if let Some(cached) = collection.cached_length_observer() {
            return cached;
        }
        let source: Rc<dyn Observer> = collection.clone();
        let observer = CollectionLengthObserver::new(
            CollectionTarget::Map(map.downgrade()),
            &source,
            self.subscriber_record(),
        );
        collection.cache_length_observer(Rc::clone(&observer));
        observer
    }

    fn set_length_observer(&self, set: &SetHandle) -> Rc<dyn Observer> {
        let collection = self.get_set_observer(set);
        if let Some(cached) = collection.cached_length_observer() {
            return cached;
        }
        let source: Rc<dyn Observer> = collection.clone();
        let observer = CollectionLengthObserver::new(
            CollectionTarget::Set(set.downgrade()),
            &source,
            self.subscriber_record(),
        );
        collection.cache_length_observer(Rc::clone(&observer));
        observer
    }

    fn array_index_observer(&self, array: &ArrayHandle, index: usize) -> Rc<dyn Observer> {
        let collection = self.get_array_observer(array);
        if let Some(cached) = collection.cached_index_observer(index) {
            return cached;
        }
        let source: Rc<dyn Observer> = collection.clone();
        let observer = ArrayIndexObserver::new(
            array.downgrade(),
            index,
            &source,
            self.subscriber_record(),
        );
        collection.cache_index_observer(index, Rc::clone(&observer));
        observer
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak handle from long-lived observers back to the runtime.
#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<RuntimeInner>);

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|inner| Runtime { inner })
    }
}

/// Evaluation context handed to computed getters, setters, and
/// expressions.
///
/// Reads made through it are what dependency tracking sees.
pub struct EvalCx {
    rt: Runtime,
}

impl EvalCx {
    /// Tracked read of `key` on `target`.
    pub fn get(&self, target: &Value, key: &str) -> Result<Value, ObserverError> {
        let observer = self.rt.get_observer(target, key)?;
        self.rt.track_dependency(&observer);
        observer.get_value()
    }

    /// Tracked read of `key` on an object.
    pub fn get_from(&self, object: &ObjectHandle, key: &str) -> Result<Value, ObserverError> {
        self.get(&Value::Object(object.clone()), key)
    }

    /// Track a collection as a dependency (the getter iterates it).
    pub fn track_collection(&self, value: &Value) {
        let observer: Option<Rc<dyn Observer>> = match value {
            Value::Array(array) => Some(self.rt.get_array_observer(array)),
            Value::Map(map) => Some(self.rt.get_map_observer(map)),
            Value::Set(set) => Some(self.rt.get_set_observer(set)),
            _ => None,
        };
        if let Some(observer) = observer {
            self.rt.track_dependency(&observer);
        }
    }

    /// The owning runtime.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }
}
