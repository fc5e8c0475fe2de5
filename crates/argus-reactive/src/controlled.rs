#![forbid(unsafe_code)]

//! Explicit-dependency computed observer.
//!
//! The dependency list is fixed and declared up front — property keys or
//! textual expressions — so evaluation runs untracked (an explicit list
//! never grows from what the getter happens to read). In deep mode,
//! every declared dependency's current value is walked recursively and
//! each nested property and collection is subscribed; the walk is torn
//! down and re-run from scratch on every recompute, because the shape of
//! a deeply observed structure may differ between evaluations.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use ahash::AHashSet;
use argus_sched::{TaskError, TaskReturn};

use crate::error::ObserverError;
use crate::index_map::IndexMap;
use crate::object::{Key, ObjectHandle, WeakObject};
use crate::observer::{Accessor, Observer, ObserverFlags};
use crate::registry::{CoerceFn, ComputedSpec, DependencyDecl, EqualityFn, FlushMode, GetterFn, SetterFn};
use crate::runtime::{Runtime, WeakRuntime};
use crate::subscribers::{Subscriber, SubscriberRecord};
use crate::value::Value;

/// Computed property observer with a declared dependency list.
pub struct ControlledComputedObserver {
    rt: WeakRuntime,
    owner: WeakObject,
    key: Key,
    get: GetterFn,
    set: Option<SetterFn>,
    equality: Option<EqualityFn>,
    coerce: Option<CoerceFn>,
    flush: FlushMode,
    deep: bool,
    decls: Vec<DependencyDecl>,
    /// Observers for the declared dependencies, live while subscribed.
    deps: RefCell<Vec<Rc<dyn Observer>>>,
    /// Nested observers found by the deep walk, rebuilt each recompute.
    deep_deps: RefCell<Vec<Rc<dyn Observer>>>,
    record: SubscriberRecord,
    cache: RefCell<Option<Value>>,
    dirty: Cell<bool>,
    evaluating: Cell<bool>,
    queued: Cell<bool>,
    self_weak: RefCell<Weak<ControlledComputedObserver>>,
}

impl std::fmt::Debug for ControlledComputedObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlledComputedObserver")
            .field("key", &self.key)
            .field("declared", &self.decls.len())
            .field("deep", &self.deep)
            .field("deep_deps", &self.deep_deps.borrow().len())
            .field("dirty", &self.dirty.get())
            .finish()
    }
}

impl ControlledComputedObserver {
    pub(crate) fn new(rt: &Runtime, owner: &ObjectHandle, key: Key, spec: &ComputedSpec) -> Rc<Self> {
        let observer = Rc::new(Self {
            rt: rt.downgrade(),
            owner: owner.downgrade(),
            key,
            get: Rc::clone(&spec.get),
            set: spec.set.clone(),
            equality: spec.equality.clone(),
            coerce: spec.coerce.clone(),
            flush: spec.flush,
            deep: spec.deep,
            decls: spec.dependencies.clone().unwrap_or_default(),
            deps: RefCell::new(Vec::new()),
            deep_deps: RefCell::new(Vec::new()),
            record: SubscriberRecord::new(rt.batch_context()),
            cache: RefCell::new(None),
            dirty: Cell::new(false),
            evaluating: Cell::new(false),
            queued: Cell::new(false),
            self_weak: RefCell::new(Weak::new()),
        });
        *observer.self_weak.borrow_mut() = Rc::downgrade(&observer);
        observer
    }

    /// Number of live nested subscriptions from the deep walk.
    #[must_use]
    pub fn deep_dependency_count(&self) -> usize {
        self.deep_deps.borrow().len()
    }

    fn me(&self) -> Option<Rc<dyn Subscriber>> {
        let me = self.self_weak.borrow().upgrade()?;
        Some(me)
    }

    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match &self.equality {
            Some(equality) => equality(a, b),
            None => a == b,
        }
    }

    /// Untracked evaluation with the reentrancy post-check.
    fn evaluate(&self) -> Result<Value, ObserverError> {
        let Some(rt) = self.rt.upgrade() else {
            return Ok(Value::Void);
        };
        let Some(owner) = self.owner.upgrade() else {
            return Ok(Value::Void);
        };
        self.evaluating.set(true);
        self.dirty.set(false);
        let result = rt.untracked(|cx| (self.get)(cx, &owner));
        self.evaluating.set(false);
        match result {
            Ok(value) => {
                if self.dirty.get() {
                    Err(ObserverError::ReentrantRecompute {
                        key: self.key.to_string(),
                    })
                } else {
                    Ok(value)
                }
            }
            Err(err) => {
                self.dirty.set(true);
                Err(err)
            }
        }
    }

    fn flush_now(&self) -> Result<(), ObserverError> {
        let old = self.cache.borrow().clone();
        let new = self.evaluate()?;
        *self.cache.borrow_mut() = Some(new.clone());
        if self.deep {
            self.rebuild_deep_walk();
        }
        let old = old.unwrap_or(Value::Void);
        if !self.values_equal(&new, &old) {
            self.record.notify(&new, &old);
        }
        Ok(())
    }

    fn on_dependency_changed(&self) {
        if self.evaluating.get() {
            self.dirty.set(true);
            return;
        }
        self.dirty.set(true);
        if self.record.count() == 0 {
            return;
        }
        match self.flush {
            FlushMode::Sync => {
                if let Err(err) = self.flush_now() {
                    match err {
                        ObserverError::ReentrantRecompute { .. } => panic!("{err}"),
                        other => tracing::warn!(
                            key = %self.key,
                            error = %other,
                            "controlled computed recompute failed; staying dirty"
                        ),
                    }
                }
            }
            FlushMode::Async => self.enqueue_flush(),
        }
    }

    fn enqueue_flush(&self) {
        if self.queued.replace(true) {
            return;
        }
        let Some(rt) = self.rt.upgrade() else {
            self.queued.set(false);
            return;
        };
        let weak = self.self_weak.borrow().clone();
        rt.queue().queue_async_task(move || {
            let Some(observer) = weak.upgrade() else {
                return TaskReturn::done();
            };
            observer.queued.set(false);
            if !observer.dirty.get() || observer.record.count() == 0 {
                return TaskReturn::done();
            }
            match observer.flush_now() {
                Ok(()) => TaskReturn::done(),
                Err(err) => TaskReturn::Fail(TaskError::Failed(err.to_string())),
            }
        });
    }

    /// First subscriber: resolve and subscribe the declared list, run the
    /// deep walk, compute the initial cache.
    fn activate(&self) {
        let Some(rt) = self.rt.upgrade() else {
            return;
        };
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let Some(me) = self.me() else {
            return;
        };
        for decl in &self.decls {
            let resolved: Result<Rc<dyn Observer>, ObserverError> = match decl {
                DependencyDecl::Key(key) => rt.get_observer(&Value::Object(owner.clone()), key),
                DependencyDecl::Expression(text) => rt
                    .get_expression_observer(&owner, text)
                    .map(|observer| observer as Rc<dyn Observer>),
            };
            match resolved {
                Ok(observer) => {
                    observer.subscribe(&me);
                    self.deps.borrow_mut().push(observer);
                }
                Err(err) => tracing::warn!(
                    key = %self.key,
                    error = %err,
                    "declared dependency could not be observed"
                ),
            }
        }
        if self.deep {
            self.rebuild_deep_walk();
        }
        match self.evaluate() {
            Ok(value) => *self.cache.borrow_mut() = Some(value),
            Err(err) => tracing::warn!(
                key = %self.key,
                error = %err,
                "initial controlled computed evaluation failed; staying dirty"
            ),
        }
    }

    fn deactivate(&self) {
        if let Some(me) = self.me() {
            for observer in self.deps.borrow_mut().drain(..) {
                observer.unsubscribe(&me);
            }
            for observer in self.deep_deps.borrow_mut().drain(..) {
                observer.unsubscribe(&me);
            }
        }
        *self.cache.borrow_mut() = None;
        self.dirty.set(false);
    }

    /// Tear down nested subscriptions and re-walk the declared
    /// dependencies' latest values.
    fn rebuild_deep_walk(&self) {
        let Some(rt) = self.rt.upgrade() else {
            return;
        };
        let Some(me) = self.me() else {
            return;
        };
        for observer in self.deep_deps.borrow_mut().drain(..) {
            observer.unsubscribe(&me);
        }
        let mut visited = AHashSet::new();
        let roots: Vec<Rc<dyn Observer>> = self.deps.borrow().clone();
        for dep in roots {
            if let Ok(value) = dep.get_value() {
                self.walk(&rt, &me, &value, &mut visited);
            }
        }
    }

    fn walk(&self, rt: &Runtime, me: &Rc<dyn Subscriber>, value: &Value, visited: &mut AHashSet<usize>) {
        let Some(id) = value.identity() else {
            return;
        };
        if !visited.insert(id) {
            return;
        }
        match value {
            Value::Object(object) => {
                for key in object.keys() {
                    match rt.get_observer(&Value::Object(object.clone()), &key) {
                        Ok(observer) => {
                            observer.subscribe(me);
                            self.deep_deps.borrow_mut().push(observer);
                        }
                        Err(err) => tracing::warn!(
                            key = %key,
                            error = %err,
                            "deep walk skipped an unobservable property"
                        ),
                    }
                    self.walk(rt, me, &object.get(&key), visited);
                }
            }
            Value::Array(array) => {
                let observer: Rc<dyn Observer> = rt.get_array_observer(array);
                observer.subscribe(me);
                self.deep_deps.borrow_mut().push(observer);
                for item in array.snapshot() {
                    self.walk(rt, me, &item, visited);
                }
            }
            Value::Map(map) => {
                let observer: Rc<dyn Observer> = rt.get_map_observer(map);
                observer.subscribe(me);
                self.deep_deps.borrow_mut().push(observer);
                for (key, value) in map.entries() {
                    self.walk(rt, me, &key, visited);
                    self.walk(rt, me, &value, visited);
                }
            }
            Value::Set(set) => {
                let observer: Rc<dyn Observer> = rt.get_set_observer(set);
                observer.subscribe(me);
                self.deep_deps.borrow_mut().push(observer);
                for item in set.snapshot() {
                    self.walk(rt, me, &item, visited);
                }
            }
            _ => {}
        }
    }
}

impl Accessor for ControlledComputedObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        if self.record.count() > 0 {
            if self.dirty.get() || self.cache.borrow().is_none() {
                self.flush_now()?;
            }
            let cached = self.cache.borrow().clone();
            return Ok(cached.unwrap_or(Value::Void));
        }
        let Some(rt) = self.rt.upgrade() else {
            return Ok(Value::Void);
        };
        let Some(owner) = self.owner.upgrade() else {
            return Ok(Value::Void);
        };
        (self.get)(&rt.eval_cx(), &owner)
    }

    fn set_value(&self, value: Value) -> Result<(), ObserverError> {
        let Some(set) = self.set.clone() else {
            return Err(ObserverError::ReadOnly {
                key: self.key.to_string(),
            });
        };
        let value = match &self.coerce {
            Some(coerce) => coerce(value),
            None => value,
        };
        let cached = self.cache.borrow().clone();
        if let Some(cached) = cached
            && self.values_equal(&value, &cached)
        {
            return Ok(());
        }
        let Some(rt) = self.rt.upgrade() else {
            return Ok(());
        };
        let Some(owner) = self.owner.upgrade() else {
            return Ok(());
        };
        rt.untracked(|cx| set(cx, &owner, value))?;
        if self.record.count() > 0 {
            self.dirty.set(true);
            match self.flush {
                FlushMode::Sync => self.flush_now()?,
                FlushMode::Async => self.enqueue_flush(),
            }
        }
        Ok(())
    }
}

impl Observer for ControlledComputedObserver {
    fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let was_empty = self.record.count() == 0;
        let added = self.record.subscribe(subscriber);
        if added && was_empty {
            self.activate();
        }
        added
    }

    fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        let removed = self.record.unsubscribe(subscriber);
        if removed && self.record.count() == 0 {
            self.deactivate();
        }
        removed
    }

    fn flags(&self) -> ObserverFlags {
        ObserverFlags::NO_NATIVE_NOTIFY
    }
}

impl Subscriber for ControlledComputedObserver {
    fn handle_change(&self, _new: &Value, _old: &Value) {
        self.on_dependency_changed();
    }

    fn handle_collection_change(&self, _map: &IndexMap) {
        self.on_dependency_changed();
    }

    fn handle_dirty(&self) {
        self.dirty.set(true);
        self.record.notify_dirty();
    }

    fn wants_dirty(&self) -> bool {
        true
    }
}
