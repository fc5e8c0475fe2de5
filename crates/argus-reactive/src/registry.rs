#![forbid(unsafe_code)]

//! Declared computed-property metadata.
//!
//! The [`ComputedRegistry`] is the explicit replacement for
//! getter-attached annotations: computed properties are registered once
//! per `(object kind, property key)` pair, and the locator consults the
//! registry when resolving an observer for that pair. A spec with a
//! declared dependency list produces a controlled computed observer;
//! without one, an implicit (auto-tracking) computed observer.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::error::ObserverError;
use crate::object::ObjectHandle;
use crate::runtime::EvalCx;
use crate::value::Value;

/// Getter: evaluates against the owning object, reading dependencies
/// through the evaluation context so they are tracked.
pub type GetterFn = Rc<dyn Fn(&EvalCx, &ObjectHandle) -> Result<Value, ObserverError>>;

/// Setter paired with a computed getter.
pub type SetterFn = Rc<dyn Fn(&EvalCx, &ObjectHandle, Value) -> Result<(), ObserverError>>;

/// Equality used to suppress redundant notifications.
pub type EqualityFn = Rc<dyn Fn(&Value, &Value) -> bool>;

/// Coercion applied to incoming values before the setter runs.
pub type CoerceFn = Rc<dyn Fn(Value) -> Value>;

/// When a computed observer propagates a dependency change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Recompute and notify synchronously, inside the triggering call.
    Sync,
    /// Recompute once per queue flush; repeated triggers coalesce.
    #[default]
    Async,
}

/// One declared dependency of a controlled computed property.
#[derive(Debug, Clone)]
pub enum DependencyDecl {
    /// A property key on the owning object.
    Key(Rc<str>),
    /// A textual expression resolved through the installed parser.
    Expression(Rc<str>),
}

impl DependencyDecl {
    /// Declare a property-key dependency.
    #[must_use]
    pub fn key(key: impl AsRef<str>) -> Self {
        Self::Key(Rc::from(key.as_ref()))
    }

    /// Declare an expression dependency.
    #[must_use]
    pub fn expression(text: impl AsRef<str>) -> Self {
        Self::Expression(Rc::from(text.as_ref()))
    }
}

/// Declared metadata for one computed property.
#[derive(Clone)]
pub struct ComputedSpec {
    pub(crate) get: GetterFn,
    pub(crate) set: Option<SetterFn>,
    pub(crate) dependencies: Option<Vec<DependencyDecl>>,
    pub(crate) flush: FlushMode,
    pub(crate) deep: bool,
    pub(crate) equality: Option<EqualityFn>,
    pub(crate) coerce: Option<CoerceFn>,
}

impl std::fmt::Debug for ComputedSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedSpec")
            .field("has_setter", &self.set.is_some())
            .field(
                "dependencies",
                &self.dependencies.as_ref().map(Vec::len),
            )
            .field("flush", &self.flush)
            .field("deep", &self.deep)
            .finish()
    }
}

impl ComputedSpec {
    /// A computed property with implicit (auto-tracked) dependencies.
    #[must_use]
    pub fn new(
        get: impl Fn(&EvalCx, &ObjectHandle) -> Result<Value, ObserverError> + 'static,
    ) -> Self {
        Self {
            get: Rc::new(get),
            set: None,
            dependencies: None,
            flush: FlushMode::default(),
            deep: false,
            equality: None,
            coerce: None,
        }
    }

    /// Pair the getter with a setter.
    #[must_use]
    pub fn with_setter(
        mut self,
        set: impl Fn(&EvalCx, &ObjectHandle, Value) -> Result<(), ObserverError> + 'static,
    ) -> Self {
        self.set = Some(Rc::new(set));
        self
    }

    /// Fix the dependency list, making the property a controlled
    /// computed.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = DependencyDecl>) -> Self {
        self.dependencies = Some(dependencies.into_iter().collect());
        self
    }

    /// Set the flush mode.
    #[must_use]
    pub fn flush(mut self, flush: FlushMode) -> Self {
        self.flush = flush;
        self
    }

    /// Observe declared dependencies' values recursively.
    ///
    /// Only meaningful with a declared dependency list.
    #[must_use]
    pub fn deep(mut self, deep: bool) -> Self {
        self.deep = deep;
        self
    }

    /// Replace strict equality for notification suppression.
    #[must_use]
    pub fn with_equality(mut self, equality: impl Fn(&Value, &Value) -> bool + 'static) -> Self {
        self.equality = Some(Rc::new(equality));
        self
    }

    /// Coerce incoming values before the setter runs.
    #[must_use]
    pub fn with_coercion(mut self, coerce: impl Fn(Value) -> Value + 'static) -> Self {
        self.coerce = Some(Rc::new(coerce));
        self
    }
}

/// Registry of declared computed properties, keyed by
/// `(object kind, property key)`.
pub struct ComputedRegistry {
    specs: RefCell<AHashMap<(Rc<str>, Rc<str>), ComputedSpec>>,
}

impl std::fmt::Debug for ComputedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedRegistry")
            .field("entries", &self.specs.borrow().len())
            .finish()
    }
}

impl ComputedRegistry {
    pub(crate) fn new() -> Self {
        Self {
            specs: RefCell::new(AHashMap::new()),
        }
    }

    /// Register (or replace) the spec for `(kind, key)`.
    pub fn register(&self, kind: impl AsRef<str>, key: impl AsRef<str>, spec: ComputedSpec) {
        self.specs
            .borrow_mut()
            .insert((Rc::from(kind.as_ref()), Rc::from(key.as_ref())), spec);
    }

    /// The spec for `(kind, key)`, if registered.
    #[must_use]
    pub fn lookup(&self, kind: &str, key: &str) -> Option<ComputedSpec> {
        self.specs
            .borrow()
            .get(&(Rc::from(kind), Rc::from(key)))
            .cloned()
    }
}
