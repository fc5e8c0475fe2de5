#![forbid(unsafe_code)]

//! Expression observation and the parser boundary.
//!
//! The engine does not parse expression text itself: an
//! [`ExpressionParser`] is installed by the host, and produces
//! [`Expression`] values whose evaluation reads through the evaluation
//! context — which is exactly what makes their dependencies trackable.
//! An [`ExpressionObserver`] wraps one parsed expression and a scope
//! object and behaves like a computed observer whose getter is "evaluate
//! the expression against the scope".
//!
//! [`PathExpression`]/[`PathParser`] are the minimal reference
//! implementation of the contract: dot-separated property paths
//! (`"address.city"`), assignable to the last segment.

use std::rc::Rc;

use crate::computed::ComputedObserver;
use crate::error::ObserverError;
use crate::object::ObjectHandle;
use crate::observer::{Accessor, Observer, ObserverFlags};
use crate::registry::{ComputedSpec, FlushMode};
use crate::runtime::{EvalCx, Runtime};
use crate::subscribers::Subscriber;
use crate::value::Value;

/// What the parsed expression will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionMode {
    /// Evaluation only.
    Access,
    /// Evaluation and assignment.
    Assign,
}

/// A parsed expression evaluated against a scope object.
pub trait Expression {
    /// Evaluate against `scope`, reading dependencies through `cx`.
    fn evaluate(&self, scope: &ObjectHandle, cx: &EvalCx) -> Result<Value, ObserverError>;

    /// Assign `value` through the expression, when assignable.
    fn assign(&self, scope: &ObjectHandle, cx: &EvalCx, value: Value) -> Result<(), ObserverError> {
        let _ = (scope, cx, value);
        Err(ObserverError::ExpressionNotAssignable {
            text: self.text().to_string(),
        })
    }

    /// Whether [`Expression::assign`] is supported.
    fn is_assignable(&self) -> bool {
        false
    }

    /// The source text, for diagnostics.
    fn text(&self) -> &str;
}

/// Parses expression text into [`Expression`]s. Installed by the host.
pub trait ExpressionParser {
    fn parse(&self, text: &str, mode: ExpressionMode) -> Result<Rc<dyn Expression>, ObserverError>;
}

// ---------------------------------------------------------------------------
// PathExpression
// ---------------------------------------------------------------------------

/// Dot-separated property path: `"a"`, `"address.city"`.
pub struct PathExpression {
    text: Rc<str>,
    segments: Vec<Rc<str>>,
}

impl PathExpression {
    /// Parse a path. Segments must be non-empty identifiers
    /// (`[A-Za-z0-9_]+`).
    pub fn parse(text: &str) -> Result<Self, ObserverError> {
        let segments: Vec<Rc<str>> = text.split('.').map(Rc::from).collect();
        if segments.iter().any(|segment: &Rc<str>| {
            segment.is_empty()
                || !segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        }) {
            return Err(ObserverError::Parse {
                text: text.to_string(),
                reason: "segments must be non-empty identifiers".to_string(),
            });
        }
        Ok(Self {
            text: Rc::from(text),
            segments,
        })
    }
}

impl Expression for PathExpression {
    fn evaluate(&self, scope: &ObjectHandle, cx: &EvalCx) -> Result<Value, ObserverError> {
        let mut current = Value::Object(scope.clone());
        for segment in &self.segments {
            current = cx.get(&current, segment)?;
        }
        Ok(current)
    }

    fn assign(&self, scope: &ObjectHandle, cx: &EvalCx, value: Value) -> Result<(), ObserverError> {
        let (last, parents) = self
            .segments
            .split_last()
            .expect("a parsed path has at least one segment");
        let mut current = Value::Object(scope.clone());
        for segment in parents {
            current = cx.get(&current, segment)?;
        }
        match current {
            Value::Object(object) => object.set(last, value),
            other => Err(ObserverError::ExpressionNotAssignable {
                text: format!("{} (hit {} before the last segment)", self.text, other.type_name()),
            }),
        }
    }

    fn is_assignable(&self) -> bool {
        true
    }

    fn text(&self) -> &str {
        &self.text
    }
}

/// Parser producing [`PathExpression`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathParser;

impl ExpressionParser for PathParser {
    fn parse(&self, text: &str, _mode: ExpressionMode) -> Result<Rc<dyn Expression>, ObserverError> {
        Ok(Rc::new(PathExpression::parse(text)?))
    }
}

// ---------------------------------------------------------------------------
// ExpressionObserver
// ---------------------------------------------------------------------------

/// Observes the value of an expression evaluated against a scope object.
///
/// Dependency tracking, caching, flush modes, and coalescing are the
/// computed observer's; this type adds the expression-specific surface
/// (assignability checks and diagnostics).
pub struct ExpressionObserver {
    expression: Rc<dyn Expression>,
    inner: Rc<ComputedObserver>,
}

impl std::fmt::Debug for ExpressionObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionObserver")
            .field("text", &self.expression.text())
            .finish()
    }
}

impl ExpressionObserver {
    pub(crate) fn new(
        rt: &Runtime,
        scope: &ObjectHandle,
        expression: Rc<dyn Expression>,
        flush: FlushMode,
    ) -> Rc<Self> {
        let get_expr = Rc::clone(&expression);
        let mut spec =
            ComputedSpec::new(move |cx, scope| get_expr.evaluate(scope, cx)).flush(flush);
        if expression.is_assignable() {
            let set_expr = Rc::clone(&expression);
            spec = spec.with_setter(move |cx, scope, value| set_expr.assign(scope, cx, value));
        }
        let inner = ComputedObserver::new(rt, scope, Rc::from(expression.text()), &spec);
        Rc::new(Self { expression, inner })
    }

    /// The wrapped expression.
    #[must_use]
    pub fn expression(&self) -> &Rc<dyn Expression> {
        &self.expression
    }
}

impl Accessor for ExpressionObserver {
    fn get_value(&self) -> Result<Value, ObserverError> {
        self.inner.get_value()
    }

    fn set_value(&self, value: Value) -> Result<(), ObserverError> {
        if !self.expression.is_assignable() {
            return Err(ObserverError::ExpressionNotAssignable {
                text: self.expression.text().to_string(),
            });
        }
        self.inner.set_value(value)
    }
}

impl Observer for ExpressionObserver {
    fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        self.inner.subscribe(subscriber)
    }

    fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        self.inner.unsubscribe(subscriber)
    }

    fn flags(&self) -> ObserverFlags {
        ObserverFlags::NO_NATIVE_NOTIFY
    }
}
