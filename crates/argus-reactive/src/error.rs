#![forbid(unsafe_code)]

//! Error taxonomy for the observation engine.
//!
//! Scheduler-side errors ([`argus_sched::TaskError`]) live in the
//! scheduler crate; everything observation-related is an
//! [`ObserverError`]. Errors are never swallowed by the engine: pull-mode
//! reads and sync push-mode recomputes propagate them to the caller, and
//! async recomputes reject the flush task's result.

/// Errors raised by observer resolution, evaluation, and assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverError {
    /// `set_value` on an observer with no write path (read-only computed,
    /// primitive, collection observer).
    ReadOnly { key: String },
    /// A dirty-checked observer was requested while the dirty-check
    /// policy is `throw`. Raised at observer-creation time, never per
    /// tick.
    DirtyCheckDisallowed { key: String },
    /// A computed observer was still dirty immediately after its own
    /// recompute: its getter mutated one of its own dependencies.
    ReentrantRecompute { key: String },
    /// The expression does not support assignment.
    ExpressionNotAssignable { text: String },
    /// The expression text could not be parsed.
    Parse { text: String, reason: String },
    /// An expression observer was requested but no parser is installed.
    NoParser,
}

impl std::fmt::Display for ObserverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly { key } => write!(f, "property '{key}' is not writable"),
            Self::DirtyCheckDisallowed { key } => write!(
                f,
                "property '{key}' cannot be observed without polling, and dirty checking is set to throw"
            ),
            Self::ReentrantRecompute { key } => write!(
                f,
                "computed property '{key}' was dirty again immediately after recomputing; its getter mutates one of its own dependencies"
            ),
            Self::ExpressionNotAssignable { text } => {
                write!(f, "expression '{text}' is not assignable")
            }
            Self::Parse { text, reason } => write!(f, "cannot parse expression '{text}': {reason}"),
            Self::NoParser => write!(f, "no expression parser has been installed"),
        }
    }
}

impl std::error::Error for ObserverError {}
