#![forbid(unsafe_code)]

//! Owning collection wrappers with per-instance change tracking.
//!
//! [`ArrayHandle`], [`MapHandle`], and [`SetHandle`] are `Rc`-shared
//! wrappers that own their storage and intercept their own mutating
//! operations — the explicit-wrapper rendition of "observe this one
//! instance". Until an observer is attached, mutators take the plain
//! path with no index-map work; attaching is construction of a
//! collection observer into the handle's observer slot (one observer per
//! collection identity, idempotent lookup).
//!
//! Every intercepted mutation computes its minimal [`IndexMap`] against
//! the pre-mutation state, applies the mutation, then notifies.

pub mod array;
pub mod map;
pub mod set;

pub use array::{ArrayHandle, ArrayObserver};
pub use map::{MapHandle, MapObserver};
pub use set::{SetHandle, SetObserver};
