#![forbid(unsafe_code)]

//! Per-mutation collection change descriptions.
//!
//! An [`IndexMap`] describes one intercepted mutation: for each slot of
//! the post-mutation collection, where that slot came from; plus the
//! slots (and items) the mutation deleted. Consumers use it to update
//! derived views incrementally instead of diffing whole collections.
//!
//! # Invariants
//!
//! 1. `slots().len()` equals the post-mutation collection length.
//! 2. `deleted_indices` refer to pre-mutation positions, ascending.
//! 3. `deleted_indices` and `deleted_items` are parallel.

use crate::value::Value;

/// Where a post-mutation slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The item previously at this pre-mutation index.
    Prior(usize),
    /// The slot kept its key/position but its value changed in place.
    Changed,
    /// A newly inserted slot.
    New,
}

/// Description of a single collection mutation.
#[derive(Debug, Clone, Default)]
pub struct IndexMap {
    slots: Vec<Slot>,
    deleted_indices: Vec<usize>,
    deleted_items: Vec<Value>,
}

impl IndexMap {
    /// Identity map over a collection of length `len` (no changes yet).
    #[must_use]
    pub fn identity(len: usize) -> Self {
        Self {
            slots: (0..len).map(Slot::Prior).collect(),
            deleted_indices: Vec::new(),
            deleted_items: Vec::new(),
        }
    }

    /// Post-mutation slots.
    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Pre-mutation indices of deleted slots.
    #[must_use]
    pub fn deleted_indices(&self) -> &[usize] {
        &self.deleted_indices
    }

    /// Items removed by the mutation, parallel to
    /// [`IndexMap::deleted_indices`].
    #[must_use]
    pub fn deleted_items(&self) -> &[Value] {
        &self.deleted_items
    }

    /// Whether the mutation had any effect.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted_indices.is_empty()
            && self
                .slots
                .iter()
                .enumerate()
                .all(|(i, slot)| matches!(slot, Slot::Prior(j) if *j == i))
    }

    /// Mark slot `index` as changed in place.
    pub(crate) fn mark_changed(&mut self, index: usize) {
        self.slots[index] = Slot::Changed;
    }

    /// Insert a `New` slot at `index`.
    pub(crate) fn insert_new(&mut self, index: usize) {
        self.slots.insert(index, Slot::New);
    }

    /// Append a `New` slot.
    pub(crate) fn push_new(&mut self) {
        self.slots.push(Slot::New);
    }

    /// Remove the slot at post-map position `index`, recording the
    /// deletion against the slot's pre-mutation index (if it had one)
    /// and remembering the removed item.
    pub(crate) fn remove_slot(&mut self, index: usize, item: Value) {
        let slot = self.slots.remove(index);
        if let Slot::Prior(original) = slot {
            let at = self
                .deleted_indices
                .partition_point(|&existing| existing < original);
            self.deleted_indices.insert(at, original);
            self.deleted_items.insert(at, item);
        }
    }

    /// Replace the slots wholesale (array reorder operations).
    pub(crate) fn set_slots(&mut self, slots: Vec<Slot>) {
        self.slots = slots;
    }
}
