#![forbid(unsafe_code)]

//! Generic pub/sub primitive shared by every observer.
//!
//! A [`SubscriberRecord`] is an ordered, duplicate-free set of
//! subscribers. Subscribers are held weakly: the strong owner is whoever
//! registered them (a consumer, or a tracking observer holding its
//! dependency list), so dropping the owner retires the subscription
//! without an explicit unsubscribe. Dead entries are pruned lazily.
//!
//! Notification runs over a **snapshot** of the live subscriber list:
//! subscribers added during a notification round are not invoked in that
//! round, and subscribers removed during the round are still invoked.
//!
//! Records carry a handle to the runtime's [`BatchContext`]; while a
//! batch is open, value notifications accumulate (coalescing per record)
//! and fire when the outermost batch closes.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::index_map::IndexMap;
use crate::value::Value;

/// Receives change notifications from observers.
///
/// `handle_dirty` is the lighter two-phase signal: "a dependency *might*
/// have changed". Only subscribers reporting `wants_dirty()` receive it.
pub trait Subscriber {
    /// A value changed from `old` to `new`.
    fn handle_change(&self, new: &Value, old: &Value);

    /// A collection mutated; `map` describes the mutation.
    fn handle_collection_change(&self, map: &IndexMap) {
        let _ = map;
    }

    /// A dependency might have changed; pull if interested.
    fn handle_dirty(&self) {}

    /// Whether this subscriber participates in dirty-phase notification.
    fn wants_dirty(&self) -> bool {
        false
    }
}

struct Entry {
    /// Identity key of the registered `Rc`, for idempotence checks.
    key: usize,
    subscriber: Weak<dyn Subscriber>,
    dirty_aware: bool,
}

fn identity_of(subscriber: &Rc<dyn Subscriber>) -> usize {
    Rc::as_ptr(subscriber).cast::<()>() as usize
}

struct RecordInner {
    entries: RefCell<Vec<Entry>>,
    batch: BatchContext,
}

/// Ordered weak subscriber set with two-phase notification.
///
/// Cheaply cloneable; clones share the same set.
#[derive(Clone)]
pub struct SubscriberRecord {
    inner: Rc<RecordInner>,
}

impl std::fmt::Debug for SubscriberRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRecord")
            .field("count", &self.count())
            .finish()
    }
}

impl SubscriberRecord {
    /// Create a record bound to `batch`.
    #[must_use]
    pub fn new(batch: BatchContext) -> Self {
        Self {
            inner: Rc::new(RecordInner {
                entries: RefCell::new(Vec::new()),
                batch,
            }),
        }
    }

    fn prune(&self) {
        self.inner
            .entries
            .borrow_mut()
            .retain(|entry| entry.subscriber.strong_count() > 0);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.prune();
        self.inner.entries.borrow().len()
    }

    /// Idempotent add. Returns whether the set changed.
    pub fn subscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        self.prune();
        let key = identity_of(subscriber);
        let mut entries = self.inner.entries.borrow_mut();
        if entries.iter().any(|entry| entry.key == key) {
            return false;
        }
        entries.push(Entry {
            key,
            subscriber: Rc::downgrade(subscriber),
            dirty_aware: subscriber.wants_dirty(),
        });
        true
    }

    /// Idempotent remove. Returns whether the set changed.
    pub fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>) -> bool {
        self.prune();
        let key = identity_of(subscriber);
        let mut entries = self.inner.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|entry| entry.key != key);
        entries.len() < before
    }

    fn snapshot(&self, dirty_only: bool) -> SmallVec<[Rc<dyn Subscriber>; 4]> {
        let mut live = SmallVec::new();
        let mut entries = self.inner.entries.borrow_mut();
        entries.retain(|entry| {
            if let Some(subscriber) = entry.subscriber.upgrade() {
                if !dirty_only || entry.dirty_aware {
                    live.push(subscriber);
                }
                true
            } else {
                false
            }
        });
        live
    }

    /// Notify subscribers of a value change, or accumulate it if a batch
    /// is open.
    pub fn notify(&self, new: &Value, old: &Value) {
        if self.inner.batch.is_open() {
            self.inner.batch.add_value(self.clone(), new.clone(), old.clone());
            return;
        }
        self.notify_now(new, old);
    }

    /// Notify subscribers of a value change, bypassing any open batch
    /// (dirty-checker path).
    pub fn notify_now(&self, new: &Value, old: &Value) {
        for subscriber in self.snapshot(false) {
            subscriber.handle_change(new, old);
        }
    }

    /// Notify subscribers of a collection mutation, or accumulate it if a
    /// batch is open.
    pub fn notify_collection(&self, map: &IndexMap) {
        if self.inner.batch.is_open() {
            self.inner.batch.add_collection(self.clone(), map.clone());
            return;
        }
        self.notify_collection_now(map);
    }

    fn notify_collection_now(&self, map: &IndexMap) {
        for subscriber in self.snapshot(false) {
            subscriber.handle_collection_change(map);
        }
    }

    /// Dirty-phase notification to the dirty-aware subset, if non-empty.
    pub fn notify_dirty(&self) {
        let dirty_aware = self.snapshot(true);
        for subscriber in dirty_aware {
            subscriber.handle_dirty();
        }
    }

    fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

enum BatchItem {
    Value {
        record: SubscriberRecord,
        new: Value,
        old: Value,
    },
    Collection {
        record: SubscriberRecord,
        map: IndexMap,
    },
}

struct BatchInner {
    depth: Cell<u32>,
    items: RefCell<Vec<BatchItem>>,
}

/// Accumulates notifications while a batch is open.
///
/// Value notifications coalesce per record (latest new value, earliest
/// old value); collection notifications are queued in order.
#[derive(Clone)]
pub struct BatchContext {
    inner: Rc<BatchInner>,
}

impl std::fmt::Debug for BatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchContext")
            .field("depth", &self.inner.depth.get())
            .field("pending", &self.inner.items.borrow().len())
            .finish()
    }
}

impl BatchContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(BatchInner {
                depth: Cell::new(0),
                items: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Whether a batch is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.depth.get() > 0
    }

    pub(crate) fn begin(&self) {
        self.inner.depth.set(self.inner.depth.get() + 1);
    }

    /// Close one nesting level; the outermost close flushes accumulated
    /// notifications.
    pub(crate) fn end(&self) {
        let depth = self.inner.depth.get();
        debug_assert!(depth > 0, "batch end without begin");
        self.inner.depth.set(depth.saturating_sub(1));
        if depth == 1 {
            self.drain();
        }
    }

    fn add_value(&self, record: SubscriberRecord, new: Value, old: Value) {
        let mut items = self.inner.items.borrow_mut();
        for item in items.iter_mut() {
            if let BatchItem::Value {
                record: existing,
                new: latest,
                ..
            } = item
                && SubscriberRecord::ptr_eq(existing, &record)
            {
                *latest = new;
                return;
            }
        }
        items.push(BatchItem::Value { record, new, old });
    }

    fn add_collection(&self, record: SubscriberRecord, map: IndexMap) {
        self.inner
            .items
            .borrow_mut()
            .push(BatchItem::Collection { record, map });
    }

    fn drain(&self) {
        // Notifications fired here run with the batch closed; anything
        // they trigger notifies immediately.
        loop {
            let batch = std::mem::take(&mut *self.inner.items.borrow_mut());
            if batch.is_empty() {
                break;
            }
            for item in batch {
                match item {
                    BatchItem::Value { record, new, old } => record.notify_now(&new, &old),
                    BatchItem::Collection { record, map } => record.notify_collection_now(&map),
                }
            }
        }
    }
}

impl Default for BatchContext {
    fn default() -> Self {
        Self::new()
    }
}
