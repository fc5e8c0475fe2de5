//! Collection observer behavior: index maps emitted per mutation, the
//! unobserved fast path, and per-identity observer sharing.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;

use argus_reactive::{
    ArrayHandle, IndexMap, MapHandle, Observer, Runtime, SetHandle, Slot, Subscriber, Value,
};

#[derive(Default)]
struct CollectionProbe {
    maps: RefCell<Vec<IndexMap>>,
}

impl CollectionProbe {
    fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn last(&self) -> IndexMap {
        self.maps.borrow().last().expect("a mutation was observed").clone()
    }

    fn count(&self) -> usize {
        self.maps.borrow().len()
    }
}

impl Subscriber for CollectionProbe {
    fn handle_change(&self, _new: &Value, _old: &Value) {}

    fn handle_collection_change(&self, map: &IndexMap) {
        self.maps.borrow_mut().push(map.clone());
    }
}

fn observed_array(rt: &Runtime, items: Vec<Value>) -> (ArrayHandle, Rc<CollectionProbe>) {
    let array = ArrayHandle::from_vec(items);
    let observer = rt.get_array_observer(&array);
    let probe = CollectionProbe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);
    (array, probe)
}

fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().copied().map(Value::Int).collect()
}

#[test]
fn push_appends_new_slot() {
    let rt = Runtime::new();
    let (array, probe) = observed_array(&rt, ints(&[1, 2]));
    array.push(Value::Int(3));
    let map = probe.last();
    assert_eq!(map.slots(), &[Slot::Prior(0), Slot::Prior(1), Slot::New]);
    assert!(map.deleted_indices().is_empty());
}

#[test]
fn pop_records_deleted_tail() {
    let rt = Runtime::new();
    let (array, probe) = observed_array(&rt, ints(&[1, 2, 3]));
    assert_eq!(array.pop(), Some(Value::Int(3)));
    let map = probe.last();
    assert_eq!(map.slots(), &[Slot::Prior(0), Slot::Prior(1)]);
    assert_eq!(map.deleted_indices(), &[2]);
    assert_eq!(map.deleted_items(), &[Value::Int(3)]);
}

#[test]
fn splice_mixes_deletions_and_insertions() {
    let rt = Runtime::new();
    let (array, probe) = observed_array(&rt, ints(&[1, 2, 3, 4]));
    let removed = array.splice(1, 2, ints(&[9]));
    assert_eq!(removed, ints(&[2, 3]));
    assert_eq!(array.snapshot(), ints(&[1, 9, 4]));

    let map = probe.last();
    assert_eq!(map.slots(), &[Slot::Prior(0), Slot::New, Slot::Prior(3)]);
    assert_eq!(map.deleted_indices(), &[1, 2]);
    assert_eq!(map.deleted_items(), &ints(&[2, 3]));
}

#[test]
fn set_equal_value_is_silent() {
    let rt = Runtime::new();
    let (array, probe) = observed_array(&rt, ints(&[1, 2]));
    array.set(0, Value::Int(1));
    assert_eq!(probe.count(), 0);

    array.set(0, Value::Int(5));
    assert_eq!(probe.last().slots(), &[Slot::Changed, Slot::Prior(1)]);
}

#[test]
fn reverse_maps_prior_indices() {
    let rt = Runtime::new();
    let (array, probe) = observed_array(&rt, ints(&[1, 2, 3]));
    array.reverse();
    assert_eq!(array.snapshot(), ints(&[3, 2, 1]));
    assert_eq!(
        probe.last().slots(),
        &[Slot::Prior(2), Slot::Prior(1), Slot::Prior(0)]
    );
}

#[test]
fn clear_reports_every_deletion() {
    let rt = Runtime::new();
    let (array, probe) = observed_array(&rt, ints(&[7, 8]));
    array.clear();
    let map = probe.last();
    assert!(map.slots().is_empty());
    assert_eq!(map.deleted_indices(), &[0, 1]);
    assert_eq!(map.deleted_items(), &ints(&[7, 8]));
}

#[test]
fn unobserved_collections_stay_silent() {
    // No observer attached: mutators run the plain path.
    let array = ArrayHandle::from_vec(ints(&[1]));
    array.push(Value::Int(2));
    array.remove(0);
    assert_eq!(array.snapshot(), ints(&[2]));

    let map = MapHandle::new();
    map.set(Value::str("k"), Value::Int(1));
    assert_eq!(map.len(), 1);

    let set = SetHandle::new();
    assert!(set.add(Value::Int(1)));
    assert!(!set.add(Value::Int(1)));
}

#[test]
fn map_set_existing_key_marks_changed_in_place() {
    let rt = Runtime::new();
    let map = MapHandle::new();
    map.set(Value::str("a"), Value::Int(1));
    map.set(Value::str("b"), Value::Int(2));

    let observer = rt.get_map_observer(&map);
    let probe = CollectionProbe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);

    // Unchanged value: no notification at all.
    map.set(Value::str("a"), Value::Int(1));
    assert_eq!(probe.count(), 0);

    // Changed value: in-place mark, not a move.
    map.set(Value::str("a"), Value::Int(10));
    assert_eq!(probe.last().slots(), &[Slot::Changed, Slot::Prior(1)]);

    // Brand-new key appends.
    map.set(Value::str("c"), Value::Int(3));
    assert_eq!(
        probe.last().slots(),
        &[Slot::Prior(0), Slot::Prior(1), Slot::New]
    );
}

#[test]
fn map_delete_and_clear_record_values() {
    let rt = Runtime::new();
    let map = MapHandle::new();
    map.set(Value::str("a"), Value::Int(1));
    map.set(Value::str("b"), Value::Int(2));
    map.set(Value::str("c"), Value::Int(3));

    let observer = rt.get_map_observer(&map);
    let probe = CollectionProbe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);

    assert!(map.delete(&Value::str("b")));
    let deleted = probe.last();
    assert_eq!(deleted.slots(), &[Slot::Prior(0), Slot::Prior(2)]);
    assert_eq!(deleted.deleted_indices(), &[1]);
    assert_eq!(deleted.deleted_items(), &[Value::Int(2)]);

    assert!(!map.delete(&Value::str("missing")));
    assert_eq!(probe.count(), 1);

    map.clear();
    let cleared = probe.last();
    assert!(cleared.slots().is_empty());
    assert_eq!(cleared.deleted_indices(), &[0, 1]);
    assert_eq!(cleared.deleted_items(), &[Value::Int(1), Value::Int(3)]);
    assert!(map.is_empty());
}

#[test]
fn set_add_delete_emit_minimal_maps() {
    let rt = Runtime::new();
    let set = SetHandle::new();
    let observer = rt.get_set_observer(&set);
    let probe = CollectionProbe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);

    assert!(set.add(Value::Int(1)));
    assert_eq!(probe.last().slots(), &[Slot::New]);

    // Duplicate add: membership unchanged, nothing emitted.
    assert!(!set.add(Value::Int(1)));
    assert_eq!(probe.count(), 1);

    assert!(set.add(Value::Int(2)));
    assert!(set.delete(&Value::Int(1)));
    let map = probe.last();
    assert_eq!(map.slots(), &[Slot::Prior(1)]);
    assert_eq!(map.deleted_indices(), &[0]);
    assert_eq!(map.deleted_items(), &[Value::Int(1)]);
}

#[test]
fn observer_is_shared_per_identity() {
    let rt = Runtime::new();
    let a = ArrayHandle::new();
    let b = ArrayHandle::new();
    assert!(Rc::ptr_eq(&rt.get_array_observer(&a), &rt.get_array_observer(&a)));
    assert!(!Rc::ptr_eq(&rt.get_array_observer(&a), &rt.get_array_observer(&b)));
}
