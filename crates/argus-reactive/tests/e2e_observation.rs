//! E2E integration tests: the full observation pipeline.
//!
//! Exercises the locator, implicit and explicit computed observers,
//! expression observation, dirty checking, batching, and the scheduler,
//! driven the way an embedding host would drive them.

#![forbid(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use argus_reactive::{
    Accessor, ArrayHandle, ComputedSpec, DependencyDecl, DirtyCheckSettings, FlushMode, IndexMap,
    MapHandle, ObjectHandle, Observer, ObserverError, PathParser, Runtime, RuntimeConfig, Slot,
    Subscriber, Value,
};

// ── Probes ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct Probe {
    changes: RefCell<Vec<(Value, Value)>>,
    collection_changes: RefCell<Vec<IndexMap>>,
}

impl Probe {
    fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn change_count(&self) -> usize {
        self.changes.borrow().len()
    }
}

impl Subscriber for Probe {
    fn handle_change(&self, new: &Value, old: &Value) {
        self.changes.borrow_mut().push((new.clone(), old.clone()));
    }

    fn handle_collection_change(&self, map: &IndexMap) {
        self.collection_changes.borrow_mut().push(map.clone());
    }
}

fn sum_spec() -> ComputedSpec {
    ComputedSpec::new(|cx, obj| {
        let a = cx.get_from(obj, "a")?.as_int().unwrap_or(0);
        let b = cx.get_from(obj, "b")?.as_int().unwrap_or(0);
        Ok(Value::Int(a + b))
    })
}

fn pair_object(rt: &Runtime, flush: FlushMode) -> (ObjectHandle, Rc<dyn Observer>) {
    let obj = ObjectHandle::with_kind("pair");
    obj.set("a", Value::Int(1)).expect("plain write");
    obj.set("b", Value::Int(2)).expect("plain write");
    rt.computed_registry()
        .register("pair", "sum", sum_spec().flush(flush));
    let sum = rt
        .get_observer(&Value::Object(obj.clone()), "sum")
        .expect("resolve computed");
    (obj, sum)
}

// ── Scenario 1: implicit computed, sync and async flush ─────────────────

#[test]
fn implicit_computed_sync_flush() {
    let rt = Runtime::new();
    let (obj, sum) = pair_object(&rt, FlushMode::Sync);

    // Pull with no subscriber.
    assert_eq!(sum.get_value().expect("pull"), Value::Int(3));

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    assert!(sum.subscribe(&sub));

    obj.set("a", Value::Int(5)).expect("observed write");
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(7), Value::Int(3))]);
}

#[test]
fn implicit_computed_async_flush_coalesces() {
    let rt = Runtime::new();
    let (obj, sum) = pair_object(&rt, FlushMode::Async);

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    sum.subscribe(&sub);

    // Two writes before the flush runs: one recompute, one notification.
    obj.set("a", Value::Int(5)).expect("observed write");
    obj.set("a", Value::Int(6)).expect("observed write");
    assert_eq!(probe.change_count(), 0, "deferred to the queue");

    rt.flush();
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(8), Value::Int(3))]);

    rt.flush();
    assert_eq!(probe.change_count(), 1, "nothing left to flush");
}

#[test]
fn subscribe_twice_returns_false_and_notifies_once() {
    let rt = Runtime::new();
    let (obj, sum) = pair_object(&rt, FlushMode::Sync);

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    assert!(sum.subscribe(&sub));
    assert!(!sum.subscribe(&sub));

    obj.set("a", Value::Int(2)).expect("observed write");
    assert_eq!(probe.change_count(), 1);
}

#[test]
fn pull_mode_leaks_no_subscriptions() {
    let rt = Runtime::new();
    let evaluations = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&evaluations);

    let obj = ObjectHandle::with_kind("counted");
    obj.set("a", Value::Int(1)).expect("plain write");
    rt.computed_registry().register(
        "counted",
        "doubled",
        ComputedSpec::new(move |cx, obj| {
            counter.set(counter.get() + 1);
            let a = cx.get_from(obj, "a")?.as_int().unwrap_or(0);
            Ok(Value::Int(a * 2))
        })
        .flush(FlushMode::Sync),
    );
    let doubled = rt
        .get_observer(&Value::Object(obj.clone()), "doubled")
        .expect("resolve");

    // Unsubscribed: every pull re-evaluates, nothing is cached.
    assert_eq!(doubled.get_value().expect("pull"), Value::Int(2));
    assert_eq!(doubled.get_value().expect("pull"), Value::Int(2));
    assert_eq!(evaluations.get(), 2);

    // A dependency change triggers no recompute: nothing subscribed.
    obj.set("a", Value::Int(10)).expect("write");
    assert_eq!(evaluations.get(), 2);
    assert_eq!(doubled.get_value().expect("pull"), Value::Int(20));
    assert_eq!(evaluations.get(), 3);
}

#[test]
fn observer_resolution_is_idempotent() {
    let rt = Runtime::new();
    let obj = ObjectHandle::new();
    obj.set("name", Value::str("x")).expect("write");

    let target = Value::Object(obj);
    let first = rt.get_observer(&target, "name").expect("resolve");
    let second = rt.get_observer(&target, "name").expect("resolve");
    assert!(Rc::ptr_eq(&first, &second));
}

// ── Scenario 2: map observation ─────────────────────────────────────────

#[test]
fn map_observer_identity_and_first_set() {
    let rt = Runtime::new();
    let map = MapHandle::new();

    let first = rt.get_map_observer(&map);
    let second = rt.get_map_observer(&map);
    assert!(Rc::ptr_eq(&first, &second));

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    first.subscribe(&sub);

    map.set(Value::str("x"), Value::Int(1));
    let changes = probe.collection_changes.borrow();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].slots(), &[Slot::New]);
    assert!(changes[0].deleted_indices().is_empty());
}

// ── Scenario 3: controlled computed, sync flush ─────────────────────────

#[test]
fn controlled_computed_notifies_synchronously() {
    let rt = Runtime::new();
    let obj = ObjectHandle::with_kind("ctrl");
    obj.set("a", Value::Int(1)).expect("write");
    rt.computed_registry().register(
        "ctrl",
        "value",
        ComputedSpec::new(|cx, obj| {
            let a = cx.get_from(obj, "a")?.as_int().unwrap_or(0);
            Ok(Value::Int(a + 100))
        })
        .with_dependencies([DependencyDecl::key("a")])
        .flush(FlushMode::Sync),
    );
    let observer = rt
        .get_observer(&Value::Object(obj.clone()), "value")
        .expect("resolve controlled");

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);

    obj.set("a", Value::Int(2)).expect("observed write");
    // Synchronous: visible before the next statement runs.
    assert_eq!(
        *probe.changes.borrow(),
        vec![(Value::Int(102), Value::Int(101))]
    );
}

// ── Scenario 4: queue ordering and next_tick ────────────────────────────

#[test]
fn queue_runs_fifo_before_next_tick_settles() {
    let rt = Runtime::new();
    let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    let log1 = Rc::clone(&log);
    rt.queue_task(move || log1.borrow_mut().push(1));
    let log2 = Rc::clone(&log);
    rt.queue_task(move || log2.borrow_mut().push(2));

    let tick = rt.next_tick();
    assert!(!tick.is_settled());

    rt.flush();
    assert_eq!(*log.borrow(), vec![1, 2]);
    assert!(tick.is_settled());
}

// ── Conditional dependencies ────────────────────────────────────────────

#[test]
fn conditional_dependency_switches_branches() {
    let rt = Runtime::new();
    let obj = ObjectHandle::new();
    obj.set("cond", Value::Bool(true)).expect("write");
    obj.set("a", Value::Int(10)).expect("write");
    obj.set("b", Value::Int(20)).expect("write");

    let observer = rt.get_getter_observer(&obj, |cx, obj| {
        if cx.get_from(obj, "cond")?.is_truthy() {
            cx.get_from(obj, "a")
        } else {
            cx.get_from(obj, "b")
        }
    });

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);
    assert_eq!(observer.dependency_count(), 2, "cond + a");

    // Untaken branch: changing `b` is invisible.
    obj.set("b", Value::Int(21)).expect("write");
    rt.flush();
    assert_eq!(probe.change_count(), 0);

    // Flip the condition: `a` is dropped, `b` picked up.
    obj.set("cond", Value::Bool(false)).expect("write");
    rt.flush();
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(21), Value::Int(10))]);
    assert_eq!(observer.dependency_count(), 2, "cond + b");

    obj.set("a", Value::Int(99)).expect("write");
    rt.flush();
    assert_eq!(probe.change_count(), 1, "a is no longer a dependency");

    obj.set("b", Value::Int(22)).expect("write");
    rt.flush();
    assert_eq!(probe.change_count(), 2);
}

// ── Equality suppression and setters ────────────────────────────────────

#[test]
fn unchanged_recompute_notifies_no_one() {
    let rt = Runtime::new();
    let obj = ObjectHandle::with_kind("clamp");
    obj.set("n", Value::Int(50)).expect("write");
    rt.computed_registry().register(
        "clamp",
        "clamped",
        ComputedSpec::new(|cx, obj| {
            let n = cx.get_from(obj, "n")?.as_int().unwrap_or(0);
            Ok(Value::Int(n.min(10)))
        })
        .flush(FlushMode::Sync),
    );
    let clamped = rt
        .get_observer(&Value::Object(obj.clone()), "clamped")
        .expect("resolve");

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    clamped.subscribe(&sub);

    // 50 → 60: both clamp to 10; recompute happens, notification doesn't.
    obj.set("n", Value::Int(60)).expect("write");
    assert_eq!(probe.change_count(), 0);

    obj.set("n", Value::Int(3)).expect("write");
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(3), Value::Int(10))]);
}

#[test]
fn computed_setter_with_coercion() {
    let rt = Runtime::new();
    let obj = ObjectHandle::with_kind("temp");
    obj.set("celsius", Value::Int(0)).expect("write");
    rt.computed_registry().register(
        "temp",
        "fahrenheit",
        ComputedSpec::new(|cx, obj| {
            let c = cx.get_from(obj, "celsius")?.as_int().unwrap_or(0);
            Ok(Value::Int(c * 9 / 5 + 32))
        })
        .with_setter(|cx, obj, value| {
            let _ = cx;
            let f = value.as_int().unwrap_or(32);
            obj.set("celsius", Value::Int((f - 32) * 5 / 9))
        })
        .with_coercion(|value| match value {
            Value::Float(f) => Value::Int(f as i64),
            other => other,
        })
        .flush(FlushMode::Sync),
    );
    let fahrenheit = rt
        .get_observer(&Value::Object(obj.clone()), "fahrenheit")
        .expect("resolve");

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    fahrenheit.subscribe(&sub);
    assert_eq!(fahrenheit.get_value().expect("read"), Value::Int(32));

    fahrenheit
        .set_value(Value::Float(212.0))
        .expect("coerced write");
    assert_eq!(obj.get("celsius"), Value::Int(100));
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(212), Value::Int(32))]);
}

#[test]
fn read_only_computed_rejects_set() {
    let rt = Runtime::new();
    let (_obj, sum) = pair_object(&rt, FlushMode::Sync);
    let err = sum.set_value(Value::Int(9)).expect_err("read-only");
    assert!(matches!(err, ObserverError::ReadOnly { .. }));
}

// ── Reentrancy ──────────────────────────────────────────────────────────

#[test]
#[should_panic(expected = "dirty again immediately after recomputing")]
fn self_mutating_getter_fails_fast() {
    let rt = Runtime::new();
    let obj = ObjectHandle::with_kind("bad");
    obj.set("n", Value::Int(0)).expect("write");
    rt.computed_registry().register(
        "bad",
        "feedback",
        ComputedSpec::new(|cx, obj| {
            let n = cx.get_from(obj, "n")?.as_int().unwrap_or(0);
            // Non-terminating feedback: the getter bumps its own input.
            obj.set("n", Value::Int(n + 1)).expect("write");
            Ok(Value::Int(n))
        })
        .flush(FlushMode::Sync),
    );
    let observer = rt
        .get_observer(&Value::Object(obj.clone()), "feedback")
        .expect("resolve");

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);

    // An external trigger forces the sync recompute path, which must
    // fail fast instead of looping.
    obj.set("n", Value::Int(100)).expect("write");
}

// ── Deep controlled observation ─────────────────────────────────────────

#[test]
fn deep_observation_tracks_nested_state() {
    let rt = Runtime::new();
    let child = ObjectHandle::new();
    child.set("x", Value::Int(1)).expect("write");
    let obj = ObjectHandle::with_kind("root");
    obj.set("tree", Value::Object(child.clone())).expect("write");

    rt.computed_registry().register(
        "root",
        "snapshot",
        ComputedSpec::new(|cx, obj| {
            let tree = cx.get_from(obj, "tree")?;
            let child = tree.as_object().cloned().unwrap_or_default();
            cx.get_from(&child, "x")
        })
        .with_dependencies([DependencyDecl::key("tree")])
        .deep(true)
        .flush(FlushMode::Sync),
    );
    let observer = rt
        .get_observer(&Value::Object(obj.clone()), "snapshot")
        .expect("resolve");

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);

    // A nested write, two levels below the declared dependency.
    child.set("x", Value::Int(2)).expect("write");
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(2), Value::Int(1))]);

    // Swap the subtree: the walk re-runs against the new shape.
    let replacement = ObjectHandle::new();
    replacement.set("x", Value::Int(7)).expect("write");
    obj.set("tree", Value::Object(replacement.clone()))
        .expect("write");
    assert_eq!(probe.change_count(), 2);

    // The old child is no longer observed; the new one is.
    child.set("x", Value::Int(50)).expect("write");
    assert_eq!(probe.change_count(), 2);
    replacement.set("x", Value::Int(8)).expect("write");
    assert_eq!(probe.change_count(), 3);
}

// ── Expressions ─────────────────────────────────────────────────────────

#[test]
fn expression_observer_tracks_and_assigns() {
    let rt = Runtime::new();
    rt.set_expression_parser(Rc::new(PathParser));

    let address = ObjectHandle::new();
    address.set("city", Value::str("Paris")).expect("write");
    let scope = ObjectHandle::new();
    scope
        .set("address", Value::Object(address.clone()))
        .expect("write");

    let observer = rt
        .get_expression_observer(&scope, "address.city")
        .expect("parse + observe");
    assert_eq!(observer.get_value().expect("read"), Value::str("Paris"));

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);

    address.set("city", Value::str("Lyon")).expect("write");
    assert_eq!(
        *probe.changes.borrow(),
        vec![(Value::str("Lyon"), Value::str("Paris"))]
    );

    // Assignment through the expression.
    observer.set_value(Value::str("Nice")).expect("assign");
    assert_eq!(address.get("city"), Value::str("Nice"));
    assert_eq!(probe.change_count(), 2);
}

#[test]
fn missing_parser_is_a_usage_error() {
    let rt = Runtime::new();
    let scope = ObjectHandle::new();
    let err = rt
        .get_expression_observer(&scope, "a.b")
        .expect_err("no parser installed");
    assert_eq!(err, ObserverError::NoParser);
}

#[test]
fn parser_boundary_reports_parse_errors() {
    let rt = Runtime::new();
    rt.set_expression_parser(Rc::new(PathParser));
    let scope = ObjectHandle::new();
    let err = rt
        .get_expression_observer(&scope, "a..b")
        .expect_err("bad path");
    assert!(matches!(err, ObserverError::Parse { .. }));
}

// ── Dirty checking through the locator ──────────────────────────────────

#[test]
fn native_accessor_falls_back_to_polling() {
    let rt = Runtime::with_config(RuntimeConfig {
        dirty_check: DirtyCheckSettings {
            ticks_per_check: 2,
            ..DirtyCheckSettings::default()
        },
        ..RuntimeConfig::default()
    });
    let obj = ObjectHandle::new();
    obj.define_accessor("host_value", |o| o.get("backing"), None);

    let observer = rt
        .get_observer(&Value::Object(obj.clone()), "host_value")
        .expect("dirty-checked fallback");

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);

    obj.set("backing", Value::Int(42)).expect("write");
    rt.flush();
    assert_eq!(probe.change_count(), 0, "throttled");
    rt.flush();
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(42), Value::Void)]);
}

#[test]
fn throw_policy_rejects_dirty_checked_creation() {
    let rt = Runtime::with_config(RuntimeConfig {
        dirty_check: DirtyCheckSettings {
            throw_on_create: true,
            ..DirtyCheckSettings::default()
        },
        ..RuntimeConfig::default()
    });
    let obj = ObjectHandle::new();
    obj.define_accessor("host_value", |_| Value::Int(0), None);

    let err = rt
        .get_observer(&Value::Object(obj), "host_value")
        .expect_err("throw policy");
    assert!(matches!(err, ObserverError::DirtyCheckDisallowed { .. }));
}

// ── Batching ────────────────────────────────────────────────────────────

#[test]
fn batch_coalesces_property_notifications() {
    let rt = Runtime::new();
    let obj = ObjectHandle::new();
    obj.set("x", Value::Int(0)).expect("write");

    let observer = rt
        .get_observer(&Value::Object(obj.clone()), "x")
        .expect("setter observer");
    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    observer.subscribe(&sub);

    rt.batch(|| {
        obj.set("x", Value::Int(1)).expect("write");
        obj.set("x", Value::Int(2)).expect("write");
        assert_eq!(probe.change_count(), 0, "held by the batch");
    });
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(2), Value::Int(0))]);
}

// ── Collection length and index observers ───────────────────────────────

#[test]
fn array_length_observer() {
    let rt = Runtime::new();
    let array = ArrayHandle::from_vec(vec![Value::Int(1), Value::Int(2)]);
    let length = rt
        .get_observer(&Value::Array(array.clone()), "length")
        .expect("length observer");
    assert_eq!(length.get_value().expect("read"), Value::Int(2));

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    length.subscribe(&sub);

    array.push(Value::Int(3));
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(3), Value::Int(2))]);

    // In-place change leaves the length untouched.
    array.set(0, Value::Int(9));
    assert_eq!(probe.change_count(), 1);
}

#[test]
fn array_index_observer() {
    let rt = Runtime::new();
    let array = ArrayHandle::from_vec(vec![Value::Int(1), Value::Int(2)]);
    let slot = rt
        .get_observer(&Value::Array(array.clone()), "0")
        .expect("index observer");
    assert_eq!(slot.get_value().expect("read"), Value::Int(1));

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    slot.subscribe(&sub);

    array.set(1, Value::Int(5));
    assert_eq!(probe.change_count(), 0, "other slot");

    array.set(0, Value::Int(7));
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(7), Value::Int(1))]);

    slot.set_value(Value::Int(8)).expect("write through");
    assert_eq!(array.get(0), Some(Value::Int(8)));
    assert_eq!(probe.change_count(), 2);
}

#[test]
fn map_size_observer() {
    let rt = Runtime::new();
    let map = MapHandle::new();
    let size = rt
        .get_observer(&Value::Map(map.clone()), "size")
        .expect("size observer");

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    size.subscribe(&sub);

    map.set(Value::str("k"), Value::Int(1));
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(1), Value::Int(0))]);

    // Changing a value in place leaves the size untouched.
    map.set(Value::str("k"), Value::Int(2));
    assert_eq!(probe.change_count(), 1);
}

// ── Computed over a collection ──────────────────────────────────────────

#[test]
fn computed_tracks_collection_contents() {
    let rt = Runtime::new();
    let items = ArrayHandle::from_vec(vec![Value::Int(1), Value::Int(2)]);
    let obj = ObjectHandle::new();
    obj.set("items", Value::Array(items.clone())).expect("write");

    let total = rt.get_getter_observer(&obj, |cx, obj| {
        let items = cx.get_from(obj, "items")?;
        cx.track_collection(&items);
        let sum = match &items {
            Value::Array(array) => array
                .snapshot()
                .iter()
                .filter_map(Value::as_int)
                .sum::<i64>(),
            _ => 0,
        };
        Ok(Value::Int(sum))
    });

    let probe = Probe::new();
    let sub: Rc<dyn Subscriber> = probe.clone();
    total.subscribe(&sub);
    assert_eq!(total.get_value().expect("read"), Value::Int(3));

    items.push(Value::Int(10));
    rt.flush();
    assert_eq!(*probe.changes.borrow(), vec![(Value::Int(13), Value::Int(3))]);
}
