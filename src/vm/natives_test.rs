// src/vm/natives_test.rs

use super::class::{Class, Instance};
use super::natives::{lookup, NATIVES};
use crate::memory::{Heap, HeapObject, ObjRef};
use crate::value::Value;

fn call(heap: &mut Heap, name: &str, args: &[Value]) -> Value {
    let native = lookup(name).unwrap_or_else(|| panic!("native '{name}' is not registered"));
    native(heap, args)
}

fn new_instance(heap: &mut Heap, class_name: &str) -> (ObjRef, ObjRef) {
    let name = heap.intern(class_name);
    let class = heap.register(HeapObject::Class(Class::new(name)));
    let instance = heap.register(HeapObject::Instance(Instance::new(class)));
    (class, instance)
}

#[test]
fn test_registry_names_are_unique() {
    for (i, def) in NATIVES.iter().enumerate() {
        assert!(NATIVES[i + 1..].iter().all(|other| other.name != def.name), "duplicate native {}", def.name);
    }
    assert!(lookup("clock").is_some());
    assert!(lookup("no_such_native").is_none());
}

#[test]
fn test_unary_math_natives() {
    let mut heap = Heap::new();
    assert_eq!(call(&mut heap, "sqrt", &[Value::Number(9.0)]), Value::Number(3.0));
    assert_eq!(call(&mut heap, "floor", &[Value::Number(-1.5)]), Value::Number(-2.0));
    assert_eq!(call(&mut heap, "abs", &[Value::Number(-0.25)]), Value::Number(0.25));
}

#[test]
fn test_unary_natives_reject_non_numbers() {
    let mut heap = Heap::new();
    let text = Value::Obj(heap.intern("4"));
    assert_eq!(call(&mut heap, "sqrt", &[text]), Value::Nil);
    assert_eq!(call(&mut heap, "floor", &[]), Value::Nil);
    assert_eq!(call(&mut heap, "abs", &[Value::Bool(true)]), Value::Nil);
}

#[test]
fn test_clock_and_random() {
    let mut heap = Heap::new();
    let Value::Number(now) = call(&mut heap, "clock", &[]) else {
        panic!("clock should return a number");
    };
    assert!(now > 0.0);

    for _ in 0..100 {
        match call(&mut heap, "random", &[]) {
            Value::Number(r) => assert!((0.0..1.0).contains(&r)),
            other => panic!("random returned {other:?}"),
        }
    }
}

#[test]
fn test_sys_version_is_interned() {
    let mut heap = Heap::new();
    let Value::Obj(version) = call(&mut heap, "sys_version", &[]) else {
        panic!("sys_version should return a string");
    };
    assert_eq!(heap.str(version), env!("CARGO_PKG_VERSION"));
    assert_eq!(heap.find_interned(env!("CARGO_PKG_VERSION")), Some(version));
}

#[test]
fn test_is_instance() {
    let mut heap = Heap::new();
    let (class, instance) = new_instance(&mut heap, "Point");
    let (other_class, _) = new_instance(&mut heap, "Other");

    assert_eq!(call(&mut heap, "is_instance", &[Value::Obj(instance), Value::Obj(class)]), Value::Bool(true));
    assert_eq!(call(&mut heap, "is_instance", &[Value::Obj(instance), Value::Obj(other_class)]), Value::Bool(false));
    assert_eq!(call(&mut heap, "is_instance", &[Value::Number(1.0), Value::Obj(class)]), Value::Bool(false));
    assert_eq!(call(&mut heap, "is_instance", &[Value::Obj(instance)]), Value::Bool(false));
}

#[test]
fn test_field_natives() {
    let mut heap = Heap::new();
    let (_, instance) = new_instance(&mut heap, "Bag");
    let field = Value::Obj(heap.intern("size"));
    let target = Value::Obj(instance);

    assert_eq!(call(&mut heap, "has_field", &[target, field]), Value::Bool(false));
    assert_eq!(call(&mut heap, "get_field", &[target, field]), Value::Nil);
    assert_eq!(call(&mut heap, "set_field", &[target, field, Value::Number(3.0)]), Value::Bool(true));
    assert_eq!(call(&mut heap, "has_field", &[target, field]), Value::Bool(true));
    assert_eq!(call(&mut heap, "get_field", &[target, field]), Value::Number(3.0));

    // Missing value, non-string names and non-instance targets are refused.
    assert_eq!(call(&mut heap, "set_field", &[target, field]), Value::Bool(false));
    assert_eq!(call(&mut heap, "set_field", &[target, Value::Number(1.0), Value::Nil]), Value::Bool(false));
    assert_eq!(call(&mut heap, "set_field", &[field, field, Value::Nil]), Value::Bool(false));
    assert_eq!(call(&mut heap, "get_field", &[Value::Nil, field]), Value::Nil);
}
