// src/value.rs

use std::fmt;

use crate::memory::{Heap, HeapObject, ObjRef};

/// A script value. Everything except `Obj` is stored inline; `Obj` is a
/// non-owning handle into the [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
    /// Marks a never-used hash table slot. Never visible to scripts.
    Empty,
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl Value {
    /// `nil` and `false` are falsey, everything else (including 0 and "") is truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    /// Adapter that prints the value the way `print` does.
    pub fn display<'a>(&self, heap: &'a Heap) -> ValueDisplay<'a> {
        ValueDisplay { value: *self, heap }
    }
}

/// Integral numbers print without a fractional part, the rest use the
/// shortest representation that round-trips.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if n == 0.0 && n.is_sign_negative() {
        "-0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

pub struct ValueDisplay<'a> {
    value: Value,
    heap: &'a Heap,
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(n)),
            Value::Empty => write!(f, "<empty>"),
            Value::Obj(r) => fmt_object(f, self.heap, r),
        }
    }
}

fn fmt_object(f: &mut fmt::Formatter<'_>, heap: &Heap, r: ObjRef) -> fmt::Result {
    match heap.get(r) {
        Some(HeapObject::String(s)) => write!(f, "{}", s.as_str()),
        Some(HeapObject::Function(func)) => match func.name {
            Some(name) => write!(f, "<fn {}>", heap.str(name)),
            None => write!(f, "<script>"),
        },
        Some(HeapObject::Closure(closure)) => fmt_object(f, heap, closure.function),
        Some(HeapObject::Upvalue(_)) => write!(f, "upvalue"),
        Some(HeapObject::Class(class)) => write!(f, "{}", heap.str(class.name)),
        Some(HeapObject::Instance(instance)) => match heap.get(instance.class) {
            Some(HeapObject::Class(class)) => write!(f, "{} instance", heap.str(class.name)),
            _ => write!(f, "instance"),
        },
        Some(HeapObject::BoundMethod(bound)) => fmt_object(f, heap, bound.method),
        Some(HeapObject::Native(_)) => write!(f, "<native fn>"),
        Some(HeapObject::Free(_)) | None => write!(f, "<freed {}>", r.index()),
    }
}
