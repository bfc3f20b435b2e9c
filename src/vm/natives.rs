// src/vm/natives.rs

use std::time::{SystemTime, UNIX_EPOCH};

use paste::paste;
use rand::Rng;

use crate::memory::{Heap, ObjRef};
use crate::table::Key;
use crate::value::Value;

// The signature for all native Rust functions callable by the VM. The slice
// holds exactly the arguments of the call; arity is not checked by the VM.
// Natives may allocate but must never trigger a collection.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Value;

/// Heap payload for a host function.
#[derive(Debug, Clone, Copy)]
pub struct Native {
    pub func: NativeFn,
}

pub struct NativeDef {
    pub name: &'static str,
    pub func: NativeFn,
}

// --- Macro Template System ---

macro_rules! define_native_functions {
    (
        // Functions that inspect or allocate heap objects.
        heap_natives: [$(($h_name:literal, $h_func:ident)),* $(,)?],
        // Nullary functions that call a pure function (e.g., random)
        nullary_pure_fn: [$(($n_pure_name:literal, $n_pure_func:path)),* $(,)?],
        // Unary numeric functions; any other argument yields nil.
        unary_pure_fn: [$(($u_pure_name:literal, $u_pure_func:path)),* $(,)?]
    ) => {
        paste! {
            $(
                fn [<native_ $n_pure_name>](_heap: &mut Heap, _args: &[Value]) -> Value {
                    Value::Number($n_pure_func())
                }
            )*

            $(
                fn [<native_ $u_pure_name>](_heap: &mut Heap, args: &[Value]) -> Value {
                    match args.first() {
                        Some(Value::Number(n)) => Value::Number($u_pure_func(*n)),
                        _ => Value::Nil,
                    }
                }
            )*

            /// Every native a fresh VM defines as a global.
            pub static NATIVES: &[NativeDef] = &[
                $(NativeDef { name: $h_name, func: $h_func },)*
                $(NativeDef { name: $n_pure_name, func: [<native_ $n_pure_name>] },)*
                $(NativeDef { name: $u_pure_name, func: [<native_ $u_pure_name>] },)*
            ];
        }
    };
}

pub fn lookup(name: &str) -> Option<NativeFn> {
    NATIVES.iter().find(|def| def.name == name).map(|def| def.func)
}

// --- Heap-aware natives ---

fn native_clock(_heap: &mut Heap, _args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64());
    Value::Number(seconds)
}

fn native_sys_version(heap: &mut Heap, _args: &[Value]) -> Value {
    Value::Obj(heap.intern(env!("CARGO_PKG_VERSION")))
}

fn native_is_instance(heap: &mut Heap, args: &[Value]) -> Value {
    let [Value::Obj(obj), Value::Obj(class), ..] = args else {
        return Value::Bool(false);
    };
    let is_instance = heap.instance(*obj).is_some_and(|instance| instance.class == *class);
    Value::Bool(is_instance)
}

// Validates an (instance, field name) argument pair.
fn field_target(heap: &Heap, args: &[Value]) -> Option<(ObjRef, Key)> {
    let [Value::Obj(obj), Value::Obj(name), ..] = args else {
        return None;
    };
    heap.instance(*obj)?;
    heap.string(*name)?;
    Some((*obj, heap.key(*name)))
}

fn native_has_field(heap: &mut Heap, args: &[Value]) -> Value {
    let found = field_target(heap, args)
        .and_then(|(obj, key)| heap.instance(obj)?.fields.get(key))
        .is_some();
    Value::Bool(found)
}

fn native_get_field(heap: &mut Heap, args: &[Value]) -> Value {
    field_target(heap, args)
        .and_then(|(obj, key)| heap.instance(obj)?.fields.get(key))
        .unwrap_or(Value::Nil)
}

fn native_set_field(heap: &mut Heap, args: &[Value]) -> Value {
    let (Some((obj, key)), Some(value)) = (field_target(heap, args), args.get(2)) else {
        return Value::Bool(false);
    };
    match heap.instance_mut(obj) {
        Some(instance) => {
            instance.fields.set(key, *value);
            Value::Bool(true)
        }
        None => Value::Bool(false),
    }
}

// --- Pure helpers ---

fn random_unit() -> f64 {
    rand::thread_rng().gen::<f64>()
}

// --- The Registry Definition ---

define_native_functions! {
    heap_natives: [
        ("clock", native_clock),
        ("sys_version", native_sys_version),
        ("is_instance", native_is_instance),
        ("has_field", native_has_field),
        ("get_field", native_get_field),
        ("set_field", native_set_field),
    ],
    nullary_pure_fn: [
        ("random", random_unit),
    ],
    unary_pure_fn: [
        ("sqrt", f64::sqrt),
        ("floor", f64::floor),
        ("abs", f64::abs),
    ]
}
