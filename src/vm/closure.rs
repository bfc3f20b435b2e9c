// src/vm/closure.rs

use crate::memory::ObjRef;
use crate::value::Value;

/// Where a captured variable currently lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Upvalue {
    /// Still on the VM stack at this absolute slot.
    Open(usize),
    /// Moved off the stack when its frame returned or its scope ended.
    Closed(Value),
}

/// Heap payload for an upvalue. Open upvalues are chained through `next_open`
/// in descending slot order.
#[derive(Debug, Clone)]
pub struct UpvalueCell {
    pub upvalue: Upvalue,
    pub next_open: Option<ObjRef>,
}

impl UpvalueCell {
    pub fn open(slot: usize, next_open: Option<ObjRef>) -> Self {
        Self { upvalue: Upvalue::Open(slot), next_open }
    }

    pub fn open_slot(&self) -> Option<usize> {
        match self.upvalue {
            Upvalue::Open(slot) => Some(slot),
            Upvalue::Closed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

impl Closure {
    pub fn new(function: ObjRef, upvalue_count: usize) -> Self {
        Self { function, upvalues: Vec::with_capacity(upvalue_count) }
    }
}
