// src/vm/function.rs

use crate::memory::ObjRef;
use crate::vm::chunk::Chunk;

#[derive(Debug, Clone, Default)]
pub struct Function {
    pub arity: usize, // Number of parameters the function expects.
    pub chunk: Chunk,
    pub name: Option<ObjRef>, // None for the top-level script.
    pub upvalue_count: usize,
}

impl Function {
    pub fn new(name: Option<ObjRef>) -> Self {
        Self {
            arity: 0,
            chunk: Chunk::new(),
            name,
            upvalue_count: 0,
        }
    }
}
