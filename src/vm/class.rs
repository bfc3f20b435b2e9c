// src/vm/class.rs

use crate::memory::ObjRef;
use crate::table::Table;
use crate::value::Value;

/// A class and its method table. Subclasses receive a copy of the superclass
/// methods when `Inherit` runs; there is no superclass pointer.
#[derive(Debug, Clone)]
pub struct Class {
    pub name: ObjRef,
    pub methods: Table,
}

impl Class {
    pub fn new(name: ObjRef) -> Self {
        Self { name, methods: Table::new() }
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: Table,
}

impl Instance {
    pub fn new(class: ObjRef) -> Self {
        Self { class, fields: Table::new() }
    }
}

/// A method read off an instance without being called right away.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}
