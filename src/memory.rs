// src/memory.rs

use std::mem::size_of;

use tracing::debug;

use crate::config::VmConfig;
use crate::table::{Key, Table};
use crate::value::Value;
use crate::vm::class::{BoundMethod, Class, Instance};
use crate::vm::closure::{Closure, Upvalue, UpvalueCell};
use crate::vm::function::Function;
use crate::vm::natives::Native;

// --- Core Data Structures ---

/// Handle to a heap object: the index of its arena slot. Two handles are equal
/// exactly when they name the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn from_index(index: u32) -> Self {
        ObjRef(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An immutable, interned string with its cached FNV-1a hash.
#[derive(Debug, Clone)]
pub struct ObjString {
    chars: Box<str>,
    pub hash: u32,
}

impl ObjString {
    fn new(chars: Box<str>) -> Self {
        let hash = hash_string(&chars);
        Self { chars, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.chars
    }
}

pub fn hash_string(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug, Clone)]
pub enum HeapObject {
    String(ObjString),
    Function(Function),
    Closure(Closure),
    Upvalue(UpvalueCell),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    Native(Native),
    /// A reclaimed slot; holds the next entry of the free list.
    Free(Option<ObjRef>),
}

impl HeapObject {
    /// Approximate bytes owned by this object, used to pace the collector.
    fn size(&self) -> usize {
        let owned = match self {
            HeapObject::String(s) => s.chars.len(),
            HeapObject::Function(f) => {
                f.chunk.code.len() + f.chunk.constants.len() * size_of::<Value>() + f.chunk.line_entries() * 2 * size_of::<usize>()
            }
            HeapObject::Closure(c) => c.upvalues.len() * size_of::<ObjRef>(),
            HeapObject::Class(c) => c.methods.allocated_bytes(),
            HeapObject::Instance(i) => i.fields.allocated_bytes(),
            _ => 0,
        };
        size_of::<HeapObject>() + owned
    }

    /// Pushes every value this object keeps alive.
    fn push_children(&self, out: &mut Vec<Value>) {
        match self {
            HeapObject::String(_) | HeapObject::Native(_) | HeapObject::Free(_) => {}
            HeapObject::Function(f) => {
                out.extend(f.name.map(Value::Obj));
                out.extend_from_slice(&f.chunk.constants);
            }
            HeapObject::Closure(c) => {
                out.push(Value::Obj(c.function));
                out.extend(c.upvalues.iter().copied().map(Value::Obj));
            }
            // An open upvalue points at a stack slot, which is already a root.
            HeapObject::Upvalue(cell) => {
                if let Upvalue::Closed(value) = cell.upvalue {
                    out.push(value);
                }
            }
            HeapObject::Class(c) => {
                out.push(Value::Obj(c.name));
                push_table(&c.methods, out);
            }
            HeapObject::Instance(i) => {
                out.push(Value::Obj(i.class));
                push_table(&i.fields, out);
            }
            HeapObject::BoundMethod(b) => {
                out.push(b.receiver);
                out.push(Value::Obj(b.method));
            }
        }
    }
}

fn push_table(table: &Table, out: &mut Vec<Value>) {
    for (key, value) in table.iter() {
        out.push(Value::Obj(key.obj));
        out.push(value);
    }
}

// --- GC State Management ---

#[derive(Debug, Clone, Copy, PartialEq)]
enum GcColor { White, Gray, Black }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub live_objects: usize,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub collections: usize,
}

// --- The Heap with a stop-the-world mark-sweep collector ---

/// Arena owning every script object.
///
/// Allocation never collects by itself: whoever can enumerate the roots (the VM
/// while running, the compiler while compiling) checks [`Heap::should_collect`]
/// before allocating and then calls [`Heap::collect_full`] with the complete
/// root set. Anything allocated but not yet reachable from those roots must not
/// live across the next allocation.
pub struct Heap {
    objects: Vec<HeapObject>,
    colors: Vec<GcColor>,
    free_list_head: Option<ObjRef>,
    // Gray stack: marked objects whose children are not traced yet.
    worklist: Vec<ObjRef>,
    scratch: Vec<Value>,
    // Weak: entries are evicted once their string is unreachable.
    strings: Table,

    bytes_allocated: usize,
    next_gc: usize,
    initial_threshold: usize,
    grow_factor: usize,
    stress: bool,
    collections: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_config(&VmConfig::default())
    }

    pub fn with_config(config: &VmConfig) -> Self {
        Self {
            objects: Vec::new(),
            colors: Vec::new(),
            free_list_head: None,
            worklist: Vec::new(),
            scratch: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: config.gc_initial_threshold,
            initial_threshold: config.gc_initial_threshold,
            grow_factor: config.gc_grow_factor.max(1),
            stress: config.gc_stress,
            collections: 0,
        }
    }

    /// True when the owner of the roots should run a collection before its
    /// next allocation.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Places an object in the arena. Never triggers a collection.
    pub fn register(&mut self, obj: HeapObject) -> ObjRef {
        self.bytes_allocated += obj.size();

        if let Some(free) = self.free_list_head {
            let slot = &mut self.objects[free.index()];
            self.free_list_head = match slot {
                HeapObject::Free(next) => *next,
                _ => None,
            };
            *slot = obj;
            self.colors[free.index()] = GcColor::White;
            free
        } else {
            self.objects.push(obj);
            self.colors.push(GcColor::White);
            ObjRef((self.objects.len() - 1) as u32)
        }
    }

    // --- Strings ---

    /// Returns the canonical string object for `text`, allocating it on first use.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        match self.find_interned(text) {
            Some(existing) => existing,
            None => self.insert_string(ObjString::new(text.into())),
        }
    }

    /// Like [`Heap::intern`] but reuses the buffer of an owned string.
    pub fn take_string(&mut self, text: String) -> ObjRef {
        match self.find_interned(&text) {
            Some(existing) => existing,
            None => self.insert_string(ObjString::new(text.into_boxed_str())),
        }
    }

    /// The interned string for `text`, if one exists. Never allocates.
    pub fn find_interned(&self, text: &str) -> Option<ObjRef> {
        let objects = &self.objects;
        self.strings.find_interned(hash_string(text), |candidate| {
            matches!(&objects[candidate.index()], HeapObject::String(s) if s.as_str() == text)
        })
    }

    fn insert_string(&mut self, string: ObjString) -> ObjRef {
        let hash = string.hash;
        let obj = self.register(HeapObject::String(string));
        self.strings.set(Key { obj, hash }, Value::Nil);
        obj
    }

    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    /// Table key for an interned string handle.
    pub fn key(&self, obj: ObjRef) -> Key {
        let hash = self.string(obj).map_or(0, |s| s.hash);
        Key { obj, hash }
    }

    pub fn intern_key(&mut self, text: &str) -> Key {
        let obj = self.intern(text);
        self.key(obj)
    }

    // --- Accessors ---

    pub fn get(&self, obj: ObjRef) -> Option<&HeapObject> {
        self.objects.get(obj.index())
    }

    pub fn get_mut(&mut self, obj: ObjRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(obj.index())
    }

    pub fn string(&self, obj: ObjRef) -> Option<&ObjString> {
        match self.get(obj) {
            Some(HeapObject::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The contents of a string object, or "" for anything else.
    pub fn str(&self, obj: ObjRef) -> &str {
        self.string(obj).map_or("", ObjString::as_str)
    }

    pub fn value_as_str(&self, value: Value) -> Option<&str> {
        value.as_obj().and_then(|obj| self.string(obj)).map(ObjString::as_str)
    }

    pub fn function(&self, obj: ObjRef) -> Option<&Function> {
        match self.get(obj) {
            Some(HeapObject::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn closure(&self, obj: ObjRef) -> Option<&Closure> {
        match self.get(obj) {
            Some(HeapObject::Closure(c)) => Some(c),
            _ => None,
        }
    }

    pub fn closure_mut(&mut self, obj: ObjRef) -> Option<&mut Closure> {
        match self.get_mut(obj) {
            Some(HeapObject::Closure(c)) => Some(c),
            _ => None,
        }
    }

    pub fn upvalue(&self, obj: ObjRef) -> Option<&UpvalueCell> {
        match self.get(obj) {
            Some(HeapObject::Upvalue(u)) => Some(u),
            _ => None,
        }
    }

    pub fn upvalue_mut(&mut self, obj: ObjRef) -> Option<&mut UpvalueCell> {
        match self.get_mut(obj) {
            Some(HeapObject::Upvalue(u)) => Some(u),
            _ => None,
        }
    }

    pub fn class(&self, obj: ObjRef) -> Option<&Class> {
        match self.get(obj) {
            Some(HeapObject::Class(c)) => Some(c),
            _ => None,
        }
    }

    pub fn class_mut(&mut self, obj: ObjRef) -> Option<&mut Class> {
        match self.get_mut(obj) {
            Some(HeapObject::Class(c)) => Some(c),
            _ => None,
        }
    }

    pub fn instance(&self, obj: ObjRef) -> Option<&Instance> {
        match self.get(obj) {
            Some(HeapObject::Instance(i)) => Some(i),
            _ => None,
        }
    }

    pub fn instance_mut(&mut self, obj: ObjRef) -> Option<&mut Instance> {
        match self.get_mut(obj) {
            Some(HeapObject::Instance(i)) => Some(i),
            _ => None,
        }
    }

    pub fn is_live(&self, obj: ObjRef) -> bool {
        !matches!(self.get(obj), Some(HeapObject::Free(_)) | None)
    }

    pub fn alive_count(&self) -> usize {
        self.objects
            .iter()
            .filter(|o| !matches!(o, HeapObject::Free(_)))
            .count()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.alive_count(),
            bytes_allocated: self.bytes_allocated,
            next_gc: self.next_gc,
            collections: self.collections,
        }
    }

    // --- Collection ---

    /// Runs a full mark-sweep cycle. `roots` must contain every value the
    /// caller can still reach without going through the heap.
    pub fn collect_full(&mut self, roots: &[Value]) {
        let before = self.bytes_allocated;
        let objects_before = self.alive_count();

        for &root in roots {
            self.mark_value(root);
        }
        self.trace_references();

        // Interned strings nobody references must not survive through the
        // intern table alone.
        let colors = &self.colors;
        self.strings.remove_unmarked(|obj| colors[obj.index()] != GcColor::White);

        self.sweep();
        self.collections += 1;
        self.next_gc = (self.bytes_allocated * self.grow_factor).max(self.initial_threshold);

        debug!(
            before,
            after = self.bytes_allocated,
            freed_objects = objects_before - self.alive_count(),
            next_gc = self.next_gc,
            "gc cycle complete"
        );
    }

    /// Marks a value if it's a white object reference.
    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    /// Marks an object by its handle if it's white. Idempotent.
    fn mark_object(&mut self, obj: ObjRef) {
        let index = obj.index();
        if index >= self.colors.len() || self.colors[index] != GcColor::White {
            return;
        }
        if matches!(self.objects[index], HeapObject::Free(_)) {
            return;
        }
        self.colors[index] = GcColor::Gray;
        self.worklist.push(obj);
    }

    fn trace_references(&mut self) {
        let mut children = std::mem::take(&mut self.scratch);
        while let Some(obj) = self.worklist.pop() {
            self.objects[obj.index()].push_children(&mut children);
            for child in children.drain(..) {
                self.mark_value(child);
            }
            self.colors[obj.index()] = GcColor::Black;
        }
        self.scratch = children;
    }

    fn sweep(&mut self) {
        let mut retained = 0;
        for index in 0..self.objects.len() {
            if matches!(self.objects[index], HeapObject::Free(_)) {
                continue;
            }
            if self.colors[index] == GcColor::White {
                self.objects[index] = HeapObject::Free(self.free_list_head);
                self.free_list_head = Some(ObjRef(index as u32));
            } else {
                // Alive: reset its colour for the next cycle.
                self.colors[index] = GcColor::White;
                retained += self.objects[index].size();
            }
        }
        self.bytes_allocated = retained;
    }

    /// Releases every object at once (VM teardown).
    pub fn free_all(&mut self) {
        self.objects.clear();
        self.colors.clear();
        self.free_list_head = None;
        self.worklist.clear();
        self.strings = Table::new();
        self.bytes_allocated = 0;
        self.next_gc = self.initial_threshold;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_returns_same_handle() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.take_string(String::from("hel") + "lo");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.interned_count(), 2);
        assert_eq!(heap.str(a), "hello");
    }

    #[test]
    fn test_fnv_hash() {
        assert_eq!(hash_string(""), 2166136261);
        assert_ne!(hash_string("a"), hash_string("b"));
    }

    #[test]
    fn test_unreachable_strings_leave_intern_table() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        heap.intern("dropped");
        heap.collect_full(&[Value::Obj(kept)]);

        assert_eq!(heap.interned_count(), 1);
        assert_eq!(heap.alive_count(), 1);
        // Re-interning allocates a fresh object in the freed slot.
        let again = heap.intern("dropped");
        assert_eq!(heap.str(again), "dropped");
        assert_eq!(heap.intern("kept"), kept);
    }

    #[test]
    fn test_free_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.intern("a");
        heap.collect_full(&[]);
        assert!(!heap.is_live(a));
        let b = heap.intern("b");
        assert_eq!(a, b);
        assert_eq!(heap.alive_count(), 1);
    }

    #[test]
    fn test_threshold_follows_retained_bytes() {
        let config = VmConfig::default().with_gc_threshold(0).with_gc_grow_factor(2);
        let mut heap = Heap::with_config(&config);
        let s = heap.intern("some string");
        assert!(heap.should_collect());
        heap.collect_full(&[Value::Obj(s)]);
        let stats = heap.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.next_gc, stats.bytes_allocated * 2);
        assert!(!heap.should_collect());
    }
}
