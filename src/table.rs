// src/table.rs

use crate::memory::ObjRef;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

/// A table key: an interned string handle together with its cached hash.
/// Keys compare by handle; the hash only picks the starting slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub obj: ObjRef,
    pub hash: u32,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<Key>,
    value: Value,
}

impl Entry {
    const VACANT: Entry = Entry { key: None, value: Value::Empty };
    const TOMBSTONE_VALUE: Value = Value::Bool(true);

    fn is_vacant(&self) -> bool {
        self.key.is_none() && self.value == Value::Empty
    }
}

/// Open-addressing hash table with linear probing and tombstone deletion.
///
/// Backs string interning, globals, instance fields and class method tables.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    // Live entries plus tombstones, so the load factor also bounds probe length.
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: Key) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[find_slot(&self.entries, key)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or overwrites. Returns true when the key was not present before.
    pub fn set(&mut self, key: Key, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * TABLE_MAX_LOAD {
            let capacity = grow_capacity(self.capacity());
            self.adjust_capacity(capacity);
        }

        let slot = find_slot(&self.entries, key);
        let entry = &mut self.entries[slot];
        let is_new_key = entry.key.is_none();
        // Reusing a tombstone does not change the count.
        if entry.is_vacant() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    /// Replaces the entry with a tombstone so later probes keep walking.
    pub fn delete(&mut self, key: Key) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = find_slot(&self.entries, key);
        let entry = &mut self.entries[slot];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Entry::TOMBSTONE_VALUE;
        true
    }

    /// Copies every live entry of `from` into `to`, overwriting collisions.
    pub fn add_all(from: &Table, to: &mut Table) {
        for (key, value) in from.iter() {
            to.set(key, value);
        }
    }

    /// Content-based probe used by string interning. `matches` decides whether
    /// the candidate key holds the wanted bytes.
    pub fn find_interned(&self, hash: u32, mut matches: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if entry.is_vacant() => return None,
                None => {}
                Some(key) if key.hash == hash && matches(key.obj) => return Some(key.obj),
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Deletes every entry whose key is not marked.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !is_marked(key.obj) {
                    entry.key = None;
                    entry.value = Entry::TOMBSTONE_VALUE;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::VACANT; capacity];
        self.count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let slot = find_slot(&entries, key);
                entries[slot] = *entry;
                self.count += 1;
            }
        }
        self.entries = entries;
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < MIN_CAPACITY { MIN_CAPACITY } else { capacity * 2 }
}

// Returns the slot holding `key`, or the slot it should be inserted into
// (the first tombstone passed, if any).
fn find_slot(entries: &[Entry], key: Key) -> usize {
    let mask = entries.len() - 1;
    let mut index = key.hash as usize & mask;
    let mut tombstone = None;
    loop {
        let entry = &entries[index];
        match entry.key {
            None if entry.is_vacant() => return tombstone.unwrap_or(index),
            None => {
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
            Some(k) if k.obj == key.obj => return index,
            Some(_) => {}
        }
        index = (index + 1) & mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests only need distinct handles; a constant hash forces every key into
    // one probe chain.
    fn key(i: u32, hash: u32) -> Key {
        Key { obj: ObjRef::from_index(i), hash }
    }

    #[test]
    fn test_set_get_delete() {
        let mut table = Table::new();
        let (k1, k2, k3) = (key(1, 11), key(2, 22), key(3, 33));

        assert!(!table.delete(k1));
        assert!(table.set(k1, Value::Number(10.0)));
        assert!(table.set(k2, Value::Number(20.0)));
        assert!(table.set(k3, Value::Number(30.0)));
        assert!(!table.set(k3, Value::Number(31.0)));

        assert!(table.delete(k3));
        assert!(!table.delete(k3));
        assert_eq!(table.get(k3), None);
        assert_eq!(table.get(k1), Some(Value::Number(10.0)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_tombstones_keep_probe_chain_intact() {
        let mut table = Table::new();
        let keys: Vec<Key> = (0..5).map(|i| key(i, 7)).collect();
        for (i, k) in keys.iter().enumerate() {
            table.set(*k, Value::Number(i as f64));
        }

        // Deleting from the middle of the chain must not hide later keys.
        assert!(table.delete(keys[1]));
        assert!(table.delete(keys[2]));
        assert_eq!(table.get(keys[4]), Some(Value::Number(4.0)));

        // Re-inserting reuses a tombstone rather than appending.
        let count_before = table.count;
        assert!(table.set(keys[2], Value::Nil));
        assert_eq!(table.count, count_before);
        assert_eq!(table.get(keys[2]), Some(Value::Nil));
        assert_eq!(table.get(keys[1]), None);
    }

    #[test]
    fn test_grows_and_keeps_entries() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(i, i.wrapping_mul(2654435761)), Value::Number(i as f64));
        }
        assert!(table.capacity() >= 128);
        for i in 0..100 {
            assert_eq!(table.get(key(i, i.wrapping_mul(2654435761))), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn test_add_all_copies_live_entries() {
        let mut from = Table::new();
        let mut to = Table::new();
        from.set(key(1, 1), Value::Bool(true));
        from.set(key(2, 2), Value::Bool(false));
        from.delete(key(2, 2));
        to.set(key(1, 1), Value::Nil);

        Table::add_all(&from, &mut to);
        assert_eq!(to.get(key(1, 1)), Some(Value::Bool(true)));
        assert_eq!(to.get(key(2, 2)), None);
    }

    #[test]
    fn test_remove_unmarked() {
        let mut table = Table::new();
        for i in 0..6 {
            table.set(key(i, 3), Value::Nil);
        }
        table.remove_unmarked(|obj| obj.index() % 2 == 0);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(key(4, 3)), Some(Value::Nil));
        assert_eq!(table.get(key(5, 3)), None);
    }

    #[test]
    fn test_find_interned_skips_tombstones() {
        let mut table = Table::new();
        table.set(key(1, 9), Value::Nil);
        table.set(key(2, 9), Value::Nil);
        table.delete(key(1, 9));
        assert_eq!(table.find_interned(9, |obj| obj.index() == 2), Some(ObjRef::from_index(2)));
        assert_eq!(table.find_interned(9, |_| false), None);
        assert_eq!(Table::new().find_interned(9, |_| true), None);
    }
}
