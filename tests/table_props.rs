// tests/table_props.rs

//! Property-based tests for the hash table and string interning.
//!
//! Keys are built with a handful of distinct hashes so that most of them
//! collide and share probe chains.

use lox_vm::table::{Key, Table};
use lox_vm::{Heap, ObjRef, Value};
use proptest::prelude::*;
use std::collections::HashMap;

fn colliding_key(id: u32) -> Key {
    Key { obj: ObjRef::from_index(id), hash: id % 3 }
}

#[derive(Debug, Clone)]
enum Op {
    Set(u32, f64),
    Delete(u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..40, -1000.0f64..1000.0).prop_map(|(id, v)| Op::Set(id, v)),
        (0u32..40).prop_map(Op::Delete),
    ]
}

// =============================================================================
// Tombstones preserve probe chains
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Insert N keys, delete a subset, re-insert part of it: every key that
    /// should be live is found with its latest value, and no other key is.
    #[test]
    fn live_keys_survive_delete_and_reinsert(
        n in 1u32..64,
        deleted in prop::collection::vec(any::<bool>(), 64),
        reinserted in prop::collection::vec(any::<bool>(), 64),
    ) {
        let mut table = Table::new();
        for id in 0..n {
            prop_assert!(table.set(colliding_key(id), Value::Number(id as f64)));
        }
        for id in (0..n).filter(|&id| deleted[id as usize]) {
            prop_assert!(table.delete(colliding_key(id)));
            prop_assert_eq!(table.get(colliding_key(id)), None);
        }
        for id in (0..n).filter(|&id| deleted[id as usize] && reinserted[id as usize]) {
            prop_assert!(table.set(colliding_key(id), Value::Number(-(id as f64))));
        }

        let mut live = 0;
        for id in 0..n {
            let expected = match (deleted[id as usize], reinserted[id as usize]) {
                (false, _) => Some(Value::Number(id as f64)),
                (true, true) => Some(Value::Number(-(id as f64))),
                (true, false) => None,
            };
            live += usize::from(expected.is_some());
            prop_assert_eq!(table.get(colliding_key(id)), expected);
        }
        prop_assert_eq!(table.len(), live);
    }

    /// Any interleaving of sets and deletes agrees with a std HashMap.
    #[test]
    fn matches_reference_map(ops in prop::collection::vec(op(), 0..200)) {
        let mut table = Table::new();
        let mut reference = HashMap::new();
        for op in ops {
            match op {
                Op::Set(id, v) => {
                    let was_new = table.set(colliding_key(id), Value::Number(v));
                    prop_assert_eq!(was_new, reference.insert(id, v).is_none());
                }
                Op::Delete(id) => {
                    prop_assert_eq!(table.delete(colliding_key(id)), reference.remove(&id).is_some());
                }
            }
        }
        for id in 0u32..40 {
            prop_assert_eq!(table.get(colliding_key(id)), reference.get(&id).map(|&v| Value::Number(v)));
        }
        prop_assert_eq!(table.len(), reference.len());
    }
}

// =============================================================================
// Interning identity
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Equal contents always map to the same handle, however the text was built.
    #[test]
    fn equal_text_interns_to_one_handle(text in "[a-zA-Z0-9 _]{0,24}", split in 0usize..25) {
        let mut heap = Heap::new();
        let first = heap.intern(&text);
        let cut = text.char_indices().map(|(i, _)| i).nth(split).unwrap_or(text.len());
        let built = format!("{}{}", &text[..cut], &text[cut..]);
        let second = heap.take_string(built);
        prop_assert_eq!(first, second);
        prop_assert_eq!(heap.interned_count(), 1);
        prop_assert_eq!(heap.str(first), text.as_str());
    }

    /// Distinct contents never share a handle.
    #[test]
    fn distinct_text_interns_to_distinct_handles(words in prop::collection::hash_set("[a-z]{1,8}", 1..30)) {
        let mut heap = Heap::new();
        let handles: Vec<_> = words.iter().map(|w| heap.intern(w)).collect();
        for (i, a) in handles.iter().enumerate() {
            for b in &handles[i + 1..] {
                prop_assert_ne!(a, b);
            }
        }
        prop_assert_eq!(heap.interned_count(), words.len());
        for word in &words {
            prop_assert_eq!(heap.find_interned(word).map(|s| heap.str(s).to_string()), Some(word.clone()));
        }
    }
}
