//! Open-addressing hash table with linear probing and tombstones (§4.2).
//!
//! Keys are always interned string handles; values are arbitrary [`Value`]s.
//! Used for the VM's globals, a class's method table, and an instance's
//! field table. Every operation except [`Table::find_string`] takes the
//! key's hash as an explicit parameter (callers read it off the key's
//! `ObjString` via [`Heap::hash_of`]) rather than looking it up internally,
//! which would require a `Table` to borrow its own owning `Heap`.

use crate::object::{Handle, Heap};
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    /// `None` key + `Value::Nil` value is a never-used empty slot.
    /// `None` key + `Value::Bool(true)` value is a tombstone.
    key: Option<Handle>,
    hash: u32,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry { key: None, hash: 0, value: Value::Nil }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Walks probes starting at `hash % capacity`; returns the index of the
    /// matching key, the first tombstone seen (if no match precedes an
    /// empty slot), or the terminating empty slot itself.
    fn find_entry(entries: &[Entry], capacity: usize, key: Handle, hash: u32) -> usize {
        let mut index = (hash as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut new_count = 0;
        for entry in &self.entries {
            let Some(key) = entry.key else { continue };
            let idx = Self::find_entry(&new_entries, new_capacity, key, entry.hash);
            new_entries[idx] = Entry { key: Some(key), hash: entry.hash, value: entry.value };
            new_count += 1;
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Sets `key` (whose content hash is `hash`) to `value`. Returns `true`
    /// if `key` was not previously present (a fresh binding), `false` if an
    /// existing entry was overwritten.
    pub fn set(&mut self, key: Handle, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * TABLE_MAX_LOAD {
            let new_cap = grow_capacity(self.capacity());
            self.adjust_capacity(new_cap);
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key, hash);
        let entry = &mut self.entries[idx];
        let is_new_key = entry.key.is_none();
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry { key: Some(key), hash, value };
        is_new_key
    }

    pub fn get(&self, key: Handle, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key, hash);
        self.entries[idx].key.map(|_| self.entries[idx].value)
    }

    /// Deletes `key`, leaving a tombstone so later probes still skip past
    /// this slot. Returns `false` if the key was not present.
    pub fn delete(&mut self, key: Handle, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key, hash);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry { key: None, hash: 0, value: Value::Bool(true) };
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Copies every entry of `other` into `self`, used by `INHERIT` to seed
    /// a subclass's method table from its superclass (§4.4).
    pub fn add_all(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    /// The interning probe (§4.2): compares length, hash, and bytes against
    /// every live string key, independent of handle identity. Used only by
    /// the heap's intern table, where no handle exists yet for `s`.
    pub fn find_string(&self, heap: &Heap, s: &str, hash: u32) -> Option<Handle> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(k) => {
                    let obj_str = heap.get(k).as_string().expect("string table key is not a string");
                    if obj_str.hash == hash && obj_str.chars.as_ref() == s {
                        return Some(k);
                    }
                }
                None => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Drops any entry whose key object is not GC-marked; called on the
    /// heap's (weak) intern table before sweep so dead strings don't
    /// survive through a stale table entry. Takes a predicate rather than
    /// `&Heap` directly: the intern table is itself a field of `Heap`, so a
    /// caller holding `&mut self.strings` can't also pass `&self`.
    pub fn remove_white(&mut self, is_marked: &mut impl FnMut(Handle) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry { key: None, hash: 0, value: Value::Bool(true) };
                    self.count -= 1;
                }
            }
        }
    }

    /// Marks every key and value, pushing newly-marked objects onto the
    /// gray worklist via `mark_value`.
    pub fn mark(&self, mark_value: &mut impl FnMut(Value)) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                mark_value(Value::Object(key));
            }
            mark_value(entry.value);
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 {
        8
    } else {
        capacity * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Heap;
    use proptest::prelude::*;

    fn key(heap: &mut Heap, s: &str) -> (Handle, u32) {
        let h = heap.intern_string(s);
        (h, heap.hash_of(h))
    }

    #[test]
    fn set_reports_new_vs_replace() {
        let mut heap = Heap::new();
        let (k, hash) = key(&mut heap, "a");
        let mut table = Table::new();
        assert!(table.set(k, hash, Value::Number(1.0)));
        assert!(!table.set(k, hash, Value::Number(2.0)));
        assert_eq!(table.get(k, hash), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_then_get_misses() {
        let mut heap = Heap::new();
        let (k, hash) = key(&mut heap, "a");
        let mut table = Table::new();
        table.set(k, hash, Value::Number(1.0));
        assert!(table.delete(k, hash));
        assert_eq!(table.get(k, hash), None);
    }

    #[test]
    fn delete_of_absent_key_is_a_miss() {
        let mut heap = Heap::new();
        let (k, hash) = key(&mut heap, "a");
        let mut table = Table::new();
        assert!(!table.delete(k, hash));
    }

    #[test]
    fn tombstone_slot_is_reused_by_a_later_insert() {
        let mut heap = Heap::new();
        let (a, a_hash) = key(&mut heap, "a");
        let (b, b_hash) = key(&mut heap, "b");
        let mut table = Table::new();
        table.set(a, a_hash, Value::Bool(false));
        table.delete(a, a_hash);
        table.set(b, b_hash, Value::Bool(false));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(b, b_hash), Some(Value::Bool(false)));
    }

    proptest! {
        // Random insert/delete sequences: every live key must be
        // retrievable and `len()` must match the reference model's count,
        // regardless of how many resizes and tombstones accumulate.
        #[test]
        fn insert_delete_matches_a_reference_model(
            ops in prop::collection::vec((0u8..12, any::<bool>()), 0..500)
        ) {
            let mut heap = Heap::new();
            let keys: Vec<(Handle, u32)> =
                (0..12).map(|i| key(&mut heap, &format!("k{i}"))).collect();
            let mut table = Table::new();
            let mut model = std::collections::HashMap::new();
            for (i, should_insert) in ops {
                let (k, hash) = keys[i as usize];
                if should_insert {
                    table.set(k, hash, Value::Number(i as f64));
                    model.insert(i, i as f64);
                } else {
                    table.delete(k, hash);
                    model.remove(&i);
                }
            }
            prop_assert_eq!(table.len(), model.len());
            for (i, (k, hash)) in keys.iter().enumerate() {
                let expected = model.get(&(i as u8)).map(|v| Value::Number(*v));
                prop_assert_eq!(table.get(*k, *hash), expected);
            }
        }
    }
}
