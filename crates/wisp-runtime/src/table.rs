//! Open-addressed, linear-probe hash table used for both the string
//! interning table and the globals table, per the base spec's §4.5 (both
//! "share the same open-addressed linear-probe implementation").
//!
//! Keys are always interned string references; content comparison is
//! only ever needed at intern time ([`Table::find_string`]), everywhere
//! else key equality is reference identity (`ObjRef` equality). Every
//! entry caches its key's hash directly (mirroring `ObjString` caching
//! its own hash) so that table operations never need to dereference the
//! heap to recompute it — which matters because the interning table is
//! itself a field of [`crate::heap::Heap`], and borrowing the whole heap
//! back out of a method already borrowing one of its fields would not
//! type-check.

use crate::heap::{Heap, ObjRef};
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

/// Sentinel value stored in a tombstone's `value` slot, per the base
/// spec: "Deletion leaves a tombstone (key = null, value = Bool(true))."
fn tombstone_marker() -> Value {
    Value::Bool(true)
}

pub struct Table {
    entries: Vec<Entry>,
    /// Live entries only (tombstones are not counted here, but *are*
    /// counted against the load factor when deciding to grow).
    count: usize,
    tombstones: usize,
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
            tombstones: 0,
        }
    }

    pub fn approx_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterate over live `(key, value)` pairs — used by the GC to mark
    /// every global name/value and every class method/instance field.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Returns the index of the matching live entry, the first tombstone
    /// seen along the probe sequence, or the first truly empty slot —
    /// exactly the three outcomes the base spec's `find_entry` describes.
    fn find_entry_index(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
        let cap = entries.len();
        let mut index = (hash as usize) % cap;
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value == tombstone_marker() {
                        if first_tombstone.is_none() {
                            first_tombstone = Some(index);
                        }
                    } else {
                        return first_tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {
                    // Non-matching key (even with a colliding hash): keep probing.
                }
            }
            index = (index + 1) % cap;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![
            Entry {
                key: None,
                hash: 0,
                value: Value::Nil,
            };
            new_capacity
        ];
        self.count = 0;
        self.tombstones = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let idx = Self::find_entry_index(&new_entries, key, entry.hash);
                new_entries[idx] = entry;
                self.count += 1;
            }
        }
        self.entries = new_entries;
    }

    fn ensure_capacity(&mut self) {
        if self.entries.is_empty() {
            self.grow(8);
            return;
        }
        let projected = self.count + self.tombstones + 1;
        if projected as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR {
            self.grow(self.capacity() * 2);
        }
    }

    /// Returns `true` iff a brand-new key was inserted (not an update of
    /// an existing key), per the base spec's `set` contract. `hash` is
    /// the key string's cached FNV-1a hash (`ObjString::hash`).
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        self.ensure_capacity();
        let idx = Self::find_entry_index(&self.entries, key, hash);
        let is_new_key = self.entries[idx].key.is_none();
        if is_new_key {
            if self.entries[idx].value == tombstone_marker() {
                self.tombstones -= 1;
            }
            self.count += 1;
        }
        self.entries[idx] = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new_key
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_entry_index(&self.entries, key, hash);
        self.entries[idx].key.map(|_| self.entries[idx].value)
    }

    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find_entry_index(&self.entries, key, hash);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry {
            key: None,
            hash: 0,
            value: tombstone_marker(),
        };
        self.count -= 1;
        self.tombstones += 1;
        true
    }

    /// Probe by byte content rather than identity — the only place
    /// content comparison matters, used to canonicalize a freshly scanned
    /// string literal/identifier at intern time before it has an `ObjRef`
    /// of its own yet. Needs `heap` to read the *existing* candidates'
    /// bytes back out; this is safe to call with `&heap.strings` and
    /// `&heap` together because both borrows here are shared.
    pub fn find_string(&self, heap: &Heap, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.entries.len();
        let mut index = (hash as usize) % cap;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if entry.value != tombstone_marker() => return None,
                Some(k) => {
                    if entry.hash == hash && heap.get_string(k).chars.as_ref() == chars {
                        return Some(k);
                    }
                }
                _ => {}
            }
            index = (index + 1) % cap;
        }
    }

    /// Weak-reference fix-up: remove any entry whose key object is still
    /// white (unreferenced) after tracing. Called only on the heap's
    /// intern table, between mark and sweep.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry {
                        key: None,
                        hash: 0,
                        value: tombstone_marker(),
                    };
                    self.count -= 1;
                    self.tombstones += 1;
                }
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::fnv1a_hash;

    #[test]
    fn set_get_delete_round_trip() {
        let mut heap = Heap::new();
        let key = heap.intern_str("x");
        let hash = heap.get_string(key).hash;
        let mut table = Table::new();
        assert!(table.set(key, hash, Value::Number(1.0)));
        assert_eq!(table.get(key, hash), Some(Value::Number(1.0)));
        assert!(!table.set(key, hash, Value::Number(2.0)));
        assert_eq!(table.get(key, hash), Some(Value::Number(2.0)));
        assert!(table.delete(key, hash));
        assert_eq!(table.get(key, hash), None);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            let name = format!("var{i}");
            let key = heap.intern_str(&name);
            let hash = heap.get_string(key).hash;
            table.set(key, hash, Value::Number(i as f64));
        }
        assert_eq!(table.len(), 100);
        let k50 = heap.intern_str("var50");
        assert_eq!(table.get(k50, fnv1a_hash(b"var50")), Some(Value::Number(50.0)));
    }

    #[test]
    fn find_string_probes_by_content() {
        let mut heap = Heap::new();
        let a = heap.intern_str("shared");
        let hash = heap.get_string(a).hash;
        let mut table = Table::new();
        table.set(a, hash, Value::Nil);
        assert_eq!(table.find_string(&heap, "shared", hash), Some(a));
        assert_eq!(table.find_string(&heap, "other", fnv1a_hash(b"other")), None);
    }
}
