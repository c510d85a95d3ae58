//! Open-addressing hash table.
//!
//! Linear probing over a power-of-two capacity, min 8, doubled whenever
//! an insert would push the load factor past 0.75. Keys are interned
//! strings, so key comparison is identity comparison on the [`ObjRef`];
//! the key's FNV-1a hash is cached in the entry so probing and resizing
//! never need to consult the heap.
//!
//! Deletion leaves a tombstone (no key, sentinel value) that keeps probe
//! chains intact. Tombstones count toward the load factor and are
//! reusable by inserts; a resize re-probes only the live entries and
//! discards tombstones, recomputing the count from live entries alone so
//! dead slots never force premature growth.

use crate::object::ObjRef;
use crate::value::Value;

const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub(crate) key: Option<ObjRef>,
    pub(crate) hash: u32,
    pub(crate) value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        hash: 0,
        value: Value::Nil,
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value != Value::Nil
    }
}

/// Hash table keyed by interned-string identity.
#[derive(Debug, Default)]
pub struct Table {
    count: usize,
    pub(crate) entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    /// Live entries plus tombstones; this is the load-factor numerator.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for `key`. Returns the slot holding the key, or the first
    /// tombstone seen (reusable on insert), or the terminating empty
    /// slot when the key is absent.
    fn find_entry(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        tombstone.get_or_insert(index);
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Table::find_entry(&self.entries, key, hash);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    /// Insert or overwrite. Returns true when the key was not present
    /// (callers use this to detect assignment to undefined globals).
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * 4 > self.capacity() * 3 {
            self.grow();
        }
        let index = Table::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Replace the entry with a tombstone so probe chains stay intact.
    /// The count is deliberately not decremented.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Table::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry {
            key: None,
            hash: 0,
            value: Value::Bool(true),
        };
        true
    }

    /// Copy every live entry of `other` into `self` (used for copy-down
    /// method inheritance).
    pub fn add_all_from(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    /// Iterate the live entries.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Snapshot of the live entries with their cached hashes.
    pub fn live_entries(&self) -> Vec<(ObjRef, u32, Value)> {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.hash, e.value)))
            .collect()
    }

    fn grow(&mut self) {
        let capacity = (self.capacity() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Table::find_entry(&self.entries, key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}

/// FNV-1a, the hash cached in every interned string.
pub fn hash_str(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in chars.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
