// File: src/table.rs
//
// The single hash-table shape shared by globals, instance fields, class
// methods and the string intern table: open addressing, linear probing,
// tombstone deletion, 0.75 load-factor growth.

use crate::gc::Heap;
use crate::value::{ObjRef, Value};

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

#[derive(Clone)]
enum Slot {
    Empty,
    /// A deleted entry. Kept (rather than cleared) so later probe chains
    /// that hopped over it still terminate correctly.
    Tombstone,
    Occupied { key: ObjRef, hash: u32, value: Value },
}

/// `count` includes live entries *and* tombstones, matching the spec: both
/// count against the load factor, since both occupy a probe slot.
#[derive(Clone)]
pub struct Table {
    slots: Vec<Slot>,
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self { slots: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Occupied { .. })).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Linear probe starting at `hash % capacity`. Returns the index of the
    /// slot holding `key` if present, else the first `Empty`-or-earliest
    /// `Tombstone` slot a fresh insert of `key` should use.
    fn find_slot(&self, key: ObjRef, hash: u32) -> usize {
        let cap = self.capacity();
        let mut index = (hash as usize) % cap;
        let mut tombstone: Option<usize> = None;
        loop {
            match &self.slots[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied { key: k, .. } if *k == key => return index,
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) % cap;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let old = std::mem::replace(&mut self.slots, vec![]);
        self.slots = (0..new_capacity).map(|_| Slot::Empty).collect();
        self.count = 0;
        for slot in old {
            if let Slot::Occupied { key, hash, value } = slot {
                self.insert_no_grow(key, hash, value);
            }
        }
    }

    fn ensure_capacity(&mut self) {
        if self.slots.is_empty() {
            self.slots = (0..INITIAL_CAPACITY).map(|_| Slot::Empty).collect();
            return;
        }
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow(self.capacity() * 2);
        }
    }

    fn insert_no_grow(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        let index = self.find_slot(key, hash);
        let is_new = !matches!(self.slots[index], Slot::Occupied { .. });
        if is_new && !matches!(self.slots[index], Slot::Tombstone) {
            self.count += 1;
        }
        self.slots[index] = Slot::Occupied { key, hash, value };
        is_new
    }

    /// Sets `key = value`, growing first if needed. Returns `true` if this
    /// created a new entry (as opposed to overwriting one).
    pub fn set(&mut self, heap: &Heap, key: ObjRef, value: Value) -> bool {
        self.ensure_capacity();
        let hash = heap.get_string(key).hash;
        self.insert_no_grow(key, hash, value)
    }

    /// Looks up `key`, fetching its hash from the heap. Prefer
    /// `get_with_hash` in hot paths (VM dispatch) where the hash is already
    /// on hand from a constant-pool string.
    pub fn get_by(&self, heap: &Heap, key: ObjRef) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        let hash = heap.get_string(key).hash;
        self.get_with_hash(key, hash)
    }

    pub fn get_with_hash(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        let index = self.find_slot(key, hash);
        match &self.slots[index] {
            Slot::Occupied { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Deletes `key`, replacing its slot with a tombstone so later probes
    /// that skipped over it on the way to a different key still find it.
    pub fn delete(&mut self, heap: &Heap, key: ObjRef) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let hash = heap.get_string(key).hash;
        let index = self.find_slot(key, hash);
        if matches!(self.slots[index], Slot::Occupied { .. }) {
            self.slots[index] = Slot::Tombstone;
            true
        } else {
            false
        }
    }

    /// Looks up a string by its raw bytes and hash directly, without
    /// requiring an already-interned `ObjRef` for it. Used only by the
    /// string intern table.
    pub fn find_string(&self, heap: &Heap, bytes: &str, hash: u32) -> Option<ObjRef> {
        if self.slots.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let mut index = (hash as usize) % cap;
        loop {
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Occupied { key, hash: h, .. } if *h == hash => {
                    if heap.get_string(*key).s == bytes {
                        return Some(*key);
                    }
                }
                _ => {}
            }
            index = (index + 1) % cap;
        }
    }

    /// Iterates live `(key, value)` pairs. Used by GC marking and by
    /// debugging/printing.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Removes every entry whose key is not in `keep`. Used to weaken the
    /// string intern table before sweep frees unmarked strings.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for slot in &mut self.slots {
            if let Slot::Occupied { key, .. } = slot {
                if !keep(*key) {
                    *slot = Slot::Tombstone;
                }
            }
        }
    }
}
