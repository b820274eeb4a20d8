use super::object::Object;
use super::ptr::Gc;
use crate::vm::value::Value;

/// Largest fraction of the capacity that may be occupied before growing.
const MAX_LOAD: f64 = 0.75;

/// Capacity used by the first growth of an empty table.
const MIN_CAPACITY: usize = 8;

/// Open-addressed hash table with linear probing, keyed by interned strings.
///
/// Keys compare by pointer identity, which interning makes equivalent to
/// content equality. A deleted slot leaves a tombstone (`key` empty, value
/// `true`) so probe chains stay intact; tombstones are reclaimed by `set`
/// and dropped whenever the table grows.
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Occupied slots, tombstones included.
    count: usize,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    key: Option<Gc<Object>>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: None,
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live key/value pairs.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn get(&self, key: Gc<Object>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or overwrites. Returns `true` when the key was not present.
    pub fn set(&mut self, key: Gc<Object>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow();
        }

        let index = Self::find_entry(&self.entries, key);
        let is_new = self.entries[index].key.is_none();
        // Reusing a tombstone does not change the occupied count.
        if is_new && !self.entries[index].is_tombstone() {
            self.count += 1;
        }
        self.entries[index].key = Some(key);
        self.entries[index].value = value;
        is_new
    }

    /// Removes a key, leaving a tombstone. Returns `true` if it was present.
    pub fn remove(&mut self, key: Gc<Object>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Copies every live entry into `to`, overwriting existing keys. Used
    /// for copy-down inheritance.
    pub fn add_all(&self, to: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                to.set(key, entry.value);
            }
        }
    }

    /// Content-based lookup used by string interning: finds the already
    /// interned key equal to `chars`, if any.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<Gc<Object>> {
        if self.count == 0 {
            return None;
        }

        let mut index = hash as usize % self.capacity();
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    let string = key.as_string();
                    if string.hash == hash && string.as_str() == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) % self.capacity();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gc<Object>, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Deletes every entry whose key string was not marked during tracing.
    /// Runs between the trace and sweep phases so the sweep can free the
    /// strings without leaving dangling table entries.
    pub(super) fn remove_white(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !key.marked() {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    /// Probes for `key` starting at its hash slot. Returns the index of the
    /// matching entry, or of the slot an insertion should use (the first
    /// tombstone seen, otherwise the terminating empty slot).
    fn find_entry(entries: &[Entry], key: Gc<Object>) -> usize {
        let capacity = entries.len();
        let mut index = key.as_string().hash as usize % capacity;
        let mut tombstone = None;

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
                Some(existing) => {
                    if Gc::ptr_eq(&existing, &key) {
                        return index;
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Doubles the capacity and re-inserts all live entries, dropping
    /// tombstones in the process.
    fn grow(&mut self) {
        let new_capacity = if self.capacity() < MIN_CAPACITY {
            MIN_CAPACITY
        } else {
            self.capacity() * 2
        };

        let old = std::mem::replace(&mut self.entries, vec![Entry::empty(); new_capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&self.entries, key);
                self.entries[index] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
                self.count += 1;
            }
        }
    }
}
