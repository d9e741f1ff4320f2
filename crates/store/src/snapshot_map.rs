//! Hash map with a copy-on-write snapshot mode.
//!
//! Entries live in an arena-backed doubly linked list so iteration order is
//! insertion order. Outside snapshot mode this behaves like a plain map. In
//! snapshot mode, mutations of entries stamped at or below the frozen
//! generation append a shadow entry at the tail and leave the original in
//! place marked inactive; erases only mark. A reader that walks the first
//! `snapshot_size` positions therefore sees exactly the state at the moment
//! the mode was enabled, whatever happens concurrently.

use std::collections::HashMap;

/// Cost accounting hook for the approximate-data-size counter.
pub trait EntrySize {
    fn size_in_bytes(&self) -> u64;
}

struct MapEntry<V> {
    key: String,
    value: V,
    /// Generation stamp; compared against the frozen bound to decide
    /// between shadowing and in-place mutation.
    version: u64,
    active: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct SnapshotableMap<V> {
    arena: Vec<Option<MapEntry<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    /// key -> arena slot of the active entry.
    index: HashMap<String, usize>,
    list_len: usize,
    snapshot_mode: bool,
    snapshot_up_to_version: u64,
    current_version: u64,
    approximate_data_size: u64,
}

impl<V: Clone + EntrySize> Default for SnapshotableMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + EntrySize> SnapshotableMap<V> {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: HashMap::new(),
            list_len: 0,
            snapshot_mode: false,
            snapshot_up_to_version: 0,
            current_version: 0,
            approximate_data_size: 0,
        }
    }

    /// Active keys.
    pub fn size(&self) -> usize {
        self.index.len()
    }

    /// List length (shadows included) and the current generation. The first
    /// component is what a snapshot serializer must iterate up to.
    pub fn snapshot_size_with_version(&self) -> (usize, u64) {
        (self.list_len, self.current_version)
    }

    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    pub fn approximate_data_size(&self) -> u64 {
        self.approximate_data_size
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        let slot = *self.index.get(key)?;
        Some(&self.entry(slot).value)
    }

    /// Inserts a new key; `false` (and no change) when it already exists.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> bool {
        let key = key.into();
        if self.index.contains_key(&key) {
            return false;
        }
        self.approximate_data_size += key.len() as u64 + value.size_in_bytes();
        let slot = self.push_back(key.clone(), value);
        self.index.insert(key, slot);
        true
    }

    /// Inserts or overwrites, shadowing when the snapshot requires it.
    pub fn insert_or_replace(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match self.index.get(&key).copied() {
            None => {
                self.insert(key, value);
            }
            Some(slot) => {
                if self.must_shadow(slot) {
                    self.shadow(slot, value);
                } else {
                    let version = self.current_version;
                    let size = value.size_in_bytes();
                    let entry = self.entry_mut(slot);
                    let old_size = entry.value.size_in_bytes();
                    entry.value = value;
                    entry.version = version;
                    self.approximate_data_size =
                        self.approximate_data_size + size - old_size;
                }
            }
        }
    }

    /// Mutates an existing value through a closure; the key must be present.
    pub fn update_value(&mut self, key: &str, update: impl FnOnce(&mut V)) {
        let slot = *self
            .index
            .get(key)
            .unwrap_or_else(|| panic!("update of missing key {key}"));
        if self.must_shadow(slot) {
            let mut value = self.entry(slot).value.clone();
            update(&mut value);
            self.shadow(slot, value);
        } else {
            let version = self.current_version;
            let old_size = self.entry(slot).value.size_in_bytes();
            let entry = self.entry_mut(slot);
            update(&mut entry.value);
            entry.version = version;
            let new_size = self.entry(slot).value.size_in_bytes();
            self.approximate_data_size = self.approximate_data_size + new_size - old_size;
        }
    }

    /// Removes a key. In snapshot mode the entry is only deactivated; the
    /// list keeps it until `clear_outdated_nodes`.
    pub fn erase(&mut self, key: &str) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        if self.snapshot_mode {
            self.entry_mut(slot).active = false;
        } else {
            let entry = self.unlink(slot);
            self.approximate_data_size -=
                entry.key.len() as u64 + entry.value.size_in_bytes();
        }
        true
    }

    /// Freezes the generations at or below `up_to_version`: from now on,
    /// mutating an entry stamped within the frozen range shadows it instead
    /// of rewriting in place.
    pub fn enable_snapshot_mode(&mut self, up_to_version: u64) {
        self.snapshot_mode = true;
        self.snapshot_up_to_version = up_to_version;
        self.current_version += 1;
    }

    pub fn disable_snapshot_mode(&mut self) {
        self.snapshot_mode = false;
    }

    /// Unlinks every inactive entry.
    pub fn clear_outdated_nodes(&mut self) {
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            cursor = self.entry(slot).next;
            if !self.entry(slot).active {
                let entry = self.unlink(slot);
                self.approximate_data_size -=
                    entry.key.len() as u64 + entry.value.size_in_bytes();
            }
        }
    }

    pub fn clear(&mut self) {
        self.arena.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.index.clear();
        self.list_len = 0;
        self.approximate_data_size = 0;
    }

    /// List-order iteration over `(key, value, active)`.
    pub fn iter(&self) -> SnapshotableMapIter<'_, V> {
        SnapshotableMapIter {
            map: self,
            cursor: self.head,
        }
    }

    fn must_shadow(&self, slot: usize) -> bool {
        self.snapshot_mode && self.entry(slot).version <= self.snapshot_up_to_version
    }

    /// Appends a replacement entry for `slot` and deactivates the original.
    fn shadow(&mut self, slot: usize, value: V) {
        let key = self.entry(slot).key.clone();
        self.approximate_data_size += key.len() as u64 + value.size_in_bytes();
        self.entry_mut(slot).active = false;
        let new_slot = self.push_back(key.clone(), value);
        self.index.insert(key, new_slot);
    }

    fn push_back(&mut self, key: String, value: V) -> usize {
        let entry = MapEntry {
            key,
            value,
            version: self.current_version,
            active: true,
            prev: self.tail,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(entry);
                slot
            }
            None => {
                self.arena.push(Some(entry));
                self.arena.len() - 1
            }
        };
        if let Some(tail) = self.tail {
            self.entry_mut(tail).next = Some(slot);
        }
        self.tail = Some(slot);
        if self.head.is_none() {
            self.head = Some(slot);
        }
        self.list_len += 1;
        slot
    }

    fn unlink(&mut self, slot: usize) -> MapEntry<V> {
        let entry = self.arena[slot].take().expect("slot occupied");
        match entry.prev {
            Some(prev) => self.entry_mut(prev).next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => self.entry_mut(next).prev = entry.prev,
            None => self.tail = entry.prev,
        }
        self.free.push(slot);
        self.list_len -= 1;
        entry
    }

    fn entry(&self, slot: usize) -> &MapEntry<V> {
        self.arena[slot].as_ref().expect("slot occupied")
    }

    fn entry_mut(&mut self, slot: usize) -> &mut MapEntry<V> {
        self.arena[slot].as_mut().expect("slot occupied")
    }
}

pub struct SnapshotableMapIter<'a, V> {
    map: &'a SnapshotableMap<V>,
    cursor: Option<usize>,
}

impl<'a, V: Clone + EntrySize> Iterator for SnapshotableMapIter<'a, V> {
    type Item = (&'a str, &'a V, bool);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let entry = self.map.entry(slot);
        self.cursor = entry.next;
        Some((entry.key.as_str(), &entry.value, entry.active))
    }
}
