use crate::heap::{Obj, ObjData, ObjRef};

const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone)]
enum Entry<V> {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, value: V },
}

/// Open-addressed, linear-probed hash table keyed by interned string
/// handles. Used verbatim for globals and instance fields (`V = Value`),
/// for class method tables (`V = ObjRef`, the method's closure), and as a
/// bare set for the string intern table (`V = ()`).
#[derive(Clone)]
pub struct Table<V> {
    entries: Vec<Entry<V>>,
    count: usize,
}

impl<V: Clone> Default for Table<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }
}

impl<V: Clone> Table<V> {
    pub fn new() -> Self {
        Self::default()
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

    fn index_of(hash: u32, capacity: usize) -> usize {
        (hash as usize) & (capacity - 1)
    }

    fn key_hash(objects: &[Option<Obj>], key: ObjRef) -> u32 {
        match string_data(objects, key) {
            Some((_, hash)) => hash,
            None => 0,
        }
    }

    /// Returns the slot a `key` would occupy: the first tombstone seen (so a
    /// later `set` can reuse it) if the key isn't present, or the slot
    /// holding the key itself.
    fn find_slot(&self, objects: &[Option<Obj>], key: ObjRef) -> usize {
        let capacity = self.capacity();
        let hash = Self::key_hash(objects, key);
        let mut index = Self::index_of(hash, capacity);
        let mut tombstone: Option<usize> = None;
        loop {
            match &self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Occupied { key: k, .. } if *k == key => return index,
                Entry::Occupied { .. } => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow(&mut self, objects: &[Option<Obj>]) {
        let new_capacity = (self.capacity() * 2).max(8);
        let old_entries = std::mem::replace(
            &mut self.entries,
            (0..new_capacity).map(|_| Entry::Empty).collect(),
        );
        self.count = 0;
        for entry in old_entries {
            if let Entry::Occupied { key, value } = entry {
                self.set_raw(objects, key, value);
            }
        }
    }

    fn set_raw(&mut self, objects: &[Option<Obj>], key: ObjRef, value: V) -> bool {
        let index = self.find_slot(objects, key);
        let is_new = !matches!(self.entries[index], Entry::Occupied { .. });
        if is_new && !matches!(self.entries[index], Entry::Tombstone) {
            self.count += 1;
        }
        self.entries[index] = Entry::Occupied { key, value };
        is_new
    }

    /// Inserts or overwrites `key`. Returns whether `key` was not already
    /// present (a set that fills a tombstone does not increment `count`
    /// further than the tombstone already did).
    pub fn set(&mut self, objects: &[Option<Obj>], key: ObjRef, value: V) -> bool {
        if self.capacity() == 0 || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR
        {
            self.grow(objects);
        }
        self.set_raw(objects, key, value)
    }

    pub fn get(&self, objects: &[Option<Obj>], key: ObjRef) -> Option<&V> {
        if self.capacity() == 0 {
            return None;
        }
        match &self.entries[self.find_slot(objects, key)] {
            Entry::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn delete(&mut self, objects: &[Option<Obj>], key: ObjRef) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let index = self.find_slot(objects, key);
        match self.entries[index] {
            Entry::Occupied { .. } => {
                self.entries[index] = Entry::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Inserts every live entry of `self` into `dst`. Used by `INHERIT` to
    /// copy a superclass's method table into its subclass.
    pub fn add_all(&self, objects: &[Option<Obj>], dst: &mut Table<V>) {
        for entry in &self.entries {
            if let Entry::Occupied { key, value } = entry {
                dst.set(objects, *key, value.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &V)> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Occupied { key, value } => Some((*key, value)),
            _ => None,
        })
    }

    /// Finds an interned string with these exact bytes without allocating a
    /// new string object first. Only meaningful when `V = ()` (the intern
    /// table); any other table never calls it.
    pub fn find_string(&self, objects: &[Option<Obj>], bytes: &str, hash: u32) -> Option<ObjRef> {
        if self.capacity() == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = Self::index_of(hash, capacity);
        loop {
            match &self.entries[index] {
                Entry::Empty => return None,
                Entry::Occupied { key, .. } => {
                    if let Some((s, h)) = string_data(objects, *key) {
                        if h == hash && s == bytes {
                            return Some(*key);
                        }
                    }
                }
                Entry::Tombstone => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Removes entries whose key string is unmarked, ahead of a GC sweep
    /// that is about to free those string objects.
    pub fn remove_unmarked_keys(&mut self, objects: &[Option<Obj>]) {
        for entry in &mut self.entries {
            if let Entry::Occupied { key, .. } = entry {
                let marked = matches!(&objects[key.0 as usize], Some(obj) if obj.is_marked());
                if !marked {
                    *entry = Entry::Tombstone;
                }
            }
        }
    }
}

fn string_data(objects: &[Option<Obj>], key: ObjRef) -> Option<(&str, u32)> {
    match objects.get(key.0 as usize)?.as_ref()?.data() {
        ObjData::String(s) => Some((s.as_str(), s.hash)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::value::Value;
    use proptest::prelude::*;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let a = heap.intern("a");
        let b = heap.intern("b");
        let mut table: Table<Value> = Table::new();
        assert!(table.set(heap.objects(), a, Value::Number(1.0)));
        assert!(table.set(heap.objects(), b, Value::Number(2.0)));
        assert!(!table.set(heap.objects(), a, Value::Number(3.0)));
        assert_eq!(table.get(heap.objects(), a), Some(&Value::Number(3.0)));
        assert!(table.delete(heap.objects(), a));
        assert_eq!(table.get(heap.objects(), a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn tombstone_is_reused_by_a_later_set() {
        let mut heap = Heap::new();
        let a = heap.intern("a");
        let b = heap.intern("b");
        let mut table: Table<Value> = Table::new();
        table.set(heap.objects(), a, Value::Number(1.0));
        let before = table.len();
        table.delete(heap.objects(), a);
        // filling the tombstone must not grow count past `before`.
        table.set(heap.objects(), b, Value::Number(2.0));
        assert_eq!(table.len(), before);
    }

    #[test]
    fn find_string_locates_interned_bytes_before_any_map_key_exists() {
        let mut heap = Heap::new();
        let hello = heap.intern("hello");
        let mut strings: Table<()> = Table::new();
        strings.set(heap.objects(), hello, ());
        let hash = crate::heap::fnv1a(b"hello");
        assert_eq!(strings.find_string(heap.objects(), "hello", hash), Some(hello));
        assert_eq!(strings.find_string(heap.objects(), "nope", crate::heap::fnv1a(b"nope")), None);
    }

    #[test]
    fn add_all_copies_live_entries_only() {
        let mut heap = Heap::new();
        let a = heap.intern("a");
        let b = heap.intern("b");
        let mut src: Table<Value> = Table::new();
        src.set(heap.objects(), a, Value::Bool(true));
        src.set(heap.objects(), b, Value::Bool(false));
        src.delete(heap.objects(), b);
        let mut dst: Table<Value> = Table::new();
        src.add_all(heap.objects(), &mut dst);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst.get(heap.objects(), a), Some(&Value::Bool(true)));
        assert_eq!(dst.get(heap.objects(), b), None);
    }

    proptest! {
        /// For any sequence of distinct keys each set to a distinct number,
        /// a table must give every key back its own last-set value,
        /// regardless of insertion order or how many times it resizes.
        #[test]
        fn last_set_value_wins_for_every_key(names in prop::collection::hash_set("[a-z]{1,8}", 1..40)) {
            let mut heap = Heap::new();
            let mut table: Table<Value> = Table::new();
            let mut expect = Vec::new();
            for (i, name) in names.iter().enumerate() {
                let key = heap.intern(name);
                let value = Value::Number(i as f64);
                table.set(heap.objects(), key, value);
                expect.push((key, value));
            }
            for (key, value) in expect {
                prop_assert_eq!(table.get(heap.objects(), key), Some(&value));
            }
        }

        /// Deleting a key and then setting an unrelated key must never
        /// resurrect the deleted key's value (tombstones must not act as
        /// live entries for any key other than the one that set them).
        #[test]
        fn delete_then_reinsert_elsewhere_does_not_resurrect(
            names in prop::collection::hash_set("[a-z]{1,8}", 2..20)
        ) {
            let mut heap = Heap::new();
            let mut table: Table<Value> = Table::new();
            let keys: Vec<_> = names.iter().map(|n| heap.intern(n)).collect();
            for (i, &key) in keys.iter().enumerate() {
                table.set(heap.objects(), key, Value::Number(i as f64));
            }
            let deleted = keys[0];
            table.delete(heap.objects(), deleted);
            for &key in &keys[1..] {
                table.set(heap.objects(), key, Value::Bool(true));
            }
            prop_assert_eq!(table.get(heap.objects(), deleted), None);
        }
    }
}
