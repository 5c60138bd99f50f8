//! KeyedContainer: the dictionary backing store.
//!
//! A hash index over generational slots: the index maps a stored hash to
//! a slot key, the slots own `(key, object, hash)`. Entries keep their
//! precomputed hash, so `K: Hash` is never invoked after insertion and a
//! rekey only touches the index. An insertion-ordered list of slot keys
//! gives entries dense, stable positions for iteration.

use crate::container::SafeContainer;
use crate::safe_object::{Collectable, SafeObject};
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use hashbrown::hash_table::Entry as TableEntry;
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    #[error("key already present")]
    DuplicateKey,
}

struct Entry<K, T> {
    key: K,
    object: Arc<SafeObject<T>>,
    hash: u64,
}

pub struct KeyedContainer<K, T, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Entry<K, T>>,
    order: Vec<DefaultKey>,
}

impl<K, T, S: Default> Default for KeyedContainer<K, T, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, T, S> KeyedContainer<K, T, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            hasher,
            index: HashTable::new(),
            slots: SlotMap::with_key(),
            order: Vec::new(),
        }
    }
}

impl<K, T, S> KeyedContainer<K, T, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    fn slot_of<Q>(&self, q: &Q) -> Option<DefaultKey>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        self.index
            .find(hash, |&k| {
                self.slots
                    .get(k)
                    .map(|e| e.key.borrow() == q)
                    .unwrap_or(false)
            })
            .copied()
    }

    pub fn find<Q>(&self, q: &Q) -> Option<&Arc<SafeObject<T>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.slot_of(q).and_then(|k| self.slots.get(k)).map(|e| &e.object)
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.slot_of(q).is_some()
    }

    pub fn insert(&mut self, key: K, object: Arc<SafeObject<T>>) -> Result<(), InsertError> {
        let hash = self.make_hash(&key);
        let slots = &mut self.slots;
        match self.index.entry(
            hash,
            |&kk| slots.get(kk).map(|e| e.key == key).unwrap_or(false),
            |&kk| slots.get(kk).map(|e| e.hash).unwrap_or(0),
        ) {
            TableEntry::Occupied(_) => Err(InsertError::DuplicateKey),
            TableEntry::Vacant(v) => {
                let k = slots.insert(Entry { key, object, hash });
                let _ = v.insert(k);
                self.order.push(k);
                Ok(())
            }
        }
    }

    pub fn remove_key<Q>(&mut self, q: &Q) -> Option<(K, Arc<SafeObject<T>>)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let k = self.slot_of(q)?;
        self.remove_slot(k)
    }

    fn remove_slot(&mut self, k: DefaultKey) -> Option<(K, Arc<SafeObject<T>>)> {
        let entry = self.slots.remove(k)?;
        if let Ok(found) = self.index.find_entry(entry.hash, |&kk| kk == k) {
            found.remove();
        }
        if let Some(pos) = self.order.iter().position(|&kk| kk == k) {
            self.order.remove(pos);
        }
        Some((entry.key, entry.object))
    }

    /// Move the entry under `from` to `to`, keeping its position.
    ///
    /// Fails, leaving the map unchanged, when `from` is absent or `to` is
    /// already taken.
    pub fn rekey<Q>(&mut self, from: &Q, to: K) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let Some(k) = self.slot_of(from) else {
            return false;
        };
        if self.contains_key::<K>(&to) {
            return false;
        }
        let old_hash = self.slots[k].hash;
        if let Ok(found) = self.index.find_entry(old_hash, |&kk| kk == k) {
            found.remove();
        }
        let hash = self.make_hash(&to);
        let entry = &mut self.slots[k];
        entry.key = to;
        entry.hash = hash;
        let slots = &self.slots;
        self.index
            .insert_unique(hash, k, |&kk| slots.get(kk).map(|e| e.hash).unwrap_or(0));
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &Arc<SafeObject<T>>)> + '_ {
        self.order
            .iter()
            .filter_map(|&k| self.slots.get(k))
            .map(|e| (&e.key, &e.object))
    }
}

impl<K, T, S> SafeContainer for KeyedContainer<K, T, S>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Collectable + Send + Sync + 'static,
    S: BuildHasher + Default + Send + 'static,
{
    type Key = K;
    type Value = T;

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn get(&self, key: &K) -> Option<&Arc<SafeObject<T>>> {
        self.find(key)
    }

    fn remove(&mut self, key: &K) -> Option<Arc<SafeObject<T>>> {
        self.remove_key(key).map(|(_, o)| o)
    }

    fn key_of(&self, object: &SafeObject<T>) -> Option<K> {
        self.position_of(object)
            .and_then(|pos| self.entry_at(pos))
            .map(|(k, _)| k)
    }

    fn position_of(&self, object: &SafeObject<T>) -> Option<usize> {
        self.order.iter().position(|&k| {
            self.slots
                .get(k)
                .map(|e| core::ptr::eq(Arc::as_ptr(&e.object), object))
                .unwrap_or(false)
        })
    }

    fn entry_at(&self, position: usize) -> Option<(K, &Arc<SafeObject<T>>)> {
        let k = *self.order.get(position)?;
        self.slots.get(k).map(|e| (e.key.clone(), &e.object))
    }

    fn push_entry(&mut self, key: K, object: Arc<SafeObject<T>>) {
        // Copies rebuild from a map with unique keys.
        let _ = self.insert(key, object);
    }

    fn drain(&mut self) -> Vec<(K, Arc<SafeObject<T>>)> {
        self.index.clear();
        let mut slots = core::mem::replace(&mut self.slots, SlotMap::with_key());
        self.order
            .drain(..)
            .filter_map(|k| slots.remove(k))
            .map(|e| (e.key, e.object))
            .collect()
    }
}
