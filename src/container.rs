//! Container capability consumed by the safe collection core, and the
//! index-addressed list container.
//!
//! Containers are purely structural: they store `Arc<SafeObject<T>>`
//! entries and never touch reference counts, locks or the being-removed
//! flag. Removing an entry hands the `Arc` back to the caller, so the
//! container never decides when a value is destroyed.

use crate::safe_object::{Collectable, SafeObject};
use std::sync::Arc;

pub(crate) type Object<C> = Arc<SafeObject<<C as SafeContainer>::Value>>;

/// Backing storage of a [`SafeColl`](crate::SafeColl).
///
/// Positions are dense, `0..len()`, and stay stable between mutations;
/// iteration walks positions in order.
pub trait SafeContainer: Default + Send + 'static {
    /// How entries are addressed (`usize` index, or a dictionary key).
    type Key: Clone + Send;
    type Value: Collectable + Send + Sync + 'static;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, key: &Self::Key) -> Option<&Arc<SafeObject<Self::Value>>>;

    fn remove(&mut self, key: &Self::Key) -> Option<Arc<SafeObject<Self::Value>>>;

    /// Key of the entry holding exactly `object`.
    fn key_of(&self, object: &SafeObject<Self::Value>) -> Option<Self::Key>;

    /// Position of the entry holding exactly `object`.
    fn position_of(&self, object: &SafeObject<Self::Value>) -> Option<usize>;

    fn entry_at(&self, position: usize) -> Option<(Self::Key, &Arc<SafeObject<Self::Value>>)>;

    /// Index `object` under `key`. Used to rebuild a copy in the source's
    /// order; `key` is always vacant.
    fn push_entry(&mut self, key: Self::Key, object: Arc<SafeObject<Self::Value>>);

    /// Remove and return every entry, in position order.
    fn drain(&mut self) -> Vec<(Self::Key, Arc<SafeObject<Self::Value>>)>;

    fn contains_object(&self, object: &SafeObject<Self::Value>) -> bool {
        self.position_of(object).is_some()
    }

    fn keys(&self) -> Vec<Self::Key> {
        (0..self.len())
            .filter_map(|pos| self.entry_at(pos).map(|(k, _)| k))
            .collect()
    }

    fn entries(&self) -> Vec<(Self::Key, Arc<SafeObject<Self::Value>>)> {
        (0..self.len())
            .filter_map(|pos| self.entry_at(pos).map(|(k, o)| (k, o.clone())))
            .collect()
    }
}

/// An ordered sequence; keys are indices and shift down on removal.
pub struct ListContainer<T> {
    items: Vec<Arc<SafeObject<T>>>,
}

impl<T> Default for ListContainer<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> ListContainer<T> {
    pub(crate) fn push(&mut self, object: Arc<SafeObject<T>>) -> usize {
        self.items.push(object);
        self.items.len() - 1
    }
}

impl<T> SafeContainer for ListContainer<T>
where
    T: Collectable + Send + Sync + 'static,
{
    type Key = usize;
    type Value = T;

    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, key: &usize) -> Option<&Arc<SafeObject<T>>> {
        self.items.get(*key)
    }

    fn remove(&mut self, key: &usize) -> Option<Arc<SafeObject<T>>> {
        (*key < self.items.len()).then(|| self.items.remove(*key))
    }

    fn key_of(&self, object: &SafeObject<T>) -> Option<usize> {
        self.position_of(object)
    }

    fn position_of(&self, object: &SafeObject<T>) -> Option<usize> {
        self.items
            .iter()
            .position(|o| core::ptr::eq(Arc::as_ptr(o), object))
    }

    fn entry_at(&self, position: usize) -> Option<(usize, &Arc<SafeObject<T>>)> {
        self.items.get(position).map(|o| (position, o))
    }

    fn push_entry(&mut self, _key: usize, object: Arc<SafeObject<T>>) {
        self.push(object);
    }

    fn drain(&mut self) -> Vec<(usize, Arc<SafeObject<T>>)> {
        self.items.drain(..).enumerate().collect()
    }
}
