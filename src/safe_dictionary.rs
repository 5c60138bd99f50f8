//! SafeDictionary: a key-addressed [`SafeColl`].

use crate::container::SafeContainer;
use crate::keyed_container::KeyedContainer;
use crate::safe_coll::{with_mode, SafeColl};
use crate::safe_object::{Collectable, SafeObject};
use crate::safe_ptr::{SafePtr, SafetyMode};
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;
use std::sync::Arc;

/// A key-addressed safe collection.
pub type SafeDictionary<K, T, S = RandomState> = SafeColl<KeyedContainer<K, T, S>>;

impl<K, T, S> SafeColl<KeyedContainer<K, T, S>>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Collectable + Send + Sync + 'static,
    S: BuildHasher + Default + Send + 'static,
{
    /// Store `object` under `key` and return a handle on it in `mode`.
    ///
    /// A previous occupant of `key` goes through the removal path first,
    /// even if `object` then cannot be added. Null if `object` is already
    /// being removed. Storing the current occupant again only returns a
    /// handle.
    pub fn set_at(&self, key: K, object: &Arc<SafeObject<T>>, mode: SafetyMode) -> SafePtr<T> {
        let core = self.core();
        let mut replaced = None;
        let ptr = {
            let mut map = core.structure();
            let current = map.find::<K>(&key).map(|o| Arc::ptr_eq(o, object));
            if current == Some(true) {
                SafePtr::new(object, SafetyMode::Reference)
            } else {
                if let Some((_, old)) = map.remove_key::<K>(&key) {
                    core.safe_remove_object(&old);
                    replaced = Some(old);
                }
                if core.safe_add_object(&map, object) {
                    // The key was vacated above.
                    let _ = map.insert(key, object.clone());
                    SafePtr::new(object, SafetyMode::Reference)
                } else {
                    SafePtr::null()
                }
            }
        };
        core.settle(replaced.into_iter().collect());
        with_mode(ptr, mode)
    }

    pub fn set_value(&self, key: K, value: T, mode: SafetyMode) -> SafePtr<T> {
        self.set_at(key, &SafeObject::shared(value), mode)
    }

    pub fn find<Q>(&self, key: &Q, mode: SafetyMode) -> SafePtr<T>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let ptr = {
            let map = self.core().structure();
            match map.find(key) {
                Some(object) => SafePtr::new(object, SafetyMode::Reference),
                None => return SafePtr::null_with_mode(mode),
            }
        };
        with_mode(ptr, mode)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.core().structure().contains_key(key)
    }

    /// Remove the entry under a borrowed form of its key.
    pub fn remove_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let detached = {
            let mut map = self.core().structure();
            let Some((_, detached)) = map.remove_key(key) else {
                return false;
            };
            self.core().safe_remove_object(&detached);
            detached
        };
        self.core().settle(vec![detached]);
        true
    }

    /// Keys in insertion order.
    pub fn get_keys(&self) -> Vec<K> {
        self.keys()
    }

    /// Re-key the entry under `from`. False if `from` is missing or `to`
    /// is taken; the object itself is untouched either way.
    pub fn move_key<Q>(&self, from: &Q, to: K) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.core().structure().rekey(from, to)
    }

    /// Take every entry of `other`, along with its deletion policy.
    ///
    /// Entries keep their membership reference across the move, so none
    /// of them is removed or destroyed; an entry already here under the
    /// same key is replaced and removed. `other` ends up empty.
    pub fn move_from(&self, other: &Self) {
        if core::ptr::eq(self, other) {
            return;
        }
        // Never hold both structural mutexes at once.
        let moved = other.core().structure().drain();
        self.allow_delete_objects(other.delete_objects());

        let core = self.core();
        let mut displaced = Vec::new();
        {
            let mut map = core.structure();
            for (key, object) in moved {
                if map.contains_object(&object) {
                    // Already a member here; keep one membership reference.
                    object.dereference();
                    continue;
                }
                if let Some((_, old)) = map.remove_key(&key) {
                    core.safe_remove_object(&old);
                    displaced.push(old);
                }
                let _ = map.insert(key, object);
            }
        }
        tracing::trace!(from = %other.core().name(), to = %core.name(), "moved dictionary entries");
        core.settle(displaced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    impl Collectable for Tracked {}

    /// Invariant: `set_at` on an occupied key removes the previous occupant.
    #[test]
    fn set_at_replaces_and_removes_previous() {
        let drops = Arc::new(AtomicUsize::new(0));
        let dict: SafeDictionary<String, Tracked> = SafeDictionary::new();
        let old = SafeObject::shared(Tracked(drops.clone()));
        let new = SafeObject::shared(Tracked(drops.clone()));
        dict.set_at("k".into(), &old, SafetyMode::Reference);
        let p = dict.set_at("k".into(), &new, SafetyMode::ReadOnly);
        assert!(p.is(&new));
        assert!(old.is_safely_being_removed());
        assert_eq!(drops.load(Ordering::SeqCst), 1, "old occupant destroyed");
        assert_eq!(dict.len(), 1);
    }

    /// Invariant: storing the current occupant again keeps it as the single
    /// member and hands back a handle.
    #[test]
    fn set_at_with_current_occupant_is_noop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let dict: SafeDictionary<u32, Tracked> = SafeDictionary::new();
        let o = SafeObject::shared(Tracked(drops.clone()));
        dict.set_at(1, &o, SafetyMode::Reference);
        let p = dict.set_at(1, &o, SafetyMode::ReadOnly);
        assert!(p.is(&o));
        assert!(p.get().is_some());
        assert!(!o.is_safely_being_removed());
        assert_eq!(o.reference_count(), 2, "membership plus the handle");
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.pending_removal_len(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    /// Invariant: the previous occupant is removed even when the new object
    /// is refused.
    #[test]
    fn set_at_removes_previous_even_if_new_is_refused() {
        let drops = Arc::new(AtomicUsize::new(0));
        let dict: SafeDictionary<u32, Tracked> = SafeDictionary::new();
        let old = SafeObject::shared(Tracked(drops.clone()));
        let gone = SafeObject::shared(Tracked(drops.clone()));
        gone.safe_remove();
        dict.set_at(1, &old, SafetyMode::Reference);
        let p = dict.set_at(1, &gone, SafetyMode::ReadOnly);
        assert!(p.is_null());
        assert!(old.is_safely_being_removed());
        assert!(dict.is_empty());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn find_by_borrowed_key() {
        let dict: SafeDictionary<String, i32> = SafeDictionary::new();
        dict.set_value("one".into(), 1, SafetyMode::Reference);
        assert_eq!(*dict.find("one", SafetyMode::ReadOnly), 1);
        assert!(dict.find("two", SafetyMode::ReadOnly).is_null());
        assert!(dict.contains("one"));
        assert!(dict.remove_key("one"));
        assert!(!dict.contains("one"));
        assert!(!dict.remove_key("one"));
    }

    /// Invariant: `move_key` keeps the same object under the new key.
    #[test]
    fn move_key_rekeys_same_object() {
        let dict: SafeDictionary<&'static str, i32> = SafeDictionary::new();
        let o = SafeObject::shared(5);
        dict.set_at("a", &o, SafetyMode::Reference);
        dict.set_value("b", 6, SafetyMode::Reference);
        assert!(!dict.move_key("a", "b"));
        assert!(dict.move_key("a", "c"));
        assert!(dict.find("a", SafetyMode::Reference).is_null());
        assert!(dict.find("c", SafetyMode::Reference).is(&o));
        assert_eq!(o.reference_count(), 1);
        assert!(!o.is_safely_being_removed());
        assert_eq!(dict.get_keys(), vec!["c", "b"]);
    }

    #[test]
    fn move_from_self_is_noop() {
        let dict: SafeDictionary<u32, u32> = SafeDictionary::new();
        dict.set_value(1, 1, SafetyMode::Reference);
        dict.move_from(&dict);
        assert_eq!(dict.len(), 1);
    }
}
