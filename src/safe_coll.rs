//! SafeColl: the typed façade over a shared collection core.
//!
//! Every lookup follows the same two steps: find the entry and take a
//! reference-only handle under the structural mutex, then release the
//! mutex and only then lock the object in the requested mode.

use crate::container::{ListContainer, Object, SafeContainer};
use crate::error::Error;
use crate::safe_collection::SafeCollection;
use crate::safe_object::{Collectable, SafeObject};
use crate::safe_ptr::{SafePtr, SafetyMode};
use crate::settings::Settings;
use crate::sweeper::Sweeper;
use core::fmt;
use parking_lot::Mutex;
use std::sync::Arc;

/// A thread-safe collection of [`SafeObject`]s over a backing container.
pub struct SafeColl<C: SafeContainer> {
    core: Arc<SafeCollection<C>>,
    sweeper: Mutex<Option<Sweeper>>,
}

/// An index-addressed safe collection.
pub type SafeList<T> = SafeColl<ListContainer<T>>;

impl<C: SafeContainer> SafeColl<C> {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            core: SafeCollection::new(settings),
            sweeper: Mutex::new(None),
        }
    }

    /// Whether removed objects are destroyed by this collection.
    pub fn delete_objects(&self) -> bool {
        self.core.delete_objects()
    }

    pub fn allow_delete_objects(&self, yes: bool) {
        self.core.allow_delete_objects(yes);
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects removed from the collection but not yet destroyed.
    pub fn pending_removal_len(&self) -> usize {
        self.core.pending_removal_len()
    }

    /// Remove `object` by identity. False if it is not a member.
    pub fn remove(&self, object: &SafeObject<C::Value>) -> bool {
        self.core.remove(object)
    }

    pub fn remove_at(&self, key: &C::Key) -> bool {
        self.core.remove_at(key)
    }

    /// Remove every member. With `synchronous`, block until every removed
    /// object has been destroyed, which waits on handles held elsewhere.
    pub fn remove_all(&self, synchronous: bool) {
        self.core.remove_all(synchronous);
    }

    /// Run one sweep; true if nothing is left in the collection or
    /// waiting for destruction.
    pub fn delete_objects_to_be_removed(&self) -> bool {
        self.core.delete_objects_to_be_removed()
    }

    /// Start sweeping in the background every
    /// [`sweep_interval`](Settings::sweep_interval). Idempotent.
    pub fn set_auto_delete_objects(&self) -> Result<(), Error> {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(Sweeper::spawn(&self.core)?);
        }
        Ok(())
    }

    pub fn get_at(&self, key: &C::Key, mode: SafetyMode) -> SafePtr<C::Value> {
        let ptr = {
            let container = self.core.structure();
            match container.get(key) {
                Some(object) => SafePtr::new(object, SafetyMode::Reference),
                None => return SafePtr::null_with_mode(mode),
            }
        };
        with_mode(ptr, mode)
    }

    /// A handle on `object` if it is a member.
    pub fn find_object(&self, object: &SafeObject<C::Value>, mode: SafetyMode) -> SafePtr<C::Value> {
        let ptr = {
            let container = self.core.structure();
            match container.position_of(object).and_then(|pos| container.entry_at(pos)) {
                Some((_, found)) => SafePtr::new(found, SafetyMode::Reference),
                None => return SafePtr::null_with_mode(mode),
            }
        };
        with_mode(ptr, mode)
    }

    /// The first member whose value matches `pred`.
    ///
    /// Values are read-locked one at a time on a snapshot, never under the
    /// structural mutex; members being removed are skipped.
    pub fn find_by<F>(&self, mut pred: F, mode: SafetyMode) -> SafePtr<C::Value>
    where
        F: FnMut(&C::Value) -> bool,
    {
        let entries = self.core.structure().entries();
        for (_, object) in entries {
            let matched = object.read().map_or(false, |v| pred(&v));
            if matched {
                let ptr = SafePtr::new(&object, mode);
                if !ptr.is_null() {
                    return ptr;
                }
            }
        }
        SafePtr::null_with_mode(mode)
    }

    pub fn keys(&self) -> Vec<C::Key> {
        self.core.structure().keys()
    }

    /// Walk the live collection, yielding a handle in `mode` per member.
    ///
    /// Members being removed are skipped. If the member the iterator is
    /// on leaves the collection, the iteration ends early; iterate a
    /// [`snapshot`](Self::snapshot) to visit every member regardless.
    pub fn iter(&self, mode: SafetyMode) -> Iter<'_, C> {
        Iter {
            coll: self,
            cursor: SafePtr::null(),
            started: false,
            mode,
        }
    }

    /// A non-owning copy sharing the current members.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Index `object` under the structural mutex using `insert`, taking the
    /// collection's reference first, then hand back a handle in `mode`.
    pub(crate) fn insert_with<F>(&self, object: &Object<C>, mode: SafetyMode, insert: F) -> SafePtr<C::Value>
    where
        F: FnOnce(&mut C, Object<C>) -> bool,
    {
        let ptr = {
            let mut container = self.core.structure();
            if !self.core.safe_add_object(&container, object) {
                return SafePtr::null_with_mode(mode);
            }
            if !insert(&mut *container, object.clone()) {
                drop(container);
                object.dereference();
                return SafePtr::null_with_mode(mode);
            }
            SafePtr::new(object, SafetyMode::Reference)
        };
        with_mode(ptr, mode)
    }

    pub(crate) fn core(&self) -> &Arc<SafeCollection<C>> {
        &self.core
    }
}

/// Lock a reference-only handle in `mode`; a failed lock leaves it null.
pub(crate) fn with_mode<T>(mut ptr: SafePtr<T>, mode: SafetyMode) -> SafePtr<T> {
    ptr.set_safety_mode(mode);
    ptr
}

impl<T> SafeColl<ListContainer<T>>
where
    T: Collectable + Send + Sync + 'static,
{
    /// Append `object` and return a handle on it in `mode`.
    ///
    /// Null if `object` is already being removed. Appending a member twice
    /// is a contract violation.
    pub fn append(&self, object: &Arc<SafeObject<T>>, mode: SafetyMode) -> SafePtr<T> {
        self.insert_with(object, mode, |list, o| {
            list.push(o);
            true
        })
    }

    pub fn append_value(&self, value: T, mode: SafetyMode) -> SafePtr<T> {
        self.append(&SafeObject::shared(value), mode)
    }
}

impl<C: SafeContainer> Default for SafeColl<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies never own deletion; every surviving member gains a reference.
impl<C: SafeContainer> Clone for SafeColl<C> {
    fn clone(&self) -> Self {
        let settings = self.core.settings().clone().with_delete_objects(false);
        let copy = SafeCollection::<C>::new(settings);
        let entries = self.core.structure().entries();
        {
            let mut container = copy.structure();
            for (key, object) in entries.iter() {
                if object.safe_reference() {
                    container.push_entry(key.clone(), object.clone());
                }
            }
        }
        Self {
            core: copy,
            sweeper: Mutex::new(None),
        }
    }
}

impl<C: SafeContainer> Drop for SafeColl<C> {
    fn drop(&mut self) {
        drop(self.sweeper.get_mut().take());
        self.core.remove_all(false);
        self.core.delete_objects_to_be_removed();
    }
}

impl<C: SafeContainer> fmt::Debug for SafeColl<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeColl")
            .field("name", &self.core.name())
            .field("len", &self.len())
            .field("pending_removal", &self.pending_removal_len())
            .field("delete_objects", &self.delete_objects())
            .finish()
    }
}

/// Iterator over a live [`SafeColl`]; see [`SafeColl::iter`].
pub struct Iter<'a, C: SafeContainer> {
    coll: &'a SafeColl<C>,
    cursor: SafePtr<C::Value>,
    started: bool,
    mode: SafetyMode,
}

impl<C: SafeContainer> Iter<'_, C> {
    /// Move the reference-only cursor to the next member not being
    /// removed. False once the end is reached or the cursor's member
    /// has left the collection.
    fn advance(&mut self) -> bool {
        let core = self.coll.core();
        let mut released = Vec::new();
        let container = core.structure();
        let mut pos = match self.cursor.object() {
            Some(current) => match container.position_of(current) {
                Some(pos) => pos + 1,
                None => {
                    drop(container);
                    self.cursor.set_null();
                    return false;
                }
            },
            None if self.started => return false,
            None => 0,
        };
        self.started = true;
        while let Some((_, object)) = container.entry_at(pos) {
            if !object.is_safely_being_removed() {
                let next = SafePtr::new(object, SafetyMode::Reference);
                if !next.is_null() {
                    released.extend(self.cursor.release(false));
                    self.cursor = next;
                    return true;
                }
            }
            pos += 1;
        }
        drop(container);
        self.cursor.set_null();
        false
    }
}

impl<C: SafeContainer> Iterator for Iter<'_, C> {
    type Item = SafePtr<C::Value>;

    fn next(&mut self) -> Option<SafePtr<C::Value>> {
        while self.advance() {
            let ptr = self.cursor.clone_with_mode(self.mode);
            if !ptr.is_null() {
                return Some(ptr);
            }
        }
        None
    }
}
