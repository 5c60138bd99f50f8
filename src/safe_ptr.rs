//! SafePtr: a handle holding one reference and, depending on its mode, one
//! read or write lock on a SafeObject.
//!
//! Acquisition is all-or-nothing: the handle becomes non-null only if both
//! the reference and the lock were granted. Release always unlocks before
//! it dereferences.

use crate::safe_object::SafeObject;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::ops::{Deref, DerefMut};
use std::sync::Arc;

/// How a [`SafePtr`] holds its object.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum SafetyMode {
    /// Reference only: the object stays alive but its value is not accessible.
    #[default]
    Reference,
    /// Shared read lock: `&T`.
    ReadOnly,
    /// Exclusive write lock: `&mut T`.
    ReadWrite,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Enter {
    WithReference,
    AlreadyReferenced,
}

/// An object just released by a handle. Dropping it collects the object
/// if the release made it deletable; holders drop it only after any mutex
/// of their own is released.
pub(crate) struct Released<T> {
    object: Arc<SafeObject<T>>,
}

impl<T> Drop for Released<T> {
    fn drop(&mut self) {
        self.object.collect();
    }
}

/// A guarded handle to a [`SafeObject`].
///
/// Not meant to be shared between threads by reference while being
/// reassigned; see [`SafePtrMultiThreaded`](crate::SafePtrMultiThreaded)
/// for a handle that is.
pub struct SafePtr<T> {
    object: Option<Arc<SafeObject<T>>>,
    mode: SafetyMode,
}

impl<T> SafePtr<T> {
    pub const fn null() -> Self {
        Self::null_with_mode(SafetyMode::Reference)
    }

    pub const fn null_with_mode(mode: SafetyMode) -> Self {
        Self { object: None, mode }
    }

    /// Reference `object` and lock it per `mode`; null if either fails.
    pub fn new(object: &Arc<SafeObject<T>>, mode: SafetyMode) -> Self {
        let mut ptr = Self::null_with_mode(mode);
        ptr.assign(Some(object));
        ptr
    }

    pub fn is_null(&self) -> bool {
        self.object.is_none()
    }

    pub fn mode(&self) -> SafetyMode {
        self.mode
    }

    pub fn object(&self) -> Option<&Arc<SafeObject<T>>> {
        self.object.as_ref()
    }

    /// Identity comparison against a raw object.
    pub fn is(&self, object: &SafeObject<T>) -> bool {
        self.object
            .as_deref()
            .map_or(false, |o| core::ptr::eq(o, object))
    }

    /// Point at `object` (or nothing), releasing what was held first.
    pub fn assign(&mut self, object: Option<&Arc<SafeObject<T>>>) -> bool {
        let mut released = Vec::new();
        self.assign_into(object, &mut released)
    }

    pub(crate) fn assign_into(
        &mut self,
        object: Option<&Arc<SafeObject<T>>>,
        released: &mut Vec<Released<T>>,
    ) -> bool {
        if let (Some(new), Some(cur)) = (object, self.object.as_ref()) {
            if Arc::ptr_eq(new, cur) {
                return true;
            }
        }
        released.extend(self.release(true));
        self.object = object.cloned();
        self.enter(Enter::WithReference, released)
    }

    /// Point at `other`'s object, keeping this handle's mode.
    ///
    /// Taking a second write lock, or a read lock while a writer waits, on
    /// an object this thread already locks through `other` deadlocks.
    pub fn assign_ptr(&mut self, other: &SafePtr<T>) -> bool {
        let mut released = Vec::new();
        self.assign_ptr_into(other, &mut released)
    }

    pub(crate) fn assign_ptr_into(&mut self, other: &SafePtr<T>, released: &mut Vec<Released<T>>) -> bool {
        if self.object.is_some() && *self == *other {
            return true;
        }
        released.extend(self.release(true));
        self.object = other.object.clone();
        self.enter(Enter::WithReference, released)
    }

    pub fn set_null(&mut self) {
        drop(self.release(true));
    }

    /// Change the lock held on the current object.
    ///
    /// This releases the current lock and then acquires the new one; it is
    /// not an atomic upgrade, and another thread may lock the object in
    /// between. On failure the handle becomes null.
    pub fn set_safety_mode(&mut self, mode: SafetyMode) -> bool {
        let mut released = Vec::new();
        self.set_safety_mode_into(mode, &mut released)
    }

    pub(crate) fn set_safety_mode_into(&mut self, mode: SafetyMode, released: &mut Vec<Released<T>>) -> bool {
        if self.mode == mode {
            return true;
        }
        if let Some(object) = self.object.as_deref() {
            self.unlock(object);
        }
        self.mode = mode;
        self.enter(Enter::AlreadyReferenced, released)
    }

    /// A new handle on the same object in `mode`.
    pub fn clone_with_mode(&self, mode: SafetyMode) -> SafePtr<T> {
        let mut ptr = Self {
            object: self.object.clone(),
            mode,
        };
        let mut released = Vec::new();
        ptr.enter(Enter::WithReference, &mut released);
        ptr
    }

    /// The value, if this handle holds a read or write lock.
    pub fn get(&self) -> Option<&T> {
        match self.mode {
            SafetyMode::Reference => None,
            // SAFETY: non-null handles hold a reference and the mode's lock.
            _ => self.object.as_deref().map(|o| unsafe { o.value() }),
        }
    }

    /// The value, if this handle holds the write lock.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self.mode {
            // SAFETY: referenced and write-locked; `&mut self` keeps it unique.
            SafetyMode::ReadWrite => self.object.as_deref().map(|o| unsafe { o.value_mut() }),
            _ => None,
        }
    }

    /// Take the reference (unless already held) and the mode's lock. On a
    /// failed lock the reference is rolled back into `released`.
    fn enter(&mut self, how: Enter, released: &mut Vec<Released<T>>) -> bool {
        let Some(object) = self.object.as_deref() else {
            return false;
        };
        if how == Enter::WithReference && !object.safe_reference() {
            self.object = None;
            return false;
        }
        let locked = match self.mode {
            SafetyMode::Reference => true,
            SafetyMode::ReadOnly => object.lock_read_only(),
            SafetyMode::ReadWrite => object.lock_read_write(),
        };
        if !locked {
            released.extend(self.release(false));
        }
        locked
    }

    fn unlock(&self, object: &SafeObject<T>) {
        match self.mode {
            SafetyMode::Reference => {}
            SafetyMode::ReadOnly => unsafe { object.unlock_read_only() },
            SafetyMode::ReadWrite => unsafe { object.unlock_read_write() },
        }
    }

    /// Unlock (when held), dereference, and leave the handle null. Any
    /// destruction this enables happens when the result is dropped.
    pub(crate) fn release(&mut self, unlock: bool) -> Option<Released<T>> {
        let object = self.object.take()?;
        if unlock {
            self.unlock(&object);
        }
        object.dereference();
        Some(Released { object })
    }
}

impl<T> Default for SafePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Drop for SafePtr<T> {
    fn drop(&mut self) {
        drop(self.release(true));
    }
}

/// # Panics
/// Panics if the handle is null or holds no lock.
impl<T> Deref for SafePtr<T> {
    type Target = T;
    fn deref(&self) -> &T {
        match self.get() {
            Some(v) => v,
            None => panic!("SafePtr dereferenced while null or unlocked ({:?})", self.mode),
        }
    }
}

/// # Panics
/// Panics unless the handle holds the write lock.
impl<T> DerefMut for SafePtr<T> {
    fn deref_mut(&mut self) -> &mut T {
        let mode = self.mode;
        match self.get_mut() {
            Some(v) => v,
            None => panic!("SafePtr mutably dereferenced without write lock ({mode:?})"),
        }
    }
}

impl<T> PartialEq for SafePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.object, &other.object) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T> Eq for SafePtr<T> {}

impl<T> Hash for SafePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.object
            .as_ref()
            .map(|o| Arc::as_ptr(o) as usize)
            .hash(state);
    }
}

impl<T> fmt::Debug for SafePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafePtr")
            .field("object", &self.object.as_deref().map(SafeObject::addr))
            .field("mode", &self.mode)
            .finish()
    }
}
