//! SafePtrMultiThreaded: a SafePtr whose handle itself may be shared.

use crate::safe_object::SafeObject;
use crate::safe_ptr::{SafePtr, SafetyMode};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// A [`SafePtr`] behind its own mutex, so the handle can be reassigned
/// through `&self` from several threads.
///
/// Objects released by an operation are destroyed (when deletable) only
/// after the handle's mutex is dropped, so a value whose `Drop` touches the
/// same handle does not deadlock.
pub struct SafePtrMultiThreaded<T> {
    inner: Mutex<SafePtr<T>>,
}

impl<T> SafePtrMultiThreaded<T> {
    pub fn null() -> Self {
        Self {
            inner: Mutex::new(SafePtr::null()),
        }
    }

    pub fn new(object: &Arc<SafeObject<T>>, mode: SafetyMode) -> Self {
        Self {
            inner: Mutex::new(SafePtr::new(object, mode)),
        }
    }

    pub fn from_ptr(ptr: SafePtr<T>) -> Self {
        Self {
            inner: Mutex::new(ptr),
        }
    }

    /// Access the inner handle. Other operations on this handle wait until
    /// the guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, SafePtr<T>> {
        self.inner.lock()
    }

    pub fn is_null(&self) -> bool {
        self.inner.lock().is_null()
    }

    pub fn mode(&self) -> SafetyMode {
        self.inner.lock().mode()
    }

    // In each operation `released` is declared before the guard, so it is
    // dropped after the handle's mutex is unlocked.

    pub fn assign(&self, object: Option<&Arc<SafeObject<T>>>) -> bool {
        let mut released = Vec::new();
        let mut ptr = self.inner.lock();
        ptr.assign_into(object, &mut released)
    }

    pub fn assign_ptr(&self, other: &SafePtr<T>) -> bool {
        let mut released = Vec::new();
        let mut ptr = self.inner.lock();
        ptr.assign_ptr_into(other, &mut released)
    }

    pub fn set_null(&self) {
        let released = self.inner.lock().release(true);
        drop(released);
    }

    /// See [`SafePtr::set_safety_mode`]; the same release-then-reacquire
    /// window applies.
    pub fn set_safety_mode(&self, mode: SafetyMode) -> bool {
        let mut released = Vec::new();
        let mut ptr = self.inner.lock();
        ptr.set_safety_mode_into(mode, &mut released)
    }

    /// A plain handle on the current object in `mode`.
    pub fn clone_with_mode(&self, mode: SafetyMode) -> SafePtr<T> {
        self.inner.lock().clone_with_mode(mode)
    }

    /// Take the inner handle out, leaving this one null.
    pub fn take(&self) -> SafePtr<T> {
        core::mem::take(&mut *self.inner.lock())
    }
}

impl<T> Default for SafePtrMultiThreaded<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> core::fmt::Debug for SafePtrMultiThreaded<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.inner.try_lock() {
            Some(ptr) => f.debug_tuple("SafePtrMultiThreaded").field(&*ptr).finish(),
            None => f.write_str("SafePtrMultiThreaded(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe_object::Collectable;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    impl Collectable for Tracked {}

    /// Invariant: the handle can be shared and reassigned from several threads;
    /// every reference taken is released.
    #[test]
    fn shared_handle_reassigned_across_threads() {
        let objects: Vec<_> = (0..4).map(SafeObject::shared).collect();
        let handle = Arc::new(SafePtrMultiThreaded::null());
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let handle = handle.clone();
                let objects = objects.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        handle.assign(Some(&objects[(t + i) % objects.len()]));
                        if i % 7 == 0 {
                            handle.set_null();
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        handle.set_null();
        assert!(objects.iter().all(|o| o.reference_count() == 0));
    }

    #[test]
    fn lock_gives_value_access() {
        let o = SafeObject::shared(vec![1]);
        let h = SafePtrMultiThreaded::new(&o, SafetyMode::ReadWrite);
        h.lock().push(2);
        assert!(h.set_safety_mode(SafetyMode::ReadOnly));
        assert_eq!(h.lock().len(), 2);
        assert_eq!(h.mode(), SafetyMode::ReadOnly);
    }

    /// Invariant: a removed object released through the handle is destroyed
    /// after the handle's mutex is dropped, so the handle is usable meanwhile.
    #[test]
    fn released_object_destroyed_outside_handle_mutex() {
        struct Reenter {
            handle: Arc<SafePtrMultiThreaded<Reenter>>,
            seen_null: Arc<AtomicUsize>,
        }
        impl Collectable for Reenter {}
        impl Drop for Reenter {
            fn drop(&mut self) {
                // Would deadlock if the handle's mutex were still held.
                if self.handle.is_null() {
                    self.seen_null.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let handle = Arc::new(SafePtrMultiThreaded::from_ptr(SafePtr::null_with_mode(
            SafetyMode::ReadOnly,
        )));
        let seen_null = Arc::new(AtomicUsize::new(0));
        let o = SafeObject::shared(Reenter {
            handle: handle.clone(),
            seen_null: seen_null.clone(),
        });
        assert!(handle.assign(Some(&o)));
        o.safe_remove();
        // The value's Drop locks this same handle.
        handle.set_null();
        assert_eq!(seen_null.load(Ordering::SeqCst), 1);
        assert!(o.safely_can_be_deleted());
    }

    #[test]
    fn take_leaves_null() {
        let drops = Arc::new(AtomicUsize::new(0));
        let o = SafeObject::shared(Tracked(drops.clone()));
        let h = SafePtrMultiThreaded::new(&o, SafetyMode::Reference);
        let p = h.take();
        assert!(h.is_null());
        assert!(!p.is_null());
        assert_eq!(o.reference_count(), 1);
        drop(p);
        drop(o);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
