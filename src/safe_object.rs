//! SafeObject: reference counting, a lazily created RW lock and a sticky
//! being-removed flag around a domain value.
//!
//! Two independent primitives guard every object: a short bookkeeping
//! mutex for `{reference_count, being_removed}` and the `SafetyLock` that
//! guards the value. Lock attempts check the flag under the bookkeeping
//! mutex, release it, and only then block on the RW lock.

use crate::error::{self, ContractViolation};
use crate::lock_order::{self, ShortMutex};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use std::borrow::Cow;
use std::sync::{Arc, OnceLock, Weak};

/// A named reader-writer lock that one or several objects serialize on.
///
/// Cloning yields another handle to the same lock.
#[derive(Clone)]
pub struct SafetyLock {
    inner: Arc<LockInner>,
}

struct LockInner {
    raw: RawRwLock,
    name: Cow<'static, str>,
}

impl SafetyLock {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                raw: RawRwLock::INIT,
                name: name.into(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True if both handles refer to the same underlying lock.
    pub fn is_same(&self, other: &SafetyLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[track_caller]
    pub(crate) fn start_read(&self) {
        lock_order::assert_unheld("start_read");
        self.inner.raw.lock_shared();
    }

    pub(crate) fn try_start_read(&self) -> bool {
        self.inner.raw.try_lock_shared()
    }

    /// # Safety
    /// The calling context must own a shared lock on `self`.
    pub(crate) unsafe fn end_read(&self) {
        self.inner.raw.unlock_shared();
    }

    #[track_caller]
    pub(crate) fn start_write(&self) {
        lock_order::assert_unheld("start_write");
        self.inner.raw.lock_exclusive();
    }

    /// # Safety
    /// The calling context must own the exclusive lock on `self`.
    pub(crate) unsafe fn end_write(&self) {
        self.inner.raw.unlock_exclusive();
    }
}

impl fmt::Debug for SafetyLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetyLock")
            .field("name", &self.name())
            .finish()
    }
}

/// Pre-deletion hook consulted before every attempt to destroy a value.
///
/// Return `false` to postpone deletion to the next sweep, e.g. after
/// releasing a handle this value holds on another object that is itself
/// pending removal. Reference cycles are not detected; a value that holds
/// handles to its peers must break them here.
pub trait Collectable {
    fn garbage_collection(&self) -> bool {
        true
    }
}

macro_rules! collectable {
    ($($t:ty),* $(,)?) => {
        $(impl Collectable for $t {})*
    };
}

collectable!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64,
    String, &'static str,
);

impl<T> Collectable for Vec<T> {}
impl<T> Collectable for Option<T> {}
impl<T: ?Sized> Collectable for Box<T> {}
impl<T: ?Sized> Collectable for Arc<T> {}
impl<A, B> Collectable for (A, B) {}

/// A collection that stages removed objects and reclaims them on demand.
pub(crate) trait Reclaim<T>: Send + Sync {
    /// Reclaim `object` if it is staged here; false if it is not.
    fn reclaim(&self, object: &SafeObject<T>) -> bool;
}

pub(crate) type OwnerLink<T> = Weak<dyn Reclaim<T>>;

#[derive(Debug, Default)]
struct SafetyState {
    reference_count: usize,
    being_removed: bool,
    destroyed: bool,
}

/// A domain value made safe to share, lock and remove across threads.
pub struct SafeObject<T> {
    state: ShortMutex<SafetyState>,
    lock: OnceLock<SafetyLock>,
    hook: fn(&T) -> bool,
    staged_in: OnceLock<OwnerLink<T>>,
    value: UnsafeCell<ManuallyDrop<T>>,
}

// Readers on several threads see `&T`; a writer on any thread sees `&mut T`.
unsafe impl<T: Send + Sync> Sync for SafeObject<T> {}

impl<T: Collectable> SafeObject<T> {
    pub fn new(value: T) -> Self {
        Self::with_lock_cell(value, OnceLock::new())
    }

    pub fn shared(value: T) -> Arc<Self> {
        Arc::new(Self::new(value))
    }

    /// Create an object guarded by an externally supplied lock.
    pub fn with_lock(value: T, lock: SafetyLock) -> Self {
        Self::with_lock_cell(value, OnceLock::from(lock))
    }

    /// Create an object that serializes on `other`'s lock.
    pub fn with_lock_of<U>(value: T, other: &SafeObject<U>) -> Self {
        Self::with_lock(value, other.safety_lock().clone())
    }

    fn with_lock_cell(value: T, lock: OnceLock<SafetyLock>) -> Self {
        Self {
            state: ShortMutex::new(SafetyState::default()),
            lock,
            hook: T::garbage_collection,
            staged_in: OnceLock::new(),
            value: UnsafeCell::new(ManuallyDrop::new(value)),
        }
    }
}

impl<T> SafeObject<T> {
    /// The lock guarding the value; a private one is created on first use.
    pub fn safety_lock(&self) -> &SafetyLock {
        self.lock
            .get_or_init(|| SafetyLock::new(std::any::type_name::<T>()))
    }

    /// Take a reference unless the object is being removed.
    pub fn safe_reference(&self) -> bool {
        let mut state = self.state.lock();
        if state.being_removed {
            return false;
        }
        state.reference_count += 1;
        true
    }

    /// Release a reference.
    ///
    /// Returns true iff the count reached zero while the object is not
    /// being removed. Objects that are being removed are destroyed by the
    /// removal path, never on the strength of this return value.
    ///
    /// # Safety
    /// Must pair with an earlier successful
    /// [`safe_reference`](Self::safe_reference) that the caller owns and has
    /// not released yet. Releasing a reference held by a [`SafePtr`] or a
    /// guard lets the value be destroyed while that handle still reads it.
    ///
    /// ```compile_fail
    /// use safe_coll::SafeObject;
    ///
    /// let o = SafeObject::new(1);
    /// o.safe_dereference();
    /// ```
    ///
    /// [`SafePtr`]: crate::SafePtr
    pub unsafe fn safe_dereference(&self) -> bool {
        self.dereference()
    }

    pub(crate) fn dereference(&self) -> bool {
        let mut state = self.state.lock();
        if state.reference_count == 0 {
            drop(state);
            error::report(ContractViolation::ReferenceUnderflow);
            return false;
        }
        state.reference_count -= 1;
        state.reference_count == 0 && !state.being_removed
    }

    pub fn reference_count(&self) -> usize {
        self.state.lock().reference_count
    }

    /// Acquire the read lock; fails fast if the object is being removed.
    pub fn lock_read_only(&self) -> bool {
        if self.is_safely_being_removed() {
            tracing::trace!(object = ?self.addr(), "read lock denied: being removed");
            return false;
        }
        self.safety_lock().start_read();
        true
    }

    /// # Safety
    /// Must pair with a successful [`lock_read_only`](Self::lock_read_only).
    pub unsafe fn unlock_read_only(&self) {
        self.safety_lock().end_read();
    }

    /// Acquire the write lock; fails fast if the object is being removed.
    pub fn lock_read_write(&self) -> bool {
        if self.is_safely_being_removed() {
            tracing::trace!(object = ?self.addr(), "write lock denied: being removed");
            return false;
        }
        self.safety_lock().start_write();
        true
    }

    /// # Safety
    /// Must pair with a successful [`lock_read_write`](Self::lock_read_write).
    pub unsafe fn unlock_read_write(&self) {
        self.safety_lock().end_write();
    }

    /// Flag the object as being removed. Sticky and idempotent.
    pub fn safe_remove(&self) {
        self.state.lock().being_removed = true;
    }

    pub fn is_safely_being_removed(&self) -> bool {
        self.state.lock().being_removed
    }

    pub fn safely_can_be_deleted(&self) -> bool {
        let state = self.state.lock();
        state.being_removed && state.reference_count == 0
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Reference and read-lock the object for the guard's lifetime.
    pub fn read(&self) -> Option<SafeReadGuard<'_, T>> {
        if !self.safe_reference() {
            return None;
        }
        if !self.lock_read_only() {
            self.release_reference();
            return None;
        }
        Some(SafeReadGuard { object: self })
    }

    /// Reference and write-lock the object for the guard's lifetime.
    pub fn write(&self) -> Option<SafeWriteGuard<'_, T>> {
        if !self.safe_reference() {
            return None;
        }
        if !self.lock_read_write() {
            self.release_reference();
            return None;
        }
        Some(SafeWriteGuard { object: self })
    }

    /// Dereference, then collect the object if that made it deletable.
    pub(crate) fn release_reference(&self) {
        self.dereference();
        self.collect();
    }

    /// Remember the collection whose removal list holds this object.
    pub(crate) fn stage_in(&self, owner: OwnerLink<T>) {
        let _ = self.staged_in.set(owner);
    }

    /// Destroy a removed, unreferenced object once its hook agrees.
    ///
    /// An object staged in a live collection is handed back to it, so that
    /// it leaves the removal list together with its value. A postponed
    /// object waits for the next sweep, or for its last `Arc`.
    pub(crate) fn collect(&self) {
        if !self.safely_can_be_deleted() {
            return;
        }
        if let Some(owner) = self.staged_in.get().and_then(Weak::upgrade) {
            if owner.reclaim(self) {
                return;
            }
        }
        if self.garbage_collection() {
            self.destroy();
        } else {
            tracing::trace!(object = ?self.addr(), "deletion postponed by hook");
        }
    }

    /// Hold the object without the being-removed check, so that a sweep
    /// can inspect a removed object. Fails once the value is destroyed.
    pub(crate) fn pin(&self) -> bool {
        let mut state = self.state.lock();
        if state.destroyed {
            return false;
        }
        state.reference_count += 1;
        true
    }

    pub(crate) fn unpin(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.reference_count > 0);
        state.reference_count = state.reference_count.saturating_sub(1);
    }

    /// Drop the value in place if the object is removed and unreferenced.
    ///
    /// Returns false when it is not deletable yet or was already destroyed.
    pub(crate) fn destroy(&self) -> bool {
        let value = {
            let mut state = self.state.lock();
            if state.destroyed || !state.being_removed || state.reference_count != 0 {
                return false;
            }
            state.destroyed = true;
            // SAFETY: removed and unreferenced, so no handle or pin can reach
            // the value; `destroyed` makes this the only take.
            unsafe { ManuallyDrop::take(&mut *self.value.get()) }
        };
        tracing::trace!(object = ?self.addr(), "destroying safe object");
        drop(value);
        true
    }

    /// # Safety
    /// The caller holds a reference (or pin) and a read or write lock.
    pub(crate) unsafe fn value(&self) -> &T {
        &**self.value.get()
    }

    /// # Safety
    /// The caller holds a reference and the write lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn value_mut(&self) -> &mut T {
        &mut **self.value.get()
    }

    pub(crate) fn addr(&self) -> *const () {
        self as *const Self as *const ()
    }
}

impl<T> SafeObject<T> {
    /// Run the value's pre-deletion hook.
    ///
    /// The hook runs under a pin and a non-blocking read lock; if a writer
    /// currently holds the lock the object is postponed. A destroyed value
    /// has nothing left to release and reports ready.
    pub fn garbage_collection(&self) -> bool {
        if !self.pin() {
            return true;
        }
        let lock = self.safety_lock();
        let ready = if lock.try_start_read() {
            // SAFETY: pinned, so not destroyed; read-locked, so no writer.
            let ready = (self.hook)(unsafe { self.value() });
            unsafe { lock.end_read() };
            ready
        } else {
            false
        };
        self.unpin();
        ready
    }
}

impl<T> Drop for SafeObject<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.reference_count != 0 && !std::thread::panicking() {
            tracing::warn!(count = state.reference_count, "dropping referenced safe object");
            error::report(ContractViolation::DroppedWhileReferenced);
        }
        if !state.destroyed {
            // SAFETY: last owner, value not taken by `destroy`.
            unsafe { ManuallyDrop::drop(self.value.get_mut()) }
        }
    }
}

impl<T> fmt::Debug for SafeObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SafeObject")
            .field("addr", &self.addr())
            .field("reference_count", &state.reference_count)
            .field("being_removed", &state.being_removed)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

/// Scoped read access obtained from [`SafeObject::read`].
pub struct SafeReadGuard<'a, T> {
    object: &'a SafeObject<T>,
}

impl<T> Deref for SafeReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: referenced and read-locked for the guard's lifetime.
        unsafe { self.object.value() }
    }
}

impl<T> Drop for SafeReadGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.object.unlock_read_only() };
        self.object.release_reference();
    }
}

/// Scoped write access obtained from [`SafeObject::write`].
pub struct SafeWriteGuard<'a, T> {
    object: &'a SafeObject<T>,
}

impl<T> Deref for SafeWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: referenced and write-locked for the guard's lifetime.
        unsafe { self.object.value() }
    }
}

impl<T> DerefMut for SafeWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: referenced and write-locked; `&mut self` keeps it unique.
        unsafe { self.object.value_mut() }
    }
}

impl<T> Drop for SafeWriteGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.object.unlock_read_write() };
        self.object.release_reference();
    }
}
