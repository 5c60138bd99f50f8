//! Debug-only lock-order checker.
//!
//! Tracks, per thread, how many "short" mutexes (object bookkeeping,
//! collection structure, removal list) are currently held. Blocking on an
//! object's RW lock while holding one of them is the interleaving that lets
//! a thread walking a collection deadlock against a thread locking one of
//! its elements, so every blocking RW acquisition asserts the count is
//! zero. In release builds this compiles to a zero-cost no-op.

use core::ops::{Deref, DerefMut};
use parking_lot::{Mutex, MutexGuard};

#[cfg(debug_assertions)]
std::thread_local! {
    static SHORT_HELD: core::cell::Cell<u32> = const { core::cell::Cell::new(0) };
}

/// Marker held for as long as a short mutex is locked on this thread.
#[derive(Debug)]
pub(crate) struct Held {
    #[cfg(debug_assertions)]
    _priv: (),
}

impl Held {
    #[inline]
    pub(crate) fn enter() -> Self {
        #[cfg(debug_assertions)]
        {
            SHORT_HELD.with(|c| c.set(c.get() + 1));
            return Held { _priv: () };
        }

        #[cfg(not(debug_assertions))]
        {
            return Held {};
        }
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        SHORT_HELD.with(|c| {
            let d = c.get();
            debug_assert!(d > 0);
            c.set(d - 1);
        });
    }
}

/// Panics in debug builds if this thread holds any short mutex.
#[inline]
#[track_caller]
pub(crate) fn assert_unheld(op: &str) {
    #[cfg(debug_assertions)]
    SHORT_HELD.with(|c| {
        assert!(
            c.get() == 0,
            "lock order violated: {op} would block on an object lock while a short mutex is held"
        );
    });
    #[cfg(not(debug_assertions))]
    let _ = op;
}

/// A mutex that is only ever held briefly and never across a blocking
/// object-lock acquisition.
#[derive(Debug, Default)]
pub(crate) struct ShortMutex<T> {
    inner: Mutex<T>,
}

impl<T> ShortMutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> ShortGuard<'_, T> {
        let guard = self.inner.lock();
        ShortGuard {
            guard,
            _held: Held::enter(),
        }
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub(crate) struct ShortGuard<'a, T> {
    // Field order: the mutex is released before the marker is dropped.
    guard: MutexGuard<'a, T>,
    _held: Held,
}

impl<T> Deref for ShortGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ShortGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::{assert_unheld, ShortMutex};

    #[test]
    fn unheld_outside_any_short_mutex() {
        assert_unheld("test");
        let m = ShortMutex::new(1);
        {
            let g = m.lock();
            assert_eq!(*g, 1);
        }
        assert_unheld("after release");
    }

    #[test]
    fn nested_short_mutexes_release_cleanly() {
        let a = ShortMutex::new(());
        let b = ShortMutex::new(());
        {
            let _ga = a.lock();
            let _gb = b.lock();
        }
        assert_unheld("after nested release");
    }

    #[cfg(debug_assertions)]
    #[test]
    fn blocking_under_short_mutex_panics_in_debug() {
        let m = ShortMutex::new(());
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g = m.lock();
            assert_unheld("lock_read_write");
        }));
        assert!(res.is_err(), "expected lock-order violation to panic in debug builds");
        // The guard unwound with the panic; this thread holds nothing now.
        assert_unheld("after unwind");
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn checker_is_noop_in_release() {
        let m = ShortMutex::new(());
        let _g = m.lock();
        assert_unheld("release build");
    }
}
