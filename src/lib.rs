//! safe-coll: thread-safe collections of reference-counted, lockable
//! objects whose values are destroyed only once provably unreferenced.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: let many threads share, lock and remove entries of a registry
//!   (calls, connections, plugins) without races, double frees, or
//!   deadlock between per-object locks and the registry's own mutex.
//! - Layers:
//!   - SafeObject<T>: wraps a value with a reference count, a sticky
//!     being-removed flag and a reader-writer lock that is created lazily
//!     or shared with other objects.
//!   - SafePtr<T>: a handle holding one reference and, per its
//!     `SafetyMode`, one read or write lock. `SafePtrMultiThreaded<T>` puts
//!     the handle itself behind a mutex.
//!   - SafeCollection<C>: the shared core. It owns a structural container
//!     and a removal list, and turns insert/remove into the reference and
//!     removal protocol.
//!   - SafeColl<C>: the public façade over any `SafeContainer`;
//!     `SafeList<T>` and `SafeDictionary<K, T>` are its two instances.
//!
//! Locking discipline
//! - Per object: a short bookkeeping mutex for `{count, removed}` and a
//!   separate RW lock for the value. Lock attempts check the flag under
//!   the mutex, release it, then block on the RW lock.
//! - Per collection: a structural mutex and a removal-list mutex. Both
//!   are "short": never held while blocking on an object lock, while a
//!   pre-deletion hook runs, or while a value is dropped.
//! - Lookups take a reference-only handle under the structural mutex and
//!   lock the object in the requested mode after releasing it.
//! - Debug builds count held short mutexes per thread and panic if a
//!   blocking object-lock acquisition happens under one.
//!
//! Lifetime
//! - Memory is owned by `Arc`; the protocol decides when the *value* is
//!   dropped in place. A value is destroyed at most once, and only when
//!   its object is flagged removed and unreferenced.
//! - Removing an object from an owning collection flags it and stages it
//!   on the removal list, and the object remembers that collection. The
//!   release that makes it unreferenced, through a `SafePtr` or a guard,
//!   hands it back to the collection, which destroys it once its
//!   `Collectable` hook agrees; `delete_objects_to_be_removed` (or the
//!   background sweeper) retries whatever the hook postponed.
//! - `safe_dereference` is `unsafe`: only a reference the caller took
//!   itself may be released through it.
//! - Copies of a collection never own deletion: they add a reference to
//!   each member and drop it on removal.
//!
//! Notes and non-goals
//! - No cycle detection: values holding handles to each other must drop
//!   them in `Collectable::garbage_collection`.
//! - `SafePtr::set_safety_mode` releases then reacquires; it is not an
//!   atomic upgrade.
//! - Iterating a live collection may end early when the current member
//!   is removed; iterate a snapshot for a full traversal.
//! - Contract violations (inserting a member twice, dereferencing below
//!   zero) are logged with `tracing` and panic in debug builds.

mod container;
mod error;
mod keyed_container;
mod lock_order;
mod safe_coll;
mod safe_collection;
mod safe_dictionary;
mod safe_object;
mod safe_ptr;
mod safe_ptr_mt;
mod settings;
mod sweeper;

// Public surface
pub use container::{ListContainer, SafeContainer};
pub use error::{ContractViolation, Error};
pub use keyed_container::{InsertError, KeyedContainer};
pub use safe_coll::{Iter, SafeColl, SafeList};
pub use safe_dictionary::SafeDictionary;
pub use safe_object::{Collectable, SafeObject, SafeReadGuard, SafeWriteGuard, SafetyLock};
pub use safe_ptr::{SafePtr, SafetyMode};
pub use safe_ptr_mt::SafePtrMultiThreaded;
pub use settings::Settings;
