//! SafeCollection: the shared core behind every safe collection façade.
//!
//! Structure and lifetime are tracked separately. The container (under
//! the structural mutex) says which objects are members; the removal list
//! (under its own mutex) holds objects that left the container but may
//! still be referenced. An object is moved from one to the other exactly
//! once, and its value is destroyed only after it is flagged removed and
//! unreferenced.
//!
//! Neither mutex is ever held while blocking on an object lock, while a
//! pre-deletion hook runs, or while a value is destroyed or an `Arc`
//! released.

use crate::container::{Object, SafeContainer};
use crate::error::{self, ContractViolation};
use crate::lock_order::{ShortGuard, ShortMutex};
use crate::safe_object::{OwnerLink, Reclaim, SafeObject};
use crate::settings::Settings;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct SafeCollection<C: SafeContainer> {
    this: Weak<Self>,
    container: ShortMutex<C>,
    to_be_removed: ShortMutex<Vec<Object<C>>>,
    delete_objects: AtomicBool,
    settings: Settings,
}

impl<C: SafeContainer> SafeCollection<C> {
    pub(crate) fn new(settings: Settings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            container: ShortMutex::new(C::default()),
            to_be_removed: ShortMutex::new(Vec::new()),
            delete_objects: AtomicBool::new(settings.delete_objects),
            settings,
        })
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn name(&self) -> &str {
        &self.settings.name
    }

    pub(crate) fn delete_objects(&self) -> bool {
        self.delete_objects.load(Ordering::Acquire)
    }

    pub(crate) fn allow_delete_objects(&self, yes: bool) {
        self.delete_objects.store(yes, Ordering::Release);
    }

    /// Lock the structure. Callers must not block on an object lock, nor
    /// drop an `Arc<SafeObject>` that may be the last, while holding it.
    pub(crate) fn structure(&self) -> ShortGuard<'_, C> {
        self.container.lock()
    }

    pub(crate) fn len(&self) -> usize {
        self.container.lock().len()
    }

    pub(crate) fn pending_removal_len(&self) -> usize {
        self.to_be_removed.lock().len()
    }

    fn owner_link(&self) -> OwnerLink<C::Value> {
        self.this.clone()
    }

    /// Take the collection's own reference on `object` before it is
    /// indexed. Runs under the structural mutex.
    ///
    /// Fails if `object` is already a member (a contract violation) or is
    /// being removed elsewhere.
    pub(crate) fn safe_add_object(&self, container: &C, object: &SafeObject<C::Value>) -> bool {
        if container.contains_object(object) {
            error::report(ContractViolation::DuplicateInsert);
            return false;
        }
        object.safe_reference()
    }

    /// Drop the collection's reference on an object just unlinked from the
    /// container. Runs under the structural mutex; pass the object to
    /// [`settle`](Self::settle) once that mutex is released.
    ///
    /// An owning collection flags the object removed and stages it first.
    pub(crate) fn safe_remove_object(&self, object: &Object<C>) {
        if self.delete_objects() {
            object.safe_remove();
            object.stage_in(self.owner_link());
            self.to_be_removed.lock().push(object.clone());
        }
        object.dereference();
    }

    /// Reclaim detached objects that nobody references any more, then let
    /// the `Arc`s go. Call with no collection mutex held.
    pub(crate) fn settle(&self, detached: Vec<Object<C>>) {
        for object in &detached {
            object.collect();
        }
    }

    pub(crate) fn remove(&self, object: &SafeObject<C::Value>) -> bool {
        let detached = {
            let mut container = self.container.lock();
            let Some(key) = container.key_of(object) else {
                return false;
            };
            let Some(detached) = container.remove(&key) else {
                return false;
            };
            self.safe_remove_object(&detached);
            detached
        };
        self.settle(vec![detached]);
        true
    }

    pub(crate) fn remove_at(&self, key: &C::Key) -> bool {
        let detached = {
            let mut container = self.container.lock();
            let Some(detached) = container.remove(key) else {
                return false;
            };
            self.safe_remove_object(&detached);
            detached
        };
        self.settle(vec![detached]);
        true
    }

    /// Remove every member. With `synchronous`, wait until every staged
    /// object has been destroyed.
    pub(crate) fn remove_all(&self, synchronous: bool) {
        let detached: Vec<_> = {
            let mut container = self.container.lock();
            let drained = container.drain();
            for (_, object) in &drained {
                self.safe_remove_object(object);
            }
            drained.into_iter().map(|(_, o)| o).collect()
        };
        tracing::trace!(collection = %self.name(), count = detached.len(), "removed all");
        self.settle(detached);

        if synchronous {
            while !self.delete_objects_to_be_removed() {
                tracing::debug!(
                    collection = %self.name(),
                    pending = self.pending_removal_len(),
                    "waiting for referenced objects before remove_all returns"
                );
                std::thread::sleep(self.settings.remove_all_poll);
            }
        }
    }

    /// Sweep the removal list, destroying every object whose hook agrees
    /// and that nobody references. True if both the removal list and the
    /// container are now empty.
    pub(crate) fn delete_objects_to_be_removed(&self) -> bool {
        let staged: Vec<Object<C>> = self.to_be_removed.lock().clone();
        let ready: Vec<Object<C>> = staged
            .into_iter()
            .filter(|o| o.garbage_collection() && o.safely_can_be_deleted())
            .collect();

        let mut doomed = Vec::with_capacity(ready.len());
        if !ready.is_empty() {
            let mut list = self.to_be_removed.lock();
            list.retain(|o| {
                let hit = ready.iter().any(|r| Arc::ptr_eq(r, o));
                if hit {
                    doomed.push(o.clone());
                }
                !hit
            });
        }

        let mut destroyed = 0usize;
        for object in &doomed {
            if object.destroy() {
                destroyed += 1;
            } else if !object.is_destroyed() {
                // Pinned by a concurrent sweep; try again next time.
                self.to_be_removed.lock().push(object.clone());
            }
        }
        if destroyed > 0 {
            tracing::debug!(collection = %self.name(), destroyed, "swept removed objects");
        }

        let empty = self.to_be_removed.lock().is_empty();
        empty && self.container.lock().is_empty()
    }
}

impl<C: SafeContainer> Drop for SafeCollection<C> {
    fn drop(&mut self) {
        // Nothing else can reach the core now; handles still out there
        // collect their object themselves.
        let owning = *self.delete_objects.get_mut();
        for (_, object) in self.container.get_mut().drain() {
            if owning {
                object.safe_remove();
            }
            object.dereference();
            object.collect();
        }
        for object in self.to_be_removed.get_mut().drain(..) {
            object.collect();
        }
    }
}

impl<C: SafeContainer> Reclaim<C::Value> for SafeCollection<C> {
    fn reclaim(&self, object: &SafeObject<C::Value>) -> bool {
        let staged = {
            let mut list = self.to_be_removed.lock();
            list.iter()
                .position(|o| core::ptr::eq(&**o, object))
                .map(|i| list.swap_remove(i))
        };
        let Some(staged) = staged else {
            return false;
        };
        if staged.garbage_collection() && staged.destroy() {
            tracing::trace!(collection = %self.name(), object = ?staged.addr(), "reclaimed");
        } else if !staged.is_destroyed() {
            self.to_be_removed.lock().push(staged);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ListContainer;
    use crate::safe_object::Collectable;
    use crate::safe_ptr::{SafePtr, SafetyMode};
    use std::sync::atomic::AtomicUsize;

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    impl Collectable for Tracked {}

    type Core = SafeCollection<ListContainer<Tracked>>;

    fn add(core: &Arc<Core>, object: &Arc<SafeObject<Tracked>>) -> bool {
        let mut c = core.structure();
        if !core.safe_add_object(&c, object) {
            return false;
        }
        c.push(object.clone());
        true
    }

    /// Invariant: membership holds exactly one reference per object.
    #[test]
    fn add_takes_one_reference() {
        let core = Core::new(Settings::default());
        let drops = Arc::new(AtomicUsize::new(0));
        let o = SafeObject::shared(Tracked(drops.clone()));
        assert!(add(&core, &o));
        assert_eq!(o.reference_count(), 1);
        assert_eq!(core.len(), 1);
    }

    /// Invariant: an unreferenced object removed from an owning collection
    /// is destroyed immediately and never lingers in the removal list.
    #[test]
    fn remove_unreferenced_destroys_at_once() {
        let core = Core::new(Settings::default());
        let drops = Arc::new(AtomicUsize::new(0));
        let o = SafeObject::shared(Tracked(drops.clone()));
        add(&core, &o);
        assert!(core.remove(&o));
        assert!(!core.remove(&o), "already gone");
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(core.pending_removal_len(), 0);
        assert!(o.is_safely_being_removed());
    }

    /// Invariant: a referenced object is staged, disjoint from the
    /// container, and destroyed when its last handle goes.
    #[test]
    fn referenced_object_staged_until_last_release() {
        let core = Core::new(Settings::default());
        let drops = Arc::new(AtomicUsize::new(0));
        let o = SafeObject::shared(Tracked(drops.clone()));
        add(&core, &o);
        let p = SafePtr::new(&o, SafetyMode::ReadWrite);
        assert!(core.remove_at(&0));
        assert_eq!(core.len(), 0);
        assert_eq!(core.pending_removal_len(), 1);
        assert!(!core.delete_objects_to_be_removed(), "still referenced");
        drop(p);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(core.pending_removal_len(), 0);
        assert!(core.delete_objects_to_be_removed());
    }

    /// Invariant: a non-owning collection leaves removed objects alive.
    #[test]
    fn non_owning_remove_keeps_value() {
        let core = Core::new(Settings::default().with_delete_objects(false));
        let drops = Arc::new(AtomicUsize::new(0));
        let o = SafeObject::shared(Tracked(drops.clone()));
        add(&core, &o);
        assert!(core.remove(&o));
        assert!(!o.is_safely_being_removed());
        assert_eq!(o.reference_count(), 0);
        assert_eq!(core.pending_removal_len(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(o);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "cannot insert safe object twice")]
    fn duplicate_add_panics_in_debug() {
        let core = Core::new(Settings::default());
        let o = SafeObject::shared(Tracked(Arc::new(AtomicUsize::new(0))));
        add(&core, &o);
        add(&core, &o);
    }

    #[test]
    fn add_refused_for_object_removed_elsewhere() {
        let core = Core::new(Settings::default());
        let o = SafeObject::shared(Tracked(Arc::new(AtomicUsize::new(0))));
        o.safe_remove();
        assert!(!add(&core, &o));
        assert_eq!(core.len(), 0);
    }

    struct Postpone(Arc<AtomicBool>);
    impl Collectable for Postpone {
        fn garbage_collection(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Invariant: a hook returning false keeps the object staged across sweeps.
    #[test]
    fn hook_postpones_destruction() {
        let core = SafeCollection::<ListContainer<Postpone>>::new(Settings::default());
        let ready = Arc::new(AtomicBool::new(false));
        let o = SafeObject::shared(Postpone(ready.clone()));
        {
            let mut c = core.structure();
            assert!(core.safe_add_object(&c, &o));
            c.push(o.clone());
        }
        core.remove_all(false);
        assert_eq!(core.pending_removal_len(), 1);
        assert!(!core.delete_objects_to_be_removed());
        ready.store(true, Ordering::SeqCst);
        assert!(core.delete_objects_to_be_removed());
        assert!(o.is_destroyed());
    }

    /// Invariant: the last handle on a staged object consults the hook; a
    /// postponed object stays staged, undestroyed, for the next sweep.
    #[test]
    fn last_release_of_staged_object_respects_hook() {
        let core = SafeCollection::<ListContainer<Postpone>>::new(Settings::default());
        let ready = Arc::new(AtomicBool::new(false));
        let o = SafeObject::shared(Postpone(ready.clone()));
        {
            let mut c = core.structure();
            assert!(core.safe_add_object(&c, &o));
            c.push(o.clone());
        }
        let p = SafePtr::new(&o, SafetyMode::ReadOnly);
        let g = o.read().unwrap();
        assert!(core.remove(&o));
        drop(p);
        drop(g);
        assert!(!o.is_destroyed());
        assert_eq!(core.pending_removal_len(), 1);

        ready.store(true, Ordering::SeqCst);
        assert!(core.delete_objects_to_be_removed());
        assert!(o.is_destroyed());
    }

    /// Invariant: a staged object released through a guard leaves the
    /// removal list together with its value.
    #[test]
    fn guard_release_unstages_destroyed_object() {
        let core = Core::new(Settings::default());
        let drops = Arc::new(AtomicUsize::new(0));
        let o = SafeObject::shared(Tracked(drops.clone()));
        add(&core, &o);
        let g = o.read().unwrap();
        assert!(core.remove(&o));
        assert_eq!(core.pending_removal_len(), 1);
        drop(g);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(core.pending_removal_len(), 0);
    }
}
