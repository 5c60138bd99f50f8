use proptest::prelude::*;
use safe_coll::{Collectable, SafeList, SafeObject, SafePtr, SafetyMode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Tracked(Arc<AtomicUsize>);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl Collectable for Tracked {}

struct Model {
    object: Arc<SafeObject<Tracked>>,
    drops: Arc<AtomicUsize>,
    removed: bool,
    handles: Vec<SafePtr<Tracked>>,
}

// Model a single-threaded workload on an owning SafeList and check, after
// every step, that a value is destroyed exactly when its object has been
// removed and no handle is left, never twice, and that members and the
// removal list stay disjoint.
proptest! {
    #[test]
    fn prop_safe_list_liveness(ops in proptest::collection::vec((0u8..=5u8, 0usize..64usize), 1..120)) {
        let list: SafeList<Tracked> = SafeList::new();
        let mut model: Vec<Model> = Vec::new();

        for (op, raw) in ops {
            match op {
                // Append a fresh object, sometimes keeping the returned handle.
                0 => {
                    let drops = Arc::new(AtomicUsize::new(0));
                    let object = SafeObject::shared(Tracked(drops.clone()));
                    let mode = if raw % 2 == 0 { SafetyMode::Reference } else { SafetyMode::ReadOnly };
                    let p = list.append(&object, mode);
                    prop_assert!(!p.is_null());
                    let handles = if raw % 3 == 0 { vec![p] } else { Vec::new() };
                    model.push(Model { object, drops, removed: false, handles });
                }
                // Take another handle by identity; null once removed.
                1 => {
                    if model.is_empty() { continue; }
                    let i = raw % model.len();
                    let m = &mut model[i];
                    let p = list.find_object(&m.object, SafetyMode::ReadOnly);
                    prop_assert_eq!(p.is_null(), m.removed);
                    if !p.is_null() {
                        m.handles.push(p);
                    }
                }
                // Drop one handle.
                2 => {
                    if model.is_empty() { continue; }
                    let i = raw % model.len();
                    model[i].handles.pop();
                }
                // Remove by identity.
                3 => {
                    if model.is_empty() { continue; }
                    let i = raw % model.len();
                    let m = &mut model[i];
                    prop_assert_eq!(list.remove(&m.object), !m.removed);
                    m.removed = true;
                }
                // Remove by index.
                4 => {
                    let live: Vec<usize> = (0..model.len()).filter(|&i| !model[i].removed).collect();
                    if live.is_empty() { continue; }
                    let pos = raw % live.len();
                    prop_assert!(list.remove_at(&pos));
                    model[live[pos]].removed = true;
                }
                // Sweep.
                5 => {
                    let done = list.delete_objects_to_be_removed();
                    prop_assert_eq!(done, model.iter().all(|m| m.removed && m.handles.is_empty()));
                }
                _ => unreachable!(),
            }

            for m in &model {
                let destroyed = m.drops.load(Ordering::SeqCst);
                prop_assert!(destroyed <= 1);
                prop_assert_eq!(destroyed == 1, m.removed && m.handles.is_empty());
                prop_assert_eq!(m.object.reference_count(), m.handles.len() + usize::from(!m.removed));
            }
            let members = model.iter().filter(|m| !m.removed).count();
            let pending = model.iter().filter(|m| m.removed && !m.handles.is_empty()).count();
            prop_assert_eq!(list.len(), members);
            prop_assert_eq!(list.pending_removal_len(), pending);
        }

        // Releasing every handle destroys every removed value.
        for m in &mut model {
            m.handles.clear();
        }
        list.remove_all(true);
        for m in &model {
            prop_assert_eq!(m.drops.load(Ordering::SeqCst), 1);
        }
    }
}
