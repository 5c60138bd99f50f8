//! Background sweep thread for `set_auto_delete_objects`.

use crate::container::SafeContainer;
use crate::error::Error;
use crate::safe_collection::SafeCollection;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

#[derive(Default)]
struct Signal {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Periodically sweeps one collection until dropped or until the
/// collection itself goes away.
pub(crate) struct Sweeper {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub(crate) fn spawn<C: SafeContainer>(collection: &Arc<SafeCollection<C>>) -> Result<Self, Error> {
        let signal = Arc::new(Signal::default());
        let weak: Weak<SafeCollection<C>> = Arc::downgrade(collection);
        let interval = collection.settings().sweep_interval;
        let name = collection.name().to_owned();

        let thread_signal = signal.clone();
        let handle = thread::Builder::new()
            .name(format!("{name}-sweeper"))
            .spawn(move || {
                tracing::debug!(collection = %name, ?interval, "sweeper started");
                loop {
                    {
                        let mut stop = thread_signal.stop.lock();
                        if !*stop {
                            thread_signal.wake.wait_for(&mut stop, interval);
                        }
                        if *stop {
                            break;
                        }
                    }
                    let Some(collection) = weak.upgrade() else {
                        break;
                    };
                    collection.delete_objects_to_be_removed();
                }
                tracing::debug!(collection = %name, "sweeper stopped");
            })
            .map_err(|source| Error::SpawnSweeper {
                collection: collection.name().to_owned(),
                source,
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        *self.signal.stop.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            // A value destroyed by the sweep may own the collection itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
