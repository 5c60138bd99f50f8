//! Collection configuration.

use std::borrow::Cow;
use std::time::Duration;

/// Tunables for a [`SafeColl`](crate::SafeColl).
#[derive(Clone, Debug)]
pub struct Settings {
    /// Whether the collection owns deletion of removed objects.
    pub delete_objects: bool,
    /// Period of the background sweep started by `set_auto_delete_objects`.
    pub sweep_interval: Duration,
    /// Sleep step while a synchronous `remove_all` waits for stragglers.
    pub remove_all_poll: Duration,
    /// Diagnostic name; used for the sweeper thread and log fields.
    pub name: Cow<'static, str>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            delete_objects: true,
            sweep_interval: Duration::from_secs(1),
            remove_all_poll: Duration::from_millis(10),
            name: Cow::Borrowed("safe-coll"),
        }
    }
}

impl Settings {
    pub fn with_delete_objects(mut self, yes: bool) -> Self {
        self.delete_objects = yes;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_remove_all_poll(mut self, poll: Duration) -> Self {
        self.remove_all_poll = poll;
        self
    }

    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }
}
