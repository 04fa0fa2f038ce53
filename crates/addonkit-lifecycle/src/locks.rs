use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-process mutual exclusion keyed by addon name. Operations on different
/// addons never contend; the database unique constraint and `BEGIN IMMEDIATE`
/// cover other processes.
#[derive(Debug, Clone, Default)]
pub struct AddonLocks {
    entries: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AddonLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, addon_name: &str) -> Arc<Mutex<()>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(addon_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Holds an addon lock; a panic in a previous holder does not wedge the addon.
pub(crate) fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
