//! Per-model mutual exclusion.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use statecraft_core::{ModelId, Problem};

/// Lock table keyed by model id.
///
/// Submissions targeting the same model run one after another; submissions
/// for different models do not block each other.
#[derive(Debug, Default)]
pub struct ModelLocks {
    held: Mutex<HashSet<ModelId>>,
    released: Condvar,
}

impl ModelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `id` is free, then hold it until the guard drops.
    pub fn acquire(&self, id: ModelId) -> Result<ModelLockGuard<'_>, Problem> {
        let poisoned = |_| Problem::internal("model lock table poisoned");
        let mut held = self.held.lock().map_err(poisoned)?;
        while held.contains(&id) {
            held = self.released.wait(held).map_err(poisoned)?;
        }
        held.insert(id);
        Ok(ModelLockGuard { locks: self, id })
    }

    pub fn is_locked(&self, id: ModelId) -> bool {
        self.held.lock().is_ok_and(|held| held.contains(&id))
    }
}

#[derive(Debug)]
pub struct ModelLockGuard<'a> {
    locks: &'a ModelLocks,
    id: ModelId,
}

impl Drop for ModelLockGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.id);
        }
        self.locks.released.notify_all();
    }
}
