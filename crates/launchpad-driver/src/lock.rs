//! Per-service single-flight lock for scale adjustments.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Set of service unique names with a scale adjustment in progress.
#[derive(Debug, Clone, Default)]
pub struct ScaleLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ScaleLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name`. Returns `None` if another adjustment holds it.
    pub fn try_acquire(&self, name: &str) -> Option<ScaleGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(name.to_string()) {
            return None;
        }
        Some(ScaleGuard {
            held: self.held.clone(),
            name: name.to_string(),
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Releases its name on drop.
#[derive(Debug)]
pub struct ScaleGuard {
    held: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for ScaleGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}
