//! Single-attempt locks keyed by radio identifier
//!
//! Two attempts on the same device are refused; attempts on distinct devices
//! proceed independently. Clones share the same lock table, so several
//! orchestrators can be handed one `AttemptLocks`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct AttemptLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl AttemptLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashSet<String>> {
        // the set stays consistent even if a holder panicked
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` if an attempt for `device` is already in flight
    pub fn try_acquire(&self, device: &str) -> Option<AttemptGuard> {
        if !self.table().insert(device.to_string()) {
            return None;
        }
        Some(AttemptGuard { locks: self.clone(), device: device.to_string() })
    }

    pub fn is_held(&self, device: &str) -> bool {
        self.table().contains(device)
    }
}

/// Releases the lock when dropped
#[derive(Debug)]
pub struct AttemptGuard {
    locks: AttemptLocks,
    device: String,
}

impl AttemptGuard {
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.locks.table().remove(&self.device);
    }
}
