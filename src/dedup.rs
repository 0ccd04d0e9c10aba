//! Process-wide idempotency set.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Identities of every event that has been applied.
///
/// Grows monotonically for the life of the process. Shared by all customers
/// and safe to use from many threads.
#[derive(Debug, Default)]
pub struct SeenSet {
    ids: Mutex<HashSet<String>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_seen(&self, event_id: &str) -> bool {
        self.lock().contains(event_id)
    }

    pub fn mark_seen(&self, event_id: &str) {
        self.lock().insert(event_id.to_string());
    }

    /// Insert `event_id` unless present. Returns `true` for exactly one
    /// caller per identity, however many threads race on it.
    pub fn mark_if_unseen(&self, event_id: &str) -> bool {
        let mut ids = self.lock();
        if ids.contains(event_id) {
            return false;
        }
        ids.insert(event_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // A panic while holding this lock cannot leave the set half-updated.
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
