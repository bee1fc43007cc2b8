//! In-process single-writer registry.
//!
//! Exactly one coordinator may drive a given archive at a time. The
//! registry is the mutation gate: a coordinator must hold the
//! [`ArchiveGuard`] for a fingerprint for the archive's whole lifetime, and
//! the guard releases the fingerprint on every exit path — success,
//! failure, cancellation, panic — because release lives in `Drop`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::fingerprint::Fingerprint;

#[derive(Clone, Default)]
pub struct ActiveArchives {
    held: Arc<Mutex<HashSet<Fingerprint>>>,
}

impl ActiveArchives {
    pub fn new() -> ActiveArchives {
        ActiveArchives::default()
    }

    /// Claim a fingerprint. Returns `None` when another coordinator already
    /// holds it, which callers treat as "someone else is on it" and skip.
    pub fn try_acquire(&self, fingerprint: &Fingerprint) -> Option<ArchiveGuard> {
        let mut held = lock_set(&self.held);
        if !held.insert(fingerprint.clone()) {
            return None;
        }
        Some(ArchiveGuard {
            held: Arc::clone(&self.held),
            fingerprint: fingerprint.clone(),
        })
    }

    pub fn is_active(&self, fingerprint: &Fingerprint) -> bool {
        lock_set(&self.held).contains(fingerprint)
    }

    pub fn active_count(&self) -> usize {
        lock_set(&self.held).len()
    }
}

pub struct ArchiveGuard {
    held: Arc<Mutex<HashSet<Fingerprint>>>,
    fingerprint: Fingerprint,
}

impl Drop for ArchiveGuard {
    fn drop(&mut self) {
        lock_set(&self.held).remove(&self.fingerprint);
    }
}

fn lock_set(set: &Mutex<HashSet<Fingerprint>>) -> MutexGuard<'_, HashSet<Fingerprint>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
