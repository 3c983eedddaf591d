//! Small helpers for deterministic failure injection in tests.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts down a number of forced failures.
pub struct FailureCounter {
    remaining: AtomicUsize,
}

impl FailureCounter {
    pub const fn new() -> Self {
        Self {
            remaining: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, count: usize) {
        self.remaining.store(count, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Consumes one failure, returning whether the caller should fail.
    pub fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl Default for FailureCounter {
    fn default() -> Self {
        Self::new()
    }
}
