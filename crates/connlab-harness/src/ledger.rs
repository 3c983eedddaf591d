use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Monotonic id source owned by one harness.
#[derive(Debug)]
pub(crate) struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Counts server responses that were produced but not yet fully written.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResponseLedger {
    outstanding: Arc<AtomicUsize>,
}

impl ResponseLedger {
    pub(crate) fn track(&self) -> TrackedResponse {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        TrackedResponse {
            outstanding: Arc::clone(&self.outstanding),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

pub(crate) struct TrackedResponse {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for TrackedResponse {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}
