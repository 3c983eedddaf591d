use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Rate-limited reporting of broken invariants.
///
/// Test builds (and builds with the `invariant-panic` feature) panic on the
/// first violation; other builds log at most once per interval.
pub struct InvariantReporter {
    name: &'static str,
    interval_us: u64,
    last_log_at: AtomicU64,
}

impl InvariantReporter {
    pub const fn new(name: &'static str, interval_us: u64) -> Self {
        Self {
            name,
            interval_us,
            last_log_at: AtomicU64::new(0),
        }
    }

    fn should_log(&self, now_us: u64) -> bool {
        loop {
            let last = self.last_log_at.load(Ordering::Relaxed);
            if last != 0 && now_us.saturating_sub(last) < self.interval_us {
                return false;
            }
            if self
                .last_log_at
                .compare_exchange(last, now_us.max(1), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Reports `message` when `holds` is false.
    pub fn check(&self, holds: bool, message: impl FnOnce() -> String) {
        if !holds {
            self.report(monotonic_us(), message());
        }
    }

    pub fn report(&self, now_us: u64, message: impl Display) {
        let message = message.to_string();
        if self.should_log(now_us) {
            tracing::error!("invariant {} violated: {}", self.name, message);
        }
        #[cfg(any(test, feature = "invariant-panic"))]
        panic!("invariant {} violated: {}", self.name, message);
    }
}

/// Microseconds since the first call in this process.
pub fn monotonic_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
}
