use crate::instrumentation::DEFAULT_EVENT_LOG_CAPACITY;
use connlab_core::http::ParseLimits;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_IDLE_SWEEP_MS: u64 = 50;
const DEFAULT_MAX_HOPS: usize = 8;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

pub fn admission_timeout_ms() -> u64 {
    static TIMEOUT_MS: OnceLock<u64> = OnceLock::new();
    *TIMEOUT_MS.get_or_init(|| {
        env_u64("CONNLAB_ADMISSION_TIMEOUT_MS").unwrap_or(DEFAULT_ADMISSION_TIMEOUT_MS)
    })
}

pub fn idle_sweep_ms() -> u64 {
    static SWEEP_MS: OnceLock<u64> = OnceLock::new();
    *SWEEP_MS.get_or_init(|| env_u64("CONNLAB_IDLE_SWEEP_MS").unwrap_or(DEFAULT_IDLE_SWEEP_MS))
}

pub fn max_header_bytes() -> usize {
    static MAX_BYTES: OnceLock<usize> = OnceLock::new();
    *MAX_BYTES.get_or_init(|| {
        env_u64("CONNLAB_MAX_HEADER_BYTES")
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(ParseLimits::default().max_header_bytes)
    })
}

pub fn event_log_capacity() -> usize {
    static CAPACITY: OnceLock<usize> = OnceLock::new();
    *CAPACITY.get_or_init(|| {
        env_u64("CONNLAB_EVENT_LOG_CAPACITY")
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(DEFAULT_EVENT_LOG_CAPACITY)
    })
}

/// Settings shared by every operation of a harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// How long a queued operation waits for a slot before failing.
    pub admission_timeout: Duration,
    pub idle_sweep_interval: Duration,
    pub parse_limits: ParseLimits,
    /// Redirects and authentication retries allowed per operation.
    pub max_hops: usize,
    /// Limit applied to groups that were never configured explicitly.
    pub default_connection_limit: Option<usize>,
    pub default_max_idle_time: Option<Duration>,
    /// Log every instrumented read and write at debug level.
    pub debug_io: bool,
    /// Most recent I/O events kept by the harness event log.
    pub event_log_capacity: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            admission_timeout: Duration::from_millis(admission_timeout_ms()),
            idle_sweep_interval: Duration::from_millis(idle_sweep_ms()),
            parse_limits: ParseLimits {
                max_header_bytes: max_header_bytes(),
                ..ParseLimits::default()
            },
            max_hops: DEFAULT_MAX_HOPS,
            default_connection_limit: None,
            default_max_idle_time: None,
            debug_io: false,
            event_log_capacity: event_log_capacity(),
        }
    }
}

impl HarnessConfig {
    #[must_use]
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_idle_sweep_interval(mut self, interval: Duration) -> Self {
        self.idle_sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_connection_limit(mut self, limit: Option<usize>) -> Self {
        self.default_connection_limit = limit;
        self
    }

    #[must_use]
    pub fn with_max_idle_time(mut self, idle: Option<Duration>) -> Self {
        self.default_max_idle_time = idle;
        self
    }

    #[must_use]
    pub fn with_max_hops(mut self, hops: usize) -> Self {
        self.max_hops = hops;
        self
    }

    #[must_use]
    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_debug_io(mut self, debug_io: bool) -> Self {
        self.debug_io = debug_io;
        self
    }
}
