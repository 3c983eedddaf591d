//! Byte-level hooks around a transport stream.
//!
//! A stream carries at most one armed read hook and one armed write hook.
//! Hooks are one-shot: a hook that wants to see the next read as well asks
//! to be re-armed in its reply.

mod stream;


pub use stream::InstrumentedStream;

use connlab_core::error::{HarnessError, Result};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// What a read hook sees after the inner read completed.
#[derive(Debug, Clone)]
pub struct ReadEvent {
    pub connection_id: u64,
    /// The bytes just read.
    pub buffer: Vec<u8>,
    /// Stream position of the first byte in `buffer`.
    pub offset: u64,
    /// Capacity the caller asked for.
    pub size: usize,
    pub bytes_read: usize,
    pub cancel: CancellationToken,
}

/// What a write hook sees before the bytes reach the transport.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    pub connection_id: u64,
    pub buffer: Vec<u8>,
    pub offset: u64,
    pub cancel: CancellationToken,
}

/// A hook's verdict.
#[derive(Debug, Clone, Default)]
pub struct HookReply {
    /// Replacement bytes handed on instead of the original ones.
    ///
    /// For a write the replacement is written to the transport in full and
    /// the caller is told its own bytes were accepted, so the replacement
    /// may be longer or shorter than the original.
    pub buffer: Option<Vec<u8>>,
    /// False aborts the read or write with `ConnectionAborted`.
    pub proceed: bool,
    /// Keep the hook armed for the next read or write.
    pub rearm: bool,
}

impl HookReply {
    pub fn proceed() -> Self {
        Self {
            buffer: None,
            proceed: true,
            rearm: false,
        }
    }

    pub fn abort() -> Self {
        Self {
            buffer: None,
            proceed: false,
            rearm: false,
        }
    }

    #[must_use]
    pub fn rearm(mut self) -> Self {
        self.rearm = true;
        self
    }

    #[must_use]
    pub fn with_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.buffer = Some(buffer);
        self
    }
}

pub type ReadHook = Arc<dyn Fn(ReadEvent) -> BoxFuture<'static, Result<HookReply>> + Send + Sync>;
pub type WriteHook = Arc<dyn Fn(WriteEvent) -> BoxFuture<'static, Result<HookReply>> + Send + Sync>;

#[derive(Default)]
struct HookSlots {
    read: Option<ReadHook>,
    write: Option<WriteHook>,
}

/// Hook registration handle of one stream. Clones share the same slots.
#[derive(Clone, Default)]
pub struct StreamHooks {
    slots: Arc<Mutex<HookSlots>>,
}

impl fmt::Debug for StreamHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.lock();
        f.debug_struct("StreamHooks")
            .field("read_armed", &slots.read.is_some())
            .field("write_armed", &slots.write.is_some())
            .finish()
    }
}

impl StreamHooks {
    fn lock(&self) -> MutexGuard<'_, HookSlots> {
        match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Arms a hook for the next read that yields bytes.
    pub fn on_next_read(&self, hook: ReadHook) -> Result<()> {
        let mut slots = self.lock();
        if slots.read.is_some() {
            return Err(HarnessError::contract("a read hook is already armed"));
        }
        slots.read = Some(hook);
        Ok(())
    }

    pub fn on_next_write(&self, hook: WriteHook) -> Result<()> {
        let mut slots = self.lock();
        if slots.write.is_some() {
            return Err(HarnessError::contract("a write hook is already armed"));
        }
        slots.write = Some(hook);
        Ok(())
    }

    pub fn read_armed(&self) -> bool {
        self.lock().read.is_some()
    }

    pub fn write_armed(&self) -> bool {
        self.lock().write.is_some()
    }

    pub fn disarm(&self) {
        let mut slots = self.lock();
        slots.read = None;
        slots.write = None;
    }

    pub(crate) fn take_read(&self) -> Option<ReadHook> {
        self.lock().read.take()
    }

    pub(crate) fn take_write(&self) -> Option<WriteHook> {
        self.lock().write.take()
    }

    /// Re-arms unless a new hook was registered while the old one ran.
    pub(crate) fn rearm_read(&self, hook: ReadHook) {
        let mut slots = self.lock();
        if slots.read.is_none() {
            slots.read = Some(hook);
        }
    }

    pub(crate) fn rearm_write(&self, hook: WriteHook) {
        let mut slots = self.lock();
        if slots.write.is_none() {
            slots.write = Some(hook);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    pub sequence: u64,
    pub connection_id: u64,
    pub side: Side,
    pub direction: Direction,
    pub bytes: usize,
    /// A hook ran for this read or write.
    pub hooked: bool,
}

/// Ordered record of instrumented reads and writes.
///
/// Holds at most `capacity` events; the oldest ones are dropped first.
/// Sequence numbers keep counting across dropped events.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<VecDeque<IoEvent>>>,
    next_sequence: Arc<AtomicU64>,
    capacity: usize,
}

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 16 * 1024;

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_LOG_CAPACITY)
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            next_sequence: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<IoEvent>> {
        match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record(
        &self,
        connection_id: u64,
        side: Side,
        direction: Direction,
        bytes: usize,
        hooked: bool,
    ) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(IoEvent {
            sequence,
            connection_id,
            side,
            direction,
            bytes,
            hooked,
        });
        sequence
    }

    pub fn snapshot(&self) -> Vec<IoEvent> {
        self.lock().iter().copied().collect()
    }

    pub fn for_connections(&self, connection_ids: &[u64]) -> Vec<IoEvent> {
        self.lock()
            .iter()
            .filter(|event| connection_ids.contains(&event.connection_id))
            .copied()
            .collect()
    }

    /// Events ever recorded, including the ones already dropped.
    pub fn recorded(&self) -> u64 {
        self.next_sequence.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
