//! Per-group connection admission.
//!
//! Every open connection of a group holds one slot, whether it is busy or
//! parked in the idle pool. Demand beyond the group's limit waits in a FIFO
//! queue and is served only when a slot is actually released.

mod ticket;

#[cfg(test)]
mod tests;

pub use ticket::{AdmissionSlot, Ticket};

use connlab_core::error::HarnessError;
use connlab_core::invariants::InvariantReporter;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static LIMIT_INVARIANT: InvariantReporter = InvariantReporter::new("admission-limit", 1_000_000);

pub const DEFAULT_GROUP: &str = "default";

/// What a queued ticket eventually receives. Holds no drop guards, so it can
/// be moved around under the group lock.
pub(crate) enum Grant<C> {
    Fresh,
    Reused(C),
}

type GrantSender<C> = oneshot::Sender<Result<Grant<C>, HarnessError>>;

struct Waiter<C> {
    id: u64,
    reuse: bool,
    tx: GrantSender<C>,
}

struct IdleEntry<C> {
    connection: C,
    since: Instant,
}

struct Group<C> {
    limit: Option<usize>,
    current: usize,
    waiters: VecDeque<Waiter<C>>,
    idle: VecDeque<IdleEntry<C>>,
    max_idle: Option<Duration>,
    close_token: CancellationToken,
}

impl<C> Group<C> {
    fn new(limit: Option<usize>, max_idle: Option<Duration>) -> Self {
        Self {
            limit,
            current: 0,
            waiters: VecDeque::new(),
            idle: VecDeque::new(),
            max_idle,
            close_token: CancellationToken::new(),
        }
    }

    fn has_capacity(&self) -> bool {
        self.limit.map_or(true, |limit| self.current < limit)
    }

    /// Hands the slot the caller holds to the first live waiter. Returns the
    /// connection back when no waiter took it.
    fn hand_over(&mut self, mut connection: Option<C>, to_close: &mut Vec<C>) -> HandOver<C> {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            let grant = match connection.take() {
                Some(conn) if waiter.reuse => Grant::Reused(conn),
                Some(conn) => {
                    to_close.push(conn);
                    Grant::Fresh
                }
                None => Grant::Fresh,
            };
            match waiter.tx.send(Ok(grant)) {
                Ok(()) => {
                    tracing::debug!("admission: slot handed to waiter {}", waiter.id);
                    return HandOver::Delivered;
                }
                Err(Ok(Grant::Reused(conn))) => connection = Some(conn),
                Err(_) => {}
            }
        }
        HandOver::NoWaiter(connection)
    }

    fn check_limit(&self, name: &str) {
        LIMIT_INVARIANT.check(self.limit.map_or(true, |limit| self.current <= limit), || {
            format!(
                "group {} holds {} connections with limit {:?}",
                name, self.current, self.limit
            )
        });
    }
}

enum HandOver<C> {
    Delivered,
    NoWaiter(Option<C>),
}

/// Counters of one group at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub limit: Option<usize>,
    pub current: usize,
    pub queued: usize,
    pub idle: usize,
}

pub enum Admission<C> {
    /// A new connection may be opened.
    Fresh(AdmissionSlot<C>),
    /// A pooled connection was taken out of the idle pool.
    Reused(C, AdmissionSlot<C>),
    Queued(Ticket<C>),
}

pub(crate) struct Shared<C> {
    groups: Mutex<HashMap<String, Group<C>>>,
    next_waiter: AtomicU64,
    default_limit: Option<usize>,
    default_max_idle: Option<Duration>,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Group<C>>> {
        match self.groups.lock() {
            Ok(groups) => groups,
            Err(poisoned) => {
                tracing::warn!("admission state mutex poisoned, continuing");
                poisoned.into_inner()
            }
        }
    }

    fn group_mut<'a>(
        &self,
        groups: &'a mut HashMap<String, Group<C>>,
        name: &str,
    ) -> &'a mut Group<C> {
        groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(self.default_limit, self.default_max_idle))
    }

    pub(crate) fn close_token(&self, name: &str) -> CancellationToken {
        let mut groups = self.lock();
        self.group_mut(&mut groups, name).close_token.clone()
    }

    /// Gives back one slot of `name`.
    ///
    /// # Panics
    ///
    /// Panics when the group holds no slot, which means a slot was released
    /// twice or never granted.
    pub(crate) fn release(&self, name: &str) {
        let mut to_close = Vec::new();
        {
            let mut groups = self.lock();
            let Some(group) = groups.get_mut(name).filter(|group| group.current > 0) else {
                drop(groups);
                panic!("released a slot of group {} that holds none", name);
            };
            if let HandOver::NoWaiter(_) = group.hand_over(None, &mut to_close) {
                group.current -= 1;
            }
        }
        drop(to_close);
    }

    /// Removes a waiter that gave up. False when it was already served.
    pub(crate) fn withdraw(&self, name: &str, waiter_id: u64) -> bool {
        let mut groups = self.lock();
        let Some(group) = groups.get_mut(name) else {
            return false;
        };
        let before = group.waiters.len();
        group.waiters.retain(|waiter| waiter.id != waiter_id);
        before != group.waiters.len()
    }
}

pub struct AdmissionController<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for AdmissionController<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Send + 'static> AdmissionController<C> {
    pub fn new(default_limit: Option<usize>, default_max_idle: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                groups: Mutex::new(HashMap::new()),
                next_waiter: AtomicU64::new(1),
                default_limit,
                default_max_idle,
            }),
        }
    }

    /// Creates the group if it does not exist yet.
    pub fn register_group(&self, name: &str) {
        let mut groups = self.shared.lock();
        self.shared.group_mut(&mut groups, name);
    }

    /// Asks for a slot. With `reuse` a pooled connection is preferred;
    /// without it, a pooled connection is evicted to make room when the
    /// group is full.
    pub fn acquire(&self, name: &str, reuse: bool) -> Admission<C> {
        let mut evicted = None;
        let admission = {
            let mut groups = self.shared.lock();
            let group = self.shared.group_mut(&mut groups, name);
            let token = group.close_token.clone();
            if reuse {
                if let Some(entry) = group.idle.pop_back() {
                    let slot = AdmissionSlot::granted(Arc::clone(&self.shared), name, token);
                    return Admission::Reused(entry.connection, slot);
                }
            }
            if group.has_capacity() {
                group.current += 1;
                group.check_limit(name);
                Admission::Fresh(AdmissionSlot::granted(Arc::clone(&self.shared), name, token))
            } else if let Some(entry) = group.idle.pop_front() {
                evicted = Some(entry.connection);
                Admission::Fresh(AdmissionSlot::granted(Arc::clone(&self.shared), name, token))
            } else {
                let id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                group.waiters.push_back(Waiter { id, reuse, tx });
                tracing::debug!(
                    "admission: group {} full ({}/{:?}), queued waiter {} at position {}",
                    name,
                    group.current,
                    group.limit,
                    id,
                    group.waiters.len()
                );
                Admission::Queued(Ticket::new(Arc::clone(&self.shared), name, id, rx))
            }
        };
        drop(evicted);
        admission
    }

    /// Returns a keep-alive connection together with its slot. The first
    /// waiter gets the connection (or, if it refuses reuse, the slot).
    ///
    /// A connection whose group was closed while it was busy is closed
    /// instead; only its slot goes back to the group.
    pub fn park(&self, connection: C, slot: AdmissionSlot<C>) {
        if slot.close_token().is_cancelled() {
            tracing::debug!(
                "admission: group {} was closed while the connection was busy, closing it",
                slot.group()
            );
            drop(connection);
            drop(slot);
            return;
        }
        let name = slot.into_group();
        let mut to_close = Vec::new();
        {
            let mut groups = self.shared.lock();
            let group = self.shared.group_mut(&mut groups, &name);
            match group.hand_over(Some(connection), &mut to_close) {
                HandOver::Delivered => {}
                HandOver::NoWaiter(Some(connection)) => {
                    group.idle.push_back(IdleEntry {
                        connection,
                        since: Instant::now(),
                    });
                }
                HandOver::NoWaiter(None) => {
                    group.current = group.current.saturating_sub(1);
                }
            }
        }
        drop(to_close);
    }

    pub fn set_connection_limit(&self, name: &str, limit: Option<usize>) {
        let mut groups = self.shared.lock();
        let group = self.shared.group_mut(&mut groups, name);
        group.limit = limit;
        // A raised limit frees slots for queued waiters.
        let mut to_close = Vec::new();
        while group.has_capacity() && !group.waiters.is_empty() {
            group.current += 1;
            if let HandOver::NoWaiter(_) = group.hand_over(None, &mut to_close) {
                group.current -= 1;
            }
        }
        drop(groups);
        drop(to_close);
    }

    pub fn set_max_idle_time(&self, name: &str, max_idle: Option<Duration>) {
        let mut groups = self.shared.lock();
        self.shared.group_mut(&mut groups, name).max_idle = max_idle;
    }

    /// Closes pooled connections, fails queued tickets and cancels the
    /// group's token so that busy connections abort.
    pub fn close_group(&self, name: &str) -> usize {
        let (waiters, idle, token) = {
            let mut groups = self.shared.lock();
            let Some(group) = groups.get_mut(name) else {
                return 0;
            };
            let waiters: Vec<_> = group.waiters.drain(..).collect();
            let idle: Vec<_> = group.idle.drain(..).collect();
            group.current = group.current.saturating_sub(idle.len());
            let token = std::mem::replace(&mut group.close_token, CancellationToken::new());
            (waiters, idle, token)
        };
        tracing::debug!(
            "admission: closing group {} ({} idle, {} queued)",
            name,
            idle.len(),
            waiters.len()
        );
        token.cancel();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(HarnessError::Canceled));
        }
        let closed = idle.len();
        drop(idle);
        closed
    }

    /// Closes pooled connections idle for longer than their group allows.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        {
            let mut groups = self.shared.lock();
            for (name, group) in groups.iter_mut() {
                let Some(max_idle) = group.max_idle else {
                    continue;
                };
                let before = group.idle.len();
                let mut kept = VecDeque::with_capacity(before);
                for entry in group.idle.drain(..) {
                    if now.saturating_duration_since(entry.since) >= max_idle {
                        expired.push(entry.connection);
                    } else {
                        kept.push_back(entry);
                    }
                }
                group.idle = kept;
                let removed = before - group.idle.len();
                if removed > 0 {
                    group.current = group.current.saturating_sub(removed);
                    tracing::debug!("admission: swept {} idle connections of {}", removed, name);
                }
            }
        }
        let closed = expired.len();
        drop(expired);
        closed
    }

    pub fn spawn_idle_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        controller.sweep_idle(Instant::now());
                    }
                }
            }
        })
    }

    pub fn close_token(&self, name: &str) -> CancellationToken {
        self.shared.close_token(name)
    }

    pub fn snapshot(&self, name: &str) -> AdmissionSnapshot {
        let groups = self.shared.lock();
        match groups.get(name) {
            Some(group) => AdmissionSnapshot {
                limit: group.limit,
                current: group.current,
                queued: group.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
                idle: group.idle.len(),
            },
            None => AdmissionSnapshot {
                limit: self.shared.default_limit,
                current: 0,
                queued: 0,
                idle: 0,
            },
        }
    }

    pub fn current_connections(&self, name: &str) -> usize {
        self.snapshot(name).current
    }

    /// Drops every pooled connection of every group.
    pub fn close_all(&self) {
        let names: Vec<String> = self.shared.lock().keys().cloned().collect();
        for name in names {
            self.close_group(&name);
        }
    }
}
