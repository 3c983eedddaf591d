use crate::admission::{AdmissionSnapshot, DEFAULT_GROUP};
use crate::instrumentation::IoEvent;
use crate::rendezvous::RendezvousControl;
use connlab_core::error::{ErrorKind, HarnessError, Result};
use connlab_core::flags::OperationFlags;
use connlab_core::handler::Handler;
use connlab_core::http::{HttpRequest, HttpResponse};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Uses the primary read handler.
    Primary,
    Secondary,
    Parallel,
    /// Expected to wait for admission; at most one may be outstanding.
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    Created,
    Queued,
    Running,
    Completed,
    Canceled,
    Faulted,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Canceled | OperationState::Faulted
        )
    }

    fn rank(self) -> u8 {
        match self {
            OperationState::Created => 0,
            OperationState::Queued => 1,
            OperationState::Running => 2,
            OperationState::Completed | OperationState::Canceled | OperationState::Faulted => 3,
        }
    }

    /// Whether an operation in `self` has reached or moved past `target`.
    pub fn has_reached(self, target: OperationState) -> bool {
        self == target || self.rank() > target.rank() || (self.is_terminal() && target.is_terminal())
    }
}

/// What an operation is expected to observe, and how it connects.
#[derive(Debug, Clone)]
pub struct OperationOptions {
    pub flags: OperationFlags,
    pub expected_status: Option<u16>,
    pub expected_error: ErrorKind,
    pub group: String,
    pub timeout: Option<Duration>,
    /// Exchanges wait for explicit start signals from the rendezvous control.
    pub gated: bool,
    /// Stop reading each response after this many body bytes.
    pub read_limit: Option<usize>,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            flags: OperationFlags::NONE,
            expected_status: None,
            expected_error: ErrorKind::Success,
            group: DEFAULT_GROUP.to_string(),
            timeout: None,
            gated: false,
            read_limit: None,
        }
    }
}

impl OperationOptions {
    #[must_use]
    pub fn with_flags(mut self, flags: OperationFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[must_use]
    pub fn expect_status(mut self, status: u16) -> Self {
        self.expected_status = Some(status);
        self
    }

    #[must_use]
    pub fn expect_error(mut self, kind: ErrorKind) -> Self {
        self.expected_error = kind;
        self
    }

    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The client gives up on a response body after `bytes` bytes. A cut
    /// response closes its connection instead of parking it.
    #[must_use]
    pub fn read_at_most(mut self, bytes: usize) -> Self {
        self.read_limit = Some(bytes);
        self
    }

    #[must_use]
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }
}

/// Outcome of a finished operation.
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub operation_id: u64,
    pub kind: OperationKind,
    pub state: OperationState,
    /// Status of the final response, if one arrived.
    pub status: Option<u16>,
    pub error: ErrorKind,
    pub response: Option<HttpResponse>,
    pub connections: Vec<u64>,
    pub reused_connection: bool,
    /// Redirects and authentication retries followed.
    pub hops: usize,
    pub was_queued: bool,
    /// Admission counters of the group when the request was configured.
    pub admission_at_configure: Option<AdmissionSnapshot>,
    pub events: Vec<IoEvent>,
}

#[derive(Debug, Default)]
pub(crate) struct Progress {
    pub(crate) connections: Vec<u64>,
    pub(crate) hops: usize,
    pub(crate) reused: bool,
    pub(crate) was_queued: bool,
    pub(crate) admission: Option<AdmissionSnapshot>,
}

type Outcome = Option<std::result::Result<OperationReport, HarnessError>>;

pub(crate) struct OperationShared {
    pub(crate) id: u64,
    pub(crate) kind: OperationKind,
    pub(crate) handler: Handler,
    pub(crate) options: OperationOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) client_abort: CancellationToken,
    pub(crate) started: AtomicBool,
    state: watch::Sender<OperationState>,
    request: watch::Sender<Option<HttpRequest>>,
    rendezvous: watch::Sender<Option<RendezvousControl>>,
    admit: watch::Sender<bool>,
    outcome: watch::Sender<Outcome>,
    progress: Mutex<Progress>,
}

/// Handle to one scheduled HTTP operation. Clones share the operation.
#[derive(Clone)]
pub struct Operation {
    pub(crate) shared: Arc<OperationShared>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Operation {
    pub(crate) fn new(id: u64, kind: OperationKind, handler: Handler, options: OperationOptions) -> Self {
        Self {
            shared: Arc::new(OperationShared {
                id,
                kind,
                handler,
                options,
                cancel: CancellationToken::new(),
                client_abort: CancellationToken::new(),
                started: AtomicBool::new(false),
                state: watch::Sender::new(OperationState::Created),
                request: watch::Sender::new(None),
                rendezvous: watch::Sender::new(None),
                admit: watch::Sender::new(false),
                outcome: watch::Sender::new(None),
                progress: Mutex::new(Progress::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> OperationKind {
        self.shared.kind
    }

    pub fn options(&self) -> &OperationOptions {
        &self.shared.options
    }

    /// The operation's own clone of the handler it was created with.
    pub fn handler(&self) -> &Handler {
        &self.shared.handler
    }

    pub fn state(&self) -> OperationState {
        *self.shared.state.borrow()
    }

    pub fn was_queued(&self) -> bool {
        self.progress().was_queued
    }

    pub fn connections(&self) -> Vec<u64> {
        self.progress().connections.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.cancel.is_cancelled() || self.shared.client_abort.is_cancelled()
    }

    /// Cancels the operation. Idempotent; never waits for the exchange.
    pub fn abort(&self) {
        if !self.shared.cancel.is_cancelled() {
            tracing::debug!("operation {}: abort requested", self.shared.id);
        }
        self.shared.cancel.cancel();
    }

    /// Lets an operation created with `DELAYED_ADMISSION` ask for a slot.
    pub fn admit(&self) {
        self.shared.admit.send_replace(true);
    }

    /// Control of the current gated exchange, once one is running.
    pub fn rendezvous(&self) -> Option<RendezvousControl> {
        self.shared.rendezvous.borrow().clone()
    }

    pub async fn wait_for_rendezvous(&self) -> Result<RendezvousControl> {
        let mut rx = self.shared.rendezvous.subscribe();
        let mut state = self.shared.state.subscribe();
        tokio::select! {
            control = rx.wait_for(Option::is_some) => control
                .ok()
                .and_then(|control| (*control).clone())
                .ok_or(HarnessError::Canceled),
            _ = state.wait_for(|state| state.is_terminal()) => {
                Err(HarnessError::contract(format!(
                    "operation {} finished without a gated exchange",
                    self.shared.id
                )))
            }
        }
    }

    /// Resolves once the operation reached `target` or a later state.
    pub async fn wait_for_state(&self, target: OperationState) -> OperationState {
        let mut rx = self.shared.state.subscribe();
        let reached = match rx.wait_for(|state| state.has_reached(target)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }

    /// Resolves once the request has been built and configured.
    pub async fn wait_for_request(&self) -> Result<RequestHandle> {
        let mut rx = self.shared.request.subscribe();
        let mut state = self.shared.state.subscribe();
        tokio::select! {
            request = rx.wait_for(Option::is_some) => {
                let request = request
                    .ok()
                    .and_then(|request| (*request).clone())
                    .ok_or(HarnessError::Canceled)?;
                Ok(RequestHandle {
                    request,
                    operation: self.clone(),
                })
            }
            _ = state.wait_for(|state| state.is_terminal()) => {
                match self.shared.request.borrow().clone() {
                    Some(request) => Ok(RequestHandle {
                        request,
                        operation: self.clone(),
                    }),
                    None => Err(HarnessError::contract(format!(
                        "operation {} finished before its request was configured",
                        self.shared.id
                    ))),
                }
            }
        }
    }

    /// Returns the report, or the error when the outcome did not match the
    /// expectation.
    pub async fn wait_for_completion(&self) -> Result<OperationReport> {
        if !self.shared.started.load(Ordering::Acquire) {
            return Err(HarnessError::contract(format!(
                "operation {} was never started",
                self.shared.id
            )));
        }
        let mut rx = self.shared.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(HarnessError::Canceled))
    }

    /// Like `wait_for_completion`, but only tells whether it succeeded.
    pub async fn wait_for_completion_ignoring_errors(&self) -> bool {
        match self.wait_for_completion().await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!("operation {} ended with {}", self.shared.id, err);
                false
            }
        }
    }

    pub(crate) fn progress(&self) -> MutexGuard<'_, Progress> {
        match self.shared.progress.lock() {
            Ok(progress) => progress,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn set_state(&self, state: OperationState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            tracing::debug!("operation {}: {:?} -> {:?}", self.shared.id, previous, state);
        }
    }

    pub(crate) fn publish_request(&self, request: &HttpRequest) {
        self.shared.request.send_replace(Some(request.clone()));
    }

    pub(crate) fn publish_rendezvous(&self, control: RendezvousControl) {
        self.shared.rendezvous.send_replace(Some(control));
    }

    pub(crate) async fn admitted(&self) {
        let mut rx = self.shared.admit.subscribe();
        let _ = rx.wait_for(|admitted| *admitted).await;
    }

    pub(crate) fn finish(&self, state: OperationState, outcome: std::result::Result<OperationReport, HarnessError>) {
        self.set_state(state);
        self.shared.outcome.send_replace(Some(outcome));
    }
}

/// The configured request of an operation, as seen by the test.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    pub request: HttpRequest,
    operation: Operation,
}

impl RequestHandle {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn abort(&self) {
        self.operation.abort();
    }
}
