//! Gated start of the four I/O tasks of one exchange.
//!
//! Each task waits for its start signal, then runs; the first task to fault
//! cancels the others and the exchange is torn down.

use connlab_core::error::HarnessError;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendezvousTask {
    ClientRead,
    ClientWrite,
    ServerRead,
    ServerWrite,
}

impl RendezvousTask {
    pub const ALL: [RendezvousTask; 4] = [
        RendezvousTask::ClientRead,
        RendezvousTask::ClientWrite,
        RendezvousTask::ServerRead,
        RendezvousTask::ServerWrite,
    ];

    fn index(self) -> usize {
        match self {
            RendezvousTask::ClientRead => 0,
            RendezvousTask::ClientWrite => 1,
            RendezvousTask::ServerRead => 2,
            RendezvousTask::ServerWrite => 3,
        }
    }

    pub fn is_client(self) -> bool {
        matches!(self, RendezvousTask::ClientRead | RendezvousTask::ClientWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    WaitingForSignal,
    Running,
    Completed,
    Faulted,
}

#[derive(Debug)]
pub struct RendezvousFault {
    pub task: RendezvousTask,
    pub error: HarnessError,
}

impl fmt::Display for RendezvousFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} faulted: {}", self.task, self.error)
    }
}

#[derive(Clone, Default)]
struct TaskStates {
    states: Arc<Mutex<[Option<TaskState>; 4]>>,
}

impl TaskStates {
    fn lock(&self) -> MutexGuard<'_, [Option<TaskState>; 4]> {
        match self.states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set(&self, task: RendezvousTask, state: TaskState) {
        self.lock()[task.index()] = Some(state);
    }

    fn get(&self, task: RendezvousTask) -> TaskState {
        self.lock()[task.index()].unwrap_or(TaskState::WaitingForSignal)
    }
}

/// Test-side handle that releases the tasks of a gated exchange.
#[derive(Clone)]
pub struct RendezvousControl {
    signals: Arc<Mutex<[Option<oneshot::Sender<()>>; 4]>>,
    states: TaskStates,
}

impl fmt::Debug for RendezvousControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: Vec<_> = RendezvousTask::ALL
            .iter()
            .map(|task| (*task, self.states.get(*task)))
            .collect();
        f.debug_struct("RendezvousControl")
            .field("states", &states)
            .finish()
    }
}

impl RendezvousControl {
    /// Fires the start signal of `task`. False when it already fired.
    pub fn start(&self, task: RendezvousTask) -> bool {
        let sender = match self.signals.lock() {
            Ok(mut signals) => signals[task.index()].take(),
            Err(poisoned) => poisoned.into_inner()[task.index()].take(),
        };
        match sender {
            Some(sender) => sender.send(()).is_ok(),
            None => false,
        }
    }

    pub fn start_client_read(&self) -> bool {
        self.start(RendezvousTask::ClientRead)
    }

    pub fn start_client_write(&self) -> bool {
        self.start(RendezvousTask::ClientWrite)
    }

    pub fn start_server_read(&self) -> bool {
        self.start(RendezvousTask::ServerRead)
    }

    pub fn start_server_write(&self) -> bool {
        self.start(RendezvousTask::ServerWrite)
    }

    pub fn start_all(&self) {
        for task in RendezvousTask::ALL {
            self.start(task);
        }
    }

    pub fn state(&self, task: RendezvousTask) -> TaskState {
        self.states.get(task)
    }
}

pub struct Rendezvous {
    gates: [Option<oneshot::Receiver<()>>; 4],
    states: TaskStates,
}

impl Rendezvous {
    /// Every task starts as soon as the exchange runs.
    pub fn immediate() -> Self {
        Self {
            gates: [None, None, None, None],
            states: TaskStates::default(),
        }
    }

    /// Every task waits for its signal from the returned control.
    pub fn gated() -> (Self, RendezvousControl) {
        let (cr_tx, cr_rx) = oneshot::channel();
        let (cw_tx, cw_rx) = oneshot::channel();
        let (sr_tx, sr_rx) = oneshot::channel();
        let (sw_tx, sw_rx) = oneshot::channel();
        let states = TaskStates::default();
        let rendezvous = Self {
            gates: [Some(cr_rx), Some(cw_rx), Some(sr_rx), Some(sw_rx)],
            states: states.clone(),
        };
        let control = RendezvousControl {
            signals: Arc::new(Mutex::new([Some(cr_tx), Some(cw_tx), Some(sr_tx), Some(sw_tx)])),
            states,
        };
        (rendezvous, control)
    }

    /// Runs the four tasks to completion. The first fault cancels `cancel`,
    /// drops the remaining tasks together with whatever they own, and then
    /// invokes `teardown`.
    #[allow(clippy::too_many_arguments)]
    pub async fn run<CR, CW, SR, SW, A, B, C, D>(
        mut self,
        cancel: &CancellationToken,
        client_read: CR,
        client_write: CW,
        server_read: SR,
        server_write: SW,
        teardown: impl FnOnce(&RendezvousFault),
    ) -> Result<(A, B, C, D), RendezvousFault>
    where
        CR: Future<Output = Result<A, HarnessError>>,
        CW: Future<Output = Result<B, HarnessError>>,
        SR: Future<Output = Result<C, HarnessError>>,
        SW: Future<Output = Result<D, HarnessError>>,
    {
        let states = self.states.clone();
        let result = tokio::try_join!(
            gated(RendezvousTask::ClientRead, self.gates[0].take(), &states, cancel, client_read),
            gated(RendezvousTask::ClientWrite, self.gates[1].take(), &states, cancel, client_write),
            gated(RendezvousTask::ServerRead, self.gates[2].take(), &states, cancel, server_read),
            gated(RendezvousTask::ServerWrite, self.gates[3].take(), &states, cancel, server_write),
        );
        if let Err(fault) = &result {
            tracing::debug!("rendezvous: {}", fault);
            teardown(fault);
        }
        result
    }
}

async fn gated<F, T>(
    task: RendezvousTask,
    gate: Option<oneshot::Receiver<()>>,
    states: &TaskStates,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, RendezvousFault>
where
    F: Future<Output = Result<T, HarnessError>>,
{
    states.set(task, TaskState::WaitingForSignal);
    if let Some(gate) = gate {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            // A dropped control counts as a start signal.
            _ = gate => {}
        }
    }
    let result = if cancel.is_cancelled() {
        Err(HarnessError::Canceled)
    } else {
        states.set(task, TaskState::Running);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HarnessError::Canceled),
            result = work => result,
        }
    };
    match result {
        Ok(value) => {
            states.set(task, TaskState::Completed);
            Ok(value)
        }
        Err(error) => {
            states.set(task, TaskState::Faulted);
            cancel.cancel();
            Err(RendezvousFault { task, error })
        }
    }
}
