//! The harness root: owns the virtual server, the admission controller and
//! every operation started through it.

mod operation;
mod run;

#[cfg(test)]
mod tests;

pub use operation::{
    Operation, OperationKind, OperationOptions, OperationReport, OperationState, RequestHandle,
};

use crate::admission::{AdmissionController, AdmissionSnapshot};
use crate::config::HarnessConfig;
use crate::connection::Connection;
use crate::instrumentation::{EventLog, HookReply, IoEvent, ReadEvent, ReadHook, WriteEvent, WriteHook};
use crate::ledger::{IdGenerator, ResponseLedger};
use crate::server::VirtualServer;
use connlab_core::auth::{CertificateInfo, CertificateProvider};
use connlab_core::error::{HarnessError, Result};
use connlab_core::handler::Handler;
use connlab_core::test_support::FailureCounter;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test callback run on every read of an operation's client stream while
/// armed. It gets the operation the read belongs to.
pub type OperationReadHandler =
    Arc<dyn Fn(Operation, ReadEvent) -> BoxFuture<'static, Result<HookReply>> + Send + Sync>;

/// Test callback run before the request bytes of an operation reach its
/// client stream.
pub type OperationWriteHandler =
    Arc<dyn Fn(Operation, WriteEvent) -> BoxFuture<'static, Result<HookReply>> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct HarnessInner {
    pub(crate) config: HarnessConfig,
    pub(crate) server: VirtualServer,
    pub(crate) admission: AdmissionController<Connection>,
    pub(crate) events: EventLog,
    pub(crate) ledger: ResponseLedger,
    pub(crate) connection_ids: IdGenerator,
    pub(crate) connect_failures: FailureCounter,
    pub(crate) shutdown: CancellationToken,
    operation_ids: IdGenerator,
    primary_read: Mutex<Option<OperationReadHandler>>,
    secondary_read: Mutex<Option<OperationReadHandler>>,
    read_handler_calls: AtomicUsize,
    write_handler: Mutex<Option<OperationWriteHandler>>,
    write_handler_calls: AtomicUsize,
    queued_outstanding: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<(Operation, JoinHandle<()>)>>,
}

impl HarnessInner {
    /// The read handler for `operation`, wrapped to count its invocations.
    pub(crate) fn read_hook_for(self: &Arc<Self>, operation: &Operation) -> Option<ReadHook> {
        let handler = match operation.kind() {
            OperationKind::Primary => lock(&self.primary_read).clone(),
            _ => lock(&self.secondary_read).clone(),
        }?;
        let harness = Arc::downgrade(self);
        let operation = operation.clone();
        let hook: ReadHook = Arc::new(move |event: ReadEvent| {
            if let Some(harness) = harness.upgrade() {
                harness.read_handler_calls.fetch_add(1, Ordering::SeqCst);
            }
            handler(operation.clone(), event)
        });
        Some(hook)
    }

    pub(crate) fn write_hook_for(self: &Arc<Self>, operation: &Operation) -> Option<WriteHook> {
        let handler = lock(&self.write_handler).clone()?;
        let harness = Arc::downgrade(self);
        let operation = operation.clone();
        let hook: WriteHook = Arc::new(move |event: WriteEvent| {
            if let Some(harness) = harness.upgrade() {
                harness.write_handler_calls.fetch_add(1, Ordering::SeqCst);
            }
            handler(operation.clone(), event)
        });
        Some(hook)
    }

    pub(crate) fn operation_finished(&self, operation: &Operation) {
        self.server.routes().remove_operation(operation.id());
        if operation.kind() == OperationKind::Queued {
            self.queued_outstanding.store(false, Ordering::SeqCst);
        }
        // The calling task is still running and stays listed until a later
        // operation finishes.
        lock(&self.tasks).retain(|(_, task)| !task.is_finished());
    }
}

impl Drop for HarnessInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Entry point for scheduling HTTP operations against the virtual server.
#[derive(Clone)]
pub struct Harness {
    inner: Arc<HarnessInner>,
}

impl Harness {
    pub async fn new(config: HarnessConfig) -> Result<Self> {
        Self::start_with_identity(config, None).await
    }

    /// Starts a harness whose server presents the certificate `provider`
    /// returns for `descriptor`.
    pub async fn with_certificate(
        config: HarnessConfig,
        provider: &dyn CertificateProvider,
        descriptor: &str,
    ) -> Result<Self> {
        let certificate = provider.certificate(descriptor).ok_or_else(|| {
            HarnessError::contract(format!("no certificate available for {}", descriptor))
        })?;
        Self::start_with_identity(config, Some(certificate)).await
    }

    async fn start_with_identity(config: HarnessConfig, certificate: Option<CertificateInfo>) -> Result<Self> {
        let server = VirtualServer::start(certificate).await?;
        let admission =
            AdmissionController::new(config.default_connection_limit, config.default_max_idle_time);
        let shutdown = CancellationToken::new();
        let sweeper = admission.spawn_idle_sweeper(config.idle_sweep_interval, shutdown.clone());
        let events = EventLog::with_capacity(config.event_log_capacity);
        tracing::debug!(
            "harness started: server {}, admission timeout {:?}",
            server.local_addr(),
            config.admission_timeout
        );
        Ok(Self {
            inner: Arc::new(HarnessInner {
                config,
                server,
                admission,
                events,
                ledger: ResponseLedger::default(),
                connection_ids: IdGenerator::new(),
                connect_failures: FailureCounter::new(),
                shutdown,
                operation_ids: IdGenerator::new(),
                primary_read: Mutex::new(None),
                secondary_read: Mutex::new(None),
                read_handler_calls: AtomicUsize::new(0),
                write_handler: Mutex::new(None),
                write_handler_calls: AtomicUsize::new(0),
                queued_outstanding: AtomicBool::new(false),
                sweeper: Mutex::new(Some(sweeper)),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.inner.config
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server.local_addr()
    }

    pub fn certificate(&self) -> Option<&CertificateInfo> {
        self.inner.server.certificate()
    }

    /// Creates an operation around its own clone of `handler`.
    pub fn create_operation(
        &self,
        kind: OperationKind,
        handler: &Handler,
        options: OperationOptions,
    ) -> Operation {
        let id = self.inner.operation_ids.next();
        tracing::debug!(
            "operation {}: created {:?} for {} in group {}",
            id,
            kind,
            handler.identifier(),
            options.group
        );
        Operation::new(id, kind, handler.clone(), options)
    }

    /// Starts `operation` in the background. `cancel` aborts it from outside.
    pub fn start(&self, operation: &Operation, cancel: &CancellationToken) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(HarnessError::contract("harness is shut down"));
        }
        if operation.shared.started.swap(true, Ordering::AcqRel) {
            return Err(HarnessError::contract(format!(
                "operation {} was already started",
                operation.id()
            )));
        }
        if operation.kind() == OperationKind::Queued
            && self.inner.queued_outstanding.swap(true, Ordering::SeqCst)
        {
            operation.shared.started.store(false, Ordering::Release);
            return Err(HarnessError::contract(
                "invalid nested call: another queued operation is still outstanding",
            ));
        }
        operation.handler().mark_dispatched();
        let task = tokio::spawn(run::run_operation(
            Arc::clone(&self.inner),
            operation.clone(),
            cancel.clone(),
        ));
        lock(&self.inner.tasks).push((operation.clone(), task));
        Ok(())
    }

    /// Creates and starts an operation in one step.
    pub fn start_operation(
        &self,
        kind: OperationKind,
        handler: &Handler,
        options: OperationOptions,
        cancel: &CancellationToken,
    ) -> Result<Operation> {
        let operation = self.create_operation(kind, handler, options);
        self.start(&operation, cancel)?;
        Ok(operation)
    }

    /// Read handler for operations of kind `Primary`.
    pub fn set_primary_read_handler(&self, handler: Option<OperationReadHandler>) {
        *lock(&self.inner.primary_read) = handler;
    }

    /// Read handler for every other operation kind.
    pub fn set_secondary_read_handler(&self, handler: Option<OperationReadHandler>) {
        *lock(&self.inner.secondary_read) = handler;
    }

    pub fn read_handler_calls(&self) -> usize {
        self.inner.read_handler_calls.load(Ordering::SeqCst)
    }

    /// Write handler for every operation kind. It sees the first write of
    /// an operation's first connection and stays armed only if it re-arms.
    pub fn set_write_handler(&self, handler: Option<OperationWriteHandler>) {
        *lock(&self.inner.write_handler) = handler;
    }

    pub fn write_handler_calls(&self) -> usize {
        self.inner.write_handler_calls.load(Ordering::SeqCst)
    }

    pub fn set_connection_limit(&self, group: &str, limit: Option<usize>) {
        self.inner.admission.set_connection_limit(group, limit);
    }

    pub fn set_max_idle_time(&self, group: &str, max_idle: Option<Duration>) {
        self.inner.admission.set_max_idle_time(group, max_idle);
    }

    /// Closes the group's pooled connections and aborts its busy ones.
    pub fn close_group(&self, group: &str) -> usize {
        self.inner.admission.close_group(group)
    }

    pub fn current_connections(&self, group: &str) -> usize {
        self.inner.admission.current_connections(group)
    }

    pub fn admission_snapshot(&self, group: &str) -> AdmissionSnapshot {
        self.inner.admission.snapshot(group)
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.connect_failures.set(count);
    }

    pub fn events(&self) -> Vec<IoEvent> {
        self.inner.events.snapshot()
    }

    /// Server responses produced but not yet fully written.
    pub fn outstanding_responses(&self) -> usize {
        self.inner.ledger.outstanding()
    }

    /// Aborts every operation, closes all connections and stops the server.
    /// Fails when a server response was left unfinished.
    pub async fn shutdown(&self) -> Result<()> {
        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for (operation, _) in &tasks {
            operation.abort();
        }
        for (operation, task) in tasks {
            if let Err(err) = task.await {
                tracing::warn!("operation {} task failed: {}", operation.id(), err);
            }
        }
        self.inner.shutdown.cancel();
        let sweeper = lock(&self.inner.sweeper).take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.inner.admission.close_all();
        self.inner.server.shutdown().await;
        self.set_primary_read_handler(None);
        self.set_secondary_read_handler(None);
        self.set_write_handler(None);

        let outstanding = self.inner.ledger.outstanding();
        if outstanding != 0 {
            return Err(HarnessError::assertion(format!(
                "{} server responses still outstanding at shutdown",
                outstanding
            )));
        }
        tracing::debug!("harness shut down");
        Ok(())
    }
}
