//! In-process loopback server.
//!
//! The accept loop pairs every accepted socket with the client socket that
//! dialled it (matched by the client's local address), so the harness owns
//! both ends of each connection.

use connlab_core::auth::CertificateInfo;
use connlab_core::error::{HarnessError, Result};
use connlab_core::flags::RequestFlags;
use connlab_core::handler::{Handler, RouteRegistry};
use connlab_core::net::is_interrupted;
use socket2::SockRef;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

enum PendingAccept {
    Waiting(oneshot::Sender<TcpStream>),
    Arrived(TcpStream),
}

type PendingMap = Arc<Mutex<HashMap<SocketAddr, PendingAccept>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<SocketAddr, PendingAccept>> {
    match pending.lock() {
        Ok(pending) => pending,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) handler: Arc<Handler>,
    pub(crate) extra_flags: RequestFlags,
    pub(crate) operation_id: u64,
    pub(crate) client_abort: CancellationToken,
}

/// Path table shared by the server and every operation.
#[derive(Default)]
pub(crate) struct Routes {
    next: AtomicU64,
    table: Mutex<HashMap<String, Route>>,
}

impl Routes {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn register(
        &self,
        operation_id: u64,
        handler: Handler,
        extra_flags: RequestFlags,
        client_abort: CancellationToken,
    ) -> String {
        let route_id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let path = format!("/op{}/{}", operation_id, route_id);
        handler.mark_dispatched();
        tracing::debug!(
            "route {} -> {} ({:?})",
            path,
            handler.identifier(),
            handler.flags() | extra_flags
        );
        self.lock().insert(
            path.clone(),
            Route {
                handler: Arc::new(handler),
                extra_flags,
                operation_id,
                client_abort,
            },
        );
        path
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<Route> {
        let path = path.split('?').next().unwrap_or(path);
        self.lock().get(path).cloned()
    }

    pub(crate) fn remove_operation(&self, operation_id: u64) {
        self.lock()
            .retain(|_, route| route.operation_id != operation_id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// The registry handed to handlers answering requests of one operation.
pub(crate) struct OperationRoutes {
    pub(crate) routes: Arc<Routes>,
    pub(crate) operation_id: u64,
    pub(crate) client_abort: CancellationToken,
}

impl RouteRegistry for OperationRoutes {
    fn register(&self, handler: Handler, extra_flags: RequestFlags) -> String {
        self.routes.register(
            self.operation_id,
            handler,
            extra_flags,
            self.client_abort.clone(),
        )
    }
}

pub struct VirtualServer {
    addr: SocketAddr,
    pending: PendingMap,
    routes: Arc<Routes>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    certificate: Option<CertificateInfo>,
}

impl VirtualServer {
    pub async fn start(certificate: Option<CertificateInfo>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(HarnessError::connect)?;
        let addr = listener.local_addr().map_err(HarnessError::connect)?;
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&pending), shutdown.clone()));
        tracing::info!("virtual server listening on {}", addr);
        Ok(Self {
            addr,
            pending,
            routes: Arc::new(Routes::default()),
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
            certificate,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn certificate(&self) -> Option<&CertificateInfo> {
        self.certificate.as_ref()
    }

    pub(crate) fn routes(&self) -> &Arc<Routes> {
        &self.routes
    }

    /// Dials the server and returns the client socket with its accepted
    /// peer. With `abort_handshake` the accepted socket is reset at once and
    /// no server end is returned.
    pub(crate) async fn connect(
        &self,
        abort_handshake: bool,
        accept_timeout: Duration,
    ) -> Result<(TcpStream, Option<TcpStream>, SocketAddr)> {
        let client = TcpStream::connect(self.addr)
            .await
            .map_err(HarnessError::connect)?;
        let _ = client.set_nodelay(true);
        let client_addr = client.local_addr().map_err(HarnessError::connect)?;
        let server = self.pair(client_addr, accept_timeout).await?;
        if abort_handshake {
            tracing::debug!("resetting accepted connection from {}", client_addr);
            reset(server);
            return Ok((client, None, client_addr));
        }
        Ok((client, Some(server), client_addr))
    }

    async fn pair(&self, client_addr: SocketAddr, accept_timeout: Duration) -> Result<TcpStream> {
        let rx = {
            let mut pending = lock_pending(&self.pending);
            match pending.remove(&client_addr) {
                Some(PendingAccept::Arrived(stream)) => return Ok(stream),
                Some(PendingAccept::Waiting(_)) | None => {
                    let (tx, rx) = oneshot::channel();
                    pending.insert(client_addr, PendingAccept::Waiting(tx));
                    rx
                }
            }
        };
        match tokio::time::timeout(accept_timeout, rx).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(_)) => Err(HarnessError::connect(io::Error::new(
                io::ErrorKind::NotConnected,
                "server stopped before accepting",
            ))),
            Err(_) => {
                lock_pending(&self.pending).remove(&client_addr);
                Err(HarnessError::connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no accept for {} within {:?}", client_addr, accept_timeout),
                )))
            }
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = match self.accept_task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            let _ = task.await;
        }
        lock_pending(&self.pending).clear();
    }
}

impl Drop for VirtualServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Closes the socket with an RST instead of a FIN.
pub(crate) fn reset(stream: TcpStream) {
    let sock = SockRef::from(&stream);
    if let Err(err) = sock.set_linger(Some(Duration::from_secs(0))) {
        tracing::debug!("failed to set linger for reset: {}", err);
    }
    drop(stream);
}

async fn accept_loop(listener: TcpListener, pending: PendingMap, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    deliver(&pending, peer, stream);
                }
                Err(err) if is_interrupted(&err) => continue,
                Err(err) => {
                    tracing::warn!("virtual server accept failed: {}", err);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    tracing::debug!("virtual server accept loop stopped");
}

fn deliver(pending: &PendingMap, peer: SocketAddr, stream: TcpStream) {
    let waiter = {
        let mut pending = lock_pending(pending);
        match pending.remove(&peer) {
            Some(PendingAccept::Waiting(tx)) => tx,
            Some(PendingAccept::Arrived(_)) | None => {
                pending.insert(peer, PendingAccept::Arrived(stream));
                return;
            }
        }
    };
    if waiter.send(stream).is_err() {
        tracing::debug!("client {} gave up before its connection was accepted", peer);
    }
}
