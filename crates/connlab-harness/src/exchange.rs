//! One HTTP exchange over an open connection, driven through the rendezvous.

use crate::connection::Connection;
use crate::ledger::ResponseLedger;
use crate::rendezvous::{Rendezvous, RendezvousFault};
use crate::server::{OperationRoutes, Routes};
use connlab_core::error::{HarnessError, Result};
use connlab_core::flags::OperationFlags;
use connlab_core::handler::HandlerContext;
use connlab_core::http::{self, HttpRequest, HttpResponse, ParseLimits};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub(crate) struct ExchangeEnv<'a> {
    pub(crate) operation_id: u64,
    pub(crate) flags: OperationFlags,
    pub(crate) limits: ParseLimits,
    pub(crate) read_limit: Option<usize>,
    pub(crate) routes: &'a Arc<Routes>,
    pub(crate) ledger: &'a ResponseLedger,
    /// Fired by handlers (or the client itself) to abort the client request.
    pub(crate) client_abort: &'a CancellationToken,
}

pub(crate) struct Exchanged {
    pub(crate) response: HttpResponse,
    /// False when the server closed its end after answering.
    pub(crate) server_keeps_open: bool,
}

/// Swallows server-side faults once only the client decides the outcome.
async fn lenient<T, F>(enabled: bool, connection_id: u64, what: &str, work: F) -> Result<T>
where
    T: Default,
    F: Future<Output = Result<T>>,
{
    match work.await {
        Err(err) if enabled && !err.is_cancellation() => {
            tracing::debug!("connection {}: ignoring {} fault: {}", connection_id, what, err);
            Ok(T::default())
        }
        other => other,
    }
}

async fn client_aborted(token: &CancellationToken) -> HarnessError {
    token.cancelled().await;
    HarnessError::Canceled
}

pub(crate) async fn run_exchange(
    conn: &mut Connection,
    request: &HttpRequest,
    env: &ExchangeEnv<'_>,
    rendezvous: Rendezvous,
    cancel: &CancellationToken,
) -> std::result::Result<Exchanged, RendezvousFault> {
    let connection_id = conn.id;
    let remote_addr = conn.client_addr;
    let ignore_server_faults = env.flags.contains(OperationFlags::ABORT_AFTER_CLIENT_EXITS);

    conn.client.set_cancellation(cancel.clone());
    let (client_read_half, mut client_write_half) = tokio::io::split(&mut conn.client);
    let mut client_reader = BufReader::new(client_read_half);

    let server = conn.server.as_mut().map(|server| {
        server.set_cancellation(cancel.clone());
        server.set_ignore_errors(ignore_server_faults);
        let (read_half, write_half) = tokio::io::split(server);
        (BufReader::new(read_half), write_half)
    });
    let (mut server_reader, mut server_writer) = match server {
        Some((reader, writer)) => (Some(reader), Some(writer)),
        None => (None, None),
    };

    let (request_tx, request_rx) = oneshot::channel::<HttpRequest>();

    let client_write = async {
        http::write_request(&mut client_write_half, request).await?;
        if env.flags.contains(OperationFlags::CLIENT_ABORTS_REQUEST) {
            tracing::debug!("connection {}: client aborts after sending", connection_id);
            env.client_abort.cancel();
            return Err(HarnessError::Canceled);
        }
        Ok(())
    };

    let client_read = async {
        let read = async {
            match env.read_limit {
                Some(limit) => {
                    http::read_response_prefix(&mut client_reader, &env.limits, &request.method, limit)
                        .await
                }
                None => http::read_response(&mut client_reader, &env.limits, &request.method).await,
            }
        };
        tokio::select! {
            biased;
            err = client_aborted(env.client_abort) => Err(err),
            response = read => response,
        }
    };

    let server_read = lenient(ignore_server_faults, connection_id, "server read", async {
        let Some(reader) = server_reader.as_mut() else {
            return Ok(());
        };
        match http::read_request(reader, &env.limits).await? {
            Some(received) => {
                let _ = request_tx.send(received);
                Ok(())
            }
            None => Err(HarnessError::exchange(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before sending a request",
            ))),
        }
    });

    let server_write = lenient(ignore_server_faults, connection_id, "server write", async {
        let Some(writer) = server_writer.as_mut() else {
            return Ok(false);
        };
        let Ok(received) = request_rx.await else {
            return Ok(false);
        };
        let _tracked = env.ledger.track();
        let mut response = match env.routes.lookup(&received.path) {
            Some(route) => {
                let ctx = HandlerContext {
                    connection_id,
                    remote_addr: Some(remote_addr),
                    cancel: cancel.clone(),
                    client_abort: route.client_abort.clone(),
                    routes: Arc::new(OperationRoutes {
                        routes: Arc::clone(env.routes),
                        operation_id: route.operation_id,
                        client_abort: route.client_abort.clone(),
                    }),
                };
                let flags = route.handler.flags() | route.extra_flags;
                route.handler.handle_request(&ctx, &received, flags).await?
            }
            None => {
                tracing::debug!("operation {}: no route for {}", env.operation_id, received.path);
                HttpResponse::error(404, format!("no handler registered for {}", received.path))
            }
        };
        if !received.wants_keep_alive() && !response.is_resolved() {
            response.set_close_connection(true)?;
        }
        http::write_response(writer, &mut response).await?;
        let keeps_open = response.allows_reuse();
        if !keeps_open {
            let _ = writer.shutdown().await;
        }
        tracing::debug!(
            "connection {}: answered {} {} with {}",
            connection_id,
            received.method,
            received.path,
            response.status()
        );
        Ok(keeps_open)
    });

    let outcome = rendezvous
        .run(cancel, client_read, client_write, server_read, server_write, |fault| {
            tracing::debug!("connection {}: tearing down exchange: {}", connection_id, fault);
        })
        .await;

    drop(client_reader);
    drop(client_write_half);
    drop(server_reader);
    drop(server_writer);

    let (response, (), (), server_keeps_open) = outcome?;
    conn.exchanges += 1;
    Ok(Exchanged {
        response,
        server_keeps_open,
    })
}
