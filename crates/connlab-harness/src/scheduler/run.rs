//! The life of one started operation.

use super::operation::{Operation, OperationReport, OperationState};
use super::HarnessInner;
use crate::admission::{Admission, AdmissionSlot};
use crate::connection::Connection;
use crate::exchange::{run_exchange, ExchangeEnv, Exchanged};
use crate::rendezvous::Rendezvous;
use connlab_core::error::{ErrorKind, HarnessError, Result};
use connlab_core::flags::{OperationFlags, RequestFlags};
use connlab_core::handler::redirects_as_get;
use connlab_core::http::{is_redirect_status, Body, HttpRequest, HttpResponse};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A connection together with the admission slot it occupies. The
/// connection closes before the slot is released.
struct Bound {
    connection: Connection,
    slot: AdmissionSlot<Connection>,
}

pub(super) async fn run_operation(inner: Arc<HarnessInner>, operation: Operation, external: CancellationToken) {
    let cancel = operation.shared.cancel.clone();
    let timeout = operation.options().timeout;
    let work = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, drive(&inner, &operation)).await {
                Ok(result) => result,
                Err(_) => Err(HarnessError::Timeout(limit)),
            },
            None => drive(&inner, &operation).await,
        }
    };
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HarnessError::Canceled),
        _ = external.cancelled() => Err(HarnessError::Canceled),
        _ = inner.shutdown.cancelled() => Err(HarnessError::Canceled),
        result = work => result,
    };
    let canceled = operation.is_aborted() || external.is_cancelled() || inner.shutdown.is_cancelled();
    let (state, outcome) = resolve(&inner, &operation, result, canceled);
    inner.operation_finished(&operation);
    match &outcome {
        Ok(report) => tracing::debug!(
            "operation {}: {:?} with status {:?}, error {}",
            operation.id(),
            state,
            report.status,
            report.error
        ),
        Err(err) => tracing::debug!("operation {}: {:?}: {}", operation.id(), state, err),
    }
    operation.finish(state, outcome);
}

async fn drive(inner: &Arc<HarnessInner>, operation: &Operation) -> Result<HttpResponse> {
    let options = operation.options();
    let group = options.group.as_str();
    let flags = options.flags;

    inner.admission.register_group(group);
    let path = inner.server.routes().register(
        operation.id(),
        operation.handler().clone(),
        RequestFlags::NONE,
        operation.shared.client_abort.clone(),
    );
    let mut request = HttpRequest::get(path);
    request.headers.set("Host", inner.server.authority());
    operation.handler().configure_request(&mut request)?;
    operation.progress().admission = Some(inner.admission.snapshot(group));
    operation.publish_request(&request);

    if flags.contains(OperationFlags::DELAYED_ADMISSION) {
        tracing::debug!("operation {}: waiting to be admitted", operation.id());
        operation.admitted().await;
    }

    let mut bound: Option<Bound> = None;
    let mut hops = 0usize;
    loop {
        let mut current = match bound.take() {
            Some(current) => current,
            None => acquire_connection(inner, operation).await?,
        };

        let rendezvous = if options.gated {
            let (rendezvous, control) = Rendezvous::gated();
            operation.publish_rendezvous(control);
            rendezvous
        } else {
            Rendezvous::immediate()
        };
        let exchange_cancel = operation.shared.cancel.child_token();
        let group_closed = current.slot.close_token().clone();
        let env = ExchangeEnv {
            operation_id: operation.id(),
            flags,
            limits: inner.config.parse_limits,
            read_limit: options.read_limit,
            routes: inner.server.routes(),
            ledger: &inner.ledger,
            client_abort: &operation.shared.client_abort,
        };
        let exchanged = tokio::select! {
            biased;
            _ = group_closed.cancelled() => {
                tracing::debug!("operation {}: group {} closed mid-exchange", operation.id(), group);
                exchange_cancel.cancel();
                Err(HarnessError::Canceled)
            }
            result = run_exchange(&mut current.connection, &request, &env, rendezvous, &exchange_cancel) => {
                result.map_err(|fault| fault.error)
            }
        };
        let Exchanged {
            response,
            server_keeps_open,
        } = exchanged?;
        let reusable = response.allows_reuse() && server_keeps_open && flags.may_park();

        let Some(next) = follow_up(&request, &response)? else {
            release(inner, current, reusable);
            return Ok(response);
        };
        hops += 1;
        if hops > inner.config.max_hops {
            return Err(HarnessError::protocol(format!(
                "gave up after {} redirects and authentication retries",
                inner.config.max_hops
            )));
        }
        operation.progress().hops = hops;
        tracing::debug!(
            "operation {}: {} answered {}, following up with {} {}",
            operation.id(),
            request.path,
            response.status(),
            next.method,
            next.path
        );
        request = next;
        if reusable {
            bound = Some(current);
        } else {
            drop(current);
        }
    }
}

async fn acquire_connection(inner: &Arc<HarnessInner>, operation: &Operation) -> Result<Bound> {
    let options = operation.options();
    let group = options.group.as_str();
    let flags = options.flags;

    let (pooled, slot) = match inner.admission.acquire(group, flags.may_take_pooled()) {
        Admission::Fresh(slot) => (None, slot),
        Admission::Reused(connection, slot) => (Some(connection), slot),
        Admission::Queued(ticket) => {
            operation.progress().was_queued = true;
            operation.set_state(OperationState::Queued);
            let waited = Instant::now();
            match tokio::time::timeout(inner.config.admission_timeout, ticket.wait()).await {
                Ok(granted) => granted?,
                Err(_) => {
                    return Err(HarnessError::AdmissionTimeout {
                        operation: operation.id(),
                        waited: waited.elapsed(),
                    })
                }
            }
        }
    };
    operation.set_state(OperationState::Running);

    let connection = match pooled {
        Some(connection) => {
            tracing::debug!(
                "operation {}: reusing connection {}",
                operation.id(),
                connection.id()
            );
            operation.progress().reused = true;
            connection
        }
        None => open_connection(inner, operation).await?,
    };

    let first = {
        let mut progress = operation.progress();
        progress.connections.push(connection.id());
        progress.connections.len() == 1
    };
    if first {
        if let Some(hook) = inner.read_hook_for(operation) {
            connection.client_hooks().on_next_read(hook)?;
        }
        if let Some(hook) = inner.write_hook_for(operation) {
            connection.client_hooks().on_next_write(hook)?;
        }
    }
    Ok(Bound { connection, slot })
}

async fn open_connection(inner: &Arc<HarnessInner>, operation: &Operation) -> Result<Connection> {
    if inner.connect_failures.take() {
        tracing::debug!("operation {}: injecting connect failure", operation.id());
        return Err(HarnessError::connect(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "injected connect failure",
        )));
    }
    let abort_handshake = operation
        .options()
        .flags
        .contains(OperationFlags::SERVER_ABORTS_HANDSHAKE);
    let (client, server, client_addr) = inner
        .server
        .connect(abort_handshake, inner.config.admission_timeout)
        .await?;
    let id = inner.connection_ids.next();
    tracing::debug!(
        "operation {}: opened connection {} from {}",
        operation.id(),
        id,
        client_addr
    );
    Ok(Connection::new(
        id,
        client,
        server,
        client_addr,
        &inner.events,
        inner.config.debug_io,
    ))
}

/// Parks a reusable connection, otherwise closes it and frees its slot.
fn release(inner: &HarnessInner, current: Bound, reusable: bool) {
    let Bound { connection, slot } = current;
    if reusable {
        connection.disarm();
        inner.admission.park(connection, slot);
    } else {
        drop(connection);
        drop(slot);
    }
}

/// The next request of the operation, if the response asks for one.
fn follow_up(request: &HttpRequest, response: &HttpResponse) -> Result<Option<HttpRequest>> {
    let status = response.status();
    if is_redirect_status(status) {
        let location = response.headers().get("Location").ok_or_else(|| {
            HarnessError::protocol(format!("{} redirect without a Location header", status))
        })?;
        let mut next = replay(request);
        next.path = location_path(location).to_string();
        if redirects_as_get(status, &request.method) {
            next.method = "GET".to_string();
            next.body = Body::Empty;
            for name in ["Content-Length", "Transfer-Encoding", "Content-Type"] {
                next.headers.remove(name);
            }
        }
        return Ok(Some(next));
    }
    if status == 401 && !request.headers.contains("Authorization") {
        let (Some(credentials), Some(challenge)) =
            (&request.credentials, response.headers().get("WWW-Authenticate"))
        else {
            return Ok(None);
        };
        let offered = challenge.split_whitespace().next().unwrap_or("");
        if offered.eq_ignore_ascii_case(&credentials.scheme) {
            let mut next = replay(request);
            next.headers.set("Authorization", credentials.authorization());
            return Ok(Some(next));
        }
    }
    Ok(None)
}

/// A copy of `request` to send again; a chunked body goes out with a length.
fn replay(request: &HttpRequest) -> HttpRequest {
    let mut next = request.clone();
    if let Body::Chunked(data) = &request.body {
        next.headers.remove("Transfer-Encoding");
        next.headers.set("Content-Length", data.len().to_string());
        next.body = Body::Fixed(data.clone());
    }
    next
}

fn location_path(location: &str) -> &str {
    match location.find("://") {
        Some(scheme_end) => {
            let rest = &location[scheme_end + 3..];
            rest.find('/').map_or("/", |path_start| &rest[path_start..])
        }
        None => location,
    }
}

/// Errors raised inside instrumentation hooks travel wrapped in I/O errors.
fn unwrap_hook_error(err: HarnessError) -> HarnessError {
    if let HarnessError::Transport { source, .. } = &err {
        if let Some(hook_error) = source
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<HarnessError>())
        {
            return hook_error.clone();
        }
    }
    err
}

fn resolve(
    inner: &HarnessInner,
    operation: &Operation,
    result: Result<HttpResponse>,
    canceled: bool,
) -> (OperationState, Result<OperationReport>) {
    let options = operation.options();
    let (response, observed, failure) = match result.map_err(unwrap_hook_error) {
        Ok(response) => {
            let observed = if response.status() >= 400 {
                ErrorKind::ProtocolError
            } else {
                ErrorKind::Success
            };
            (Some(response), observed, None)
        }
        Err(err @ (HarnessError::Assertion(_) | HarnessError::Contract(_))) => {
            return (OperationState::Faulted, Err(err));
        }
        Err(err) => {
            let observed = if canceled {
                ErrorKind::RequestCanceled
            } else {
                err.kind()
            };
            (None, observed, Some(err))
        }
    };
    let status = response.as_ref().map(HttpResponse::status);

    let mismatch = if observed != options.expected_error {
        Some(format!(
            "expected {} but observed {}{}",
            options.expected_error,
            observed,
            failure
                .as_ref()
                .map(|err| format!(" ({})", err))
                .unwrap_or_default()
        ))
    } else if options.expected_status.is_some() && status != options.expected_status {
        Some(format!(
            "expected status {:?} but got {:?}",
            options.expected_status, status
        ))
    } else if observed == ErrorKind::Success
        && options.expected_status.is_none()
        && !response
            .as_ref()
            .is_some_and(HttpResponse::is_truncated)
        && !response
            .as_ref()
            .is_some_and(|response| operation.handler().check_response(response))
    {
        Some(format!(
            "handler {} rejected the response (status {:?})",
            operation.handler().identifier(),
            status
        ))
    } else {
        None
    };
    if let Some(message) = mismatch {
        return (
            OperationState::Faulted,
            Err(HarnessError::assertion(format!(
                "operation {}: {}",
                operation.id(),
                message
            ))),
        );
    }

    let state = if observed == ErrorKind::RequestCanceled && canceled {
        OperationState::Canceled
    } else {
        OperationState::Completed
    };
    let progress = operation.progress();
    let report = OperationReport {
        operation_id: operation.id(),
        kind: operation.kind(),
        state,
        status,
        error: observed,
        response,
        connections: progress.connections.clone(),
        reused_connection: progress.reused,
        hops: progress.hops,
        was_queued: progress.was_queued,
        admission_at_configure: progress.admission,
        events: inner.events.for_connections(&progress.connections),
    };
    (state, Ok(report))
}
