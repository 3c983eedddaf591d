//! Named end-to-end scenarios shared by the runner and the e2e tests.
//!
//! Every scenario runs on its own harness, checks its own invariants and
//! reports the operations it observed.

use crate::admission::DEFAULT_GROUP;
use crate::config::HarnessConfig;
use crate::instrumentation::{HookReply, ReadEvent, WriteEvent};
use crate::rendezvous::{RendezvousTask, TaskState};
use crate::scheduler::{
    Harness, Operation, OperationKind, OperationOptions, OperationReport, OperationState,
};
use connlab_core::auth::TokenAuthentication;
use connlab_core::error::{ErrorKind, HarnessError, Result};
use connlab_core::flags::{OperationFlags, RequestFlags};
use connlab_core::handler::{Handler, TransferMode};
use futures::future::{BoxFuture, FutureExt};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

type ScenarioFn = fn(Harness) -> BoxFuture<'static, Result<Vec<OperationReport>>>;

pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    body: ScenarioFn,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario").field("name", &self.name).finish()
    }
}

impl Scenario {
    /// Runs the scenario on a fresh harness and shuts it down afterwards.
    /// A scenario failure wins over a shutdown failure.
    pub async fn run(&self, config: HarnessConfig) -> Result<Vec<OperationReport>> {
        tracing::info!("scenario {}: starting", self.name);
        let harness = Harness::new(config).await?;
        let result = (self.body)(harness.clone()).await;
        let shutdown = harness.shutdown().await;
        let reports = result?;
        shutdown?;
        tracing::info!("scenario {}: passed with {} operations", self.name, reports.len());
        Ok(reports)
    }
}

pub fn find(name: &str) -> Option<Scenario> {
    catalogue().into_iter().find(|scenario| scenario.name == name)
}

macro_rules! scenario {
    ($name:literal, $description:literal, $body:path) => {
        Scenario {
            name: $name,
            description: $description,
            body: |harness| $body(harness).boxed(),
        }
    };
}

pub fn catalogue() -> Vec<Scenario> {
    vec![
        scenario!("simple", "one GET answered with Hello World", simple),
        scenario!(
            "parallel-requests",
            "a read callback starts a parallel request on a second connection",
            parallel_requests
        ),
        scenario!(
            "three-parallel-requests",
            "a read callback starts two parallel requests",
            three_parallel_requests
        ),
        scenario!(
            "parallel-requests-some-queued",
            "with a limit of two the third request waits for a slot",
            parallel_requests_some_queued
        ),
        scenario!(
            "simple-queued-request",
            "with a limit of one a request started from a read callback is queued",
            simple_queued_request
        ),
        scenario!(
            "cancel-queued-request",
            "a queued request is cancelled before it gets a slot",
            cancel_queued_request
        ),
        scenario!(
            "cancel-main-while-queued",
            "cancelling the busy request releases the queued one",
            cancel_main_while_queued
        ),
        scenario!(
            "abort-during-handshake",
            "the first read callback aborts the request",
            abort_during_handshake
        ),
        scenario!(
            "reset-after-accept",
            "the server resets the connection right after accepting it",
            reset_after_accept
        ),
        scenario!(
            "invalid-data-during-first-read",
            "a read callback replaces the response with garbage",
            invalid_data_during_first_read
        ),
        scenario!(
            "reuse-connection",
            "a keep-alive connection serves the next request",
            reuse_connection
        ),
        scenario!(
            "reuse-after-partial-read",
            "a response read only in part closes its connection",
            reuse_after_partial_read
        ),
        scenario!(
            "custom-connection-group",
            "pooled connections are only reused within their group",
            custom_connection_group
        ),
        scenario!(
            "close-idle-connection",
            "the idle sweeper closes a pooled connection",
            close_idle_connection
        ),
        scenario!(
            "close-connection-group",
            "closing a group closes idle connections and aborts busy ones",
            close_connection_group
        ),
        scenario!("simple-redirect", "a 302 is followed to the target", simple_redirect),
        scenario!("post-redirect", "a POST meeting a 302 is retried as GET", post_redirect),
        scenario!(
            "redirect-on-same-connection",
            "a keep-alive redirect is followed on the connection that carried it",
            redirect_on_same_connection
        ),
        scenario!(
            "simple-auth",
            "a challenge is answered on the same connection",
            simple_auth
        ),
        scenario!("get-404", "a 404 is reported as a protocol error", get_404),
        scenario!("simple-post", "a POST with an explicit Content-Length", simple_post),
        scenario!("post-chunked", "a POST with a chunked body", post_chunked),
        scenario!(
            "cancel-post-while-writing",
            "a write callback aborts a POST between its head and its body",
            cancel_post_while_writing
        ),
        scenario!(
            "read-timeout",
            "a slow handler outlives the operation timeout",
            read_timeout
        ),
        scenario!(
            "abort-response",
            "the server handler aborts the client request",
            abort_response
        ),
        scenario!(
            "gated-exchange",
            "the four exchange tasks start in a forced order",
            gated_exchange
        ),
    ]
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(HarnessError::Assertion(message()))
    }
}

async fn run_one(
    harness: &Harness,
    kind: OperationKind,
    handler: &Handler,
    options: OperationOptions,
) -> Result<OperationReport> {
    let token = CancellationToken::new();
    let operation = harness.start_operation(kind, handler, options, &token)?;
    operation.wait_for_completion().await
}

fn stored<T: Clone>(slot: &OnceLock<T>, what: &str) -> Result<T> {
    slot.get()
        .cloned()
        .ok_or_else(|| HarnessError::assertion(format!("read callback never produced {}", what)))
}

async fn simple(harness: Harness) -> Result<Vec<OperationReport>> {
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("simple"),
        OperationOptions::default().expect_status(200),
    )
    .await?;
    ensure(report.connections.len() == 1, || {
        format!("expected one connection, used {:?}", report.connections)
    })?;
    Ok(vec![report])
}

/// Installs a primary read handler that starts `count` parallel operations
/// and waits for all of them before the primary sees its response.
fn start_parallel_from_callback(
    harness: &Harness,
    count: usize,
    queue_last: bool,
) -> Arc<OnceLock<Vec<OperationReport>>> {
    let results = Arc::new(OnceLock::new());
    let slot = Arc::clone(&results);
    let nested = harness.clone();
    harness.set_primary_read_handler(Some(Arc::new(move |primary: Operation, _event: ReadEvent| {
        let harness = nested.clone();
        let slot = Arc::clone(&slot);
        async move {
            let handler = Handler::hello("parallel");
            let token = CancellationToken::new();
            let mut operations = Vec::with_capacity(count);
            for index in 0..count {
                let operation = harness.start_operation(
                    OperationKind::Parallel,
                    &handler,
                    OperationOptions::default(),
                    &token,
                )?;
                let expected = if queue_last && index + 1 == count {
                    OperationState::Queued
                } else {
                    OperationState::Running
                };
                operation.wait_for_state(expected).await;
                operations.push(operation);
            }
            let mut reports = Vec::with_capacity(count);
            for operation in operations {
                let report = operation.wait_for_completion().await?;
                let current = report.admission_at_configure.map_or(0, |snapshot| snapshot.current);
                ensure(current >= 1, || {
                    format!(
                        "operation {} was configured before primary {} held a slot",
                        report.operation_id,
                        primary.id()
                    )
                })?;
                ensure(!report.connections.iter().any(|id| primary.connections().contains(id)), || {
                    format!("operation {} shared the primary connection", report.operation_id)
                })?;
                reports.push(report);
            }
            let _ = slot.set(reports);
            Ok::<_, HarnessError>(HookReply::proceed())
        }
        .boxed()
    })));
    results
}

async fn parallel_requests(harness: Harness) -> Result<Vec<OperationReport>> {
    let results = start_parallel_from_callback(&harness, 1, false);
    let primary = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("primary"),
        OperationOptions::default(),
    )
    .await?;
    ensure(harness.read_handler_calls() == 1, || {
        format!("read callback ran {} times", harness.read_handler_calls())
    })?;
    let mut reports = vec![primary];
    reports.extend(stored(&results, "parallel reports")?);
    Ok(reports)
}

async fn three_parallel_requests(harness: Harness) -> Result<Vec<OperationReport>> {
    let results = start_parallel_from_callback(&harness, 2, false);
    let primary = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("primary"),
        OperationOptions::default(),
    )
    .await?;
    let parallel = stored(&results, "parallel reports")?;
    ensure(parallel.len() == 2, || format!("expected two parallel reports, got {}", parallel.len()))?;
    let mut reports = vec![primary];
    reports.extend(parallel);
    Ok(reports)
}

async fn parallel_requests_some_queued(harness: Harness) -> Result<Vec<OperationReport>> {
    harness.set_connection_limit(DEFAULT_GROUP, Some(2));
    let results = start_parallel_from_callback(&harness, 2, true);
    let primary = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("primary"),
        OperationOptions::default(),
    )
    .await?;
    let parallel = stored(&results, "parallel reports")?;
    ensure(
        parallel.len() == 2 && !parallel[0].was_queued && parallel[1].was_queued,
        || "only the request beyond the limit should have been queued".to_string(),
    )?;
    let mut reports = vec![primary];
    reports.extend(parallel);
    Ok(reports)
}

/// Installs a primary read handler that starts a queued operation and checks
/// it waits behind the primary. With `cancel` the queued operation is
/// aborted before the primary continues.
fn start_queued_from_callback(harness: &Harness, cancel: bool) -> Arc<OnceLock<Operation>> {
    let queued = Arc::new(OnceLock::new());
    let slot = Arc::clone(&queued);
    let nested = harness.clone();
    harness.set_primary_read_handler(Some(Arc::new(move |_primary: Operation, _event: ReadEvent| {
        let harness = nested.clone();
        let slot = Arc::clone(&slot);
        async move {
            let options = if cancel {
                OperationOptions::default().expect_error(ErrorKind::RequestCanceled)
            } else {
                OperationOptions::default().expect_status(200)
            };
            let operation = harness.start_operation(
                OperationKind::Queued,
                &Handler::hello("queued"),
                options,
                &CancellationToken::new(),
            )?;
            let state = operation.wait_for_state(OperationState::Queued).await;
            ensure(state == OperationState::Queued, || {
                format!("queued operation is {:?}", state)
            })?;
            let snapshot = harness.admission_snapshot(DEFAULT_GROUP);
            ensure(snapshot.current == 1 && snapshot.queued == 1, || {
                format!("unexpected admission state {:?}", snapshot)
            })?;
            if cancel {
                operation.abort();
            }
            let _ = slot.set(operation);
            Ok::<_, HarnessError>(HookReply::proceed())
        }
        .boxed()
    })));
    queued
}

async fn simple_queued_request(harness: Harness) -> Result<Vec<OperationReport>> {
    harness.set_connection_limit(DEFAULT_GROUP, Some(1));
    let queued = start_queued_from_callback(&harness, false);
    let primary = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("primary"),
        OperationOptions::default(),
    )
    .await?;
    let queued = stored(&queued, "a queued operation")?.wait_for_completion().await?;
    ensure(queued.was_queued, || "the secondary request was never queued".to_string())?;
    ensure(queued.connections != primary.connections, || {
        "the queued request reused a closed connection".to_string()
    })?;
    Ok(vec![primary, queued])
}

async fn cancel_queued_request(harness: Harness) -> Result<Vec<OperationReport>> {
    harness.set_connection_limit(DEFAULT_GROUP, Some(1));
    let queued = start_queued_from_callback(&harness, true);
    let primary = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("primary"),
        OperationOptions::default(),
    )
    .await?;
    let queued = stored(&queued, "a queued operation")?.wait_for_completion().await?;
    ensure(queued.state == OperationState::Canceled && queued.connections.is_empty(), || {
        format!("queued request ended {:?} on {:?}", queued.state, queued.connections)
    })?;
    Ok(vec![primary, queued])
}

async fn cancel_main_while_queued(harness: Harness) -> Result<Vec<OperationReport>> {
    harness.set_connection_limit(DEFAULT_GROUP, Some(1));
    let token = CancellationToken::new();
    let primary = harness.start_operation(
        OperationKind::Primary,
        &Handler::delay(Duration::from_secs(30), Handler::hello("primary")),
        OperationOptions::default().expect_error(ErrorKind::RequestCanceled),
        &token,
    )?;
    primary.wait_for_state(OperationState::Running).await;
    let queued = harness.start_operation(
        OperationKind::Queued,
        &Handler::hello("queued"),
        OperationOptions::default(),
        &token,
    )?;
    queued.wait_for_state(OperationState::Queued).await;
    ensure(harness.current_connections(DEFAULT_GROUP) == 1, || {
        format!("{} connections open", harness.current_connections(DEFAULT_GROUP))
    })?;
    primary.abort();
    let primary = primary.wait_for_completion().await?;
    let queued = queued.wait_for_completion().await?;
    ensure(primary.state == OperationState::Canceled, || {
        format!("primary ended {:?}", primary.state)
    })?;
    ensure(queued.was_queued && queued.status == Some(200), || {
        format!("queued request ended with {:?}", queued.status)
    })?;
    Ok(vec![primary, queued])
}

async fn abort_during_handshake(harness: Harness) -> Result<Vec<OperationReport>> {
    harness.set_primary_read_handler(Some(Arc::new(|operation: Operation, event: ReadEvent| {
        async move {
            operation.abort();
            event.cancel.cancelled().await;
            Ok::<_, HarnessError>(HookReply::abort())
        }
        .boxed()
    })));
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("handshake"),
        OperationOptions::default().expect_error(ErrorKind::RequestCanceled),
    )
    .await?;
    ensure(report.state == OperationState::Canceled, || {
        format!("aborted request ended {:?}", report.state)
    })?;
    ensure(harness.read_handler_calls() == 1, || {
        format!("read callback ran {} times", harness.read_handler_calls())
    })?;
    Ok(vec![report])
}

async fn reset_after_accept(harness: Harness) -> Result<Vec<OperationReport>> {
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("reset"),
        OperationOptions::default()
            .with_flags(OperationFlags::SERVER_ABORTS_HANDSHAKE)
            .expect_error(ErrorKind::RequestCanceled),
    )
    .await?;
    ensure(harness.outstanding_responses() == 0, || {
        format!("{} responses outstanding", harness.outstanding_responses())
    })?;
    Ok(vec![report])
}

async fn invalid_data_during_first_read(harness: Harness) -> Result<Vec<OperationReport>> {
    harness.set_primary_read_handler(Some(Arc::new(|_operation: Operation, event: ReadEvent| {
        async move {
            ensure(event.offset == 0, || format!("first read at offset {}", event.offset))?;
            Ok::<_, HarnessError>(HookReply::proceed().with_buffer(b"garbage\r\n\r\n".to_vec()))
        }
        .boxed()
    })));
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("invalid"),
        OperationOptions::default().expect_error(ErrorKind::ReceiveFailure),
    )
    .await?;
    Ok(vec![report])
}

async fn reuse_connection(harness: Harness) -> Result<Vec<OperationReport>> {
    let handler = Handler::hello("keep-alive").with_flags(RequestFlags::KEEP_ALIVE);
    let first = run_one(&harness, OperationKind::Primary, &handler, OperationOptions::default()).await?;
    let second = run_one(&harness, OperationKind::Secondary, &handler, OperationOptions::default()).await?;
    ensure(second.reused_connection && second.connections == first.connections, || {
        format!(
            "second request used {:?}, first used {:?}",
            second.connections, first.connections
        )
    })?;
    let fresh = run_one(
        &harness,
        OperationKind::Secondary,
        &handler,
        OperationOptions::default().with_flags(OperationFlags::FORCE_NEW_CONNECTION),
    )
    .await?;
    ensure(!fresh.reused_connection, || {
        "a forced new connection came from the pool".to_string()
    })?;
    Ok(vec![first, second, fresh])
}

async fn reuse_after_partial_read(harness: Harness) -> Result<Vec<OperationReport>> {
    const READ_LIMIT: usize = 1024;
    let handler = Handler::get_with_body("partial", 200, "x".repeat(32 * 1024))?
        .with_flags(RequestFlags::KEEP_ALIVE);
    let partial = run_one(
        &harness,
        OperationKind::Primary,
        &handler,
        OperationOptions::default()
            .read_at_most(READ_LIMIT)
            .expect_status(200),
    )
    .await?;
    let read = partial
        .response
        .as_ref()
        .filter(|response| response.is_truncated())
        .map(|response| response.body().bytes().len());
    ensure(read == Some(READ_LIMIT), || {
        format!("expected a response cut after {} bytes, read {:?}", READ_LIMIT, read)
    })?;
    let snapshot = harness.admission_snapshot(DEFAULT_GROUP);
    ensure(snapshot.idle == 0 && snapshot.current == 0, || {
        format!("partially read connection was kept: {:?}", snapshot)
    })?;

    let next = run_one(&harness, OperationKind::Secondary, &handler, OperationOptions::default()).await?;
    ensure(!next.reused_connection && next.connections != partial.connections, || {
        format!(
            "follow-up used {:?} after the partial read on {:?}",
            next.connections, partial.connections
        )
    })?;
    Ok(vec![partial, next])
}

async fn custom_connection_group(harness: Harness) -> Result<Vec<OperationReport>> {
    const GROUP: &str = "custom";
    harness.set_connection_limit(GROUP, Some(1));
    let handler = Handler::hello("grouped").with_flags(RequestFlags::KEEP_ALIVE);
    let custom = OperationOptions::default().in_group(GROUP);
    let first = run_one(&harness, OperationKind::Primary, &handler, custom.clone()).await?;
    let other = run_one(&harness, OperationKind::Secondary, &handler, OperationOptions::default()).await?;
    ensure(!other.reused_connection, || {
        "a connection crossed into another group".to_string()
    })?;
    let again = run_one(&harness, OperationKind::Secondary, &handler, custom).await?;
    ensure(again.reused_connection && again.connections == first.connections, || {
        "the custom group did not reuse its pooled connection".to_string()
    })?;
    ensure(harness.current_connections(GROUP) == 1, || {
        format!("group holds {} connections", harness.current_connections(GROUP))
    })?;
    Ok(vec![first, other, again])
}

async fn close_idle_connection(harness: Harness) -> Result<Vec<OperationReport>> {
    let max_idle = Duration::from_millis(50);
    harness.set_max_idle_time(DEFAULT_GROUP, Some(max_idle));
    let handler = Handler::hello("idle").with_flags(RequestFlags::KEEP_ALIVE);
    let report = run_one(&harness, OperationKind::Primary, &handler, OperationOptions::default()).await?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.current_connections(DEFAULT_GROUP) != 0 {
        ensure(Instant::now() < deadline, || {
            "idle connection was never swept".to_string()
        })?;
        tokio::time::sleep(max_idle / 2).await;
    }
    Ok(vec![report])
}

async fn close_connection_group(harness: Harness) -> Result<Vec<OperationReport>> {
    const GROUP: &str = "closing";
    let idle = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::hello("idle").with_flags(RequestFlags::KEEP_ALIVE),
        OperationOptions::default().in_group(GROUP),
    )
    .await?;
    let closed = harness.close_group(GROUP);
    ensure(closed == 1, || format!("closed {} idle connections", closed))?;

    let token = CancellationToken::new();
    let busy = harness.start_operation(
        OperationKind::Secondary,
        &Handler::delay(Duration::from_secs(30), Handler::hello("busy")),
        OperationOptions::default()
            .in_group(GROUP)
            .expect_error(ErrorKind::RequestCanceled),
        &token,
    )?;
    busy.wait_for_request().await?;
    busy.wait_for_state(OperationState::Running).await;
    harness.close_group(GROUP);
    let busy = busy.wait_for_completion().await?;
    ensure(harness.current_connections(GROUP) == 0, || {
        format!("group still holds {} connections", harness.current_connections(GROUP))
    })?;
    Ok(vec![idle, busy])
}

async fn simple_redirect(harness: Harness) -> Result<Vec<OperationReport>> {
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::redirect(302, Handler::hello("target")),
        OperationOptions::default(),
    )
    .await?;
    ensure(report.hops == 1 && report.status == Some(200), || {
        format!("redirect ended after {} hops with {:?}", report.hops, report.status)
    })?;
    Ok(vec![report])
}

async fn post_redirect(harness: Harness) -> Result<Vec<OperationReport>> {
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::redirect(
            302,
            Handler::post("target", Some("payload".to_string()), TransferMode::Default),
        ),
        OperationOptions::default().expect_status(200),
    )
    .await?;
    ensure(report.hops == 1, || format!("{} hops", report.hops))?;
    Ok(vec![report])
}

async fn redirect_on_same_connection(harness: Harness) -> Result<Vec<OperationReport>> {
    let target = Handler::hello("target").with_flags(RequestFlags::KEEP_ALIVE);
    let handler = Handler::redirect(302, target).with_flags(RequestFlags::KEEP_ALIVE);
    let report = run_one(&harness, OperationKind::Primary, &handler, OperationOptions::default()).await?;
    ensure(report.hops == 1 && report.status == Some(200), || {
        format!("redirect ended after {} hops with {:?}", report.hops, report.status)
    })?;
    ensure(report.connections.len() == 1, || {
        format!("redirect was followed over {:?}", report.connections)
    })?;
    Ok(vec![report])
}

async fn simple_auth(harness: Harness) -> Result<Vec<OperationReport>> {
    let middleware = Arc::new(TokenAuthentication::new("Token", "secret").connection_bound());
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::auth(middleware, Handler::hello("protected")),
        OperationOptions::default(),
    )
    .await?;
    ensure(report.hops == 1 && report.connections.len() == 1, || {
        format!(
            "authentication took {} hops over {:?}",
            report.hops, report.connections
        )
    })?;
    Ok(vec![report])
}

async fn get_404(harness: Harness) -> Result<Vec<OperationReport>> {
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::get("missing", 404),
        OperationOptions::default()
            .expect_status(404)
            .expect_error(ErrorKind::ProtocolError),
    )
    .await?;
    Ok(vec![report])
}

async fn simple_post(harness: Harness) -> Result<Vec<OperationReport>> {
    let handler = Handler::post("post", Some("Hello Post".to_string()), TransferMode::ContentLength)
        .with_flags(RequestFlags::EXPLICITLY_SET_LENGTH);
    let report = run_one(&harness, OperationKind::Primary, &handler, OperationOptions::default()).await?;
    Ok(vec![report])
}

async fn post_chunked(harness: Harness) -> Result<Vec<OperationReport>> {
    let content = "chunk ".repeat(2048);
    let handler = Handler::post("chunked", Some(content), TransferMode::Chunked);
    let report = run_one(&harness, OperationKind::Primary, &handler, OperationOptions::default()).await?;
    Ok(vec![report])
}

async fn cancel_post_while_writing(harness: Harness) -> Result<Vec<OperationReport>> {
    harness.set_write_handler(Some(Arc::new(|operation: Operation, event: WriteEvent| {
        async move {
            if event.offset == 0 {
                return Ok::<_, HarnessError>(HookReply::proceed().rearm());
            }
            operation.abort();
            event.cancel.cancelled().await;
            Ok(HookReply::abort())
        }
        .boxed()
    })));
    let handler = Handler::post(
        "cancelled-post",
        Some("body ".repeat(1024)),
        TransferMode::ContentLength,
    )
    .with_flags(RequestFlags::EXPLICITLY_SET_LENGTH);
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &handler,
        OperationOptions::default().expect_error(ErrorKind::RequestCanceled),
    )
    .await?;
    ensure(report.state == OperationState::Canceled && report.status.is_none(), || {
        format!("cancelled POST ended {:?} with {:?}", report.state, report.status)
    })?;
    ensure(harness.write_handler_calls() == 2, || {
        format!("write callback ran {} times", harness.write_handler_calls())
    })?;
    Ok(vec![report])
}

async fn read_timeout(harness: Harness) -> Result<Vec<OperationReport>> {
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::delay(Duration::from_secs(30), Handler::hello("slow")),
        OperationOptions::default()
            .with_timeout(Duration::from_millis(200))
            .expect_error(ErrorKind::Timeout),
    )
    .await?;
    Ok(vec![report])
}

async fn abort_response(harness: Harness) -> Result<Vec<OperationReport>> {
    let report = run_one(
        &harness,
        OperationKind::Primary,
        &Handler::abort(Handler::hello("aborted")),
        OperationOptions::default()
            .with_flags(OperationFlags::ABORT_AFTER_CLIENT_EXITS)
            .expect_error(ErrorKind::RequestCanceled),
    )
    .await?;
    ensure(report.state == OperationState::Canceled, || {
        format!("aborted request ended {:?}", report.state)
    })?;
    Ok(vec![report])
}

async fn gated_exchange(harness: Harness) -> Result<Vec<OperationReport>> {
    let token = CancellationToken::new();
    let operation = harness.start_operation(
        OperationKind::Primary,
        &Handler::hello("gated"),
        OperationOptions::default().gated(),
        &token,
    )?;
    let control = operation.wait_for_rendezvous().await?;
    ensure(control.state(RendezvousTask::ClientRead) == TaskState::WaitingForSignal, || {
        "client read ran before its signal".to_string()
    })?;
    control.start_server_read();
    control.start_server_write();
    control.start_client_write();
    ensure(control.state(RendezvousTask::ClientRead) == TaskState::WaitingForSignal, || {
        "client read ran before its signal".to_string()
    })?;
    control.start_client_read();
    let report = operation.wait_for_completion().await?;
    for task in RendezvousTask::ALL {
        ensure(control.state(task) == TaskState::Completed, || {
            format!("{:?} ended {:?}", task, control.state(task))
        })?;
    }
    Ok(vec![report])
}
