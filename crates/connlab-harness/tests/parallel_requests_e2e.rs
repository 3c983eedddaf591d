mod support;

use connlab_core::error::HarnessError;
use connlab_core::handler::Handler;
use connlab_harness::instrumentation::{Direction, Side};
use connlab_harness::{HookReply, Operation, OperationKind, OperationOptions, OperationReport, ReadEvent};
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use support::{harness, run_scenario};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn simple() {
    let reports = run_scenario("simple").await.expect("scenario");
    assert_eq!(reports[0].status, Some(200));
    assert_eq!(reports[0].hops, 0);
}

#[tokio::test]
async fn parallel_requests() {
    let reports = run_scenario("parallel-requests").await.expect("scenario");
    assert_eq!(reports.len(), 2);
    assert_ne!(reports[0].connections, reports[1].connections);
}

#[tokio::test]
async fn three_parallel_requests() {
    let reports = run_scenario("three-parallel-requests").await.expect("scenario");
    assert_eq!(reports.len(), 3);
    let mut connections: Vec<u64> = reports
        .iter()
        .flat_map(|report| report.connections.iter().copied())
        .collect();
    connections.sort_unstable();
    connections.dedup();
    assert_eq!(connections.len(), 3);
}

#[tokio::test]
async fn gated_exchange() {
    let reports = run_scenario("gated-exchange").await.expect("scenario");
    assert_eq!(reports[0].status, Some(200));
}

#[tokio::test]
async fn parallel_operation_is_admitted_after_its_callback_starts() {
    let harness = harness().await;
    let started: Arc<Mutex<Option<Operation>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&started);
    let nested = harness.clone();
    harness.set_primary_read_handler(Some(Arc::new(move |_primary: Operation, event: ReadEvent| {
        let harness = nested.clone();
        let slot = Arc::clone(&slot);
        async move {
            assert_eq!(event.offset, 0);
            let parallel = harness.start_operation(
                OperationKind::Parallel,
                &Handler::hello("parallel"),
                OperationOptions::default(),
                &CancellationToken::new(),
            )?;
            parallel.wait_for_completion().await?;
            *slot.lock().expect("slot") = Some(parallel);
            Ok::<_, HarnessError>(HookReply::proceed())
        }
        .boxed()
    })));

    let token = CancellationToken::new();
    let primary = harness
        .start_operation(
            OperationKind::Primary,
            &Handler::hello("primary"),
            OperationOptions::default(),
            &token,
        )
        .expect("primary");
    let primary: OperationReport = primary.wait_for_completion().await.expect("primary");
    let parallel = started.lock().expect("slot").take().expect("parallel started");
    let parallel = parallel.wait_for_completion().await.expect("parallel");

    let callback = primary
        .events
        .iter()
        .find(|event| event.hooked && event.side == Side::Client && event.direction == Direction::Read)
        .expect("hooked read")
        .sequence;
    assert!(parallel.events.iter().all(|event| event.sequence > callback));
    assert!(parallel.admission_at_configure.expect("snapshot").current >= 1);
    assert_eq!(harness.read_handler_calls(), 1);
    harness.shutdown().await.expect("shutdown");
}
