mod support;

use connlab_core::error::ErrorKind;
use connlab_core::handler::Handler;
use connlab_harness::{
    Harness, OperationKind, OperationOptions, OperationState, DEFAULT_GROUP,
};
use std::time::Duration;
use support::{init_logging, run_scenario, test_config};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn simple_queued_request() {
    let reports = run_scenario("simple-queued-request").await.expect("scenario");
    let queued = &reports[1];
    assert!(queued.was_queued);
    assert_eq!(queued.status, Some(200));
    let snapshot = queued.admission_at_configure.expect("snapshot");
    assert_eq!(snapshot.current, 1);
}

#[tokio::test]
async fn cancel_queued_request() {
    let reports = run_scenario("cancel-queued-request").await.expect("scenario");
    assert_eq!(reports[0].status, Some(200));
    assert_eq!(reports[1].error, ErrorKind::RequestCanceled);
    assert_eq!(reports[1].state, OperationState::Canceled);
}

#[tokio::test]
async fn cancel_main_while_queued() {
    let reports = run_scenario("cancel-main-while-queued").await.expect("scenario");
    assert_eq!(reports[0].error, ErrorKind::RequestCanceled);
    assert_eq!(reports[1].status, Some(200));
}

#[tokio::test]
async fn parallel_requests_some_queued() {
    let reports = run_scenario("parallel-requests-some-queued")
        .await
        .expect("scenario");
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|report| report.status == Some(200)));
}

#[tokio::test]
async fn limit_holds_while_second_operation_waits() {
    init_logging();
    let harness = Harness::new(test_config()).await.expect("harness");
    harness.set_connection_limit(DEFAULT_GROUP, Some(1));
    let token = CancellationToken::new();

    let busy = harness
        .start_operation(
            OperationKind::Primary,
            &Handler::delay(Duration::from_secs(30), Handler::hello("busy")),
            OperationOptions::default().expect_error(ErrorKind::RequestCanceled),
            &token,
        )
        .expect("busy");
    assert_eq!(
        busy.wait_for_state(OperationState::Running).await,
        OperationState::Running
    );
    let waiting = harness
        .start_operation(
            OperationKind::Secondary,
            &Handler::hello("waiting"),
            OperationOptions::default(),
            &token,
        )
        .expect("waiting");
    waiting.wait_for_state(OperationState::Queued).await;

    let snapshot = harness.admission_snapshot(DEFAULT_GROUP);
    assert_eq!(snapshot.limit, Some(1));
    assert_eq!(snapshot.current, 1);
    assert_eq!(snapshot.queued, 1);

    busy.abort();
    busy.abort();
    let report = waiting.wait_for_completion().await.expect("waiting");
    assert!(report.was_queued);
    assert!(harness.current_connections(DEFAULT_GROUP) <= 1);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn queued_operation_times_out_waiting_for_a_slot() {
    init_logging();
    let config = test_config().with_admission_timeout(Duration::from_millis(100));
    let harness = Harness::new(config).await.expect("harness");
    harness.set_connection_limit(DEFAULT_GROUP, Some(1));
    let token = CancellationToken::new();

    let busy = harness
        .start_operation(
            OperationKind::Primary,
            &Handler::delay(Duration::from_secs(30), Handler::hello("busy")),
            OperationOptions::default().expect_error(ErrorKind::RequestCanceled),
            &token,
        )
        .expect("busy");
    busy.wait_for_state(OperationState::Running).await;
    let starved = harness
        .start_operation(
            OperationKind::Secondary,
            &Handler::hello("starved"),
            OperationOptions::default().expect_error(ErrorKind::Timeout),
            &token,
        )
        .expect("starved");
    let report = starved.wait_for_completion().await.expect("starved");
    assert!(report.was_queued);
    assert!(report.connections.is_empty());
    assert_eq!(harness.admission_snapshot(DEFAULT_GROUP).queued, 0);

    token.cancel();
    busy.wait_for_completion().await.expect("busy");
    harness.shutdown().await.expect("shutdown");
}
