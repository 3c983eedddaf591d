mod support;

use connlab_core::flags::{OperationFlags, RequestFlags};
use connlab_core::handler::Handler;
use connlab_harness::{OperationKind, OperationOptions, DEFAULT_GROUP};
use support::{harness, run_scenario};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn reuse_connection() {
    let reports = run_scenario("reuse-connection").await.expect("scenario");
    assert!(!reports[0].reused_connection);
    assert!(reports[1].reused_connection);
    assert!(!reports[2].reused_connection);
}

#[tokio::test]
async fn custom_connection_group() {
    let reports = run_scenario("custom-connection-group").await.expect("scenario");
    assert_ne!(reports[0].connections, reports[1].connections);
    assert_eq!(reports[0].connections, reports[2].connections);
}

#[tokio::test]
async fn close_idle_connection() {
    run_scenario("close-idle-connection").await.expect("scenario");
}

#[tokio::test]
async fn close_connection_group() {
    let reports = run_scenario("close-connection-group").await.expect("scenario");
    assert_eq!(reports.len(), 2);
}

#[tokio::test]
async fn dont_reuse_never_parks() {
    let harness = harness().await;
    let token = CancellationToken::new();
    let handler = Handler::hello("keep-alive").with_flags(RequestFlags::KEEP_ALIVE);

    let kept = harness
        .start_operation(OperationKind::Primary, &handler, OperationOptions::default(), &token)
        .expect("kept");
    kept.wait_for_completion().await.expect("kept");
    assert_eq!(harness.admission_snapshot(DEFAULT_GROUP).idle, 1);

    let private = harness
        .start_operation(
            OperationKind::Secondary,
            &handler,
            OperationOptions::default().with_flags(OperationFlags::DONT_REUSE_CONNECTION),
            &token,
        )
        .expect("private");
    let report = private.wait_for_completion().await.expect("private");
    assert!(!report.reused_connection);
    let snapshot = harness.admission_snapshot(DEFAULT_GROUP);
    assert_eq!(snapshot.idle, 1);
    assert_eq!(snapshot.current, 1);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn full_group_evicts_idle_connection_for_new_demand() {
    let harness = harness().await;
    harness.set_connection_limit(DEFAULT_GROUP, Some(1));
    let token = CancellationToken::new();
    let handler = Handler::hello("keep-alive").with_flags(RequestFlags::KEEP_ALIVE);

    let first = harness
        .start_operation(OperationKind::Primary, &handler, OperationOptions::default(), &token)
        .expect("first");
    let first = first.wait_for_completion().await.expect("first");
    let fresh = harness
        .start_operation(
            OperationKind::Secondary,
            &handler,
            OperationOptions::default().with_flags(OperationFlags::FORCE_NEW_CONNECTION),
            &token,
        )
        .expect("fresh");
    let fresh = fresh.wait_for_completion().await.expect("fresh");
    assert!(!fresh.was_queued);
    assert_ne!(fresh.connections, first.connections);
    assert_eq!(harness.current_connections(DEFAULT_GROUP), 1);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn reuse_after_partial_read() {
    let reports = run_scenario("reuse-after-partial-read")
        .await
        .expect("scenario");
    let partial = reports[0].response.as_ref().expect("partial response");
    assert!(partial.is_truncated());
    assert!(!partial.allows_reuse());
    assert!(!reports[1].reused_connection);
    assert_ne!(reports[0].connections, reports[1].connections);
}
