use super::*;
use crate::admission::DEFAULT_GROUP;
use connlab_core::error::ErrorKind;
use connlab_core::flags::RequestFlags;
use futures::FutureExt;

async fn harness() -> Harness {
    Harness::new(HarnessConfig::default().with_admission_timeout(Duration::from_secs(5)))
        .await
        .expect("harness")
}

#[tokio::test]
async fn hello_operation_completes() {
    let harness = harness().await;
    let token = CancellationToken::new();
    let operation = harness
        .start_operation(
            OperationKind::Primary,
            &Handler::hello("hello"),
            OperationOptions::default(),
            &token,
        )
        .expect("start");
    let report = operation.wait_for_completion().await.expect("completion");
    assert_eq!(report.status, Some(200));
    assert_eq!(report.error, ErrorKind::Success);
    assert_eq!(report.state, OperationState::Completed);
    assert_eq!(report.connections.len(), 1);
    assert!(!report.reused_connection);
    assert!(!report.events.is_empty());
    assert_eq!(operation.state(), OperationState::Completed);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn operation_starts_only_once() {
    let harness = harness().await;
    let token = CancellationToken::new();
    let operation = harness.create_operation(
        OperationKind::Primary,
        &Handler::hello("hello"),
        OperationOptions::default(),
    );
    harness.start(&operation, &token).expect("first start");
    let err = harness.start(&operation, &token).expect_err("second start");
    assert!(matches!(err, HarnessError::Contract(_)));
    operation.wait_for_completion().await.expect("completion");
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unstarted_operation_cannot_be_awaited() {
    let harness = harness().await;
    let operation = harness.create_operation(
        OperationKind::Secondary,
        &Handler::hello("hello"),
        OperationOptions::default(),
    );
    assert_eq!(operation.state(), OperationState::Created);
    let err = operation.wait_for_completion().await.expect_err("never started");
    assert!(matches!(err, HarnessError::Contract(_)));
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn handler_clone_is_dispatched_not_the_original() {
    let harness = harness().await;
    let token = CancellationToken::new();
    let handler = Handler::hello("hello");
    let operation = harness
        .start_operation(OperationKind::Primary, &handler, OperationOptions::default(), &token)
        .expect("start");
    assert!(operation.handler().is_dispatched());
    assert!(!handler.is_dispatched());
    operation.wait_for_completion().await.expect("completion");
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn second_queued_operation_is_a_nested_call() {
    let harness = harness().await;
    harness.set_connection_limit(DEFAULT_GROUP, Some(1));
    let token = CancellationToken::new();
    let slow = Handler::delay(Duration::from_secs(30), Handler::hello("slow"));
    let primary = harness
        .start_operation(
            OperationKind::Primary,
            &slow,
            OperationOptions::default().expect_error(ErrorKind::RequestCanceled),
            &token,
        )
        .expect("primary");
    primary.wait_for_state(OperationState::Running).await;

    let queued = harness
        .start_operation(
            OperationKind::Queued,
            &Handler::hello("queued"),
            OperationOptions::default(),
            &token,
        )
        .expect("queued");
    assert_eq!(queued.wait_for_state(OperationState::Queued).await, OperationState::Queued);

    let err = harness
        .start_operation(
            OperationKind::Queued,
            &Handler::hello("nested"),
            OperationOptions::default(),
            &token,
        )
        .expect_err("nested");
    assert!(matches!(err, HarnessError::Contract(_)));

    primary.abort();
    primary.wait_for_completion().await.expect("primary");
    queued.wait_for_completion().await.expect("queued");
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn injected_connect_failure_is_observed() {
    let harness = harness().await;
    harness.fail_next_connects(1);
    let token = CancellationToken::new();
    let failing = harness
        .start_operation(
            OperationKind::Primary,
            &Handler::hello("hello"),
            OperationOptions::default().expect_error(ErrorKind::ConnectFailure),
            &token,
        )
        .expect("start");
    let report = failing.wait_for_completion().await.expect("completion");
    assert_eq!(report.status, None);
    assert!(report.connections.is_empty());
    assert_eq!(harness.current_connections(DEFAULT_GROUP), 0);

    let next = harness
        .start_operation(
            OperationKind::Primary,
            &Handler::hello("hello"),
            OperationOptions::default(),
            &token,
        )
        .expect("start");
    next.wait_for_completion().await.expect("completion");
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unexpected_outcome_faults_the_operation() {
    let harness = harness().await;
    let token = CancellationToken::new();
    let operation = harness
        .start_operation(
            OperationKind::Primary,
            &Handler::hello("hello"),
            OperationOptions::default().expect_status(204),
            &token,
        )
        .expect("start");
    let err = operation.wait_for_completion().await.expect_err("mismatch");
    assert!(matches!(err, HarnessError::Assertion(_)));
    assert_eq!(operation.state(), OperationState::Faulted);
    assert!(!operation.wait_for_completion_ignoring_errors().await);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn request_handle_aborts_before_admission() {
    let harness = harness().await;
    let token = CancellationToken::new();
    let operation = harness
        .start_operation(
            OperationKind::Secondary,
            &Handler::hello("hello"),
            OperationOptions::default()
                .with_flags(connlab_core::flags::OperationFlags::DELAYED_ADMISSION)
                .expect_error(ErrorKind::RequestCanceled),
            &token,
        )
        .expect("start");
    let handle = operation.wait_for_request().await.expect("request");
    assert_eq!(handle.request.method, "GET");
    assert!(handle.request.path.starts_with(&format!("/op{}/", operation.id())));
    handle.abort();
    handle.abort();
    let report = operation.wait_for_completion().await.expect("completion");
    assert_eq!(report.state, OperationState::Canceled);
    assert!(report.connections.is_empty());
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn read_handler_sees_primary_reads_only() {
    let harness = harness().await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    harness.set_primary_read_handler(Some(Arc::new(move |operation: Operation, event: ReadEvent| {
        let counter = Arc::clone(&counter);
        async move {
            assert_eq!(operation.kind(), OperationKind::Primary);
            assert!(event.bytes_read > 0);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HarnessError>(HookReply::proceed())
        }
        .boxed()
    })));
    let token = CancellationToken::new();
    let handler = Handler::hello("hello");
    let primary = harness
        .start_operation(OperationKind::Primary, &handler, OperationOptions::default(), &token)
        .expect("primary");
    primary.wait_for_completion().await.expect("primary");
    let secondary = harness
        .start_operation(OperationKind::Secondary, &handler, OperationOptions::default(), &token)
        .expect("secondary");
    secondary.wait_for_completion().await.expect("secondary");

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(harness.read_handler_calls(), 1);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn keep_alive_connection_is_parked_and_reused() {
    let harness = harness().await;
    let token = CancellationToken::new();
    let handler = Handler::hello("hello").with_flags(RequestFlags::KEEP_ALIVE);
    let first = harness
        .start_operation(OperationKind::Primary, &handler, OperationOptions::default(), &token)
        .expect("first");
    let first = first.wait_for_completion().await.expect("first");
    assert_eq!(harness.admission_snapshot(DEFAULT_GROUP).idle, 1);

    let second = harness
        .start_operation(OperationKind::Secondary, &handler, OperationOptions::default(), &token)
        .expect("second");
    let second = second.wait_for_completion().await.expect("second");
    assert!(second.reused_connection);
    assert_eq!(second.connections, first.connections);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn finished_operations_are_pruned_from_the_task_list() {
    let harness = harness().await;
    let token = CancellationToken::new();
    for _ in 0..8 {
        harness
            .start_operation(
                OperationKind::Primary,
                &Handler::hello("hello"),
                OperationOptions::default(),
                &token,
            )
            .expect("start")
            .wait_for_completion()
            .await
            .expect("completion");
    }
    assert!(lock(&harness.inner.tasks).len() <= 2);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn event_log_keeps_the_configured_number_of_events() {
    let harness = Harness::new(HarnessConfig::default().with_event_log_capacity(4))
        .await
        .expect("harness");
    let token = CancellationToken::new();
    harness
        .start_operation(
            OperationKind::Primary,
            &Handler::hello("hello"),
            OperationOptions::default(),
            &token,
        )
        .expect("start")
        .wait_for_completion()
        .await
        .expect("completion");
    let events = harness.events();
    assert!(events.len() <= 4);
    assert!(harness.inner.events.recorded() as usize >= events.len());
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn write_handler_sees_the_request_head() {
    let harness = harness().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    harness.set_write_handler(Some(Arc::new(move |operation: Operation, event: WriteEvent| {
        let recorder = Arc::clone(&recorder);
        async move {
            assert_eq!(event.offset, 0);
            recorder.lock().expect("lock").push((operation.kind(), event.buffer));
            Ok::<_, HarnessError>(HookReply::proceed())
        }
        .boxed()
    })));
    let token = CancellationToken::new();
    let operation = harness
        .start_operation(
            OperationKind::Secondary,
            &Handler::hello("hello"),
            OperationOptions::default(),
            &token,
        )
        .expect("start");
    let report = operation.wait_for_completion().await.expect("completion");
    assert_eq!(report.status, Some(200));

    let seen = seen.lock().expect("lock").clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, OperationKind::Secondary);
    assert!(seen[0].1.starts_with(b"GET /op"));
    assert_eq!(harness.write_handler_calls(), 1);
    harness.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failing_write_handler_faults_the_operation() {
    let harness = harness().await;
    harness.set_write_handler(Some(Arc::new(|_operation: Operation, _event: WriteEvent| {
        async { Err::<HookReply, _>(HarnessError::assertion("request must not be sent")) }.boxed()
    })));
    let token = CancellationToken::new();
    let operation = harness
        .start_operation(
            OperationKind::Primary,
            &Handler::hello("hello"),
            OperationOptions::default(),
            &token,
        )
        .expect("start");
    let err = operation.wait_for_completion().await.expect_err("faulted");
    assert!(matches!(err, HarnessError::Assertion(_)), "{err}");
    assert_eq!(operation.state(), OperationState::Faulted);
    assert_eq!(harness.write_handler_calls(), 1);
    assert_eq!(harness.current_connections(DEFAULT_GROUP), 0);
    harness.shutdown().await.expect("shutdown");
}
