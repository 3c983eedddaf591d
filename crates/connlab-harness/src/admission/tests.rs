use super::*;
use std::sync::atomic::AtomicUsize;
use tokio::time::{sleep, timeout, Duration};

#[derive(Debug)]
struct FakeConn {
    id: u32,
    closed: Arc<AtomicUsize>,
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn conn(id: u32, closed: &Arc<AtomicUsize>) -> FakeConn {
    FakeConn {
        id,
        closed: Arc::clone(closed),
    }
}

fn limited(limit: usize) -> AdmissionController<FakeConn> {
    AdmissionController::new(Some(limit), None)
}

fn expect_fresh(admission: Admission<FakeConn>) -> AdmissionSlot<FakeConn> {
    match admission {
        Admission::Fresh(slot) => slot,
        Admission::Reused(..) => panic!("expected a fresh slot, got a pooled connection"),
        Admission::Queued(_) => panic!("expected a fresh slot, got queued"),
    }
}

fn expect_queued(admission: Admission<FakeConn>) -> Ticket<FakeConn> {
    match admission {
        Admission::Queued(ticket) => ticket,
        _ => panic!("expected to be queued"),
    }
}

#[tokio::test]
async fn limit_one_queues_the_second_request() {
    let controller = limited(1);
    let first = expect_fresh(controller.acquire(DEFAULT_GROUP, true));
    let ticket = expect_queued(controller.acquire(DEFAULT_GROUP, true));

    let snapshot = controller.snapshot(DEFAULT_GROUP);
    assert_eq!(snapshot.current, 1);
    assert_eq!(snapshot.queued, 1);

    let waiter = tokio::spawn(ticket.wait());
    sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished(), "ticket granted before release");

    drop(first);
    let (pooled, slot) = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("grant in time")
        .expect("join")
        .expect("granted");
    assert!(pooled.is_none());
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 1);
    drop(slot);
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 0);
}

#[tokio::test]
async fn tickets_are_granted_in_arrival_order() {
    let controller = limited(1);
    let slot = expect_fresh(controller.acquire(DEFAULT_GROUP, true));
    let first = expect_queued(controller.acquire(DEFAULT_GROUP, true));
    let second = expect_queued(controller.acquire(DEFAULT_GROUP, true));
    assert!(first.id() < second.id());

    let second_task = tokio::spawn(second.wait());
    let first_task = tokio::spawn(first.wait());
    drop(slot);

    let (_, first_slot) = first_task.await.expect("join").expect("first granted");
    sleep(Duration::from_millis(20)).await;
    assert!(!second_task.is_finished());
    drop(first_slot);
    let (_, _second_slot) = second_task.await.expect("join").expect("second granted");
}

#[tokio::test]
async fn parked_connection_goes_to_reusing_waiter() {
    let closed = Arc::new(AtomicUsize::new(0));
    let controller = limited(1);
    let slot = expect_fresh(controller.acquire(DEFAULT_GROUP, true));
    let ticket = expect_queued(controller.acquire(DEFAULT_GROUP, true));

    controller.park(conn(7, &closed), slot);
    let (pooled, _slot) = ticket.wait().await.expect("granted");
    assert_eq!(pooled.expect("pooled connection").id, 7);
    assert_eq!(closed.load(Ordering::SeqCst), 0);
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 1);
}

#[tokio::test]
async fn parked_connection_is_closed_for_non_reusing_waiter() {
    let closed = Arc::new(AtomicUsize::new(0));
    let controller = limited(1);
    let slot = expect_fresh(controller.acquire(DEFAULT_GROUP, true));
    let ticket = expect_queued(controller.acquire(DEFAULT_GROUP, false));

    controller.park(conn(1, &closed), slot);
    let (pooled, _slot) = ticket.wait().await.expect("granted");
    assert!(pooled.is_none());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 1);
}

#[test]
fn idle_connection_is_reused_or_evicted() {
    let closed = Arc::new(AtomicUsize::new(0));
    let controller = limited(1);
    let slot = expect_fresh(controller.acquire(DEFAULT_GROUP, true));
    controller.park(conn(1, &closed), slot);
    assert_eq!(controller.snapshot(DEFAULT_GROUP).idle, 1);

    match controller.acquire(DEFAULT_GROUP, true) {
        Admission::Reused(connection, slot) => {
            assert_eq!(connection.id, 1);
            controller.park(connection, slot);
        }
        _ => panic!("expected the pooled connection"),
    }

    let fresh = expect_fresh(controller.acquire(DEFAULT_GROUP, false));
    assert_eq!(closed.load(Ordering::SeqCst), 1, "idle connection evicted");
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 1);
    drop(fresh);
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 0);
}

#[test]
fn unbounded_group_never_queues() {
    let controller: AdmissionController<FakeConn> = AdmissionController::new(None, None);
    let slots: Vec<_> = (0..32)
        .map(|_| expect_fresh(controller.acquire("wide", false)))
        .collect();
    assert_eq!(controller.current_connections("wide"), 32);
    drop(slots);
    assert_eq!(controller.current_connections("wide"), 0);
}

#[tokio::test]
async fn dropped_ticket_withdraws_and_keeps_count() {
    let controller = limited(1);
    let slot = expect_fresh(controller.acquire(DEFAULT_GROUP, true));
    let ticket = expect_queued(controller.acquire(DEFAULT_GROUP, true));
    let waiting = timeout(Duration::from_millis(20), ticket.wait()).await;
    assert!(waiting.is_err(), "nothing should be granted yet");
    assert_eq!(controller.snapshot(DEFAULT_GROUP).queued, 0);

    drop(slot);
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 0);
}

#[test]
fn grant_racing_with_ticket_drop_is_released() {
    let controller = limited(1);
    let slot = expect_fresh(controller.acquire(DEFAULT_GROUP, true));
    let ticket = expect_queued(controller.acquire(DEFAULT_GROUP, true));
    // The grant is delivered but never awaited.
    drop(slot);
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 1);
    drop(ticket);
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 0);
}

#[test]
fn close_group_closes_idle_and_cancels_busy() {
    let closed = Arc::new(AtomicUsize::new(0));
    let controller = limited(2);
    let busy = expect_fresh(controller.acquire("g", true));
    let idle_slot = expect_fresh(controller.acquire("g", true));
    controller.park(conn(1, &closed), idle_slot);
    let busy_token = busy.close_token().clone();

    assert_eq!(controller.close_group("g"), 1);
    assert!(busy_token.is_cancelled());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(controller.current_connections("g"), 1);

    drop(busy);
    assert_eq!(controller.current_connections("g"), 0);
    let after = expect_fresh(controller.acquire("g", true));
    assert!(!after.close_token().is_cancelled());
}

#[test]
fn connection_finishing_after_close_group_is_not_pooled() {
    let closed = Arc::new(AtomicUsize::new(0));
    let controller = limited(2);
    let busy = expect_fresh(controller.acquire("g", true));
    assert_eq!(controller.close_group("g"), 0);

    controller.park(conn(1, &closed), busy);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    let snapshot = controller.snapshot("g");
    assert_eq!(snapshot.idle, 0);
    assert_eq!(snapshot.current, 0);

    // Connections admitted after the close pool normally.
    let later = expect_fresh(controller.acquire("g", true));
    controller.park(conn(2, &closed), later);
    assert_eq!(controller.snapshot("g").idle, 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slot_of_closed_connection_goes_to_next_waiter() {
    let closed = Arc::new(AtomicUsize::new(0));
    let controller = limited(1);
    let busy = expect_fresh(controller.acquire("g", true));
    controller.close_group("g");
    let ticket = expect_queued(controller.acquire("g", true));

    controller.park(conn(1, &closed), busy);
    let (pooled, _slot) = ticket.wait().await.expect("granted");
    assert!(pooled.is_none(), "a connection of the closed generation was handed on");
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(controller.current_connections("g"), 1);
}

#[tokio::test]
async fn close_group_fails_queued_tickets() {
    let controller = limited(1);
    let _busy = expect_fresh(controller.acquire("g", true));
    let ticket = expect_queued(controller.acquire("g", true));
    controller.close_group("g");
    assert!(matches!(ticket.wait().await, Err(HarnessError::Canceled)));
    assert_eq!(controller.snapshot("g").queued, 0);
}

#[test]
fn sweep_closes_only_expired_idle_connections() {
    let closed = Arc::new(AtomicUsize::new(0));
    let controller = limited(4);
    controller.set_max_idle_time("g", Some(Duration::from_millis(100)));
    let slot = expect_fresh(controller.acquire("g", true));
    controller.park(conn(1, &closed), slot);

    assert_eq!(controller.sweep_idle(Instant::now()), 0);
    let later = Instant::now() + Duration::from_millis(250);
    assert_eq!(controller.sweep_idle(later), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(controller.current_connections("g"), 0);
}

#[tokio::test]
async fn raising_the_limit_admits_waiters() {
    let controller = limited(1);
    let _slot = expect_fresh(controller.acquire(DEFAULT_GROUP, true));
    let ticket = expect_queued(controller.acquire(DEFAULT_GROUP, true));
    controller.set_connection_limit(DEFAULT_GROUP, Some(2));
    let (_, _second) = timeout(Duration::from_secs(1), ticket.wait())
        .await
        .expect("granted in time")
        .expect("granted");
    assert_eq!(controller.current_connections(DEFAULT_GROUP), 2);
}

#[test]
#[should_panic(expected = "holds none")]
fn releasing_an_unheld_slot_panics() {
    let controller = limited(1);
    controller.register_group(DEFAULT_GROUP);
    controller.shared.release(DEFAULT_GROUP);
}
