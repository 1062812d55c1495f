//! Unit tests for `Room` membership and broadcast.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use notebook_sessions::session::{ConnectionState, ConsumerRole, Disposable, Room};
use notebook_sessions::AppError;

use super::test_helpers::{as_consumer, message, FakeConsumer};

fn counting_disposable(counter: &Arc<AtomicUsize>) -> Disposable {
    let counter = Arc::clone(counter);
    Disposable::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn second_main_consumer_is_rejected_and_room_unchanged() {
    let room = Room::new();
    let a = FakeConsumer::new("a");
    room.add_consumer(as_consumer(&a), Disposable::empty(), "a".into(), ConsumerRole::Main)
        .unwrap();

    let disposed = Arc::new(AtomicUsize::new(0));
    let b = FakeConsumer::new("b");
    let err = room
        .add_consumer(
            as_consumer(&b),
            counting_disposable(&disposed),
            "b".into(),
            ConsumerRole::Main,
        )
        .unwrap_err();

    assert!(matches!(err, AppError::Consumer(_)), "got {err:?}");
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(room.size(), 1);
    assert_eq!(room.main_consumer_id().as_deref(), Some("a"));
}

#[test]
fn duplicate_consumer_id_is_rejected() {
    let room = Room::new();
    let a = FakeConsumer::new("a");
    room.add_consumer(as_consumer(&a), Disposable::empty(), "a".into(), ConsumerRole::Kiosk)
        .unwrap();
    let again = room.add_consumer(
        as_consumer(&a),
        Disposable::empty(),
        "a".into(),
        ConsumerRole::Kiosk,
    );
    assert!(again.is_err());
    assert_eq!(room.size(), 1);
}

#[test]
fn broadcast_skips_sender_and_closed_consumers() {
    let room = Room::new();
    let main = FakeConsumer::new("main");
    let kiosk = FakeConsumer::new("kiosk");
    let gone = FakeConsumer::new("gone");
    room.add_consumer(as_consumer(&main), Disposable::empty(), "main".into(), ConsumerRole::Main)
        .unwrap();
    room.add_consumer(as_consumer(&kiosk), Disposable::empty(), "kiosk".into(), ConsumerRole::Kiosk)
        .unwrap();
    room.add_consumer(as_consumer(&gone), Disposable::empty(), "gone".into(), ConsumerRole::Kiosk)
        .unwrap();
    gone.set_state(ConnectionState::Closed);

    let delivered = room.broadcast(&message("focus-cell"), Some("main"));

    assert_eq!(delivered, 1);
    assert!(main.ops().is_empty());
    assert_eq!(kiosk.ops(), vec!["focus-cell"]);
    assert!(gone.ops().is_empty());
}

#[test]
fn broadcast_to_empty_room_is_a_no_op() {
    let room = Room::new();
    assert_eq!(room.broadcast(&message("reload"), None), 0);
}

#[test]
fn remove_consumer_stops_and_disposes_exactly_once() {
    let room = Room::new();
    let disposed = Arc::new(AtomicUsize::new(0));
    let main = FakeConsumer::new("main");
    room.add_consumer(
        as_consumer(&main),
        counting_disposable(&disposed),
        "main".into(),
        ConsumerRole::Main,
    )
    .unwrap();

    assert!(room.remove_consumer("main"));
    assert!(!room.remove_consumer("main"));

    assert_eq!(main.stop_count(), 1);
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert!(room.main_consumer().is_none());
    assert_eq!(room.size(), 0);
}

#[test]
fn close_tears_down_every_consumer() {
    let room = Room::new();
    let disposed = Arc::new(AtomicUsize::new(0));
    let main = FakeConsumer::new("main");
    let kiosk = FakeConsumer::new("kiosk");
    room.add_consumer(
        as_consumer(&main),
        counting_disposable(&disposed),
        "main".into(),
        ConsumerRole::Main,
    )
    .unwrap();
    room.add_consumer(
        as_consumer(&kiosk),
        counting_disposable(&disposed),
        "kiosk".into(),
        ConsumerRole::Kiosk,
    )
    .unwrap();

    room.close();

    assert_eq!(room.size(), 0);
    assert_eq!(main.stop_count(), 1);
    assert_eq!(kiosk.stop_count(), 1);
    assert_eq!(disposed.load(Ordering::SeqCst), 2);

    // A new main consumer is accepted after close.
    let next = FakeConsumer::new("next");
    room.add_consumer(as_consumer(&next), Disposable::empty(), "next".into(), ConsumerRole::Main)
        .unwrap();
    assert_eq!(room.consumer_ids(), vec!["next".to_owned()]);
}
