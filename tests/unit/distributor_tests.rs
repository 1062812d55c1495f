//! Unit tests for `MessageDistributor` fan-out and the socket source.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use notebook_sessions::models::ops::KernelMessage;
use notebook_sessions::session::distributor::{ConnectionSource, MessageSource, QueueSource};
use notebook_sessions::session::{ConsumerCallback, MessageDistributor};

use super::test_helpers::message;

fn distributor() -> (mpsc::UnboundedSender<KernelMessage>, MessageDistributor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, MessageDistributor::new(Box::new(QueueSource::new(rx))))
}

fn recorder() -> (ConsumerCallback, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ConsumerCallback =
        Arc::new(move |message: &KernelMessage| sink.lock().unwrap().push(message.op.clone()));
    (callback, seen)
}

async fn wait_for_len(seen: &Mutex<Vec<String>>, len: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.lock().unwrap().len() < len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("messages should arrive before timeout");
}

#[tokio::test]
async fn every_subscriber_sees_the_same_order() {
    let (tx, distributor) = distributor();
    let (first, first_seen) = recorder();
    let (second, second_seen) = recorder();
    let _a = distributor.add_consumer(first);
    let _b = distributor.add_consumer(second);
    distributor.start().unwrap();

    let expected: Vec<String> = (0..25).map(|i| format!("m{i}")).collect();
    for op in &expected {
        tx.send(message(op)).unwrap();
    }

    wait_for_len(&first_seen, expected.len()).await;
    wait_for_len(&second_seen, expected.len()).await;
    assert_eq!(*first_seen.lock().unwrap(), expected);
    assert_eq!(*second_seen.lock().unwrap(), expected);
    distributor.stop();
}

#[tokio::test]
async fn late_subscriber_only_sees_later_messages() {
    let (tx, distributor) = distributor();
    let (early, early_seen) = recorder();
    let _early = distributor.add_consumer(early);
    distributor.start().unwrap();

    tx.send(message("before")).unwrap();
    wait_for_len(&early_seen, 1).await;

    let (late, late_seen) = recorder();
    let _late = distributor.add_consumer(late);
    tx.send(message("after")).unwrap();
    wait_for_len(&early_seen, 2).await;
    wait_for_len(&late_seen, 1).await;

    assert_eq!(*late_seen.lock().unwrap(), vec!["after"]);
    distributor.stop();
}

#[tokio::test]
async fn disposed_subscriber_stops_receiving() {
    let (tx, distributor) = distributor();
    let (kept, kept_seen) = recorder();
    let (dropped, dropped_seen) = recorder();
    let _kept = distributor.add_consumer(kept);
    let subscription = distributor.add_consumer(dropped);
    assert_eq!(distributor.subscriber_count(), 2);
    distributor.start().unwrap();

    subscription.dispose();
    assert_eq!(distributor.subscriber_count(), 1);
    tx.send(message("m")).unwrap();
    wait_for_len(&kept_seen, 1).await;

    assert!(dropped_seen.lock().unwrap().is_empty());
    distributor.stop();
}

#[tokio::test]
async fn start_twice_is_an_error_and_stop_is_idempotent() {
    let (_tx, distributor) = distributor();
    distributor.start().unwrap();
    assert!(distributor.start().is_err());

    distributor.stop();
    distributor.stop();
    assert!(distributor.is_stopped());
}

#[test]
fn snapshot_runs_when_subscribing() {
    let (_tx, distributor) = distributor();
    let (callback, _) = recorder();
    let (_subscription, value) = distributor.add_consumer_with(callback, || 42);
    assert_eq!(value, 42);
    assert_eq!(distributor.subscriber_count(), 1);
}

/// NDJSON stream with junk between two good messages.
fn noisy_stream() -> String {
    let first = serde_json::to_string(&message("first")).unwrap();
    let second = serde_json::to_string(&message("second")).unwrap();
    format!("{first}\nnot json\n\n   \n{{\"data\": 1}}\n{second}\n")
}

#[tokio::test]
async fn connection_source_skips_malformed_lines_and_ends_at_eof() {
    let (mut kernel_side, server_side) = tokio::io::duplex(4096);
    let mut source = ConnectionSource::new(server_side);

    kernel_side.write_all(noisy_stream().as_bytes()).await.unwrap();
    drop(kernel_side);

    let first = source.next_message().await.expect("first message");
    assert_eq!(first.op, "first");
    let second = source.next_message().await.expect("second message");
    assert_eq!(second.op, "second");
    assert!(source.next_message().await.is_none());
}

#[tokio::test]
async fn distributor_over_a_socket_delivers_in_order_until_eof() {
    let (mut kernel_side, server_side) = tokio::io::duplex(4096);
    let distributor = MessageDistributor::new(Box::new(ConnectionSource::new(server_side)));
    let (callback, seen) = recorder();
    let _subscription = distributor.add_consumer(callback);
    distributor.start().unwrap();

    kernel_side.write_all(noisy_stream().as_bytes()).await.unwrap();
    wait_for_len(&seen, 2).await;

    drop(kernel_side);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    distributor.stop();
}
