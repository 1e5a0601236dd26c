use std::thread::sleep;
use std::time::Duration;

use tempfile::tempdir;
use work_queue::{
    DeleteEntry, DurableQueue, OutgoingMessage, QueueError, QueueKind, QueueOptions,
    EXPIRED_RECEIPT,
};

fn fifo_options(visibility: Duration) -> QueueOptions {
    QueueOptions {
        kind: QueueKind::Fifo,
        visibility_timeout: visibility,
        purge_interval: Duration::from_secs(60),
    }
}

fn grouped(entries: std::ops::Range<usize>, group: &str) -> Vec<OutgoingMessage> {
    entries
        .map(|i| OutgoingMessage::new(format!("e{i}"), format!("body-{i}")).with_group(group))
        .collect()
}

fn delete_entries(messages: &[work_queue::ReceivedMessage]) -> Vec<DeleteEntry> {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| DeleteEntry {
            entry_id: format!("d{i}"),
            receipt_handle: m.receipt_handle.clone(),
        })
        .collect()
}

#[test]
fn send_receive_delete_flow_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queues").join("company.db");
    let queue = DurableQueue::open(&path, fifo_options(Duration::from_secs(30))).unwrap();

    let sent = queue.send_batch(&grouped(0..3, "run-1")).unwrap();
    assert_eq!(sent.successful.len(), 3);
    assert!(sent.failed.is_empty());
    assert_eq!(queue.attributes().unwrap().total(), 3);
    drop(queue);

    let queue = DurableQueue::open(&path, fifo_options(Duration::from_secs(30))).unwrap();
    let received = queue.receive(10).unwrap();
    assert_eq!(received.len(), 3);
    assert_eq!(received[0].body, "body-0");
    assert_eq!(received[2].body, "body-2");
    assert!(received.iter().all(|m| m.receive_count == 1));

    let attrs = queue.attributes().unwrap();
    assert_eq!(attrs.visible, 0);
    assert_eq!(attrs.in_flight, 3);

    let deleted = queue.delete_batch(&delete_entries(&received)).unwrap();
    assert_eq!(deleted.successful.len(), 3);
    assert_eq!(queue.attributes().unwrap().total(), 0);
}

#[test]
fn fifo_group_is_blocked_while_sibling_in_flight() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(
        dir.path().join("fifo.db"),
        fifo_options(Duration::from_secs(30)),
    )
    .unwrap();

    queue.send_batch(&grouped(0..10, "run-1")).unwrap();
    queue.send_batch(&grouped(10..11, "run-1")).unwrap();

    let first = queue.receive(10).unwrap();
    assert_eq!(first.len(), 10);

    // The eleventh message shares the group of ten in-flight siblings.
    assert!(queue.receive(10).unwrap().is_empty());

    queue.delete_batch(&delete_entries(&first)).unwrap();
    let second = queue.receive(10).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].body, "body-10");
}

#[test]
fn fifo_other_groups_are_not_blocked() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(
        dir.path().join("fifo.db"),
        fifo_options(Duration::from_secs(30)),
    )
    .unwrap();

    queue.send_batch(&grouped(0..2, "a")).unwrap();
    let first = queue.receive(1).unwrap();
    assert_eq!(first.len(), 1);

    queue.send_batch(&grouped(2..3, "b")).unwrap();
    let next = queue.receive(10).unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].group_key.as_deref(), Some("b"));
}

#[test]
fn fifo_requires_group_key_per_entry() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(dir.path().join("q.db"), QueueOptions::default()).unwrap();

    let batch = vec![
        OutgoingMessage::new("ok", "a").with_group("g"),
        OutgoingMessage::new("missing", "b"),
    ];
    let outcome = queue.send_batch(&batch).unwrap();
    assert_eq!(outcome.successful.len(), 1);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].entry_id, "missing");
}

#[test]
fn standard_queue_rejects_group_key_and_delivers_freely() {
    let dir = tempdir().unwrap();
    let options = QueueOptions {
        kind: QueueKind::Standard,
        ..QueueOptions::default()
    };
    let queue = DurableQueue::open(dir.path().join("q.db"), options).unwrap();

    let batch = vec![
        OutgoingMessage::new("a", "1"),
        OutgoingMessage::new("b", "2"),
        OutgoingMessage::new("c", "3").with_group("g"),
    ];
    let outcome = queue.send_batch(&batch).unwrap();
    assert_eq!(outcome.successful.len(), 2);
    assert_eq!(outcome.failed[0].entry_id, "c");

    let first = queue.receive(1).unwrap();
    let second = queue.receive(1).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first[0].message_id, second[0].message_id);
}

#[test]
fn oversized_or_duplicate_batches_are_rejected() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(dir.path().join("q.db"), QueueOptions::default()).unwrap();

    let err = queue.send_batch(&grouped(0..11, "g")).unwrap_err();
    assert!(matches!(err, QueueError::BatchTooLarge { len: 11, .. }));

    let dup = vec![
        OutgoingMessage::new("x", "1").with_group("g"),
        OutgoingMessage::new("x", "2").with_group("g"),
    ];
    assert!(matches!(
        queue.send_batch(&dup).unwrap_err(),
        QueueError::DuplicateEntryId(_)
    ));
    assert_eq!(queue.attributes().unwrap().total(), 0);
}

#[test]
fn expired_receipt_cannot_delete_and_message_is_redelivered() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(
        dir.path().join("q.db"),
        fifo_options(Duration::from_millis(50)),
    )
    .unwrap();

    queue.send_batch(&grouped(0..1, "g")).unwrap();
    let first = queue.receive(10).unwrap();
    assert_eq!(first.len(), 1);

    sleep(Duration::from_millis(120));

    let outcome = queue.delete_batch(&delete_entries(&first)).unwrap();
    assert!(outcome.successful.is_empty());
    assert_eq!(outcome.failed[0].reason, EXPIRED_RECEIPT);

    let again = queue.receive(10).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].receive_count, 2);
    assert_ne!(again[0].receipt_handle, first[0].receipt_handle);
}

#[test]
fn unknown_receipt_is_reported_per_entry() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(dir.path().join("q.db"), QueueOptions::default()).unwrap();

    let outcome = queue
        .delete_batch(&[DeleteEntry {
            entry_id: "d0".to_string(),
            receipt_handle: "nope".to_string(),
        }])
        .unwrap();
    assert_eq!(outcome.failed.len(), 1);
    assert_ne!(outcome.failed[0].reason, EXPIRED_RECEIPT);
}

#[test]
fn delayed_messages_are_counted_separately() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(dir.path().join("q.db"), QueueOptions::default()).unwrap();

    queue
        .send_batch(&[
            OutgoingMessage::new("now", "1").with_group("g"),
            OutgoingMessage::new("later", "2")
                .with_group("h")
                .with_delay(Duration::from_secs(60)),
        ])
        .unwrap();

    let attrs = queue.attributes().unwrap();
    assert_eq!(attrs.visible, 1);
    assert_eq!(attrs.delayed, 1);
    assert_eq!(attrs.in_flight, 0);
}

#[test]
fn change_visibility_releases_message() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(dir.path().join("q.db"), QueueOptions::default()).unwrap();

    queue.send_batch(&grouped(0..1, "g")).unwrap();
    let received = queue.receive(1).unwrap();
    assert!(queue
        .change_visibility(&received[0].receipt_handle, Duration::ZERO)
        .unwrap());

    let again = queue.receive(1).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id, received[0].message_id);
}

#[test]
fn purge_clears_messages_and_enforces_interval() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(dir.path().join("q.db"), QueueOptions::default()).unwrap();

    queue.send_batch(&grouped(0..4, "g")).unwrap();
    assert_eq!(queue.purge().unwrap(), 4);
    assert_eq!(queue.attributes().unwrap().total(), 0);

    assert!(matches!(
        queue.purge().unwrap_err(),
        QueueError::PurgeInProgress { .. }
    ));
}

#[test]
fn extreme_visibility_timeout_keeps_message_hidden() {
    let dir = tempdir().unwrap();
    let queue = DurableQueue::open(dir.path().join("q.db"), fifo_options(Duration::MAX)).unwrap();
    queue.send_batch(&grouped(0..1, "run-1")).unwrap();

    let received = queue.receive(10).unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(queue.attributes().unwrap().in_flight, 1);

    assert!(queue
        .change_visibility(&received[0].receipt_handle, Duration::MAX)
        .unwrap());
    assert_eq!(queue.attributes().unwrap().in_flight, 1);
    assert!(queue.receive(10).unwrap().is_empty());
}
