use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{AckSink, DeliveryCoordinator, Disposition, MemorySink, RedeliveryPolicy};
use crate::ack::{AckKind, PoisonCause, PoisonKind, TransactionId};
use crate::config::Settings;
use crate::dispatch::{ConsumerId, Dequeue, Destination, InboundMessage, MessageId, Timeout};
use crate::utils::error::{AckError, CoordinatorError};

fn coordinator(max_redeliveries: i32) -> DeliveryCoordinator<Arc<MemorySink>> {
    let coordinator = DeliveryCoordinator::new(
        ConsumerId::from("consumer-1"),
        Destination::from("orders"),
        Arc::new(MemorySink::new()),
    )
    .with_policy(RedeliveryPolicy::default().with_max_redeliveries(max_redeliveries));
    coordinator.start();
    coordinator
}

fn deliver_all(coordinator: &DeliveryCoordinator<Arc<MemorySink>>, ids: &[&str]) {
    for id in ids {
        coordinator.deliver(InboundMessage::new(*id, format!("body of {id}")), None);
    }
}

fn next_id(coordinator: &DeliveryCoordinator<Arc<MemorySink>>) -> MessageId {
    coordinator
        .receive_no_wait()
        .into_entry()
        .expect("an entry")
        .message_id
}

#[test]
fn test_deliver_assigns_sequence_and_destination() {
    let coordinator = coordinator(3);
    let hint = Destination::from("hinted");

    coordinator.deliver(InboundMessage::new("a", "x").with_destination("explicit"), Some(&hint));
    coordinator.deliver(InboundMessage::new("b", "x"), Some(&hint));
    coordinator.deliver(InboundMessage::new("c", "x"), None);

    let a = coordinator.receive_no_wait().into_entry().unwrap();
    let b = coordinator.receive_no_wait().into_entry().unwrap();
    let c = coordinator.receive_no_wait().into_entry().unwrap();

    assert_eq!(a.destination.as_str(), "explicit");
    assert_eq!(b.destination.as_str(), "hinted");
    assert_eq!(c.destination.as_str(), "orders");
    assert_eq!((a.sequence, b.sequence, c.sequence), (1, 2, 3));
    assert_eq!(a.consumer_id.as_str(), "consumer-1");
}

#[test]
fn test_receive_records_outstanding() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["a", "b"]);

    assert_eq!(coordinator.pending_count(), 2);
    assert_eq!(coordinator.outstanding_count(), 0);

    let a = next_id(&coordinator);
    assert_eq!(coordinator.pending_count(), 1);
    assert_eq!(coordinator.outstanding_ids(), vec![a]);
}

#[test]
fn test_acknowledge_emits_standard_record() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["a", "b", "c"]);
    let ids: Vec<MessageId> = (0..3).map(|_| next_id(&coordinator)).collect();

    let record = coordinator.acknowledge(&ids).unwrap();

    assert_eq!(record.kind, AckKind::Standard);
    assert_eq!(record.message_count, 3);
    assert_eq!(coordinator.sink().take(), vec![record]);
    assert_eq!(coordinator.outstanding_count(), 0);
}

#[test]
fn test_acknowledge_errors_are_reported() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["a", "b", "c"]);
    let a = next_id(&coordinator);
    let _b = next_id(&coordinator);
    let c = next_id(&coordinator);

    assert!(matches!(
        coordinator.acknowledge(&[a.clone(), c]),
        Err(CoordinatorError::Ack(AckError::NonContiguousRange { .. }))
    ));

    coordinator.acknowledge_individual(&a).unwrap();
    assert_eq!(
        coordinator.acknowledge_individual(&a),
        Err(CoordinatorError::Ack(AckError::NotOutstanding(a)))
    );
    assert_eq!(coordinator.sink().len(), 1);
}

#[test]
fn test_redelivery_then_poison_scenario() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["A", "B", "C"]);
    let a = MessageId::from("A");

    for attempt in 1..=3 {
        let entry = coordinator.receive_no_wait().into_entry().unwrap();
        assert_eq!(entry.message_id, a, "A stays ahead of B");
        assert_eq!(entry.redelivery_count, attempt - 1);
        assert_eq!(entry.sequence, 1);

        let disposition = coordinator
            .fail(&a, PoisonCause::listener_failure("handler blew up"))
            .unwrap();
        assert!(matches!(
            disposition,
            Disposition::Redelivered { redelivery_count, .. } if redelivery_count == attempt
        ));
        assert_eq!(coordinator.redelivery_count(&a), attempt);
    }

    let entry = coordinator.receive_no_wait().into_entry().unwrap();
    assert_eq!(entry.message_id, a);
    assert_eq!(entry.redelivery_count, 3);
    assert_eq!(
        coordinator
            .fail(&a, PoisonCause::listener_failure("handler blew up"))
            .unwrap(),
        Disposition::Poisoned
    );

    let records = coordinator.sink().take();
    let kinds: Vec<AckKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AckKind::Redelivered,
            AckKind::Redelivered,
            AckKind::Redelivered,
            AckKind::Poison
        ]
    );
    let poison = records.last().unwrap();
    let cause = poison.poison_cause.as_ref().unwrap();
    assert_eq!(cause.kind, PoisonKind::RedeliveryExhausted);
    assert!(cause.message.contains("handler blew up"));

    assert!(coordinator.outstanding_ids().is_empty());
    assert_eq!(next_id(&coordinator).as_str(), "B");
}

#[test]
fn test_silent_exhaustion_keeps_original_cause() {
    let coordinator = DeliveryCoordinator::new(
        ConsumerId::from("consumer-1"),
        Destination::from("orders"),
        Arc::new(MemorySink::new()),
    )
    .with_policy(
        RedeliveryPolicy::default()
            .with_max_redeliveries(0)
            .with_report_exhaustion(false),
    );
    coordinator.start();
    deliver_all(&coordinator, &["a"]);
    let a = next_id(&coordinator);

    let cause = PoisonCause::new(PoisonKind::Unprocessable, "bad schema");
    assert_eq!(coordinator.fail(&a, cause.clone()).unwrap(), Disposition::Poisoned);

    let records = coordinator.sink().take();
    assert_eq!(records[0].poison_cause, Some(cause));
}

#[test]
fn test_fail_unknown_message_is_reported() {
    let coordinator = coordinator(3);
    let ghost = MessageId::from("ghost");
    assert_eq!(
        coordinator.fail(&ghost, PoisonCause::listener_failure("x")),
        Err(CoordinatorError::Ack(AckError::NotOutstanding(ghost)))
    );
}

#[test]
fn test_unlimited_redeliveries_never_poison() {
    let coordinator = coordinator(RedeliveryPolicy::UNLIMITED);
    deliver_all(&coordinator, &["a"]);

    for _ in 0..20 {
        let a = next_id(&coordinator);
        let disposition = coordinator
            .fail(&a, PoisonCause::listener_failure("again"))
            .unwrap();
        assert!(matches!(disposition, Disposition::Redelivered { .. }));
    }
}

#[test]
fn test_expired_entries_are_acked_as_expired() {
    let coordinator = coordinator(3);
    coordinator.deliver(
        InboundMessage::new("stale", "x").with_expiration(chrono::Utc::now().timestamp_millis() - 5),
        None,
    );
    deliver_all(&coordinator, &["fresh"]);

    let entry = coordinator.receive_no_wait().into_entry().unwrap();
    assert_eq!(entry.message_id.as_str(), "fresh");

    let records = coordinator.sink().take();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, AckKind::Expired);
    assert_eq!(records[0].first_message_id.as_str(), "stale");
    assert_eq!(coordinator.outstanding_ids(), vec![MessageId::from("fresh")]);
}

#[test]
fn test_requeued_entry_is_acked_only_after_it_is_received_again() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["A", "B"]);
    let a = next_id(&coordinator);
    coordinator
        .fail(&a, PoisonCause::listener_failure("try later"))
        .unwrap();

    let not_outstanding = Err(CoordinatorError::Ack(AckError::NotOutstanding(a.clone())));
    assert_eq!(coordinator.acknowledge(std::slice::from_ref(&a)), not_outstanding);
    assert_eq!(coordinator.acknowledge_individual(&a), not_outstanding);
    assert_eq!(
        coordinator.poison(std::slice::from_ref(&a), PoisonCause::listener_failure("x")),
        not_outstanding
    );
    assert!(coordinator.outstanding_ids().is_empty());
    assert_eq!(coordinator.pending_count(), 2);

    assert_eq!(next_id(&coordinator), a);
    coordinator.acknowledge(std::slice::from_ref(&a)).unwrap();
    assert_eq!(next_id(&coordinator).as_str(), "B");
    assert_eq!(coordinator.acknowledge(std::slice::from_ref(&a)), not_outstanding);
    assert!(coordinator.receive_no_wait().into_entry().is_none());

    let standard_for_a = coordinator
        .sink()
        .take()
        .iter()
        .filter(|r| r.kind == AckKind::Standard && r.first_message_id == a)
        .count();
    assert_eq!(standard_for_a, 1);
}

#[test]
fn test_failing_requeued_entry_again_is_rejected() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["A"]);
    let a = next_id(&coordinator);

    coordinator
        .fail(&a, PoisonCause::listener_failure("first"))
        .unwrap();
    assert_eq!(
        coordinator.fail(&a, PoisonCause::listener_failure("second")),
        Err(CoordinatorError::Ack(AckError::NotOutstanding(a.clone())))
    );

    assert_eq!(coordinator.pending_count(), 1);
    assert_eq!(coordinator.redelivery_count(&a), 1);
    assert_eq!(coordinator.sink().len(), 1);

    let entry = coordinator.receive_no_wait().into_entry().unwrap();
    assert_eq!(entry.redelivery_count, 1);
    assert!(coordinator.receive_no_wait().into_entry().is_none());
}

#[test]
fn test_requeued_entry_counts_once_against_prefetch() {
    let coordinator = coordinator(3).with_prefetch_limit(2);
    deliver_all(&coordinator, &["a"]);
    let a = next_id(&coordinator);
    coordinator
        .fail(&a, PoisonCause::listener_failure("again"))
        .unwrap();

    assert_eq!(coordinator.pending_count(), 1);
    assert_eq!(coordinator.outstanding_count(), 1);
    assert!(coordinator.has_prefetch_capacity());

    deliver_all(&coordinator, &["b"]);
    assert!(!coordinator.has_prefetch_capacity());
}

#[test]
fn test_expiry_in_channel_is_acked_outside_transaction() {
    let coordinator = coordinator(3);
    coordinator.deliver(
        InboundMessage::new("X", "x").with_expiration(chrono::Utc::now().timestamp_millis() - 5),
        None,
    );
    coordinator.begin(TransactionId::from("tx-expiry")).unwrap();

    assert_eq!(coordinator.receive_no_wait(), Dequeue::Empty);

    let records = coordinator.sink().take();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, AckKind::Expired);
    assert_eq!(records[0].first_message_id.as_str(), "X");
    assert!(records[0].transaction_id.is_none());

    coordinator.rollback().unwrap();
    assert!(coordinator.outstanding_ids().is_empty());
    assert_eq!(coordinator.outstanding_count(), 0);
    assert_eq!(coordinator.pending_count(), 0);
    assert!(coordinator.sink().is_empty());
}

#[test]
fn test_expire_disposal_ignores_transaction() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["a", "b"]);
    let a = next_id(&coordinator);
    let b = next_id(&coordinator);

    coordinator.begin(TransactionId::from("tx")).unwrap();
    let expired = coordinator.expire(std::slice::from_ref(&a)).unwrap();
    let acked = coordinator.acknowledge(std::slice::from_ref(&b)).unwrap();
    assert!(expired.transaction_id.is_none());
    assert!(acked.transaction_id.is_some());
    assert_eq!(coordinator.sink().take(), vec![expired]);

    coordinator.rollback().unwrap();
    assert_eq!(coordinator.outstanding_ids(), vec![b]);
}

#[test]
fn test_other_disposals() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["a", "b", "c", "d"]);
    let a = next_id(&coordinator);
    let b = next_id(&coordinator);
    let c = next_id(&coordinator);
    let d = next_id(&coordinator);

    let delivered = coordinator.acknowledge_delivered(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(delivered.kind, AckKind::Delivered);
    assert_eq!(coordinator.outstanding_count(), 4);

    coordinator.discard_unmatched(&[a]).unwrap();
    coordinator.expire(&[b]).unwrap();
    let poison = coordinator
        .poison(&[c, d], PoisonCause::listener_failure("corrupt"))
        .unwrap();
    assert_eq!(poison.message_count, 2);
    assert_eq!(coordinator.outstanding_count(), 0);

    let kinds: Vec<AckKind> = coordinator.sink().take().iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AckKind::Delivered,
            AckKind::Unmatched,
            AckKind::Expired,
            AckKind::Poison
        ]
    );
}

#[test]
fn test_transaction_holds_records_until_commit() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["a", "b"]);
    let a = next_id(&coordinator);
    let b = next_id(&coordinator);

    let tx = TransactionId::from("tx-1");
    coordinator.begin(tx.clone()).unwrap();
    let record = coordinator.acknowledge(&[a]).unwrap();
    assert_eq!(record.transaction_id, Some(tx));
    assert!(coordinator.sink().is_empty());
    assert_eq!(coordinator.outstanding_count(), 2);

    let committed = coordinator.commit().unwrap();
    assert_eq!(committed, vec![record]);
    assert_eq!(coordinator.sink().take(), committed);
    assert_eq!(coordinator.outstanding_ids(), vec![b]);
}

#[test]
fn test_rollback_restores_and_emits_nothing() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["a", "b"]);
    let a = next_id(&coordinator);
    let b = next_id(&coordinator);

    coordinator.begin(TransactionId::generate()).unwrap();
    coordinator.acknowledge(&[a.clone(), b.clone()]).unwrap();
    assert!(coordinator.outstanding_ids().is_empty());

    coordinator.rollback().unwrap();
    assert_eq!(coordinator.outstanding_ids(), vec![a, b]);
    assert!(coordinator.sink().is_empty());
    assert_eq!(
        coordinator.commit(),
        Err(CoordinatorError::Ack(AckError::NoTransaction))
    );
}

#[test]
fn test_close_discards_everything() {
    let coordinator = coordinator(3);
    deliver_all(&coordinator, &["a", "b", "c"]);
    let a = next_id(&coordinator);
    coordinator.begin(TransactionId::from("tx")).unwrap();

    coordinator.close();
    coordinator.close();

    assert!(coordinator.is_closed());
    assert_eq!(coordinator.pending_count(), 0);
    assert_eq!(coordinator.outstanding_count(), 0);
    assert_eq!(coordinator.receive(Timeout::Indefinite), Dequeue::Closed);
    assert_eq!(
        coordinator.acknowledge(&[a]),
        Err(CoordinatorError::Closed(ConsumerId::from("consumer-1")))
    );

    deliver_all(&coordinator, &["late"]);
    assert_eq!(coordinator.pending_count(), 0);
}

#[test]
fn test_stop_cancels_blocked_receiver() {
    let coordinator = Arc::new(coordinator(3));

    let receiver = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.receive(Timeout::Indefinite))
    };
    thread::sleep(Duration::from_millis(50));
    coordinator.stop();

    assert_eq!(receiver.join().unwrap(), Dequeue::Cancelled);
    assert!(!coordinator.is_running());
}

#[test]
fn test_prefetch_capacity_counts_pending_and_outstanding() {
    let coordinator = coordinator(3).with_prefetch_limit(2);
    assert!(coordinator.has_prefetch_capacity());

    deliver_all(&coordinator, &["a"]);
    let _a = next_id(&coordinator);
    assert!(coordinator.has_prefetch_capacity());

    deliver_all(&coordinator, &["b"]);
    assert!(!coordinator.has_prefetch_capacity());
    assert_eq!(coordinator.prefetch_limit(), 2);
}

#[test]
fn test_from_settings() {
    let mut settings = Settings::default();
    settings.consumer.id = Some("orders-consumer".to_string());
    settings.consumer.destination = "queue.orders".to_string();
    settings.consumer.prefetch_limit = 5;
    settings.redelivery.max_redeliveries = 2;

    let coordinator = DeliveryCoordinator::from_settings(&settings, MemorySink::new());
    assert_eq!(coordinator.consumer_id().as_str(), "orders-consumer");
    assert_eq!(coordinator.prefetch_limit(), 5);
    assert_eq!(coordinator.policy().max_redeliveries, 2);

    settings.consumer.id = None;
    let generated = DeliveryCoordinator::from_settings(&settings, MemorySink::new());
    assert!(generated.consumer_id().as_str().starts_with("consumer-"));
}

#[test]
fn test_policy_delays() {
    let fixed = RedeliveryPolicy::default();
    assert_eq!(fixed.delay_for(0), Duration::ZERO);
    assert_eq!(fixed.delay_for(1), Duration::from_secs(1));
    assert_eq!(fixed.delay_for(4), Duration::from_secs(1));

    let exponential = RedeliveryPolicy {
        use_exponential_backoff: true,
        backoff_multiplier: 2.0,
        initial_delay: Duration::from_millis(100),
        max_delay: Some(Duration::from_millis(500)),
        ..RedeliveryPolicy::default()
    };
    assert_eq!(exponential.delay_for(1), Duration::from_millis(100));
    assert_eq!(exponential.delay_for(2), Duration::from_millis(200));
    assert_eq!(exponential.delay_for(3), Duration::from_millis(400));
    assert_eq!(exponential.delay_for(4), Duration::from_millis(500));
}

#[test]
fn test_policy_exhaustion() {
    let policy = RedeliveryPolicy::default().with_max_redeliveries(2);
    assert!(!policy.is_exhausted(0));
    assert!(!policy.is_exhausted(1));
    assert!(policy.is_exhausted(2));
    assert!(!RedeliveryPolicy::default()
        .with_max_redeliveries(RedeliveryPolicy::UNLIMITED)
        .is_exhausted(u32::MAX));
}

#[tokio::test]
async fn test_unbounded_sender_sink() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = DeliveryCoordinator::new(
        ConsumerId::from("consumer-1"),
        Destination::from("orders"),
        tx,
    );
    coordinator.start();
    coordinator.deliver(InboundMessage::new("a", "x"), None);
    let a = coordinator.receive_no_wait().into_entry().unwrap().message_id;
    coordinator.acknowledge_individual(&a).unwrap();

    let record = rx.recv().await.unwrap();
    assert_eq!(record.kind, AckKind::Individual);
    assert_eq!(record.last_message_id, a);
}

#[test]
fn test_sink_survives_closed_receiver() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let coordinator = DeliveryCoordinator::new(
        ConsumerId::from("consumer-1"),
        Destination::from("orders"),
        tx,
    );
    coordinator.start();
    coordinator.deliver(InboundMessage::new("a", "x"), None);
    let a = coordinator.receive_no_wait().into_entry().unwrap().message_id;

    // No panic; the record is dropped with a warning.
    assert!(coordinator.acknowledge(&[a]).is_ok());
}

#[test]
fn test_arc_sink_forwards() {
    let sink = Arc::new(MemorySink::new());
    let shared: Arc<dyn AckSink> = sink.clone();
    let coordinator = DeliveryCoordinator::new(
        ConsumerId::from("consumer-1"),
        Destination::from("orders"),
        shared,
    );
    coordinator.start();
    coordinator.deliver(InboundMessage::new("a", "x"), None);
    let a = coordinator.receive_no_wait().into_entry().unwrap().message_id;
    coordinator.acknowledge(&[a]).unwrap();

    assert_eq!(sink.len(), 1);
}
