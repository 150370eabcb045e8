use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mqdispatch::coordinator::MemorySink;
use mqdispatch::dispatch::{ConsumerId, Destination};
use mqdispatch::{
    AckKind, DeliveryCoordinator, Dequeue, Disposition, InboundMessage, PoisonCause,
    RedeliveryPolicy, Timeout,
};

fn coordinator(sink: Arc<MemorySink>) -> Arc<DeliveryCoordinator<Arc<MemorySink>>> {
    let coordinator = DeliveryCoordinator::new(
        ConsumerId::from("it-consumer"),
        Destination::from("it.queue"),
        sink,
    )
    .with_policy(RedeliveryPolicy::default().with_max_redeliveries(3));
    coordinator.start();
    Arc::new(coordinator)
}

#[test]
fn concurrent_producers_keep_per_producer_order() {
    const PER_PRODUCER: usize = 200;
    let sink = Arc::new(MemorySink::new());
    let coordinator = coordinator(sink.clone());

    let producers: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|name| {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                for n in 0..PER_PRODUCER {
                    coordinator.deliver(InboundMessage::new(format!("{name}-{n}"), "x"), None);
                }
            })
        })
        .collect();

    let consumer = {
        let coordinator = coordinator.clone();
        thread::spawn(move || {
            let mut seen: HashMap<String, Vec<usize>> = HashMap::new();
            for _ in 0..PER_PRODUCER * 2 {
                let entry = coordinator
                    .receive(Timeout::After(Duration::from_secs(5)))
                    .into_entry()
                    .expect("entry before timeout");
                let (name, n) = entry
                    .message_id
                    .as_str()
                    .split_once('-')
                    .expect("name-n id");
                seen.entry(name.to_string())
                    .or_default()
                    .push(n.parse().expect("numeric suffix"));
                coordinator
                    .acknowledge(&[entry.message_id])
                    .expect("ack of received entry");
            }
            seen
        })
    };

    for producer in producers {
        producer.join().unwrap();
    }
    let seen = consumer.join().unwrap();

    for name in ["left", "right"] {
        let expected: Vec<usize> = (0..PER_PRODUCER).collect();
        assert_eq!(seen[name], expected, "{name} stream out of order");
    }
    assert_eq!(coordinator.outstanding_count(), 0);
    assert_eq!(sink.len(), PER_PRODUCER * 2);
}

#[test]
fn failed_message_is_redelivered_ahead_of_newer_ones_then_poisoned() {
    let sink = Arc::new(MemorySink::new());
    let coordinator = coordinator(sink.clone());

    let receive_path = {
        let coordinator = coordinator.clone();
        thread::spawn(move || {
            for id in ["A", "B", "C"] {
                coordinator.deliver(InboundMessage::new(id, "x"), None);
            }
        })
    };
    receive_path.join().unwrap();

    let mut order = Vec::new();
    loop {
        let entry = match coordinator.receive(Timeout::from_millis(100)) {
            Dequeue::Delivered(entry) => entry,
            _ => break,
        };
        order.push(entry.message_id.to_string());
        if entry.message_id.as_str() == "A" {
            let disposition = coordinator
                .fail(&entry.message_id, PoisonCause::listener_failure("nope"))
                .unwrap();
            if entry.redelivery_count < 3 {
                assert!(matches!(disposition, Disposition::Redelivered { .. }));
            } else {
                assert_eq!(disposition, Disposition::Poisoned);
            }
        } else {
            coordinator.acknowledge(&[entry.message_id]).unwrap();
        }
    }

    assert_eq!(order, vec!["A", "A", "A", "A", "B", "C"]);

    let kinds: Vec<AckKind> = sink.take().iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AckKind::Redelivered,
            AckKind::Redelivered,
            AckKind::Redelivered,
            AckKind::Poison,
            AckKind::Standard,
            AckKind::Standard,
        ]
    );
    assert_eq!(coordinator.outstanding_count(), 0);
}

#[test]
fn close_releases_a_blocked_receiver() {
    let coordinator = coordinator(Arc::new(MemorySink::new()));

    let receiver = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.receive(Timeout::Indefinite))
    };
    thread::sleep(Duration::from_millis(50));
    coordinator.close();

    assert_eq!(receiver.join().unwrap(), Dequeue::Closed);
}
