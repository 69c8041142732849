//! Publish/subscribe semantics: fan-out, filters, groups, ordering.

use super::message;
use fabric_bus::{handler_fn, Broker, BrokerConfig, InMemoryBroker, SubscriptionSpec};
use fabric_types::{Channel, ChannelType, Message};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn broker_with(channel: &str) -> InMemoryBroker {
    let broker = InMemoryBroker::new(BrokerConfig::default());
    broker
        .channels()
        .create(Channel::new(channel, ChannelType::Topic))
        .unwrap();
    broker
}

fn counting_handler(counter: &Arc<AtomicUsize>) -> Arc<dyn fabric_bus::MessageHandler> {
    let counter = Arc::clone(counter);
    handler_fn(move |_m: Message| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_fan_out_to_independent_subscriptions() {
    let broker = broker_with("tasks.created");

    let count_a = Arc::new(AtomicUsize::new(0));
    let count_b = Arc::new(AtomicUsize::new(0));
    for counter in [&count_a, &count_b] {
        broker
            .subscribe(
                SubscriptionSpec::new("tasks.#").unwrap(),
                counting_handler(counter),
            )
            .await
            .unwrap();
    }

    broker
        .publish("tasks.created", message("tasks.created", json!({})))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(count_a.load(Ordering::SeqCst), 1);
    assert_eq!(count_b.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_filter_gates_by_payload_value() {
    // Spec scenario: a "low" priority message must not reach a
    // subscription filtering on "high", and must arrive once it is high.
    let broker = broker_with("tasks.created");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |m: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(m.payload["priority"].clone());
            Ok(())
        }
    });
    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created")
                .unwrap()
                .with_filter_entry("priority", json!("high")),
            handler,
        )
        .await
        .unwrap();

    broker
        .publish(
            "tasks.created",
            message("tasks.created", json!({"priority": "low"})),
        )
        .await
        .unwrap();
    broker
        .publish(
            "tasks.created",
            message("tasks.created", json!({"priority": "high"})),
        )
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, json!("high"));
    assert!(rx.try_recv().is_err(), "low priority must be skipped");
}

#[tokio::test]
async fn test_group_is_competing_consumers() {
    let broker = broker_with("tasks.created");

    let grouped_a = Arc::new(AtomicUsize::new(0));
    let grouped_b = Arc::new(AtomicUsize::new(0));
    let independent = Arc::new(AtomicUsize::new(0));

    for counter in [&grouped_a, &grouped_b] {
        broker
            .subscribe(
                SubscriptionSpec::new("tasks.created")
                    .unwrap()
                    .with_group("workers"),
                counting_handler(counter),
            )
            .await
            .unwrap();
    }
    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created").unwrap(),
            counting_handler(&independent),
        )
        .await
        .unwrap();

    for _ in 0..8 {
        broker
            .publish("tasks.created", message("tasks.created", json!({})))
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(200)).await;

    // The group shares one copy per message; the independent subscription
    // gets its own copy of all of them.
    assert_eq!(
        grouped_a.load(Ordering::SeqCst) + grouped_b.load(Ordering::SeqCst),
        8
    );
    assert_eq!(independent.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_fifo_per_channel_subscription() {
    let broker = broker_with("tasks.created");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |m: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(m.payload["n"].as_u64().unwrap());
            Ok(())
        }
    });
    broker
        .subscribe(SubscriptionSpec::new("tasks.created").unwrap(), handler)
        .await
        .unwrap();

    for n in 0..50u64 {
        broker
            .publish("tasks.created", message("tasks.created", json!({"n": n})))
            .await
            .unwrap();
    }

    for expected in 0..50u64 {
        let n = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, expected, "delivery order must match publish order");
    }
}

#[tokio::test]
async fn test_broadcast_shutdown_scenario() {
    // Spec scenario: create agents.broadcast.shutdown, subscribe with
    // agents.broadcast.*, publish a Shutdown message, handler fires once.
    let broker = InMemoryBroker::new(BrokerConfig::default());
    broker
        .channels()
        .create(Channel::new("agents.broadcast.shutdown", ChannelType::Broadcast))
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |m: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(m);
            Ok(())
        }
    });
    broker
        .subscribe(SubscriptionSpec::new("agents.broadcast.*").unwrap(), handler)
        .await
        .unwrap();

    let mut shutdown = message("agents.broadcast.shutdown", json!({}));
    shutdown.message_type = "Shutdown".to_string();
    broker
        .publish("agents.broadcast.shutdown", shutdown)
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.message_type, "Shutdown");
    assert!(rx.try_recv().is_err(), "exactly one invocation");
}

#[tokio::test]
async fn test_bus_events_observe_lifecycle() {
    let broker = broker_with("tasks.created");
    let mut events = broker.events();

    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created").unwrap(),
            handler_fn(|_m| async { Ok(()) }),
        )
        .await
        .unwrap();
    broker
        .publish("tasks.created", message("tasks.created", json!({})))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        if let Ok(Ok(event)) = timeout(Duration::from_secs(1), events.recv()).await {
            kinds.push(event.kind().to_string());
        }
    }
    assert!(kinds.contains(&"subscription_created".to_string()));
    assert!(kinds.contains(&"message_published".to_string()));
    assert!(kinds.contains(&"message_acknowledged".to_string()));
}
