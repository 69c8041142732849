//! Cross-project routing over the durable transport: authorization,
//! contracts, signing, and quotas end to end.

use fabric_bus::{handler_fn, Broker, BrokerConfig, InMemoryBroker};
use fabric_cross_project::{
    CrossProjectError, CrossProjectRouter, HandlerOptions, SendOptions,
};
use fabric_telemetry::metrics as tm;
use fabric_transport::{DurableBroker, InMemoryEventLog, TransportConfig};
use fabric_types::{
    CrossProjectEventContract, Message, ProjectConfig, ProjectCredentials, RateLimitPolicy,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

fn project(id: &str) -> ProjectConfig {
    let mut config = ProjectConfig::new(id, id.to_uppercase(), id);
    config.credentials = Some(ProjectCredentials {
        api_key: format!("{id}-key"),
        secret: format!("{id}-secret"),
    });
    config
}

fn contract(source: &str, target: &str, event_type: &str) -> CrossProjectEventContract {
    CrossProjectEventContract {
        name: format!("{source}-to-{target}"),
        version: "1.0".to_string(),
        source_project: source.to_string(),
        target_projects: vec![target.to_string()],
        event_types: vec![event_type.to_string()],
        schema: json!({"type": "object"}),
        metadata: Default::default(),
    }
}

fn wired_router(broker: Arc<dyn Broker>) -> CrossProjectRouter {
    let router = CrossProjectRouter::new(broker);
    let mut alpha = project("alpha");
    alpha.allowed_targets.insert("beta".to_string());
    alpha.allowed_event_types.insert("task.created".to_string());
    alpha.rate_limiting = Some(RateLimitPolicy {
        events_per_second: 2,
        burst_limit: 5,
    });
    router.register_project(alpha).unwrap();
    router.register_project(project("beta")).unwrap();
    router
        .register_contract(contract("alpha", "beta", "task.created"))
        .unwrap();
    router
}

#[tokio::test]
async fn test_cross_project_over_durable_transport() {
    let broker: Arc<dyn Broker> = Arc::new(DurableBroker::new(
        Arc::new(InMemoryEventLog::new()),
        TransportConfig {
            batch_timeout: Duration::from_millis(2),
            poll_interval: Duration::from_millis(10),
            ..TransportConfig::default()
        },
    ));
    let router = wired_router(broker);

    let (tx, mut rx) = mpsc::unbounded_channel();
    router
        .setup_message_handler(
            "beta",
            "task.created",
            handler_fn(move |m: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m);
                    Ok(())
                }
            }),
            HandlerOptions::default(),
        )
        .await
        .unwrap();

    let correlation = Uuid::new_v4();
    router
        .send_message(
            "alpha",
            "beta",
            "task.created",
            json!({"task": {"id": 42}}),
            SendOptions {
                correlation_id: Some(correlation),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("cross-project delivery")
        .unwrap();
    assert_eq!(received.payload, json!({"task": {"id": 42}}));
    assert_eq!(received.metadata.correlation_id, Some(correlation));
    assert_eq!(received.channel, "beta.task.created");
}

#[tokio::test]
async fn test_authorization_pipeline_order() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
    let router = CrossProjectRouter::new(broker);

    // Unregistered source first.
    let result = router
        .send_message("alpha", "beta", "task.created", json!({}), SendOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(CrossProjectError::ProjectNotRegistered { .. })
    ));

    // Registered, but target not allowed.
    let mut alpha = project("alpha");
    alpha.allowed_event_types.insert("task.created".to_string());
    router.register_project(alpha).unwrap();
    router.register_project(project("beta")).unwrap();
    let result = router
        .send_message("alpha", "beta", "task.created", json!({}), SendOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(CrossProjectError::CommunicationNotAllowed { .. })
    ));

    // Target allowed, event type not.
    let mut alpha = project("alpha");
    alpha.allowed_targets.insert("beta".to_string());
    router.register_project(alpha).unwrap();
    let result = router
        .send_message("alpha", "beta", "task.created", json!({}), SendOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(CrossProjectError::EventTypeNotAuthorized { .. })
    ));

    // Policy passes, but no contract covers the triple.
    let mut alpha = project("alpha");
    alpha.allowed_targets.insert("beta".to_string());
    alpha.allowed_event_types.insert("task.created".to_string());
    router.register_project(alpha).unwrap();
    let result = router
        .send_message("alpha", "beta", "task.created", json!({}), SendOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(CrossProjectError::ContractNotCovered { .. })
    ));
}

#[tokio::test]
async fn test_burst_rate_limiting_is_exact() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
    let router = wired_router(broker);

    // Burst limit is 5: five sends pass, the sixth fails, nothing is
    // partially published.
    for n in 0..5 {
        router
            .send_message(
                "alpha",
                "beta",
                "task.created",
                json!({"n": n}),
                SendOptions::default(),
            )
            .await
            .unwrap_or_else(|e| panic!("send {n} should pass: {e}"));
    }
    let result = router
        .send_message("alpha", "beta", "task.created", json!({}), SendOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(CrossProjectError::RateLimitExceeded { .. })
    ));

    let stats = router.get_stats();
    assert_eq!(stats.messages_sent, 5);
    assert_eq!(stats.rate_limit_hits, 1);
}

#[tokio::test]
async fn test_tampered_envelope_never_reaches_handler() {
    // A second router instance with a different secret for alpha models a
    // spoofed sender: signatures cannot verify on the receiving side.
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(BrokerConfig::default()));

    let sender = CrossProjectRouter::new(Arc::clone(&broker));
    let mut alpha = project("alpha");
    alpha.credentials = Some(ProjectCredentials {
        api_key: "alpha-key".to_string(),
        secret: "attacker-secret".to_string(),
    });
    alpha.allowed_targets.insert("beta".to_string());
    alpha.allowed_event_types.insert("task.created".to_string());
    sender.register_project(alpha).unwrap();
    sender.register_project(project("beta")).unwrap();
    sender
        .register_contract(contract("alpha", "beta", "task.created"))
        .unwrap();

    let receiver = wired_router(broker);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    receiver
        .setup_message_handler(
            "beta",
            "task.created",
            handler_fn(move |m: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m);
                    Ok(())
                }
            }),
            HandlerOptions::default(),
        )
        .await
        .unwrap();

    sender
        .send_message("alpha", "beta", "task.created", json!({}), SendOptions::default())
        .await
        .unwrap();

    let result = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(
        result.is_err(),
        "handler must not run for an unverifiable signature"
    );
}

#[tokio::test]
async fn test_metrics_exposition_includes_fabric_counters() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
    let router = wired_router(broker);
    router
        .send_message("alpha", "beta", "task.created", json!({}), SendOptions::default())
        .await
        .unwrap();

    // Registration may have happened in another test already; either way
    // the exposition must carry the fabric_ counters.
    let _ = tm::register_metrics();
    let text = tm::export().unwrap();
    assert!(text.contains("fabric_cross_project_messages_sent_total"));
}
