//! Transport-facing behavior end to end: forwarding, dead-lettering,
//! ordering, untyped dispatch and graceful shutdown.

mod common;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferrobus_core::{
    headers, Bus, BusError, BusMessage, Headers, TypeBasedRouter,
};
use ferrobus_memory::{InMemNetwork, InMemTransport, DEAD_LETTER_QUEUE};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Probe {
    text: String,
}

impl BusMessage for Probe {
    fn message_type() -> &'static str {
        "Probe"
    }
}

fn single_handler_bus(
    network: &Arc<InMemNetwork>,
    queue: &str,
    handler: impl Fn(ferrobus_core::MessageContext, Probe) -> futures::future::BoxFuture<'static, ferrobus_core::Result<()>>
        + Send
        + Sync
        + 'static,
) -> Bus {
    Bus::builder()
        .with_transport(Arc::new(InMemTransport::new(network.clone(), queue)))
        .with_router(Arc::new(TypeBasedRouter::new().map("Probe", queue)))
        .handle::<Probe, _, _>(handler)
        .with_config(common::serial_config())
        .build()
        .unwrap()
}

#[tokio::test]
async fn forward_moves_the_message_with_injected_headers() {
    common::init_tracing();
    let network = InMemNetwork::new();
    let bus = single_handler_bus(&network, "forwarding", |ctx, _probe| {
        Box::pin(async move {
            let mut extra = Headers::new();
            extra.insert("testheader".to_string(), "OK".to_string());
            ctx.forward("errors", extra).await
        })
    });
    bus.start().await.unwrap();

    bus.send(&Probe { text: "x".into() }).await.unwrap();

    assert!(
        common::wait_until(Duration::from_secs(3), || network.queue_len("errors") == 1).await
    );
    let forwarded = network.peek_all("errors").remove(0);
    assert_eq!(forwarded.header("testheader"), Some("OK"));

    // Original body travels untouched.
    let body: serde_json::Value = serde_json::from_slice(&forwarded.body).unwrap();
    assert_eq!(body, serde_json::json!({"text": "x"}));

    // And the message is gone from the source queue.
    assert_eq!(network.queue_len("forwarding"), 0);

    bus.stop().await;
}

#[tokio::test]
async fn failing_handler_drives_the_message_to_dead_letter() {
    common::init_tracing();
    let network = InMemNetwork::with_max_deliveries(3);
    let attempts = Arc::new(Mutex::new(0u32));

    let counted = attempts.clone();
    let bus = single_handler_bus(&network, "failing", move |_ctx, _probe| {
        let counted = counted.clone();
        Box::pin(async move {
            *counted.lock() += 1;
            Err(BusError::handler("handler always fails"))
        })
    });
    bus.start().await.unwrap();

    bus.send(&Probe { text: "doomed".into() }).await.unwrap();

    assert!(
        common::wait_until(Duration::from_secs(5), || {
            network.queue_len(DEAD_LETTER_QUEUE) == 1
        })
        .await,
        "message never reached the dead-letter queue"
    );

    // One delivery attempt per allowed delivery.
    assert_eq!(*attempts.lock(), 3);

    let dead = network.peek_all(DEAD_LETTER_QUEUE).remove(0);
    let details = dead.header(headers::ERROR_DETAILS).unwrap();
    assert!(details.contains("handler always fails"), "details: {details}");
    assert!(dead.header(headers::MESSAGE_ID).is_some());

    assert_eq!(network.queue_len("failing"), 0);
    bus.stop().await;
}

#[tokio::test]
async fn sends_from_a_failing_handler_are_never_delivered() {
    common::init_tracing();
    let network = InMemNetwork::with_max_deliveries(2);
    let bus = single_handler_bus(&network, "flaky", |ctx, _probe| {
        Box::pin(async move {
            ctx.send_to("side-effects", &Probe { text: "leak".into() })
                .await?;
            Err(BusError::handler("failed after sending"))
        })
    });
    bus.start().await.unwrap();

    bus.send(&Probe { text: "x".into() }).await.unwrap();

    assert!(
        common::wait_until(Duration::from_secs(5), || {
            network.queue_len(DEAD_LETTER_QUEUE) == 1
        })
        .await
    );
    // The handler sent on every attempt and failed on every attempt:
    // nothing may have left the endpoint.
    assert_eq!(network.queue_len("side-effects"), 0);

    bus.stop().await;
}

#[tokio::test]
async fn poison_message_is_dead_lettered_immediately() {
    common::init_tracing();
    let network = InMemNetwork::new();
    let bus = single_handler_bus(&network, "poisoned", |_ctx, _probe| {
        Box::pin(async move { Ok(()) })
    });
    bus.start().await.unwrap();

    // An unknown content type can never deserialize; it goes straight to
    // the dead-letter queue instead of burning redeliveries.
    let mut wire_headers = Headers::new();
    wire_headers.insert(
        headers::CONTENT_TYPE.to_string(),
        "application/x-protobuf".to_string(),
    );
    network
        .deliver(
            "poisoned",
            ferrobus_core::TransportMessage::new(wire_headers, b"\x00\x01".to_vec()),
        )
        .unwrap();

    assert!(
        common::wait_until(Duration::from_secs(3), || {
            network.queue_len(DEAD_LETTER_QUEUE) == 1
        })
        .await
    );
    let dead = network.peek_all(DEAD_LETTER_QUEUE).remove(0);
    assert!(dead
        .header(headers::ERROR_DETAILS)
        .unwrap()
        .contains("content type"));

    bus.stop().await;
}

#[tokio::test]
async fn single_worker_single_parallelism_preserves_send_order() {
    common::init_tracing();
    let network = InMemNetwork::new();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let recorded = seen.clone();
    let bus = single_handler_bus(&network, "ordered", move |_ctx, probe| {
        let recorded = recorded.clone();
        Box::pin(async move {
            recorded.lock().push(probe.text);
            Ok(())
        })
    });
    bus.start().await.unwrap();

    let sent: Vec<String> = (0..10).map(|n| format!("message-{n}")).collect();
    for text in &sent {
        bus.send(&Probe { text: text.clone() }).await.unwrap();
    }

    assert!(common::wait_until(Duration::from_secs(5), || seen.lock().len() == 10).await);
    assert_eq!(*seen.lock(), sent);

    bus.stop().await;
}

#[tokio::test]
async fn untagged_message_is_dispatched_to_fallback_handlers() {
    common::init_tracing();
    let network = InMemNetwork::new();
    let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));

    let recorded = seen.clone();
    let bus = Bus::builder()
        .with_transport(Arc::new(InMemTransport::new(network.clone(), "dynamic")))
        .with_router(Arc::new(TypeBasedRouter::new().with_fallback("dynamic")))
        .handle_untyped(move |_ctx, logical| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().push(logical.body.clone());
                Ok(())
            }
        })
        .with_config(common::serial_config())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    // No rbs2-msg-type header: the body is delivered dynamically.
    let mut wire_headers = Headers::new();
    wire_headers.insert(
        headers::CONTENT_TYPE.to_string(),
        "application/json;charset=utf-8".to_string(),
    );
    wire_headers.insert(headers::MESSAGE_ID.to_string(), "untyped-1".to_string());
    network
        .deliver(
            "dynamic",
            ferrobus_core::TransportMessage::new(wire_headers, br#"{"anything":42}"#.to_vec()),
        )
        .unwrap();

    assert!(common::wait_until(Duration::from_secs(3), || !seen.lock().is_empty()).await);
    assert_eq!(seen.lock()[0], serde_json::json!({"anything": 42}));

    bus.stop().await;
}

#[tokio::test]
async fn graceful_shutdown_finishes_the_in_flight_message() {
    common::init_tracing();
    let network = InMemNetwork::new();
    let started = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicBool::new(false));

    let started_flag = started.clone();
    let completed_flag = completed.clone();
    let bus = single_handler_bus(&network, "draining", move |_ctx, _probe| {
        let started_flag = started_flag.clone();
        let completed_flag = completed_flag.clone();
        Box::pin(async move {
            started_flag.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            completed_flag.store(true, Ordering::SeqCst);
            Ok(())
        })
    });
    bus.start().await.unwrap();

    bus.send(&Probe { text: "slow".into() }).await.unwrap();
    assert!(
        common::wait_until(Duration::from_secs(2), || started.load(Ordering::SeqCst)).await
    );

    // Stop while the handler is mid-flight: it must run to completion and
    // the message must be acked, not redelivered.
    bus.stop().await;

    assert!(completed.load(Ordering::SeqCst));
    assert_eq!(network.queue_len("draining"), 0);
}
