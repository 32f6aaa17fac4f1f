//! These tests need a NATS server; set `NATS_URL` and run with `--ignored`.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::time::timeout;
use vigil_envelope::{ANY_TYPE, Envelope};
use vigil_messaging::{EventBus, Subscription, Topic};
use vigil_messaging_nats::{NatsBus, NatsBusOptions};

async fn bus(prefix: &str) -> NatsBus {
    let url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());
    let client = async_nats::connect(url).await.unwrap();

    NatsBus::new(NatsBusOptions {
        client,
        subject_prefix: prefix.to_string(),
    })
}

#[tokio::test]
#[ignore = "requires a NATS server"]
async fn test_publish_before_subscribe_is_not_delivered() {
    let _ = tracing_subscriber::fmt::try_init();

    let bus = bus("vigil-test-late").await;
    let topic = Topic::new("test_topic").unwrap();

    bus.publish(&topic, Envelope::new(ANY_TYPE, Bytes::from_static(b"{}")))
        .await
        .unwrap();

    let mut subscription = bus.subscribe(&topic).await.unwrap();
    assert!(
        timeout(Duration::from_millis(200), subscription.next())
            .await
            .is_err()
    );

    let late = Envelope::new(ANY_TYPE, Bytes::from_static(b"late"));
    bus.publish(&topic, late.clone()).await.unwrap();

    let received = timeout(Duration::from_secs(2), subscription.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, late);

    subscription.cancel();
}

#[tokio::test]
#[ignore = "requires a NATS server"]
async fn test_undecodable_messages_are_skipped() {
    let _ = tracing_subscriber::fmt::try_init();

    let bus = bus("vigil-test-skip").await;
    let topic = Topic::new("events").unwrap();
    let mut subscription = bus.subscribe(&topic).await.unwrap();

    let raw = async_nats::connect(
        std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string()),
    )
    .await
    .unwrap();
    raw.publish(bus.subject(&topic), Bytes::from_static(&[0x0a, 0x7f]))
        .await
        .unwrap();
    raw.flush().await.unwrap();

    let good = Envelope::new(ANY_TYPE, Bytes::from_static(b"ok"));
    bus.publish(&topic, good.clone()).await.unwrap();

    let received = timeout(Duration::from_secs(2), subscription.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, good);
}

#[tokio::test]
#[ignore = "requires a NATS server"]
async fn test_cancel_handle_ends_parked_stream() {
    let _ = tracing_subscriber::fmt::try_init();

    let bus = bus("vigil-test-cancel").await;
    let topic = Topic::new("events").unwrap();
    let mut subscription = bus.subscribe(&topic).await.unwrap();
    let handle = subscription.cancel_handle();

    let consumer = tokio::spawn(async move { subscription.next().await });
    handle.cancel();

    let next = timeout(Duration::from_secs(2), consumer)
        .await
        .unwrap()
        .unwrap();
    assert!(next.is_none());
}
