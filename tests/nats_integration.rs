//! NATS ingestion integration tests
//!
//! These tests require a running NATS server:
//!   nats-server
//!
//! Tests are skipped automatically if NATS is not available.

use a3s_relay::config::BusConfig;
use a3s_relay::{BufferConfig, Ingestor, MemoryMessageStore, NatsIngest, Payload, PersistentBuffer};
use std::sync::Arc;
use std::time::Duration;

const NATS_URL: &str = "nats://127.0.0.1:4222";

/// Unique subject prefix so parallel runs do not see each other's events
fn prefix() -> String {
    format!("relay-test.{}", uuid::Uuid::new_v4().simple())
}

fn buffer() -> Arc<PersistentBuffer> {
    Arc::new(
        PersistentBuffer::new(BufferConfig::default(), Arc::new(MemoryMessageStore::default()))
            .unwrap(),
    )
}

/// Try to connect a publishing client. Returns None if server is unavailable.
async fn try_publisher() -> Option<async_nats::Client> {
    match async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(2))
        .connect(NATS_URL)
        .await
    {
        Ok(client) => Some(client),
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            None
        }
    }
}

macro_rules! publisher {
    () => {
        match try_publisher().await {
            Some(client) => client,
            None => return,
        }
    };
}

async fn wait_for_len(buffer: &PersistentBuffer, expected: usize) {
    for _ in 0..50 {
        if buffer.len().await >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_wildcard_subscriptions_buffer_events() {
    let publisher = publisher!();
    let prefix = prefix();
    let buffer = buffer();

    let config = BusConfig {
        url: NATS_URL.to_string(),
        subjects: vec![format!("{}.tele.>", prefix), format!("{}.stat.*.POWER", prefix)],
        ..Default::default()
    };
    let ingest = NatsIngest::start(&config, Ingestor::new(buffer.clone()))
        .await
        .unwrap();

    publisher
        .publish(format!("{}.tele.kitchen.SENSOR", prefix), r#"{"Temperature": 21.0}"#.into())
        .await
        .unwrap();
    publisher
        .publish(format!("{}.stat.kitchen.POWER", prefix), "ON".into())
        .await
        .unwrap();
    publisher
        .publish(format!("{}.other.ignored", prefix), "{}".into())
        .await
        .unwrap();
    publisher.flush().await.unwrap();

    wait_for_len(&buffer, 2).await;
    let total = ingest.shutdown().await;
    assert_eq!(total, 2);

    let mut messages = buffer.messages().await;
    messages.sort_by(|a, b| a.topic.cmp(&b.topic));
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].topic, format!("{}.stat.kitchen.POWER", prefix));
    assert_eq!(messages[0].payload, Payload::Raw(b"ON".to_vec()));
    assert_eq!(messages[1].topic, format!("{}.tele.kitchen.SENSOR", prefix));
    assert_eq!(
        messages[1].payload.get("Temperature"),
        Some(&serde_json::json!(21.0))
    );
}

#[tokio::test]
async fn test_shutdown_stops_ingestion() {
    let publisher = publisher!();
    let prefix = prefix();
    let buffer = buffer();

    let config = BusConfig {
        url: NATS_URL.to_string(),
        subjects: vec![format!("{}.>", prefix)],
        ..Default::default()
    };
    let ingest = NatsIngest::start(&config, Ingestor::new(buffer.clone()))
        .await
        .unwrap();
    ingest.shutdown().await;

    publisher
        .publish(format!("{}.late", prefix), "{}".into())
        .await
        .unwrap();
    publisher.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(buffer.is_empty().await);
}
