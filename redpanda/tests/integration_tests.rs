//! Integration tests for [`RedpandaBus`] against a real Kafka instance.
//!
//! These tests use testcontainers to spin up a real Kafka instance and validate:
//! - Publish/subscribe round-trip of the full envelope
//! - Nack rewinds and redelivers with a higher attempt
//! - Messages sharing a partition key keep their order
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p reliable-events-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chrono::Utc;
use futures::StreamExt;
use reliable_events_core::bus::{DeliveryStream, MessageBus};
use reliable_events_core::message::{BusMessage, MessageHeaders, MessageId};
use reliable_events_redpanda::RedpandaBus;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

fn message(event_type: &str, partition_key: &str, body: Vec<u8>) -> BusMessage {
    BusMessage::new(
        MessageId::random(),
        event_type,
        body,
        MessageHeaders::new(partition_key, Utc::now()).with_correlation_id("corr-1"),
    )
}

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(bus) = RedpandaBus::new(brokers) {
            if bus
                .publish("warmup-topic", &message("warmup", "warmup", vec![1]))
                .await
                .is_ok()
            {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

/// Publishes a warmup message so the topic is auto-created before subscribing.
async fn ensure_topic_exists(bus: &RedpandaBus, topic: &str) {
    for attempt in 1..=30 {
        if bus
            .publish(topic, &message("warmup", "warmup", vec![255]))
            .await
            .is_ok()
        {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(attempt != 30, "Failed to create topic {topic}");
    }
}

/// Next non-warmup delivery; warmups are acked and skipped.
async fn next_real(stream: &mut DeliveryStream) -> reliable_events_core::bus::Delivery {
    loop {
        let delivery = stream
            .next()
            .await
            .expect("stream ended")
            .expect("Failed to receive delivery");
        if delivery.message().event_type == "warmup" {
            delivery.ack().await.expect("ack warmup");
            continue;
        }
        return delivery;
    }
}

fn bus(brokers: &str, group: &str) -> RedpandaBus {
    RedpandaBus::builder()
        .brokers(brokers)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .redelivery_delay(Duration::from_millis(100))
        .build()
        .expect("Failed to create bus")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn publish_and_subscribe_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "round-trip");
    ensure_topic_exists(&bus, "bookings.booking").await;

    let mut stream = bus
        .subscribe(&["bookings.booking"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let sent = message("BookingCreated", "booking-1", vec![1, 2, 3]);
    bus.publish("bookings.booking", &sent)
        .await
        .expect("Failed to publish");

    let delivery = tokio::time::timeout(Duration::from_secs(10), next_real(&mut stream))
        .await
        .expect("Timeout waiting for delivery");

    assert_eq!(delivery.topic(), "bookings.booking");
    assert_eq!(delivery.attempt(), 1);
    assert_eq!(delivery.message(), &sent);
    delivery.ack().await.expect("ack");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn nack_redelivers_with_next_attempt() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "redelivery");
    ensure_topic_exists(&bus, "bookings.redelivery").await;

    let mut stream = bus
        .subscribe(&["bookings.redelivery"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let sent = message("BookingCreated", "booking-7", vec![7]);
    bus.publish("bookings.redelivery", &sent)
        .await
        .expect("Failed to publish");

    let first = tokio::time::timeout(Duration::from_secs(10), next_real(&mut stream))
        .await
        .expect("Timeout waiting for first delivery");
    assert_eq!(first.attempt(), 1);
    first.nack().await.expect("nack");

    let second = tokio::time::timeout(Duration::from_secs(10), next_real(&mut stream))
        .await
        .expect("Timeout waiting for redelivery");
    assert_eq!(second.attempt(), 2);
    assert_eq!(second.message().message_id, sent.message_id);
    second.ack().await.expect("ack");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn same_partition_key_keeps_order() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "ordering");
    ensure_topic_exists(&bus, "bookings.ordering").await;

    let mut stream = bus
        .subscribe(&["bookings.ordering"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let sent: Vec<BusMessage> = (0..10u8)
        .map(|i| message("BookingUpdated", "booking-42", vec![i]))
        .collect();
    for msg in &sent {
        bus.publish("bookings.ordering", msg)
            .await
            .expect("Failed to publish");
    }

    let mut bodies = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), async {
        while bodies.len() < sent.len() {
            let delivery = next_real(&mut stream).await;
            bodies.push(delivery.message().body.clone());
            delivery.ack().await.expect("ack");
        }
    })
    .await
    .expect("Timeout waiting for deliveries");

    let expected: Vec<Vec<u8>> = sent.iter().map(|m| m.body.clone()).collect();
    assert_eq!(bodies, expected);
}
