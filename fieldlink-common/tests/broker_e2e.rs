//! End-to-end tests through a local broker session.
//!
//! Note: Zenoh requires multi-thread tokio runtime.
//! Each test uses a unique topic to avoid interference.

use std::time::Duration;

use chrono::Local;
use fieldlink_common::{BrokerConfig, DataBlock, Entry, Error, connect};

/// Generate a unique test topic to avoid test interference.
fn unique_topic() -> String {
    let nanos = Local::now().timestamp_nanos_opt().unwrap_or_default();
    format!("test_{}/environmental_station/data", nanos)
}

fn peer_config() -> BrokerConfig {
    BrokerConfig {
        mode: "peer".to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_payload_round_trip_through_session() {
    let topic = unique_topic();
    let session = connect(&peer_config())
        .await
        .expect("Failed to open broker session");

    let subscriber = session
        .declare_subscriber(&topic)
        .await
        .expect("Failed to create subscriber");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let now = Local::now();
    let block = DataBlock::new(
        vec![
            Entry::bridge_timestamp(now),
            Entry::new("TEMP", "21.5 C"),
            Entry::new("HUMIDITY", "48 %"),
        ],
        now,
    );
    let payload = serde_json::to_vec(&block.field_map()).expect("Failed to encode");

    session
        .put(&topic, payload)
        .await
        .expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(5), subscriber.recv_async())
        .await
        .expect("Timeout waiting for message")
        .expect("Failed to receive message");

    let bytes = received.payload().to_bytes();
    let decoded: serde_json::Value = serde_json::from_slice(&bytes).expect("Failed to decode");

    assert_eq!(decoded["temp"], serde_json::json!(21.5));
    assert_eq!(decoded["humidity"], serde_json::json!(48));
    assert!(decoded["rpi_timestamp"].is_string());

    drop(subscriber);
    session.close().await.expect("Failed to close session");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_rejects_unknown_mode() {
    let config = BrokerConfig {
        mode: "mesh".to_string(),
        ..Default::default()
    };

    let result = connect(&config).await;
    assert!(matches!(result, Err(Error::Config(_))));
}
