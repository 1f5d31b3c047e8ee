//! JSON publisher for the broker session.

use std::sync::Arc;
use std::time::Duration;

use zenoh::qos::CongestionControl;

use crate::error::{BridgeError, Result};

/// Publisher for sending readings to the broker.
///
/// Wraps a Zenoh session and publishes JSON payloads to a fixed topic. Every
/// put is bounded by `timeout` so a stalled transport cannot hold up the
/// caller.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    topic: String,
    timeout: Duration,
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(session: Arc<zenoh::Session>, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            session,
            topic: topic.into(),
            timeout,
        }
    }

    /// Get the default topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the publish timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publish a JSON value to the default topic.
    pub async fn publish_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(&self.topic, payload).await
    }

    /// Publish raw bytes to a topic.
    ///
    /// Uses blocking congestion control so the put is delivered to the
    /// transport rather than dropped, bounded by the publish timeout.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let put = async {
            self.session
                .put(topic, payload)
                .congestion_control(CongestionControl::Block)
                .await
        };

        match tokio::time::timeout(self.timeout, put).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(BridgeError::Publish {
                topic: topic.to_string(),
                message: format!("timed out after {:?}", self.timeout),
            }),
        }
    }
}

/// Running counters for publish attempts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    /// Number of successful publishes.
    pub success: usize,
    /// Number of failed publishes.
    pub failed: usize,
    /// Number of publishes skipped (e.g. broker disconnected).
    pub skipped: usize,
}

impl PublishStats {
    /// Total number of attempted publishes, excluding skips.
    pub fn total(&self) -> usize {
        self.success + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            100.0
        } else {
            (self.success as f64 / self.total() as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_stats() {
        let mut stats = PublishStats::default();
        assert_eq!(stats.total(), 0);
        assert_eq!(stats.success_rate(), 100.0);

        stats.success = 8;
        stats.failed = 2;
        stats.skipped = 5;
        assert_eq!(stats.total(), 10);
        assert_eq!(stats.success_rate(), 80.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publish_json_peer_session() {
        let mut config = zenoh::Config::default();
        config.insert_json5("mode", r#""peer""#).unwrap();
        config
            .insert_json5("scouting/multicast/enabled", "false")
            .unwrap();
        let session = Arc::new(zenoh::open(config).await.unwrap());

        let publisher = Publisher::new(session.clone(), "fieldlink/test/data", Duration::from_secs(2));
        assert_eq!(publisher.topic(), "fieldlink/test/data");
        assert_eq!(publisher.timeout(), Duration::from_secs(2));

        let value = serde_json::json!({ "temp": 21.5 });
        publisher.publish_json(&value).await.unwrap();
        publisher
            .publish_raw("fieldlink/test/other", b"raw".to_vec())
            .await
            .unwrap();

        session.close().await.unwrap();
    }
}
