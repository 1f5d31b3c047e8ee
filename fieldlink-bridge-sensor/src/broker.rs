//! Broker sink.
//!
//! A snapshot is published as one flat JSON object on the configured topic:
//!
//! ```json
//! {"rpi_timestamp":"2025-03-14T09:26:53.123456+01:00","temp":21.5,"humidity":48}
//! ```

use std::future::Future;

use fieldlink_bridge_framework::{BridgeError, LinkStatus, PublishStats, Publisher};
use serde_json::json;

use crate::dispatcher::{DispatchReport, Sink, SinkError, SinkKind};
use crate::journal::Journal;
use crate::snapshot::Snapshot;

/// Anything that can publish a JSON document to a fixed topic.
pub trait JsonPublisher: Send + Sync {
    fn topic(&self) -> &str;

    fn publish(
        &self,
        payload: &serde_json::Value,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send;
}

impl JsonPublisher for Publisher {
    fn topic(&self) -> &str {
        Publisher::topic(self)
    }

    async fn publish(&self, payload: &serde_json::Value) -> Result<(), BridgeError> {
        self.publish_json(payload).await
    }
}

/// Publishes snapshots to the broker while the link is up.
#[derive(Debug)]
pub struct BrokerSink<P> {
    publisher: Option<P>,
    status: LinkStatus,
    journal: Journal,
    stats: PublishStats,
}

impl<P: JsonPublisher> BrokerSink<P> {
    /// `publisher` is `None` when no broker session could be opened.
    pub fn new(publisher: Option<P>, status: LinkStatus, journal: Journal) -> Self {
        Self {
            publisher,
            status,
            journal,
            stats: PublishStats::default(),
        }
    }

    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    fn skip(&mut self, reason: &str) -> SinkError {
        self.stats.skipped += 1;
        self.journal
            .record("broker_publish_skipped", json!({ "reason": reason }));
        SinkError::Unavailable(format!("broker ({reason})"))
    }
}

impl<P: JsonPublisher> Sink for BrokerSink<P> {
    fn kind(&self) -> SinkKind {
        SinkKind::Broker
    }

    async fn dispatch(&mut self, snapshot: &Snapshot) -> Result<DispatchReport, SinkError> {
        if self.publisher.is_none() {
            return Err(self.skip("no broker session"));
        }
        let state = self.status.state();
        if !self.status.is_connected() {
            return Err(self.skip(state.as_str()));
        }

        let fields = snapshot.block().field_map();
        if fields.is_empty() {
            return Err(SinkError::Empty("block has no fields".to_string()));
        }
        let payload = serde_json::Value::Object(fields);

        let Some(publisher) = self.publisher.as_ref() else {
            return Err(self.skip("no broker session"));
        };
        let topic = publisher.topic().to_string();

        match publisher.publish(&payload).await {
            Ok(()) => {
                self.stats.success += 1;
                tracing::debug!(topic = %topic, "Published to broker");
                self.journal.record(
                    "broker_publish_success",
                    json!({ "topic": topic, "payload": payload }),
                );
                Ok(DispatchReport { sent: 1, failed: 0 })
            }
            Err(e) => {
                self.stats.failed += 1;
                self.journal.record(
                    "broker_publish_failed",
                    json!({ "topic": topic, "error": e.to_string() }),
                );
                Err(SinkError::Transport(e.to_string()))
            }
        }
    }

    async fn close(&mut self) {
        tracing::info!(
            success = self.stats.success,
            failed = self.stats.failed,
            skipped = self.stats.skipped,
            success_rate = format!("{:.1}%", self.stats.success_rate()),
            "Broker sink closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotStore;
    use chrono::Local;
    use fieldlink_bridge_framework::LinkState;
    use fieldlink_common::{DataBlock, Entry};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Clone, Default)]
    struct MemoryPublisher {
        published: Arc<Mutex<Vec<serde_json::Value>>>,
        fail: bool,
    }

    impl JsonPublisher for MemoryPublisher {
        fn topic(&self) -> &str {
            "wio/environmental_station/data"
        }

        async fn publish(&self, payload: &serde_json::Value) -> Result<(), BridgeError> {
            if self.fail {
                return Err(BridgeError::Publish {
                    topic: self.topic().to_string(),
                    message: "timed out".to_string(),
                });
            }
            self.published.lock().push(payload.clone());
            Ok(())
        }
    }

    fn snapshot() -> Snapshot {
        let store = SnapshotStore::new(Duration::ZERO, Instant::now());
        store.offer(
            DataBlock::new(
                vec![
                    Entry::new("TEMP", "21.5 C"),
                    Entry::new("HUMIDITY", "48 %"),
                    Entry::new("STATUS", "OK ready"),
                ],
                Local::now(),
            ),
            Instant::now(),
        );
        store.reader().latest().unwrap()
    }

    #[tokio::test]
    async fn test_publishes_field_map() {
        let publisher = MemoryPublisher::default();
        let mut sink = BrokerSink::new(
            Some(publisher.clone()),
            LinkStatus::fixed(LinkState::Connected),
            Journal::disabled(),
        );

        let report = sink.dispatch(&snapshot()).await.unwrap();
        assert_eq!(report.sent, 1);

        let published = publisher.published.lock();
        assert_eq!(
            published[0],
            serde_json::json!({ "temp": 21.5, "humidity": 48, "status": "OK ready" })
        );
        assert_eq!(sink.stats().success, 1);
    }

    #[tokio::test]
    async fn test_skips_while_disconnected() {
        let publisher = MemoryPublisher::default();
        let (tx, status) = LinkStatus::channel(LinkState::Disconnected);
        let mut sink = BrokerSink::new(Some(publisher.clone()), status, Journal::disabled());

        assert!(matches!(
            sink.dispatch(&snapshot()).await,
            Err(SinkError::Unavailable(_))
        ));
        assert!(publisher.published.lock().is_empty());

        tx.send_replace(LinkState::Connected);
        assert!(sink.dispatch(&snapshot()).await.is_ok());
        assert_eq!(sink.stats().skipped, 1);
        assert_eq!(sink.stats().success, 1);
    }

    #[tokio::test]
    async fn test_without_session_and_failures() {
        let mut none: BrokerSink<MemoryPublisher> = BrokerSink::new(
            None,
            LinkStatus::fixed(LinkState::Disconnected),
            Journal::disabled(),
        );
        assert!(matches!(
            none.dispatch(&snapshot()).await,
            Err(SinkError::Unavailable(_))
        ));

        let mut failing = BrokerSink::new(
            Some(MemoryPublisher {
                fail: true,
                ..Default::default()
            }),
            LinkStatus::fixed(LinkState::Connected),
            Journal::disabled(),
        );
        assert!(matches!(
            failing.dispatch(&snapshot()).await,
            Err(SinkError::Transport(_))
        ));
        assert_eq!(failing.stats().failed, 1);
    }
}
