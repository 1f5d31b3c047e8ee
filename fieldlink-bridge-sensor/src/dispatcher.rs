//! Timed delivery of the current snapshot to a sink.
//!
//! Each sink gets its own task and its own timer, so a slow or failing sink
//! never delays the other one. A tick always sends whatever snapshot is
//! current, even if it was already sent on a previous tick.

use std::future::Future;
use std::time::Duration;

use fieldlink_bridge_framework::ShutdownListener;
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;

use crate::journal::Journal;
use crate::snapshot::{Snapshot, SnapshotReader};

/// Errors reported by a sink for a whole dispatch.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink's link is not available; nothing was attempted.
    #[error("{0} unavailable")]
    Unavailable(String),

    /// The snapshot produced nothing to send.
    #[error("nothing to send: {0}")]
    Empty(String),

    /// Every item failed.
    #[error("all {failed} item(s) failed")]
    AllFailed { failed: usize },

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Which sink a timer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Mesh,
    Broker,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Mesh => "mesh",
            SinkKind::Broker => "broker",
        }
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-dispatch item counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// A destination for snapshots.
pub trait Sink: Send {
    fn kind(&self) -> SinkKind;

    /// Deliver one snapshot. Per-item failures are handled inside the sink.
    fn dispatch(
        &mut self,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<DispatchReport, SinkError>> + Send;

    /// Release the sink's link.
    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Fixed-interval timer for one sink.
#[derive(Debug, Clone)]
pub struct DispatchTimer {
    kind: SinkKind,
    interval: Duration,
    next_fire: Instant,
}

impl DispatchTimer {
    /// First expiry is one full interval after `start`.
    pub fn new(kind: SinkKind, interval: Duration, start: Instant) -> Self {
        Self {
            kind,
            interval,
            next_fire: start + interval,
        }
    }

    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_fire(&self) -> Instant {
        self.next_fire
    }

    /// Re-arm one interval after the expiry that just happened.
    pub fn rearm(&mut self, fired_at: Instant) {
        self.next_fire = fired_at + self.interval;
    }
}

/// Counters kept by a dispatch loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub ticks: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Drive a sink from its timer until shutdown.
///
/// A dispatch in progress when shutdown arrives is abandoned. The sink is
/// closed before returning.
pub async fn run_sink_loop<S: Sink>(
    sink: S,
    timer: DispatchTimer,
    reader: SnapshotReader,
    journal: Journal,
    shutdown: ShutdownListener,
) -> SinkStats {
    let (mut sink, stats) = drive(sink, timer, reader, journal, shutdown).await;
    sink.close().await;
    log_stopped(sink.kind(), &stats);
    stats
}

/// Like [`run_sink_loop`], but the sink is only closed once `predecessor`
/// is released.
///
/// Link sessions close in a fixed order (sensor, mesh, broker). The task
/// owning the previous link holds the [`Shutdown`](fieldlink_bridge_framework::Shutdown)
/// behind `predecessor` and triggers or drops it once that link is closed,
/// so a task aborted by the runner still releases its successor.
pub async fn run_sink_loop_after<S: Sink>(
    sink: S,
    timer: DispatchTimer,
    reader: SnapshotReader,
    journal: Journal,
    shutdown: ShutdownListener,
    mut predecessor: ShutdownListener,
) -> SinkStats {
    let (mut sink, stats) = drive(sink, timer, reader, journal, shutdown).await;
    tracing::debug!(sink = %sink.kind(), "Waiting for previous link to close");
    predecessor.wait().await;
    sink.close().await;
    log_stopped(sink.kind(), &stats);
    stats
}

fn log_stopped(kind: SinkKind, stats: &SinkStats) {
    tracing::info!(sink = %kind, ticks = stats.ticks, sent = stats.sent, failed = stats.failed, skipped = stats.skipped, "Dispatch loop stopped");
}

async fn drive<S: Sink>(
    mut sink: S,
    mut timer: DispatchTimer,
    reader: SnapshotReader,
    journal: Journal,
    mut shutdown: ShutdownListener,
) -> (S, SinkStats) {
    let kind = timer.kind();
    let mut stats = SinkStats::default();

    tracing::info!(sink = %kind, interval_secs = timer.interval().as_secs(), "Dispatch loop started");

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep_until(timer.next_fire()) => {}
        }

        let fired_at = Instant::now();
        timer.rearm(fired_at);
        stats.ticks += 1;

        let Some(snapshot) = reader.latest() else {
            stats.skipped += 1;
            tracing::info!(sink = %kind, "Timed send skipped: no data");
            journal.record(&format!("{kind}_timed_send_skipped_no_data"), json!({}));
            continue;
        };

        let age = snapshot.age(fired_at);
        tracing::debug!(sink = %kind, entries = snapshot.block().len(), age_secs = age.as_secs(), "Timed send triggered");
        journal.record(
            &format!("{kind}_timed_send_triggered"),
            json!({
                "data_block_size": snapshot.block().len(),
                "snapshot_age_secs": age.as_secs_f64(),
            }),
        );

        let result = tokio::select! {
            _ = shutdown.wait() => {
                tracing::info!(sink = %kind, "Dispatch abandoned for shutdown");
                break;
            }
            result = sink.dispatch(&snapshot) => result,
        };

        match result {
            Ok(report) => {
                stats.sent += 1;
                tracing::info!(sink = %kind, sent = report.sent, failed = report.failed, "Snapshot dispatched");
            }
            Err(SinkError::Unavailable(reason)) => {
                stats.skipped += 1;
                tracing::warn!(sink = %kind, reason = %reason, "Timed send skipped");
            }
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(sink = %kind, error = %e, "Timed send failed");
                journal.record(
                    &format!("{kind}_timed_send_failed"),
                    json!({ "error": e.to_string() }),
                );
            }
        }
    }

    (sink, stats)
}
