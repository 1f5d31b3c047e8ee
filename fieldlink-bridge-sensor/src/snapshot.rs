//! Latest-known-good reading.
//!
//! A single slot, overwritten rather than queued. The sensor worker is the
//! only writer; the dispatch tasks hold [`SnapshotReader`]s.

use std::sync::Arc;
use std::time::Duration;

use fieldlink_common::DataBlock;
use tokio::sync::watch;
use tokio::time::Instant;

/// The accepted block and when it was accepted.
#[derive(Debug, Clone)]
pub struct Snapshot {
    block: Arc<DataBlock>,
    accepted_at: Instant,
}

impl Snapshot {
    pub fn block(&self) -> &DataBlock {
        &self.block
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    /// Time since the block was accepted.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.accepted_at)
    }
}

/// Result of offering a block to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    /// The storage interval had not elapsed since the last accepted block.
    Ignored { since_last: Duration },
}

/// Write side of the snapshot slot.
#[derive(Debug)]
pub struct SnapshotStore {
    tx: watch::Sender<Option<Snapshot>>,
    storage_interval: Duration,
    opened_at: Instant,
}

impl SnapshotStore {
    /// An empty store whose storage window starts at `opened_at`.
    pub fn new(storage_interval: Duration, opened_at: Instant) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            storage_interval,
            opened_at,
        }
    }

    /// A read-only handle.
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }

    /// Offer a completed block.
    ///
    /// Accepted only once the storage interval has passed since the last
    /// acceptance, or since the store was opened if nothing was accepted yet.
    pub fn offer(&self, block: DataBlock, now: Instant) -> OfferOutcome {
        let last = self
            .tx
            .borrow()
            .as_ref()
            .map_or(self.opened_at, |s| s.accepted_at);

        let since_last = now.saturating_duration_since(last);
        if since_last < self.storage_interval {
            tracing::debug!(
                since_last_secs = since_last.as_secs_f64(),
                "Block ignored: storage interval not met"
            );
            return OfferOutcome::Ignored { since_last };
        }

        let entries = block.len();
        self.tx.send_replace(Some(Snapshot {
            block: Arc::new(block),
            accepted_at: now,
        }));
        tracing::info!(entries, "Stored new data block");
        OfferOutcome::Accepted
    }
}

/// Read side of the snapshot slot.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Option<Snapshot>>,
}

impl SnapshotReader {
    /// The current snapshot, if any block has been accepted.
    pub fn latest(&self) -> Option<Snapshot> {
        self.rx.borrow().clone()
    }
}
