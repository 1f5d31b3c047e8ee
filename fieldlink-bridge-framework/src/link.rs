//! Broker connectivity tracking.
//!
//! The broker session does its own networking and reconnection in the
//! background. [`LinkWatch`] samples that session on an interval and
//! publishes the result through a `watch` channel, so the rest of the
//! bridge only ever sees a read-only [`LinkStatus`].
//!
//! # Example
//!
//! ```ignore
//! let (watch, status) = LinkWatch::spawn(session.clone(), Duration::from_secs(5), shutdown.listener());
//!
//! if status.is_connected() {
//!     publisher.publish_json(&payload).await?;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use zenoh::Session;

use crate::shutdown::ShutdownListener;

/// Connectivity of a link as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not yet sampled.
    Connecting,
    /// At least one router or peer is reachable.
    Connected,
    /// The session has no remote endpoint.
    Disconnected,
}

impl LinkState {
    /// Lower-case name used in logs and journal entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a link's connectivity.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    rx: watch::Receiver<LinkState>,
}

impl LinkStatus {
    /// Create a status fed by the returned sender.
    pub fn channel(initial: LinkState) -> (watch::Sender<LinkState>, Self) {
        let (tx, rx) = watch::channel(initial);
        (tx, Self { rx })
    }

    /// A status that never changes. Used when no session could be opened.
    pub fn fixed(state: LinkState) -> Self {
        let (_tx, status) = Self::channel(state);
        status
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        *self.rx.borrow()
    }

    /// Current state, marking it as seen.
    ///
    /// A following [`changed`](Self::changed) only wakes for states
    /// published after this call, so a caller that records the current
    /// state and then follows changes never sees the same state twice.
    pub fn current(&mut self) -> LinkState {
        *self.rx.borrow_and_update()
    }

    /// Whether the link is currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Wait for the next state change.
    ///
    /// Returns `None` once the writer is gone and no further change can
    /// arrive.
    pub async fn changed(&mut self) -> Option<LinkState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

/// Background task that samples broker connectivity.
#[derive(Debug)]
pub struct LinkWatch {
    handle: JoinHandle<()>,
}

impl LinkWatch {
    /// Watch a broker session.
    pub fn spawn(
        session: Arc<Session>,
        interval: Duration,
        shutdown: ShutdownListener,
    ) -> (Self, LinkStatus) {
        Self::spawn_check(
            move || {
                let session = session.clone();
                async move { session_has_remote(&session).await }
            },
            interval,
            shutdown,
        )
    }

    /// Watch an arbitrary connectivity check.
    ///
    /// The check runs once immediately and then every `interval`; only
    /// changes are published and logged.
    pub fn spawn_check<F, Fut>(
        mut check: F,
        interval: Duration,
        mut shutdown: ShutdownListener,
    ) -> (Self, LinkStatus)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (tx, status) = LinkStatus::channel(LinkState::Connecting);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {}
                }

                let state = if check().await {
                    LinkState::Connected
                } else {
                    LinkState::Disconnected
                };

                let changed = tx.send_if_modified(|current| {
                    if *current != state {
                        *current = state;
                        true
                    } else {
                        false
                    }
                });

                if changed {
                    match state {
                        LinkState::Connected => tracing::info!("Broker link connected"),
                        _ => tracing::warn!(state = %state, "Broker link lost"),
                    }
                }
            }

            tracing::debug!("Link watch stopped");
        });

        (Self { handle }, status)
    }

    /// Stop sampling.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn session_has_remote(session: &Session) -> bool {
    let info = session.info();
    if info.routers_zid().await.next().is_some() {
        return true;
    }
    info.peers_zid().await.next().is_some()
}
