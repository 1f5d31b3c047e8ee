//! Cooperative stop flag shared by all bridge tasks.

use std::sync::Arc;

use tokio::sync::watch;

/// Handle that can request a bridge-wide shutdown.
///
/// Cloned freely; every clone flips the same flag. Triggering is idempotent.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create a new, untriggered stop flag.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Only the first call is logged.
    pub fn trigger(&self, reason: &str) {
        let was_set = self.tx.send_replace(true);
        if !was_set {
            tracing::info!(reason = %reason, "Shutdown requested");
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A listener that tasks can await.
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the stop flag.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested.
    ///
    /// Cancel-safe, so it can sit in a `select!` arm. Returns immediately if
    /// the flag is already set or every [`Shutdown`] handle is gone.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}
