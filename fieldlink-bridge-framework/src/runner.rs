//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;

use fieldlink_common::{LoggingConfig, connect, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::link::{LinkState, LinkStatus, LinkWatch};
use crate::publisher::Publisher;
use crate::shutdown::Shutdown;

/// Default time each task gets to finish after shutdown is requested.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Bridge runner that manages the lifecycle of a bridge.
///
/// Handles:
/// - Logging initialization
/// - Broker connection (degrading to offline mode when it fails)
/// - Broker connectivity tracking
/// - Task spawning and ordered shutdown
/// - Ctrl+C / SIGTERM handling
///
/// # Example
///
/// ```ignore
/// use fieldlink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new("mybridge", config).await?;
///
///     let shutdown = runner.shutdown();
///     runner.spawn("worker", async move {
///         // Worker logic here, watching shutdown.listener()
///     });
///
///     runner.run().await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Broker session, absent when the broker could not be opened.
    session: Option<Arc<zenoh::Session>>,
    /// Publisher bound to the configured topic.
    publisher: Option<Publisher>,
    /// Broker connectivity sampler.
    link_watch: Option<LinkWatch>,
    /// Broker connectivity as seen by workers.
    link_status: LinkStatus,
    /// Bridge-wide stop flag.
    shutdown: Shutdown,
    /// Spawned tasks, joined in spawn order on shutdown.
    tasks: Vec<(String, JoinHandle<()>)>,
    /// Time each task gets to finish on shutdown.
    grace_period: Duration,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Open the broker session
    /// 3. Create the publisher and start the connectivity watch
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new bridge runner with CLI args for log level override.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        Ok(Self::with_broker(name, config).await)
    }

    /// Create a runner without touching the global tracing subscriber.
    ///
    /// A broker that cannot be opened is logged and the runner continues
    /// with no publisher and a permanently disconnected link status.
    pub async fn with_broker(name: impl Into<String>, config: C) -> Self {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let shutdown = Shutdown::new();

        let session = match connect(config.broker()).await {
            Ok(session) => Some(Arc::new(session)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to open broker session, continuing without broker");
                None
            }
        };

        let (publisher, link_watch, link_status) = match &session {
            Some(session) => {
                let publisher =
                    Publisher::new(session.clone(), config.topic(), config.publish_timeout());
                let (watch, status) = LinkWatch::spawn(
                    session.clone(),
                    config.link_check_interval(),
                    shutdown.listener(),
                );
                (Some(publisher), Some(watch), status)
            }
            None => (None, None, LinkStatus::fixed(LinkState::Disconnected)),
        };

        Self {
            name,
            version,
            config,
            session,
            publisher,
            link_watch,
            link_status,
            shutdown,
            tasks: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Set how long each task may take to finish after shutdown.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a reference to the broker session, if one was opened.
    pub fn session(&self) -> Option<&Arc<zenoh::Session>> {
        self.session.as_ref()
    }

    /// Get a clone of the publisher, if the broker session is open.
    pub fn publisher(&self) -> Option<Publisher> {
        self.publisher.clone()
    }

    /// Broker connectivity.
    pub fn link_status(&self) -> LinkStatus {
        self.link_status.clone()
    }

    /// The bridge-wide stop flag.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Spawn a worker task.
    ///
    /// Tasks are expected to watch the shutdown flag and return on their
    /// own. They are joined in spawn order on shutdown.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push((name.into(), handle));
    }

    /// Run the bridge until Ctrl+C, SIGTERM, or an internal shutdown request.
    ///
    /// This will:
    /// 1. Wait for a stop condition
    /// 2. Set the shutdown flag
    /// 3. Join every task in spawn order, aborting any that overrun the grace period
    /// 4. Stop the connectivity watch
    /// 5. Close the broker session
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            broker = self.session.is_some(),
            "Bridge running. Press Ctrl+C to stop."
        );

        let mut stop = self.shutdown.listener();

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate_signal() => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
            _ = stop.wait() => {
                tracing::info!("Shutdown requested internally");
            }
        }

        self.shutdown.trigger("bridge stopping");

        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(self.grace_period, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(task = %name, "Task stopped"),
                Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    tracing::warn!(task = %name, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(watch) = self.link_watch.take() {
            watch.stop().await;
        }

        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "Error closing broker session");
            }
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BrokerConfig, LoggingConfig};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        broker: BrokerConfig,
        logging: LoggingConfig,
    }

    impl BridgeConfig for TestConfig {
        fn broker(&self) -> &BrokerConfig {
            &self.broker
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn topic(&self) -> &str {
            "fieldlink/test/data"
        }
    }

    fn isolated_peer() -> TestConfig {
        TestConfig {
            broker: BrokerConfig {
                mode: "peer".to_string(),
                connect: Vec::new(),
                listen: Vec::new(),
            },
            logging: LoggingConfig::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_broker_degrades() {
        let config = TestConfig {
            broker: BrokerConfig {
                mode: "satellite".to_string(),
                ..Default::default()
            },
            logging: LoggingConfig::default(),
        };

        let runner = BridgeRunner::with_broker("test", config).await;
        assert!(runner.session().is_none());
        assert!(runner.publisher().is_none());
        assert_eq!(runner.config().broker.mode, "satellite");
        assert_eq!(runner.link_status().state(), LinkState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_internal_shutdown_joins_tasks_in_order() {
        let mut runner = BridgeRunner::with_broker("test", isolated_peer())
            .await
            .with_grace_period(Duration::from_secs(2));
        assert!(runner.publisher().is_some());

        let order = Arc::new(AtomicUsize::new(0));
        for expected in 0..2 {
            let order = order.clone();
            let mut listener = runner.shutdown().listener();
            runner.spawn(format!("worker-{expected}"), async move {
                listener.wait().await;
                let _ = order.fetch_add(1, Ordering::SeqCst);
            });
        }

        let shutdown = runner.shutdown();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.trigger("test done");
        });

        tokio::time::timeout(Duration::from_secs(10), runner.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stuck_task_is_aborted() {
        let mut runner = BridgeRunner::with_broker("test", isolated_peer())
            .await
            .with_grace_period(Duration::from_millis(50));

        runner.spawn("stuck", std::future::pending::<()>());
        runner.spawn("quick", async {});
        runner.shutdown().trigger("test");

        tokio::time::timeout(Duration::from_secs(10), runner.run())
            .await
            .unwrap()
            .unwrap();
    }
}
