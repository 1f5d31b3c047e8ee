//! FieldLink Bridge Framework
//!
//! Common abstractions for building bridges that forward field telemetry to
//! the broker.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`Publisher`] for bounded JSON publishing to the broker
//! - [`LinkWatch`] / [`LinkStatus`] for broker connectivity
//! - [`Shutdown`] for the cooperative stop flag
//! - [`BridgeArgs`] for common CLI argument parsing
//!
//! # Example
//!
//! ```ignore
//! use fieldlink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
//!
//!     // Spawn workers
//!     runner.spawn("worker", my_worker(runner.publisher(), runner.shutdown().listener()));
//!
//!     // Run until Ctrl+C
//!     runner.run().await?;
//!     Ok(())
//! }
//! ```

mod args;
mod config;
mod error;
mod link;
mod publisher;
mod runner;
mod shutdown;

pub use args::{BridgeArgs, PortOverride};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use link::{LinkState, LinkStatus, LinkWatch};
pub use publisher::{PublishStats, Publisher};
pub use runner::{BridgeRunner, DEFAULT_GRACE_PERIOD};
pub use shutdown::{Shutdown, ShutdownListener};

// Re-export commonly used types from fieldlink-common
pub use fieldlink_common::{BrokerConfig, DataBlock, Entry, FieldValue, LogFormat, LoggingConfig};
