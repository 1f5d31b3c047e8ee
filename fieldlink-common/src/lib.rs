//! FieldLink Common Library
//!
//! Shared types and utilities for FieldLink telemetry bridges:
//!
//! - [`block`] - Sensor data model (`DataBlock`, `Entry`, `FieldValue`) and wire markers
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`session`] - Broker session management
//! - [`error`] - Error types

pub mod block;
pub mod config;
pub mod error;
pub mod session;

// Re-export commonly used types at the crate root
pub use block::{
    BRIDGE_TIMESTAMP_KEY, DEVICE_TIMESTAMP_KEY, DataBlock, END_MARKER, Entry, FieldValue,
    START_MARKER,
};
pub use config::{BrokerConfig, LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use session::connect;

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
