use thiserror::Error;

/// Common error type for FieldLink components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Broker session error: {0}")]
    Broker(#[from] zenoh::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using FieldLink's Error.
pub type Result<T> = std::result::Result<T, Error>;
