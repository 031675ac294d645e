//! Error types for the brick paging subsystem

use thiserror::Error;

use crate::brick::BrickKey;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction parameters (brick sizes, ghost width, pool capacity).
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported element type: {0}")]
    UnsupportedType(String),

    #[error("Invalid brick key {0}")]
    InvalidBrickKey(BrickKey),

    #[error("Payload size mismatch: expected {expected} bytes, got {actual}")]
    PayloadSize { expected: usize, actual: usize },

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Streaming error: {0}")]
    Streaming(String),
}

impl Error {
    /// Shorthand for configuration failures.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Whether this error came from reading source data.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}
