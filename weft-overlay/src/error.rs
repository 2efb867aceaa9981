//! Error types for the overlay hub.

use std::io;
use thiserror::Error;
use weft_core::error::WeftError;

/// Main error type for hub operations
#[derive(Error, Debug)]
pub enum HubError {
    /// Core building-block failure
    #[error(transparent)]
    Core(#[from] WeftError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key material or signature failure
    #[error("Security error: {0}")]
    Security(String),

    /// SRP handshake failure
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Worker channel torn down
    #[error("Worker channel closed")]
    WorkerClosed,

    /// Stabilization exchange timed out
    #[error("Stabilization timeout")]
    StabilizationTimeout,
}

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a security error with a message
    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }
}
