//! Error types shared across the weft crates.

use std::io;
use thiserror::Error;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum WeftError {
    /// IO error while loading external resources
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or out-of-bounds frame
    #[error("Invalid frame: {0}")]
    Frame(String),

    /// Message pool exhausted
    #[error("Message pool exhausted")]
    PoolExhausted,

    /// Hosts directory failure
    #[error("Hosts error: {0}")]
    Hosts(String),

    /// Identifier outside the permitted range
    #[error("Invalid identifier: {0}")]
    InvalidId(u64),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, WeftError>;

impl WeftError {
    /// Create an invalid frame error with a message
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    /// Create a hosts directory error
    pub fn hosts(msg: impl Into<String>) -> Self {
        Self::Hosts(msg.into())
    }
}
