//! Error types for the engine.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid mesh or vertex data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// GPU error
    #[error("GPU error: {0}")]
    Gpu(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
