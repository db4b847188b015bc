//! Error types for the Whale encoder.

use thiserror::Error;

/// Main error type for encoder operations.
#[derive(Error, Debug)]
pub enum WhaleError {
    /// Configuration validation errors, raised eagerly at construction.
    #[error("Config error: {0}")]
    Config(String),

    /// Malformed inputs detected at call time (wrong rank, missing tensors).
    #[error("Invalid input: {0}")]
    Input(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for encoder operations.
pub type WhaleResult<T> = Result<T, WhaleError>;
