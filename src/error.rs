//! # Error Types
//!
//! Custom error types for the telemetry recorder using `thiserror`.

use thiserror::Error;

/// Main error type for the telemetry recorder
#[derive(Debug, Error)]
pub enum RecorderError {
    /// The byte stream does not start with a ULog file header.
    /// The caller has to discard the stream and restart from a clean source.
    #[error("Not a recognized ULog stream (header magic mismatch)")]
    InvalidHeader,

    /// Not enough bytes buffered yet
    #[error("Truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Malformed record contents
    #[error("ULog format error: {0}")]
    Format(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Session export serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the telemetry recorder
pub type Result<T> = std::result::Result<T, RecorderError>;
