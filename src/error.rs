//! Error types for the Burstguard rate limiter.

use thiserror::Error;

/// Main error type for Burstguard operations.
#[derive(Error, Debug)]
pub enum BurstguardError {
    /// The API key of a request was empty
    #[error("Invalid input: api key must not be empty")]
    EmptyApiKey,

    /// The route of a request was empty
    #[error("Invalid input: route must not be empty")]
    EmptyRoute,

    /// The request timestamp was before the epoch
    #[error("Invalid input: epoch seconds must be non-negative, got {0}")]
    NegativeEpoch(i64),

    /// Threshold values that cannot be enforced
    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BurstguardError {
    /// Whether this error is a rejected request rather than an operational failure.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            BurstguardError::EmptyApiKey
                | BurstguardError::EmptyRoute
                | BurstguardError::NegativeEpoch(_)
        )
    }
}

/// Result type alias for Burstguard operations.
pub type Result<T> = std::result::Result<T, BurstguardError>;
