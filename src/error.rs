//! Error types for the Turnstile scheduler.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A queued caller was rejected because its channel was reset
    /// before a slot could be granted.
    #[error("Admission interrupted: channel '{channel}' was reset while waiting")]
    Interrupted {
        /// Name of the channel that was reset
        channel: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
