//! Error types for the Clickguard service.

use thiserror::Error;

/// Main error type for Clickguard operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No caller identity could be derived from the request
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// The window store could not be reached or answered with an error
    #[error("Window store unavailable: {0}")]
    StoreUnavailable(String),

    /// A janitor sweep could not complete
    #[error("Sweep failure: {0}")]
    SweepFailure(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GuardError {
    fn from(e: config::ConfigError) -> Self {
        GuardError::Config(e.to_string())
    }
}

/// Result type alias for Clickguard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
