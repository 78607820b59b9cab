//! Error types for mesh authentication

use thiserror::Error;

use crate::types::AuthType;

/// Result type alias for mesh authentication
pub type Result<T> = std::result::Result<T, Error>;

/// Mesh authentication errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No handler is registered for the auth type required by policy
    #[error("No auth handler registered for auth type {0}")]
    HandlerNotFound(AuthType),

    /// More than one handler was registered for the same auth type
    #[error("Multiple auth handlers registered for auth type {0}")]
    DuplicateHandler(AuthType),

    /// Policy repository lookup failed
    #[error("Policy error: {0}")]
    Policy(String),

    /// Authentication was attempted and did not succeed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Certificate could not be obtained or parsed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// An external handshake did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Shared auth table read or write failed
    #[error("Auth map error: {0}")]
    AuthMap(String),

    /// Signal registration or decoding failed
    #[error("Signal error: {0}")]
    Signal(String),
}

/// Coarse error taxonomy used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Wiring or registration problems; fatal at startup.
    Configuration,
    /// Handshake or policy failures; retried on the next signal.
    Authentication,
    /// Shared table I/O; fatal during restore, retried otherwise.
    Storage,
}

impl ErrorCategory {
    /// Label value for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Authentication => "authentication",
            Self::Storage => "storage",
        }
    }
}

impl Error {
    /// Map this error onto the coarse taxonomy.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::HandlerNotFound(_)
            | Self::DuplicateHandler(_)
            | Self::Signal(_) => ErrorCategory::Configuration,
            Self::AuthMap(_) => ErrorCategory::Storage,
            Self::Policy(_)
            | Self::Authentication(_)
            | Self::Certificate(_)
            | Self::Timeout(_) => ErrorCategory::Authentication,
        }
    }
}
