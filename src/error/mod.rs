//! Error types for the routing toolkit

use thiserror::Error;

/// Boxed error returned by caller-supplied callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for toolkit operations
pub type Result<T> = std::result::Result<T, ToolkitError>;

/// Toolkit errors
///
/// Structural "not found" outcomes (no route, no healthy target, unknown
/// borrower) are not errors; they surface as `None` or as no-ops.
#[derive(Debug, Error)]
pub enum ToolkitError {
    /// Argument outside its valid domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A cache creation callback failed
    #[error("Entry creation failed: {0}")]
    CreationFailed(#[source] BoxError),

    /// Malformed URL router pattern
    #[error("Invalid URL pattern: {0}")]
    InvalidPattern(String),

    /// Timed out waiting for quota
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed configuration document
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ToolkitError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a creation failure from any callback error
    pub fn creation_failed<E: Into<BoxError>>(err: E) -> Self {
        Self::CreationFailed(err.into())
    }

    /// Create an invalid pattern error
    pub fn invalid_pattern<S: Into<String>>(msg: S) -> Self {
        Self::InvalidPattern(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}

impl From<serde_json::Error> for ToolkitError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
