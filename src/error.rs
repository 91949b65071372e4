//! Error types for the floodgate crate.

use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// A limit type was requested that has no entry in the limit table.
    ///
    /// This is a programming or deployment error, not a user-triggerable
    /// condition, and should be treated as fatal at startup rather than
    /// swallowed per request.
    #[error("unknown limit type: {0}")]
    UnknownLimitType(String),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backend errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by window storage backends.
///
/// The in-process store is infallible in practice; these variants exist for
/// backends that reach a shared store over the network. The limiter never
/// catches them: the caller must make an explicit fail-open or fail-closed
/// decision.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend did not respond within the configured deadline.
    #[error("backend timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
