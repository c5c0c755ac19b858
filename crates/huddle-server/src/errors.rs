//! Server error types.

use huddle_store::StoreError;
use thiserror::Error;

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or serving failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The group store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
