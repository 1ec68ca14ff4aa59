//! Error types for the hypervisor API surface.

use thiserror::Error;

/// Errors that can occur while talking to a hypervisor server.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Failed to connect to the server.
    #[error("Failed to connect to server: {0}")]
    ConnectionFailed(String),

    /// The requested object does not exist on the server.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server rejected the request.
    #[error("API error: {0}")]
    Api(String),

    /// An asynchronous server operation completed with an error.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether this error means the object no longer exists.
    ///
    /// Callers branch on this for out-of-band deletions and ephemeral
    /// instances that vanish when stopped.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
