//! Error types for the prerendering engine

use thiserror::Error;

use crate::protocol::WireError;

/// Result type alias for prerender operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating or executing prerender work
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to initialize a worker or the pool
    #[error("Worker initialization failed: {0}")]
    InitializationError(String),

    /// Invalid route or build configuration (including malformed
    /// path-generation callback results)
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Rendering a specific page failed
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Coordinator and worker disagree about the message protocol
    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    /// A worker terminated or stopped accepting messages
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A worker did not respond in time
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// An error serialized by a worker and carried back over the protocol
    #[error("Worker error: {0}")]
    Worker(WireError),
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::Worker(err)
    }
}
