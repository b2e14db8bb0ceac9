use thiserror::Error;

/// Result type alias for remote-write operations
pub type Result<T, E = RemoteWriteError> = std::result::Result<T, E>;

/// Errors that abort an inbound request or the service itself.
///
/// Per-destination failures never surface here; they only reach logs and metrics.
#[derive(Error, Debug)]
pub enum RemoteWriteError {
    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] crate::config::ValidationError),

    #[error("Failed to build outbound transport: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
