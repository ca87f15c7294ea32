//! Error types for the port-relay engine.

use thiserror::Error;

use crate::endpoint::SessionKey;

/// Result type alias for port-relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while managing relays.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during network or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A relay is already registered for this key.
    #[error("{0} forward already running")]
    AlreadyRunning(SessionKey),

    /// No relay is registered for this key.
    #[error("{0} forward not running")]
    NotRunning(SessionKey),

    /// The listening socket could not be bound.
    #[error("failed to listen on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The relay loop had already exited when the stop signal was sent.
    #[error("failed to close {0}: relay loop already exited")]
    CloseFailed(SessionKey),

    /// Listen or target endpoint is malformed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Address resolution failed.
    #[error("failed to resolve address: {0}")]
    AddressResolution(String),

    /// Connecting to the target failed.
    #[error("failed to connect to target {target}: {source}")]
    DialFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection timeout.
    #[error("connection to {0} timed out")]
    Timeout(String),

    /// Request is missing required fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Rule or template lookup failed.
    #[error("{0} not found")]
    NotFound(String),

    /// Rule store could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
