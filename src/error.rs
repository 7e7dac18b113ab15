//! Error taxonomy shared by the adapter, the controller and the HTTP layer.

use thiserror::Error;

/// A remote host string that was rejected before any request was made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("remote host is empty")]
    Empty,

    #[error("unsupported scheme in {0:?}: expected tcp://, http:// or https://")]
    UnsupportedScheme(String),

    #[error("invalid remote host {0:?}")]
    Malformed(String),
}

/// Failures talking to a container engine.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("container engine at {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("request to container engine at {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("container engine returned {status}: {message}")]
    Engine { status: u16, message: String },

    #[error("malformed response from container engine: {0}")]
    Malformed(String),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl AdapterError {
    /// True when the engine could not be reached at all, as opposed to
    /// answering with an error or an empty fleet.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }
}

/// Failures of a reload or of any call routed through the controller.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("a reload is already in progress")]
    InProgress,

    /// The active remote session lost its engine and must be reconnected.
    #[error("remote host {0} is disconnected; reconnect to resume")]
    Disconnected(String),
}
