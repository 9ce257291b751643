//! Error types for the signaling and presence channels

/// Result type alias using the signaling Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on a hub channel
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation attempted while the channel is not Connected
    #[error("Not connected")]
    NotConnected,

    /// RPC round-trip failed at the transport level
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Initial or reconnection attempt failed
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The endpoint rejected the access token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Presence subscribe/unsubscribe RPC failed
    #[error("Subscription to {contact_id} failed: {message}")]
    SubscriptionFailed {
        /// Contact the subscription was for
        contact_id: String,
        /// Underlying failure
        message: String,
    },

    /// The server completed an invocation with an error
    #[error("{method} failed: {message}")]
    Rpc {
        /// Hub method name
        method: String,
        /// Server supplied error message
        message: String,
    },

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Malformed or unexpected hub message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if a connect attempt that failed with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ConnectFailed(_)
                | Error::Timeout(_)
                | Error::WebSocketError(_)
                | Error::Protocol(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error should stop the reconnection loop outright
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Unauthorized(_) | Error::InvalidConfig(_))
    }

    /// Check if this is the fail-fast "not connected" rejection
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Error::NotConnected)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
