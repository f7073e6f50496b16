//! Error types for the DUET environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Network send/connect failed (socket error, broker unreachable, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The connection was closed by the peer or dropped
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation attempted without a live connection
    #[error("Not connected")]
    NotConnected,

    /// The broker answered with a protocol-level error frame
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Frame serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// True for errors that mean the connection is gone and must be re-established.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_) | Self::ConnectionClosed | Self::NotConnected | Self::ProtocolError(_) | Self::Timeout(_)
        )
    }
}
