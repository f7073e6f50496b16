//! Error types for the result-sync core.

use duet_env::EnvError;
use thiserror::Error;

/// Errors surfaced by the result-sync pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be read or is inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// Transport-level failure (wrapped environment error)
    #[error("Transport error: {0}")]
    Transport(#[from] EnvError),

    /// Payload is missing expected keys or has the wrong shape
    #[error("Malformed payload: {reason}")]
    MalformedPayload {
        /// Human-readable reason
        reason: String,
        /// The offending payload, serialized for diagnosis
        payload: String,
    },

    /// Layer registry or tile source rejected an operation
    #[error("Layer error: {0}")]
    Layer(String),

    /// The subscription could not be re-established within the retry budget
    #[error("Reconnect gave up after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        /// Number of failed attempts
        attempts: u32,
        /// Last transport error seen
        last_error: String,
    },
}

impl CoreError {
    /// Creates a malformed-payload error.
    pub fn malformed(reason: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
            payload: payload.into(),
        }
    }

    /// Creates a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a layer error.
    pub fn layer(msg: impl Into<String>) -> Self {
        Self::Layer(msg.into())
    }
}

/// Convenience alias used across the crate.
pub type CoreResult<T> = Result<T, CoreError>;
