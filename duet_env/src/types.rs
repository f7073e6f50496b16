//! Common types for the DUET environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier this viewing client presents to the broker.
///
/// Rendered as `interaction-client-<10 chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    /// Creates a new random client id.
    pub fn new() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("interaction-client-{}", &suffix[..10]))
    }

    /// Creates a deterministic client id from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        Self(format!("interaction-client-{:010x}", seed & 0xff_ffff_ffff))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message delivered by the broker on a subscribed destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Full broker destination, e.g. `/topic/noise-results-dev`
    pub destination: String,

    /// Raw message body (JSON text)
    pub body: String,

    /// Receive timestamp (context clock, ms since Unix epoch)
    pub received_at_ms: u64,
}

impl InboundMessage {
    /// Creates a new inbound message.
    pub fn new(destination: impl Into<String>, body: impl Into<String>, received_at_ms: u64) -> Self {
        Self {
            destination: destination.into(),
            body: body.into(),
            received_at_ms,
        }
    }

    /// Returns the body size in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = ClientId::new();
        assert!(id.as_str().starts_with("interaction-client-"));
        assert_eq!(id.as_str().len(), "interaction-client-".len() + 10);
    }

    #[test]
    fn test_client_id_from_seed_is_deterministic() {
        assert_eq!(ClientId::from_seed(42), ClientId::from_seed(42));
        assert_ne!(ClientId::from_seed(42), ClientId::from_seed(43));
    }
}
