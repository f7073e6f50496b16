//! Broker transport abstraction for the result-sync session.

use crate::error::EnvError;
use crate::types::{ClientId, InboundMessage};
use async_trait::async_trait;

/// Abstraction over a topic-based message broker connection.
///
/// # Implementations
///
/// - **Production**: `StompWsTransport` - STOMP 1.2 frames over a WebSocket
/// - **Simulation**: `SimTransport` - in-memory broker with fault injection
///
/// # Message Flow
///
/// ```text
/// Session                    Broker                     Simulation service
///   |-- connect() ------------->|                              |
///   |-- subscribe(topic) ------>|                              |
///   |                           |<----- result on topic -------|
///   |<-- recv() -> message -----|                              |
/// ```
///
/// A transport holds at most one live connection. After `recv()` reports a
/// connection loss the caller is expected to `connect()` and re-subscribe.
#[async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    /// Opens the connection (replacing any previous one).
    async fn connect(&self) -> Result<(), EnvError>;

    /// Subscribes to a broker destination on the live connection.
    async fn subscribe(&self, destination: &str) -> Result<(), EnvError>;

    /// Receives the next message on any subscribed destination.
    ///
    /// # Returns
    /// * `Ok(message)` - A message was received
    /// * `Err(EnvError::ConnectionClosed)` - The connection dropped
    async fn recv(&self) -> Result<InboundMessage, EnvError>;

    /// Publishes a text body to a destination.
    async fn send(&self, destination: &str, body: &str) -> Result<(), EnvError>;

    /// Closes the connection. Idempotent.
    async fn disconnect(&self);

    /// Returns this client's identifier.
    fn client_id(&self) -> &ClientId;
}
