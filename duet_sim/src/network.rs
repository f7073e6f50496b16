//! Simulated message broker with fault injection.
//!
//! ```text
//!   scenario ──publish(dest, body)──► SimBroker ──(loss / duplication)──► SimTransport inbox
//!                                        ▲                                      │
//!   session ◄── recv() ──────────────────┼──────────────────────────────────────┘
//!   session ──── send(requests) ─────────┘  (recorded for assertions)
//! ```

use crate::context::SimContext;
use async_trait::async_trait;
use duet_env::{ClientId, DuetContext, EnvError, InboundMessage, MessageTransport};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

type Inbox = mpsc::UnboundedSender<Result<InboundMessage, EnvError>>;

/// Fault knobs of the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability a delivery is lost (0.0 - 1.0)
    pub loss_rate: f64,

    /// Probability a delivery is made twice (0.0 - 1.0)
    pub duplicate_rate: f64,

    /// Connect attempts still to be refused
    pub refuse_connects: u32,

    /// Broker refuses every connection while down
    pub down: bool,
}

/// Counters kept by the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub connects: u64,
    pub refused: u64,
    pub forced_drops: u64,

    /// Subscribe calls for a destination the connection already had
    pub duplicate_subscriptions: u64,
}

struct ClientSlot {
    connected: bool,
    subscriptions: BTreeSet<String>,
    inbox: Inbox,
}

#[derive(Default)]
struct BrokerState {
    clients: BTreeMap<String, ClientSlot>,
    faults: FaultConfig,
    requests: Vec<(String, String)>,
    stats: BrokerStats,
}

/// In-memory topic broker shared by every simulated client.
pub struct SimBroker {
    context: Arc<SimContext>,
    state: Mutex<BrokerState>,
}

impl SimBroker {
    /// Creates a broker whose fault decisions use the context's RNG.
    pub fn shared(context: Arc<SimContext>) -> Arc<Self> {
        Arc::new(Self {
            context,
            state: Mutex::new(BrokerState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates a transport for a new client of this broker.
    pub fn transport(self: &Arc<Self>, client_id: ClientId) -> SimTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().clients.insert(
            client_id.as_str().to_string(),
            ClientSlot {
                connected: false,
                subscriptions: BTreeSet::new(),
                inbox: tx,
            },
        );
        SimTransport {
            broker: Arc::clone(self),
            client_id,
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    pub fn set_loss(&self, rate: f64) {
        self.state().faults.loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_duplication(&self, rate: f64) {
        self.state().faults.duplicate_rate = rate.clamp(0.0, 1.0);
    }

    /// Refuses the next `count` connect attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.state().faults.refuse_connects = count;
    }

    pub fn set_down(&self, down: bool) {
        self.state().faults.down = down;
    }

    pub fn faults(&self) -> FaultConfig {
        self.state().faults.clone()
    }

    /// Drops every live connection. Returns how many were dropped.
    pub fn drop_connections(&self) -> usize {
        let mut state = self.state();
        let mut dropped = 0;
        for slot in state.clients.values_mut().filter(|s| s.connected) {
            slot.connected = false;
            slot.subscriptions.clear();
            let _ = slot.inbox.send(Err(EnvError::ConnectionClosed));
            dropped += 1;
        }
        state.stats.forced_drops += dropped as u64;
        debug!(dropped, "broker dropped connections");
        dropped
    }

    // ------------------------------------------------------------------------
    // Traffic
    // ------------------------------------------------------------------------

    /// Publishes a message as the simulation service would.
    ///
    /// # Returns
    /// Number of deliveries made (duplicates included).
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        let received_at_ms = self.context.unix_millis();
        let mut state = self.state();
        let faults = state.faults.clone();
        state.stats.published += 1;

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        let mut duplicated = 0u64;
        for slot in state
            .clients
            .values()
            .filter(|s| s.connected && s.subscriptions.contains(destination))
        {
            let (lost, twice) = self.context.with_rng(|rng| {
                (rng.gen_bool(faults.loss_rate), rng.gen_bool(faults.duplicate_rate))
            });
            if lost {
                dropped += 1;
                continue;
            }
            let copies = if twice { 2 } else { 1 };
            for _ in 0..copies {
                let message = InboundMessage::new(destination, body, received_at_ms);
                if slot.inbox.send(Ok(message)).is_ok() {
                    delivered += 1;
                }
            }
            duplicated += u64::from(twice);
        }

        state.stats.delivered += delivered;
        state.stats.dropped += dropped;
        state.stats.duplicated += duplicated;
        delivered as usize
    }

    /// Requests published by clients, oldest first.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.state().requests.clone()
    }

    pub fn stats(&self) -> BrokerStats {
        self.state().stats
    }

    /// Destinations a client is subscribed to on its live connection.
    pub fn subscriptions(&self, client_id: &ClientId) -> Vec<String> {
        self.state()
            .clients
            .get(client_id.as_str())
            .map(|s| s.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn connect(&self, client_id: &ClientId) -> Result<(), EnvError> {
        let mut state = self.state();
        if state.faults.down || state.faults.refuse_connects > 0 {
            state.faults.refuse_connects = state.faults.refuse_connects.saturating_sub(1);
            state.stats.refused += 1;
            return Err(EnvError::network("broker refused connection"));
        }
        let slot = state
            .clients
            .get_mut(client_id.as_str())
            .ok_or_else(|| EnvError::network(format!("unknown client {client_id}")))?;
        slot.connected = true;
        slot.subscriptions.clear();
        state.stats.connects += 1;
        Ok(())
    }

    fn subscribe(&self, client_id: &ClientId, destination: &str) -> Result<(), EnvError> {
        let mut state = self.state();
        let slot = state
            .clients
            .get_mut(client_id.as_str())
            .filter(|s| s.connected)
            .ok_or(EnvError::NotConnected)?;
        let fresh = slot.subscriptions.insert(destination.to_string());
        if !fresh {
            state.stats.duplicate_subscriptions += 1;
        }
        Ok(())
    }

    fn record_request(&self, client_id: &ClientId, destination: &str, body: &str) -> Result<(), EnvError> {
        let mut state = self.state();
        if !state.clients.get(client_id.as_str()).is_some_and(|s| s.connected) {
            return Err(EnvError::NotConnected);
        }
        state.requests.push((destination.to_string(), body.to_string()));
        Ok(())
    }

    fn disconnect(&self, client_id: &ClientId) {
        if let Some(slot) = self.state().clients.get_mut(client_id.as_str()) {
            slot.connected = false;
            slot.subscriptions.clear();
        }
    }
}

/// A client connection to the [`SimBroker`].
pub struct SimTransport {
    broker: Arc<SimBroker>,
    client_id: ClientId,

    /// Receiver for deliveries (behind tokio mutex for async)
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<InboundMessage, EnvError>>>,
}

#[async_trait]
impl MessageTransport for SimTransport {
    async fn connect(&self) -> Result<(), EnvError> {
        self.broker.connect(&self.client_id)
    }

    async fn subscribe(&self, destination: &str) -> Result<(), EnvError> {
        self.broker.subscribe(&self.client_id, destination)
    }

    async fn recv(&self) -> Result<InboundMessage, EnvError> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await.unwrap_or(Err(EnvError::ConnectionClosed))
    }

    async fn send(&self, destination: &str, body: &str) -> Result<(), EnvError> {
        self.broker.record_request(&self.client_id, destination, body)
    }

    async fn disconnect(&self) {
        self.broker.disconnect(&self.client_id);
    }

    fn client_id(&self) -> &ClientId {
        &self.client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> Arc<SimBroker> {
        SimBroker::shared(SimContext::shared(42))
    }

    #[tokio::test]
    async fn test_only_subscribed_clients_receive() {
        let broker = broker();
        let a = broker.transport(ClientId::from_seed(1));
        let b = broker.transport(ClientId::from_seed(2));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        a.subscribe("/topic/noise").await.unwrap();

        assert_eq!(broker.publish("/topic/noise", "{}"), 1);
        let message = a.recv().await.unwrap();
        assert_eq!(message.destination, "/topic/noise");
        assert_eq!(message.received_at_ms, 1_704_067_200_000);
        assert_eq!(broker.publish("/topic/traffic", "{}"), 0);
    }

    #[tokio::test]
    async fn test_refused_connects_and_outage() {
        let broker = broker();
        let t = broker.transport(ClientId::from_seed(1));
        broker.refuse_connects(2);
        assert!(t.connect().await.is_err());
        assert!(t.connect().await.is_err());
        assert!(t.connect().await.is_ok());

        broker.set_down(true);
        assert!(t.connect().await.is_err());
        assert_eq!(broker.stats().refused, 3);
    }

    #[tokio::test]
    async fn test_drop_connections_clears_subscriptions() {
        let broker = broker();
        let t = broker.transport(ClientId::from_seed(1));
        t.connect().await.unwrap();
        t.subscribe("/topic/noise").await.unwrap();
        t.subscribe("/topic/noise").await.unwrap();
        assert_eq!(broker.stats().duplicate_subscriptions, 1);

        assert_eq!(broker.drop_connections(), 1);
        assert!(matches!(t.recv().await, Err(EnvError::ConnectionClosed)));
        assert!(broker.subscriptions(t.client_id()).is_empty());
        assert!(matches!(t.send("/topic/requests", "{}").await, Err(EnvError::NotConnected)));
    }

    #[tokio::test]
    async fn test_duplication_and_loss() {
        let broker = broker();
        let t = broker.transport(ClientId::from_seed(1));
        t.connect().await.unwrap();
        t.subscribe("/topic/noise").await.unwrap();

        broker.set_duplication(1.0);
        assert_eq!(broker.publish("/topic/noise", "a"), 2);
        broker.set_duplication(0.0);
        broker.set_loss(1.0);
        assert_eq!(broker.publish("/topic/noise", "b"), 0);

        let stats = broker.stats();
        assert_eq!(stats.duplicated, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 2);
    }
}
