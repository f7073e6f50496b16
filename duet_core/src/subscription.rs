//! Subscription Manager - one broker connection, every resolved topic.
//!
//! ```text
//!          ┌──────────── connect + subscribe all ◄─────────────┐
//!          ▼                                                    │
//!   Connecting ──ok──► Connected ──recv──► MessageSink          │
//!          │                │                                   │
//!          │ err            │ connection lost                   │
//!          ▼                ▼                                   │
//!      backoff(attempt) ────────────────────────────────────────┘
//!          │ attempt == max_retries
//!          ▼
//!        Failed (ReconnectExhausted)
//! ```
//!
//! A lost connection counts as a failed attempt like a refused connect.
//! The failure count only resets once a connection proved stable: it
//! delivered a message or stayed up for `stable_after_ms`. A broker that
//! accepts and immediately drops every connection therefore still backs
//! off and eventually exhausts the retry budget.
//!
//! The connect/resubscribe sequence is serialized behind an async mutex,
//! so there is never more than one live connection or a duplicate
//! subscription.

use crate::config::ReconnectPolicy;
use crate::error::{CoreError, CoreResult};
use crate::notify::Notifications;
use crate::topics::{semantic_topic, TopicDescriptor, TopicRoute};
use async_trait::async_trait;
use duet_env::{DuetContext, EnvError, InboundMessage, MessageTransport};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A message forwarded to the dispatcher.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    /// Topic with the transport prefix stripped
    pub topic: String,

    /// Destination exactly as the broker reported it
    pub destination: String,

    /// Descriptor the subscription was made for
    pub descriptor: TopicDescriptor,

    pub body: String,
    pub received_at_ms: u64,
}

/// Consumer of routed messages.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: RoutedMessage);
}

/// Sends scenario requests to a broker topic or an HTTP gateway.
#[async_trait]
pub trait RequestPublisher: Send + Sync {
    async fn publish(&self, destination: &str, body: &str) -> CoreResult<()>;
}

/// Connection lifecycle of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnect attempt `attempt`
    Backoff { attempt: u32 },
    /// Retry budget exhausted
    Failed,
    Stopped,
}

/// Keeps the session subscribed to its topics.
pub struct SubscriptionManager<Ctx: DuetContext, T: MessageTransport> {
    context: Arc<Ctx>,
    transport: Arc<T>,
    routes: Vec<TopicRoute>,
    prefix: String,
    policy: ReconnectPolicy,
    notifications: Arc<Notifications>,

    state: Mutex<ConnectionState>,

    /// Serializes connect + resubscribe; holds the number of connections made
    connection: tokio::sync::Mutex<u64>,

    shutdown: watch::Sender<bool>,
}

impl<Ctx: DuetContext, T: MessageTransport> SubscriptionManager<Ctx, T> {
    /// Creates a manager for the given routes.
    ///
    /// # Arguments
    /// * `context` - Clock used for backoff
    /// * `transport` - Broker connection
    /// * `routes` - Resolved subscriptions (see [`crate::topics::TopicCatalog::routes`])
    /// * `prefix` - Transport prefix stripped from destinations
    /// * `policy` - Reconnect backoff
    /// * `notifications` - Where transport warnings are recorded
    pub fn new(
        context: Arc<Ctx>,
        transport: Arc<T>,
        routes: Vec<TopicRoute>,
        prefix: impl Into<String>,
        policy: ReconnectPolicy,
        notifications: Arc<Notifications>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            context,
            transport,
            routes,
            prefix: prefix.into(),
            policy,
            notifications,
            state: Mutex::new(ConnectionState::Disconnected),
            connection: tokio::sync::Mutex::new(0),
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn routes(&self) -> &[TopicRoute] {
        &self.routes
    }

    /// Number of successful connections so far.
    pub async fn connections(&self) -> u64 {
        *self.connection.lock().await
    }

    /// Asks `run()` to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Connects and subscribes to every route.
    async fn establish(&self) -> Result<(), EnvError> {
        let mut connections = self.connection.lock().await;
        self.set_state(ConnectionState::Connecting);
        self.transport.connect().await?;
        for route in &self.routes {
            self.transport.subscribe(&route.destination).await?;
        }
        *connections += 1;
        self.set_state(ConnectionState::Connected);
        info!(
            client = %self.transport.client_id(),
            topics = self.routes.len(),
            connection = *connections,
            "subscribed to result topics"
        );
        Ok(())
    }

    fn route_for(&self, destination: &str) -> Option<&TopicRoute> {
        self.routes.iter().find(|r| r.destination == destination).or_else(|| {
            let topic = semantic_topic(destination, &self.prefix);
            self.routes
                .iter()
                .find(|r| semantic_topic(&r.destination, &self.prefix) == topic)
        })
    }

    async fn forward(&self, message: InboundMessage, sink: &dyn MessageSink) {
        let Some(route) = self.route_for(&message.destination) else {
            debug!(destination = %message.destination, "message on unknown destination dropped");
            return;
        };
        let routed = RoutedMessage {
            topic: semantic_topic(&message.destination, &self.prefix).to_string(),
            destination: message.destination,
            descriptor: route.descriptor.clone(),
            body: message.body,
            received_at_ms: message.received_at_ms,
        };
        sink.deliver(routed).await;
    }

    /// Maintains the subscription until shutdown.
    ///
    /// # Returns
    /// * `Ok(())` - shutdown was requested
    /// * `Err(CoreError::ReconnectExhausted)` - `max_retries` consecutive
    ///   connection attempts failed or were dropped before proving stable
    pub async fn run(&self, sink: &dyn MessageSink) -> CoreResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let error = match self.establish().await {
                Err(e) => e,
                Ok(()) => {
                    let connected_at = self.context.now();
                    let mut received: u64 = 0;
                    let lost = loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    self.transport.disconnect().await;
                                    self.set_state(ConnectionState::Stopped);
                                    return Ok(());
                                }
                            }
                            next = self.transport.recv() => match next {
                                Ok(message) => {
                                    received += 1;
                                    self.forward(message, sink).await;
                                }
                                Err(e) => break e,
                            }
                        }
                    };

                    let uptime = self.context.now().saturating_sub(connected_at);
                    if received > 0 || uptime >= self.policy.stable_after() {
                        failures = 0;
                    }
                    self.notifications
                        .warning("subscription", format!("Connection to message broker lost: {lost}"));
                    self.set_state(ConnectionState::Disconnected);
                    lost
                }
            };

            failures += 1;
            self.transport.disconnect().await;
            if failures >= self.policy.max_retries {
                self.set_state(ConnectionState::Failed);
                self.notifications
                    .error("subscription", format!("Giving up on the message broker: {error}"));
                return Err(CoreError::ReconnectExhausted {
                    attempts: failures,
                    last_error: error.to_string(),
                });
            }
            let delay = self.policy.delay_for(failures);
            warn!(attempt = failures, delay_ms = delay.as_millis() as u64, %error, "broker connection failed, backing off");
            self.set_state(ConnectionState::Backoff { attempt: failures });
            tokio::select! {
                _ = self.context.sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.transport.disconnect().await;
        self.set_state(ConnectionState::Stopped);
        Ok(())
    }
}

#[async_trait]
impl<Ctx: DuetContext, T: MessageTransport> RequestPublisher for SubscriptionManager<Ctx, T> {
    async fn publish(&self, destination: &str, body: &str) -> CoreResult<()> {
        self.transport.send(destination, body).await?;
        debug!(%destination, bytes = body.len(), "request published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentMode;
    use crate::topics::{TopicCatalog, TopicClass};
    use duet_env::{ClientId, TokioContext};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ScriptedTransport {
        client_id: ClientId,
        failing_connects: Mutex<u32>,
        /// Every accepted connection is closed on the first `recv`
        drop_on_recv: bool,
        connects: Mutex<u32>,
        subscriptions: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, String)>>,
        inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<InboundMessage, EnvError>>>,
    }

    impl ScriptedTransport {
        fn new(failing_connects: u32) -> (Self, mpsc::UnboundedSender<Result<InboundMessage, EnvError>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Self {
                client_id: ClientId::from_seed(1),
                failing_connects: Mutex::new(failing_connects),
                drop_on_recv: false,
                connects: Mutex::new(0),
                subscriptions: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                inbox: tokio::sync::Mutex::new(rx),
            };
            (transport, tx)
        }
    }

    #[async_trait]
    impl MessageTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), EnvError> {
            *self.connects.lock().unwrap() += 1;
            let mut failing = self.failing_connects.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(EnvError::network("broker unreachable"));
            }
            Ok(())
        }

        async fn subscribe(&self, destination: &str) -> Result<(), EnvError> {
            self.subscriptions.lock().unwrap().push(destination.to_string());
            Ok(())
        }

        async fn recv(&self) -> Result<InboundMessage, EnvError> {
            if self.drop_on_recv {
                return Err(EnvError::ConnectionClosed);
            }
            match self.inbox.lock().await.recv().await {
                Some(next) => next,
                None => std::future::pending().await,
            }
        }

        async fn send(&self, destination: &str, body: &str) -> Result<(), EnvError> {
            self.sent.lock().unwrap().push((destination.to_string(), body.to_string()));
            Ok(())
        }

        async fn disconnect(&self) {}

        fn client_id(&self) -> &ClientId {
            &self.client_id
        }
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<RoutedMessage>>);

    #[async_trait]
    impl MessageSink for CollectingSink {
        async fn deliver(&self, message: RoutedMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    fn routes() -> Vec<TopicRoute> {
        let catalog = TopicCatalog::new(
            vec![
                TopicDescriptor::new(TopicClass::Noise, "all", "/topic/noise-results", ""),
                TopicDescriptor::new(TopicClass::Traffic, "all", "/topic/traffic-results", ""),
            ],
            BTreeMap::new(),
        );
        catalog.routes("gent", DeploymentMode::Dev)
    }

    fn policy(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            max_retries,
            stable_after_ms: 1_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let (transport, _tx) = ScriptedTransport::new(u32::MAX);
        let transport = Arc::new(transport);
        let notifications = Arc::new(Notifications::new());
        let manager = SubscriptionManager::new(
            Arc::new(TokioContext::new()),
            Arc::clone(&transport),
            routes(),
            "/topic/",
            policy(3),
            Arc::clone(&notifications),
        );

        let result = manager.run(&CollectingSink::default()).await;
        assert!(matches!(result, Err(CoreError::ReconnectExhausted { attempts: 3, .. })));
        assert_eq!(*transport.connects.lock().unwrap(), 3);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_drops_back_off_and_give_up() {
        let (mut transport, _tx) = ScriptedTransport::new(0);
        transport.drop_on_recv = true;
        let transport = Arc::new(transport);
        let notifications = Arc::new(Notifications::new());
        let manager = SubscriptionManager::new(
            Arc::new(TokioContext::new()),
            Arc::clone(&transport),
            routes(),
            "/topic/",
            policy(3),
            Arc::clone(&notifications),
        );

        let started = tokio::time::Instant::now();
        let result = manager.run(&CollectingSink::default()).await;

        assert!(matches!(result, Err(CoreError::ReconnectExhausted { attempts: 3, .. })));
        assert_eq!(*transport.connects.lock().unwrap(), 3);
        assert_eq!(manager.connections().await, 3);
        // Backoff after the first two drops: 100ms + 200ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(700), "elapsed {elapsed:?}");
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(notifications
            .at_least(crate::notify::Level::Warning)
            .iter()
            .any(|n| n.message.contains("lost")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_and_resubscribes_after_loss() {
        let (transport, tx) = ScriptedTransport::new(1);
        let transport = Arc::new(transport);
        let manager = Arc::new(SubscriptionManager::new(
            Arc::new(TokioContext::new()),
            Arc::clone(&transport),
            routes(),
            "/topic/",
            policy(5),
            Arc::new(Notifications::new()),
        ));
        let sink = Arc::new(CollectingSink::default());

        tx.send(Ok(InboundMessage::new("/topic/noise-results-dev", "{\"a\":1}", 10))).unwrap();
        tx.send(Err(EnvError::ConnectionClosed)).unwrap();
        tx.send(Ok(InboundMessage::new("/topic/traffic-results-dev", "{\"b\":2}", 20))).unwrap();

        let handle = {
            let manager = Arc::clone(&manager);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { manager.run(sink.as_ref()).await })
        };

        while sink.0.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown();
        assert!(handle.await.unwrap().is_ok());

        let delivered = sink.0.lock().unwrap().clone();
        assert_eq!(delivered[0].topic, "noise-results-dev");
        assert_eq!(delivered[0].descriptor.class, TopicClass::Noise);
        assert_eq!(delivered[1].topic, "traffic-results-dev");

        // One failed connect, then two successful connections
        assert_eq!(*transport.connects.lock().unwrap(), 3);
        assert_eq!(manager.connections().await, 2);
        assert_eq!(
            *transport.subscriptions.lock().unwrap(),
            vec![
                "/topic/traffic-results-dev",
                "/topic/noise-results-dev",
                "/topic/traffic-results-dev",
                "/topic/noise-results-dev",
            ]
        );
        assert_eq!(manager.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_publish_goes_through_transport() {
        let (transport, _tx) = ScriptedTransport::new(0);
        let transport = Arc::new(transport);
        let manager = SubscriptionManager::new(
            Arc::new(TokioContext::new()),
            Arc::clone(&transport),
            routes(),
            "/topic/",
            policy(1),
            Arc::new(Notifications::new()),
        );
        manager.publish("/topic/requests", "{\"scenarioid\":\"s1\"}").await.unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }
}
