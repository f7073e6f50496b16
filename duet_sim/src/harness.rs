//! Session wired to the simulated broker.
//!
//! ```text
//!   SimBroker ──► SimTransport ──► SubscriptionManager ──► OutcomeLog ──► ResultDispatcher ──► Session
//!      ▲                                                                                         │
//!      └──────────────────────────── request_scenario ◄──────────────────────────────────────────┘
//! ```
//!
//! Everything runs on a current-thread runtime, so waiting is done by
//! yielding until a condition holds.

use crate::context::SimContext;
use crate::network::{SimBroker, SimTransport};
use async_trait::async_trait;
use duet_core::{
    ConnectionState, CoreError, CoreResult, DispatchOutcome, DuetConfig, InMemoryLayerRegistry, MemoryTileSourceFactory,
    MessageSink, ReconnectPolicy, RequestTarget, ResultDispatcher, RoutedMessage, Session, SubscriptionManager, TopicCatalog,
    TopicClass, TopicDescriptor, TopicRoute,
};
use duet_env::ClientId;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Yields granted to any single wait.
const YIELD_BUDGET: usize = 10_000;

/// Region the harness session subscribes for.
pub const SIM_REGION: &str = "flanders";

/// Sink that dispatches and remembers every outcome.
pub struct OutcomeLog {
    dispatcher: ResultDispatcher,
    outcomes: Mutex<Vec<DispatchOutcome>>,
}

impl OutcomeLog {
    pub fn new(dispatcher: ResultDispatcher) -> Self {
        Self {
            dispatcher,
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub fn outcomes(&self) -> Vec<DispatchOutcome> {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outcomes matching a predicate.
    pub fn count(&self, pred: impl Fn(&DispatchOutcome) -> bool) -> usize {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|o| pred(o))
            .count()
    }
}

#[async_trait]
impl MessageSink for OutcomeLog {
    async fn deliver(&self, message: RoutedMessage) {
        let outcome = self.dispatcher.dispatch(&message).await;
        debug!(topic = %message.topic, ?outcome, "sim delivery");
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).push(outcome);
    }
}

/// Topic table used by every simulated session.
pub fn sim_config(policy: ReconnectPolicy) -> DuetConfig {
    let config = DuetConfig {
        dev_mode: true,
        reconnect: policy,
        ..DuetConfig::default()
    };
    config.with_topic_table(
        "simTopics",
        &[
            TopicDescriptor::new(TopicClass::Traffic, "all", "/topic/traffic-results", "/topic/traffic-changes"),
            TopicDescriptor::new(TopicClass::Noise, "gent", "/topic/noise-results", ""),
            TopicDescriptor::new(TopicClass::Air, "flanders", "/topic/air-results", ""),
            TopicDescriptor::new(TopicClass::Control, "all", "/topic/control", "/topic/requests"),
            TopicDescriptor::new(TopicClass::Error, "all", "/topic/errors", ""),
        ],
    )
}

/// A session, its broker and its subscription task.
pub struct Harness {
    pub context: Arc<SimContext>,
    pub broker: Arc<SimBroker>,
    pub session: Arc<Session>,
    pub registry: Arc<InMemoryLayerRegistry>,
    pub tiles: Arc<MemoryTileSourceFactory>,
    pub manager: Arc<SubscriptionManager<SimContext, SimTransport>>,
    pub outcomes: Arc<OutcomeLog>,
    client_id: ClientId,
    delivered: usize,
    task: Option<JoinHandle<CoreResult<()>>>,
}

impl Harness {
    /// Builds the harness. Nothing connects until [`Self::start`].
    pub fn new(seed: u64, policy: ReconnectPolicy) -> CoreResult<Self> {
        let context = SimContext::shared(seed);
        let broker = SimBroker::shared(Arc::clone(&context));
        let config = sim_config(policy);
        let routes = TopicCatalog::from_config(&config)?.routes(SIM_REGION, config.mode());

        let registry = Arc::new(InMemoryLayerRegistry::new());
        let tiles = Arc::new(MemoryTileSourceFactory::new());
        let session = Arc::new(Session::new(config.clone(), registry.clone(), tiles.clone()));

        let client_id = ClientId::from_seed(seed);
        let transport = Arc::new(broker.transport(client_id.clone()));
        let manager = Arc::new(SubscriptionManager::new(
            Arc::clone(&context),
            transport,
            routes,
            config.topic_prefix.clone(),
            config.reconnect.clone(),
            Arc::clone(session.notifications()),
        ));
        let outcomes = Arc::new(OutcomeLog::new(ResultDispatcher::new(Arc::clone(&session))));

        Ok(Self {
            context,
            broker,
            session,
            registry,
            tiles,
            manager,
            outcomes,
            client_id,
            delivered: 0,
            task: None,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Spawns the subscription loop.
    pub fn start(&mut self) {
        let manager = Arc::clone(&self.manager);
        let sink = Arc::clone(&self.outcomes);
        self.task = Some(tokio::spawn(async move { manager.run(sink.as_ref()).await }));
    }

    /// Yields until `done` holds or the budget runs out.
    pub async fn wait_until(&self, mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..YIELD_BUDGET {
            if done() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        done()
    }

    pub async fn wait_connected(&self) -> bool {
        let manager = Arc::clone(&self.manager);
        self.wait_until(move || manager.state() == ConnectionState::Connected).await
    }

    /// Waits until every delivery made so far has been dispatched.
    pub async fn settle(&self) -> bool {
        let outcomes = Arc::clone(&self.outcomes);
        let delivered = self.delivered;
        self.wait_until(move || outcomes.len() >= delivered).await
    }

    fn route(&self, class: &TopicClass) -> CoreResult<&TopicRoute> {
        self.manager
            .routes()
            .iter()
            .find(|r| &r.descriptor.class == class)
            .ok_or_else(|| CoreError::config(format!("no {class} route in the sim topic table")))
    }

    /// Publishes a JSON body on the route of a topic class.
    pub fn publish(&mut self, class: &TopicClass, body: &Value) -> CoreResult<usize> {
        self.publish_raw(class, &body.to_string())
    }

    /// Publishes raw text on the route of a topic class.
    pub fn publish_raw(&mut self, class: &TopicClass, body: &str) -> CoreResult<usize> {
        let destination = self.route(class)?.destination.clone();
        let deliveries = self.broker.publish(&destination, body);
        self.delivered += deliveries;
        Ok(deliveries)
    }

    /// Publishes a scenario request and registers its id.
    pub async fn request(&self, scenario_id: &str) -> CoreResult<String> {
        let fallback = self.route(&TopicClass::Control)?.destination.clone();
        let destination = match self.session.config().request_target(Some(fallback.as_str())) {
            Some(RequestTarget::Broker(destination)) => destination,
            Some(RequestTarget::Gateway(url)) => {
                return Err(CoreError::config(format!("the simulated broker has no HTTP gateway ({url})")))
            }
            None => return Err(CoreError::config("no request destination")),
        };
        let payload = json!({"scenarioid": scenario_id, "action": "simulate"});
        self.session
            .request_scenario(self.manager.as_ref(), &destination, &payload)
            .await
    }

    /// Stops the subscription loop and returns how it ended.
    pub async fn stop(&mut self) -> Option<CoreResult<()>> {
        self.manager.shutdown();
        self.join().await
    }

    /// Waits for the subscription loop to end on its own.
    pub async fn join(&mut self) -> Option<CoreResult<()>> {
        let task = self.task.take()?;
        match task.await {
            Ok(result) => Some(result),
            Err(e) => Some(Err(CoreError::config(format!("subscription task panicked: {e}")))),
        }
    }
}

/// TNO noise result with result and delta maps.
pub fn tno_noise_payload(scenario_id: &str) -> Value {
    json!({
        "scenarioid": scenario_id,
        "tilesurl": format!("https://tno.example/{scenario_id}/{{z}}/{{x}}/{{y}}.png"),
        "deltaurl": format!("https://tno.example/{scenario_id}/delta/{{z}}/{{x}}/{{y}}.png"),
    })
}

/// VITO air result with two pollutants, only the first with a delta map.
pub fn vito_air_payload(scenario_id: &str) -> Value {
    json!({
        "scenarioid": scenario_id,
        "pollutants": ["no2", "pm2.5"],
        "no2": {
            "tilesurl": format!("https://vito.example/{scenario_id}/no2/{{z}}/{{x}}/{{y}}"),
            "deltaurl": format!("https://vito.example/{scenario_id}/no2-delta/{{z}}/{{x}}/{{y}}"),
        },
        "pm2.5": {
            "tilesurl": format!("https://vito.example/{scenario_id}/pm25/{{z}}/{{x}}/{{y}}"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::LayerRegistry;

    #[tokio::test]
    async fn test_harness_connects_and_requests() {
        let mut harness = Harness::new(3, ReconnectPolicy::default()).unwrap();
        harness.start();
        assert!(harness.wait_connected().await);

        assert_eq!(harness.broker.subscriptions(harness.client_id()).len(), 5);
        let id = harness.request("s-1").await.unwrap();
        assert_eq!(id, "s-1");
        assert_eq!(harness.broker.requests()[0].0, "/topic/requests-dev");

        harness.publish(&TopicClass::Noise, &tno_noise_payload("s-1")).unwrap();
        assert!(harness.settle().await);
        assert_eq!(harness.registry.names().len(), 2);
        assert!(matches!(harness.stop().await, Some(Ok(()))));
    }
}
