//! Result Dispatcher - turns routed broker messages into result layers.
//!
//! ```text
//!   RoutedMessage
//!        │
//!        ├─ error topic ─────► warning notification
//!        ├─ control topic ───► ignored (debug)
//!        ▼
//!   parse JSON ──fail──► malformed (error notification)
//!        ▼
//!   claim scenarioid ──not pending──► discarded silently
//!        ▼
//!   classify payload ──fail──► malformed, id stays pending
//!        ▼
//!   build layers ──ok──► complete claim (id removed once)
//! ```

use crate::error::{CoreError, CoreResult};
use crate::payload::{classify, scenario_id, RasterProvider, ResultClass, ResultPayload};
use crate::pending::ClaimOutcome;
use crate::session::Session;
use crate::subscription::{MessageSink, RoutedMessage};
use crate::topics::TopicClass;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Why a message was dropped without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// No `scenarioid` in the body
    NoScenarioId,
    /// The scenario was never requested (or the session was reloaded)
    Unsolicited,
    /// The scenario's result was already handled
    AlreadyFulfilled,
    /// Another delivery of the same scenario is being handled
    InFlight,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Layers were built and the scenario id was removed from pending
    Handled { scenario_id: String, layers: Vec<String> },
    Discarded(DiscardReason),
    /// Message on an error-class topic, recorded as a warning
    ErrorReported,
    /// Message on a control topic
    Ignored,
    /// Body could not be decoded or classified
    Malformed,
    /// Layer construction failed; the id stays pending
    Failed,
}

/// Routes messages into the session. Cloning shares the session.
#[derive(Clone)]
pub struct ResultDispatcher {
    session: Arc<Session>,
}

impl ResultDispatcher {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Handles one routed message.
    pub async fn dispatch(&self, message: &RoutedMessage) -> DispatchOutcome {
        match message.descriptor.class {
            TopicClass::Error => {
                self.session
                    .notifications()
                    .warning("broker", error_text(&message.topic, &message.body));
                return DispatchOutcome::ErrorReported;
            }
            TopicClass::Control => {
                debug!(topic = %message.topic, "control message ignored");
                return DispatchOutcome::Ignored;
            }
            _ => {}
        }

        let body: Value = match serde_json::from_str(&message.body) {
            Ok(body) => body,
            Err(e) => {
                self.report_malformed(&message.topic, &CoreError::malformed(e.to_string(), message.body.clone()));
                return DispatchOutcome::Malformed;
            }
        };

        let Some(id) = scenario_id(&body) else {
            debug!(topic = %message.topic, "message without scenarioid discarded");
            return DispatchOutcome::Discarded(DiscardReason::NoScenarioId);
        };

        let claim = match self.session.pending().claim(&id) {
            ClaimOutcome::Claimed(claim) => claim,
            ClaimOutcome::AlreadyFulfilled => {
                debug!(scenario = %id, topic = %message.topic, "re-delivery of fulfilled scenario discarded");
                return DispatchOutcome::Discarded(DiscardReason::AlreadyFulfilled);
            }
            ClaimOutcome::InFlight => {
                debug!(scenario = %id, topic = %message.topic, "duplicate delivery while handling discarded");
                return DispatchOutcome::Discarded(DiscardReason::InFlight);
            }
            ClaimOutcome::Unsolicited => {
                debug!(scenario = %id, topic = %message.topic, "unsolicited result discarded");
                return DispatchOutcome::Discarded(DiscardReason::Unsolicited);
            }
        };

        let class = ResultClass::classify(&message.descriptor.class, &message.topic);
        let payload = match classify(&body, class) {
            Ok(payload) => payload,
            Err(e) => {
                self.report_malformed(&message.topic, &e);
                return DispatchOutcome::Malformed;
            }
        };

        self.session.mark_matched(&id, class);
        match self.build(class, payload).await {
            Ok(layers) => {
                claim.complete();
                info!(scenario = %id, %class, layers = layers.len(), "simulation result loaded");
                DispatchOutcome::Handled { scenario_id: id, layers }
            }
            Err(e) => {
                self.session.rollback(&id);
                drop(claim);
                self.session
                    .notifications()
                    .error("dispatcher", format!("Results of scenario {id} could not be loaded: {e}"));
                DispatchOutcome::Failed
            }
        }
    }

    async fn build(&self, class: ResultClass, payload: ResultPayload) -> CoreResult<Vec<String>> {
        let scenario = payload.scenario_id().to_string();
        let layers = match payload {
            ResultPayload::TnoRaster { scenario_id, urls } => {
                self.session
                    .add_raster_result(RasterProvider::Tno, class.as_str(), &scenario_id, &urls)?
            }
            ResultPayload::VitoRaster { scenario_id, pollutants } => {
                let mut layers = Vec::new();
                for set in pollutants {
                    layers.extend(self.session.add_raster_result(
                        RasterProvider::Vito,
                        &set.label,
                        &scenario_id,
                        &set.urls,
                    )?);
                }
                layers
            }
            ResultPayload::Vector(result) => self.session.add_vector_result(class, result).await?,
        };
        self.session.finish_result(&scenario)?;
        Ok(layers)
    }

    fn report_malformed(&self, topic: &str, e: &CoreError) {
        let payload = match e {
            CoreError::MalformedPayload { payload, .. } => payload.as_str(),
            _ => "",
        };
        error!(%topic, error = %e, %payload, "malformed result payload");
        self.session
            .notifications()
            .error("dispatcher", format!("Result on {topic} could not be read: {e}"));
    }
}

/// Text of a message on an error topic: its `message` field, or the body.
fn error_text(topic: &str, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    format!("{topic}: {detail}")
}

#[async_trait]
impl MessageSink for ResultDispatcher {
    async fn deliver(&self, message: RoutedMessage) {
        let outcome = self.dispatch(&message).await;
        debug!(topic = %message.topic, ?outcome, "message dispatched");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuetConfig;
    use crate::layers::{InMemoryLayerRegistry, LayerRegistry};
    use crate::notify::Level;
    use crate::session::ScenarioPhase;
    use crate::tiles::{MemoryTileSourceFactory, Tile, TileCoord, TileFeature};
    use crate::topics::TopicDescriptor;
    use geo::line_string;
    use serde_json::json;

    struct Fixture {
        dispatcher: ResultDispatcher,
        registry: Arc<InMemoryLayerRegistry>,
        tiles: Arc<MemoryTileSourceFactory>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryLayerRegistry::new());
        let tiles = Arc::new(MemoryTileSourceFactory::new());
        let session = Arc::new(Session::new(DuetConfig::default(), registry.clone(), tiles.clone()));
        Fixture {
            dispatcher: ResultDispatcher::new(session),
            registry,
            tiles,
        }
    }

    fn message(class: TopicClass, topic: &str, body: Value) -> RoutedMessage {
        RoutedMessage {
            topic: topic.to_string(),
            destination: format!("/topic/{topic}"),
            descriptor: TopicDescriptor::new(class, "all", &format!("/topic/{topic}"), ""),
            body: body.to_string(),
            received_at_ms: 0,
        }
    }

    fn tno_noise(id: &str) -> RoutedMessage {
        message(
            TopicClass::Other("tno".into()),
            "tno-noise-results",
            json!({"scenarioid": id, "tilesurl": "https://t/{z}/{x}/{y}.png", "deltaurl": "https://d/{z}/{x}/{y}.png"}),
        )
    }

    #[tokio::test]
    async fn test_unsolicited_message_has_no_effect() {
        let f = fixture();
        f.dispatcher.session().register_scenario("other");

        let outcome = f.dispatcher.dispatch(&tno_noise("s1")).await;
        assert_eq!(outcome, DispatchOutcome::Discarded(DiscardReason::Unsolicited));
        assert!(f.registry.names().is_empty());
        assert_eq!(f.dispatcher.session().pending().pending_ids(), vec!["other".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_removes_id_once() {
        let f = fixture();
        f.dispatcher.session().register_scenario("s1");
        f.dispatcher.session().register_scenario("s2");

        let first = f.dispatcher.dispatch(&tno_noise("s1")).await;
        let second = f.dispatcher.dispatch(&tno_noise("s1")).await;

        let DispatchOutcome::Handled { layers, .. } = first else { panic!("expected handled, got {first:?}") };
        assert_eq!(layers, vec!["noise-pollution-tno-s1_result", "noise-pollution-tno-s1_delta"]);
        assert_eq!(second, DispatchOutcome::Discarded(DiscardReason::AlreadyFulfilled));
        assert_eq!(f.dispatcher.session().pending().pending_ids(), vec!["s2".to_string()]);
        assert_eq!(f.registry.names().len(), 2);
        assert_eq!(f.registry.active_names(), vec!["noise-pollution-tno-s1_delta"]);
    }

    #[tokio::test]
    async fn test_malformed_keeps_id_pending() {
        let f = fixture();
        f.dispatcher.session().register_scenario("s1");

        let outcome = f
            .dispatcher
            .dispatch(&message(TopicClass::Traffic, "traffic-results", json!({"scenarioid": "s1", "oops": 1})))
            .await;
        assert_eq!(outcome, DispatchOutcome::Malformed);
        assert!(f.dispatcher.session().pending().contains("s1"));
        assert_eq!(f.dispatcher.session().phase("s1"), Some(ScenarioPhase::Pending));

        let garbage = RoutedMessage {
            body: "{not json".into(),
            ..message(TopicClass::Traffic, "traffic-results", Value::Null)
        };
        assert_eq!(f.dispatcher.dispatch(&garbage).await, DispatchOutcome::Malformed);
        assert_eq!(f.dispatcher.session().notifications().at_least(Level::Error).len(), 2);
    }

    #[tokio::test]
    async fn test_vito_layers_per_pollutant() {
        let f = fixture();
        f.dispatcher.session().register_scenario("v1");
        let outcome = f
            .dispatcher
            .dispatch(&message(
                TopicClass::Air,
                "vito-air-results",
                json!({
                    "scenarioid": "v1",
                    "pollutants": ["no2", "pm10"],
                    "no2": {"tilesurl": "https://v/no2/{z}/{x}/{y}", "deltaurl": "https://v/no2d/{z}/{x}/{y}"},
                    "pm10": {"tilesurl": "https://v/pm10/{z}/{x}/{y}"}
                }),
            ))
            .await;
        let DispatchOutcome::Handled { layers, .. } = outcome else { panic!("expected handled") };
        assert_eq!(
            layers,
            vec![
                "air.no2-pollution-vito-v1_result",
                "air.no2-pollution-vito-v1_delta",
                "air.pm10-pollution-vito-v1_result",
            ]
        );
        let layer = f.registry.get("air.pm10-pollution-vito-v1_result").unwrap();
        assert_eq!(layer.duet_type, "simresults.air.pm10");
        assert_eq!(layer.provider, "VITO");
    }

    #[tokio::test]
    async fn test_vector_result_enriches_loaded_tiles() {
        let f = fixture();
        f.dispatcher.session().register_scenario("k1");
        let outcome = f
            .dispatcher
            .dispatch(&message(
                TopicClass::Traffic,
                "traffic-results",
                json!({
                    "scenarioid": "k1",
                    "name": "kul-gent-traffic-results",
                    "data": {
                        "metadata": {"status": "ok", "road_network_geom_url": "https://g/gent.json"},
                        "result": [{"link_id": 8344, "Traffic": [30, 40]}, {"link_id": 12, "Traffic": [5, 5]}]
                    }
                }),
            ))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Handled { .. }));
        assert_eq!(f.dispatcher.session().phase("k1"), Some(ScenarioPhase::Enriching));

        let delta = f.tiles.source("kul-gent-traffic-results_delta").unwrap();
        let features = vec![
            TileFeature::new(
                line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 20.0, y: 0.0)],
                json!({"link_id": 8344, "flow": [20, 20]}).as_object().cloned().unwrap(),
            ),
            TileFeature::new(
                line_string![(x: 0.0, y: 5.0), (x: 10.0, y: 5.0), (x: 20.0, y: 5.0)],
                json!({"link_id": 12, "flow": [5, 7]}).as_object().cloned().unwrap(),
            ),
        ];
        let tile = delta.load_tile(Tile::new(TileCoord::new(15, 1, 1), features));

        assert_eq!(tile.features[0].properties["flow_delta"], json!([10.0, 20.0]));
        assert_eq!(tile.features[1].properties["flow_delta"], json!([0.0, -2.0]));
        let geo::Geometry::LineString(first) = &tile.features[0].geometry else { panic!("not a line") };
        let geo::Geometry::LineString(second) = &tile.features[1].geometry else { panic!("not a line") };
        assert_eq!(first.0.len(), 2);
        assert_eq!(second.0.len(), 3);
        assert_eq!(delta.redraw_requests(), vec![vec![TileCoord::ROOT]]);
    }

    #[tokio::test]
    async fn test_error_and_control_topics() {
        let f = fixture();
        let outcome = f
            .dispatcher
            .dispatch(&message(TopicClass::Error, "errors", json!({"message": "model crashed"})))
            .await;
        assert_eq!(outcome, DispatchOutcome::ErrorReported);
        let warnings = f.dispatcher.session().notifications().at_least(Level::Warning);
        assert_eq!(warnings[0].message, "errors: model crashed");

        let outcome = f
            .dispatcher
            .dispatch(&message(TopicClass::Control, "control", json!({"scenarioid": "x"})))
            .await;
        assert_eq!(outcome, DispatchOutcome::Ignored);
    }
}
