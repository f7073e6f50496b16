//! Session configuration.
//!
//! Mirrors the viewer plugin configuration: `models` names the topic tables,
//! each table is an array of topic descriptors stored under its own key.
//!
//! ```json
//! {
//!   "models": ["trafficTopics", "noiseTopics"],
//!   "trafficTopics": [{ "type": "traffic", "region": "all",
//!                       "topicForResults": "/topic/traffic-results",
//!                       "topicForChanges": "/topic/traffic-changes" }],
//!   "dev-mode": true,
//!   "referenceData": { "road-network-calculation-result-flanders": "https://..." }
//! }
//! ```

use crate::datasets::{default_dataset_table, DatasetDescriptor};
use crate::error::{CoreError, CoreResult};
use crate::topics::TopicDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Which topic-name variant the broker exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentMode {
    /// Topics carry a `-dev` suffix
    Dev,
    /// Plain topic names
    Prod,
}

impl DeploymentMode {
    /// Applies the mode's suffix to a topic name.
    pub fn apply(&self, topic: &str) -> String {
        match self {
            DeploymentMode::Dev => format!("{topic}-dev"),
            DeploymentMode::Prod => topic.to_string(),
        }
    }
}

/// Bounded exponential backoff for re-establishing the broker subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt (ms)
    pub initial_delay_ms: u64,

    /// Upper bound on the delay between attempts (ms)
    pub max_delay_ms: u64,

    /// Growth factor applied after each failed attempt
    pub multiplier: f64,

    /// Consecutive failed attempts before giving up
    pub max_retries: u32,

    /// Uptime after which a connection counts as stable even if nothing
    /// arrived on it (ms)
    pub stable_after_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_retries: 12,
            stable_after_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }
}

/// Where scenario requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// HTTP gateway (`appReceiverURL`) that relays POSTed JSON to the broker
    Gateway(String),
    /// Broker destination the request is sent to directly
    Broker(String),
}

fn default_topic_prefix() -> String {
    "/topic/".to_string()
}

fn default_region_hierarchy() -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert("flanders".to_string(), vec!["gent".to_string()]);
    map
}

/// Top-level configuration consumed by the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuetConfig {
    /// Names of the topic tables to load
    #[serde(default)]
    pub models: Vec<String>,

    /// Subscribe to `-dev` topic variants
    #[serde(rename = "dev-mode", default)]
    pub dev_mode: bool,

    /// Base URL of the DUET environment (broker endpoint is derived from it)
    #[serde(rename = "baseURL", default)]
    pub base_url: String,

    /// Endpoint scenario requests are posted to
    #[serde(rename = "appReceiverURL", default)]
    pub app_receiver_url: String,

    /// Layer-name substring → geometry URL overriding the payload's
    /// geometry URL. Kept in file order: the last matching key wins.
    #[serde(default)]
    pub reference_data: serde_json::Map<String, serde_json::Value>,

    /// Super-region → sub-regions whose topics are pulled in as well
    #[serde(default = "default_region_hierarchy")]
    pub region_hierarchy: BTreeMap<String, Vec<String>>,

    /// Per-dataset identifier and offset rules
    #[serde(default = "default_dataset_table")]
    pub datasets: Vec<DatasetDescriptor>,

    /// Reconnect policy for the broker subscription
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Prefix the transport puts in front of semantic topic names
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Topic tables and any other keys, by name
    #[serde(flatten)]
    pub tables: BTreeMap<String, serde_json::Value>,
}

impl Default for DuetConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            dev_mode: false,
            base_url: String::new(),
            app_receiver_url: String::new(),
            reference_data: serde_json::Map::new(),
            region_hierarchy: default_region_hierarchy(),
            datasets: default_dataset_table(),
            reconnect: ReconnectPolicy::default(),
            topic_prefix: default_topic_prefix(),
            tables: BTreeMap::new(),
        }
    }
}

impl DuetConfig {
    /// Parses a configuration from JSON text.
    pub fn from_json_str(text: &str) -> CoreResult<Self> {
        serde_json::from_str(text).map_err(|e| CoreError::config(format!("invalid config JSON: {e}")))
    }

    /// Reads a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// The deployment mode selected by `dev-mode`.
    pub fn mode(&self) -> DeploymentMode {
        if self.dev_mode {
            DeploymentMode::Dev
        } else {
            DeploymentMode::Prod
        }
    }

    /// Decodes one named topic table.
    pub fn topic_table(&self, name: &str) -> CoreResult<Vec<TopicDescriptor>> {
        let raw = self
            .tables
            .get(name)
            .ok_or_else(|| CoreError::config(format!("topic table `{name}` listed in models but not present")))?;
        serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::config(format!("topic table `{name}` is not an array of topics: {e}")))
    }

    /// Inserts a topic table and lists it in `models` (builder style).
    pub fn with_topic_table(mut self, name: &str, topics: &[TopicDescriptor]) -> Self {
        let value = serde_json::to_value(topics).unwrap_or(serde_json::Value::Array(Vec::new()));
        self.tables.insert(name.to_string(), value);
        if !self.models.iter().any(|m| m == name) {
            self.models.push(name.to_string());
        }
        self
    }

    /// Where scenario requests are published.
    ///
    /// The `appReceiverURL` gateway when configured, otherwise the caller's
    /// `broker_destination` (typically the control route), otherwise `None`.
    pub fn request_target(&self, broker_destination: Option<&str>) -> Option<RequestTarget> {
        if !self.app_receiver_url.is_empty() {
            return Some(RequestTarget::Gateway(self.app_receiver_url.clone()));
        }
        broker_destination.map(|d| RequestTarget::Broker(d.to_string()))
    }

    /// Geometry URL override for a layer name, if configured.
    pub fn reference_url_for(&self, layer_name: &str) -> Option<&str> {
        self.reference_data
            .iter()
            .filter(|(key, _)| layer_name.contains(key.as_str()))
            .filter_map(|(_, url)| url.as_str())
            .last()
    }

    /// Broker WebSocket endpoint derived from `baseURL`.
    pub fn broker_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/app-sender/websocket")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::TopicClass;

    const SAMPLE: &str = r#"{
        "models": ["trafficTopics"],
        "trafficTopics": [
            {"type": "traffic", "region": "all", "topicForResults": "/topic/traffic-results", "topicForChanges": "/topic/traffic-changes"}
        ],
        "dev-mode": true,
        "baseURL": "https://services.example.eu/",
        "referenceData": {"flanders": "https://geo.example/flanders.json"},
        "casesURL": "https://cases.example"
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config = DuetConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.models, vec!["trafficTopics"]);
        assert_eq!(config.mode(), DeploymentMode::Dev);
        assert_eq!(config.topic_prefix, "/topic/");
        assert_eq!(config.region_hierarchy["flanders"], vec!["gent"]);

        let topics = config.topic_table("trafficTopics").unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].class, TopicClass::Traffic);
    }

    #[test]
    fn test_missing_table_is_config_error() {
        let config = DuetConfig::from_json_str(r#"{"models": ["nope"]}"#).unwrap();
        assert!(matches!(config.topic_table("nope"), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_broker_url() {
        let config = DuetConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.broker_url(), "wss://services.example.eu/app-sender/websocket");
    }

    #[test]
    fn test_reference_url_override() {
        let config = DuetConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(
            config.reference_url_for("road-network-calculation-result-flanders"),
            Some("https://geo.example/flanders.json")
        );
        assert_eq!(config.reference_url_for("pilsen-network"), None);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            max_retries: 5,
            stable_after_ms: 1_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(50), Duration::from_millis(1_000));
        assert_eq!(policy.stable_after(), Duration::from_secs(1));
    }

    #[test]
    fn test_reference_data_last_match_in_file_order() {
        let config = DuetConfig::from_json_str(
            r#"{"referenceData": {
                "road-network": "https://geo.example/roads.json",
                "flanders": "https://geo.example/flanders.json"
            }}"#,
        )
        .unwrap();
        assert_eq!(
            config.reference_url_for("road-network-calculation-result-flanders"),
            Some("https://geo.example/flanders.json")
        );
        assert_eq!(config.reference_url_for("road-network-gent"), Some("https://geo.example/roads.json"));
    }

    #[test]
    fn test_request_target_prefers_gateway() {
        let mut config = DuetConfig::default();
        assert_eq!(config.request_target(None), None);
        assert_eq!(
            config.request_target(Some("/topic/requests")),
            Some(RequestTarget::Broker("/topic/requests".to_string()))
        );

        config.app_receiver_url = "https://services.example.eu/app-receiver/gateway".to_string();
        assert_eq!(
            config.request_target(Some("/topic/requests")),
            Some(RequestTarget::Gateway("https://services.example.eu/app-receiver/gateway".to_string()))
        );
    }
}
