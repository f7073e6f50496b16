//! The Topic Catalog - which broker topics matter for a pilot region.
//!
//! Topic descriptors come from the configuration's topic tables. For a given
//! pilot region the catalog selects every descriptor whose region matches
//! (or is the wildcard `"all"`), pulls in configured sub-regions, removes
//! duplicates and yields a deterministic subscription list.

use crate::config::{DeploymentMode, DuetConfig};
use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Wildcard region matching every pilot.
pub const ALL_REGIONS: &str = "all";

/// Message class a topic carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TopicClass {
    Traffic,
    Noise,
    Air,
    Control,
    Error,
    /// Any other class name ("misc" topics)
    Other(String),
}

impl TopicClass {
    /// Resolution order of the well-known classes; misc classes follow.
    pub const RESOLUTION_ORDER: [TopicClass; 5] = [
        TopicClass::Traffic,
        TopicClass::Air,
        TopicClass::Noise,
        TopicClass::Error,
        TopicClass::Control,
    ];

    /// Returns the class name as used in configuration.
    pub fn as_str(&self) -> &str {
        match self {
            TopicClass::Traffic => "traffic",
            TopicClass::Noise => "noise",
            TopicClass::Air => "air",
            TopicClass::Control => "control",
            TopicClass::Error => "error",
            TopicClass::Other(name) => name,
        }
    }

    /// True for traffic, noise and air topics.
    pub fn is_simulation_result(&self) -> bool {
        matches!(self, TopicClass::Traffic | TopicClass::Noise | TopicClass::Air)
    }
}

impl From<String> for TopicClass {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "traffic" => TopicClass::Traffic,
            "noise" => TopicClass::Noise,
            "air" => TopicClass::Air,
            "control" => TopicClass::Control,
            "error" => TopicClass::Error,
            _ => TopicClass::Other(value),
        }
    }
}

impl From<TopicClass> for String {
    fn from(value: TopicClass) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for TopicClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One topic entry from a configuration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDescriptor {
    /// Message class
    #[serde(rename = "type")]
    pub class: TopicClass,

    /// Pilot region, or `"all"`
    pub region: String,

    /// Topic the simulation publishes results on
    #[serde(default)]
    pub topic_for_results: String,

    /// Topic carrying change requests / control messages
    #[serde(default)]
    pub topic_for_changes: String,
}

impl TopicDescriptor {
    /// Creates a descriptor.
    pub fn new(class: TopicClass, region: &str, results: &str, changes: &str) -> Self {
        Self {
            class,
            region: region.to_string(),
            topic_for_results: results.to_string(),
            topic_for_changes: changes.to_string(),
        }
    }

    /// True if this descriptor serves the given region.
    pub fn matches_region(&self, region: &str) -> bool {
        self.region.eq_ignore_ascii_case(region) || self.region.eq_ignore_ascii_case(ALL_REGIONS)
    }

    /// Broker destination to subscribe to in the given mode.
    ///
    /// Results topic unless it is empty or the class is control, in which
    /// case the changes topic is used.
    pub fn destination(&self, mode: DeploymentMode) -> String {
        let base = if !self.topic_for_results.is_empty() && self.class != TopicClass::Control {
            &self.topic_for_results
        } else {
            &self.topic_for_changes
        };
        mode.apply(base)
    }

    fn dedup_key(&self) -> (String, TopicClass) {
        (self.topic_for_results.clone(), self.class.clone())
    }
}

/// A resolved subscription: destination plus the descriptor it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    /// Broker destination, including prefix and mode suffix
    pub destination: String,

    /// Originating descriptor
    pub descriptor: TopicDescriptor,
}

/// Descriptors grouped by class, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct TopicCatalog {
    by_class: BTreeMap<TopicClass, Vec<TopicDescriptor>>,
    region_hierarchy: BTreeMap<String, Vec<String>>,
}

impl TopicCatalog {
    /// Builds the catalog from every table listed in `models`.
    pub fn from_config(config: &DuetConfig) -> CoreResult<Self> {
        let mut descriptors = Vec::new();
        for table in &config.models {
            descriptors.extend(config.topic_table(table)?);
        }
        Ok(Self::new(descriptors, config.region_hierarchy.clone()))
    }

    /// Builds a catalog from descriptors and a region hierarchy.
    pub fn new(descriptors: Vec<TopicDescriptor>, region_hierarchy: BTreeMap<String, Vec<String>>) -> Self {
        let mut by_class: BTreeMap<TopicClass, Vec<TopicDescriptor>> = BTreeMap::new();
        for descriptor in descriptors {
            by_class.entry(descriptor.class.clone()).or_default().push(descriptor);
        }
        let region_hierarchy = region_hierarchy
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self { by_class, region_hierarchy }
    }

    /// Number of descriptors in the catalog.
    pub fn len(&self) -> usize {
        self.by_class.values().map(Vec::len).sum()
    }

    /// True if the catalog holds no descriptors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sub-regions configured for a super-region.
    pub fn sub_regions(&self, region: &str) -> &[String] {
        self.region_hierarchy
            .get(&region.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Descriptors relevant to a region, deduplicated on
    /// `(topicForResults, type)` with the first occurrence kept.
    pub fn resolve(&self, region: &str) -> Vec<TopicDescriptor> {
        let mut regions: Vec<&str> = self.sub_regions(region).iter().map(String::as_str).collect();
        regions.push(region);

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for r in regions {
            for descriptor in self.for_region(r) {
                if seen.insert(descriptor.dedup_key()) {
                    resolved.push(descriptor.clone());
                }
            }
        }
        resolved
    }

    /// Resolved descriptors turned into broker subscriptions.
    pub fn routes(&self, region: &str, mode: DeploymentMode) -> Vec<TopicRoute> {
        self.resolve(region)
            .into_iter()
            .map(|descriptor| TopicRoute {
                destination: descriptor.destination(mode),
                descriptor,
            })
            .collect()
    }

    /// Matching descriptors of one region in class resolution order.
    fn for_region<'a>(&'a self, region: &'a str) -> impl Iterator<Item = &'a TopicDescriptor> + 'a {
        let known = TopicClass::RESOLUTION_ORDER
            .iter()
            .filter_map(|class| self.by_class.get(class));
        let misc = self
            .by_class
            .iter()
            .filter(|(class, _)| matches!(class, TopicClass::Other(_)))
            .map(|(_, list)| list);
        known
            .chain(misc)
            .flat_map(|list| list.iter())
            .filter(move |d| d.matches_region(region))
    }
}

/// Strips the transport prefix from a destination to recover the semantic topic.
pub fn semantic_topic<'a>(destination: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return destination;
    }
    destination.strip_prefix(prefix).unwrap_or(destination)
}
