//! Per-dataset rules: which attribute identifies a feature and whether the
//! lateral line offset is applied.
//!
//! Layer names embed the dataset name (`<dataset>_reference`,
//! `<dataset>_result`, `<dataset>_delta`). Resolution strips the role suffix
//! and looks the dataset up by exact name first, then by alias, then by
//! substring for legacy layer names.

use crate::layers::LayerRole;
use serde::{Deserialize, Serialize};

/// Identifier attribute used when no dataset rule matches.
pub const DEFAULT_ID_ATTRIBUTE: &str = "id";

/// Feature id whose first coordinate is known to be malformed.
pub const DEFAULT_OFFSET_EXCEPTION_ID: &str = "8344";

/// Line offset rule of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OffsetRule {
    /// Apply the lateral offset to line features
    pub enabled: bool,

    /// Feature id that drops its first coordinate before offsetting
    pub drop_first_for: Option<String>,
}

impl OffsetRule {
    /// Offset enabled with the default malformed-feature exception.
    pub fn with_default_exception() -> Self {
        Self {
            enabled: true,
            drop_first_for: Some(DEFAULT_OFFSET_EXCEPTION_ID.to_string()),
        }
    }

    /// Offset enabled without exceptions.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            drop_first_for: None,
        }
    }
}

/// One entry of the dataset table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDescriptor {
    /// Dataset name as it appears in layer names
    pub name: String,

    /// Attribute that carries the feature identifier; `None` infers it
    #[serde(default)]
    pub id_attribute: Option<String>,

    #[serde(default)]
    pub offset: OffsetRule,

    /// Other names the dataset is published under
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl DatasetDescriptor {
    /// Creates a descriptor with no aliases.
    pub fn new(name: &str, id_attribute: Option<&str>, offset: OffsetRule) -> Self {
        Self {
            name: name.to_string(),
            id_attribute: id_attribute.map(str::to_string),
            offset,
            aliases: Vec::new(),
        }
    }

    /// Adds an alias (builder style).
    pub fn with_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    /// Attribute used to look features up, falling back to `id`.
    pub fn id_attribute_or_default(&self) -> &str {
        self.id_attribute.as_deref().unwrap_or(DEFAULT_ID_ATTRIBUTE)
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Generic descriptor for datasets without an entry.
    pub fn generic(name: &str) -> Self {
        Self::new(name, None, OffsetRule::default())
    }
}

/// The built-in dataset table for the DUET pilots.
pub fn default_dataset_table() -> Vec<DatasetDescriptor> {
    vec![
        DatasetDescriptor::new(
            "road-network-calculation-result-flanders",
            Some("link_id"),
            OffsetRule::with_default_exception(),
        )
        .with_alias("flanders"),
        DatasetDescriptor::new("kul-gent-traffic-results", Some("link_id"), OffsetRule::with_default_exception())
            .with_alias("kul"),
        DatasetDescriptor::new("gent_road_network", None, OffsetRule::enabled()).with_alias("gent"),
        DatasetDescriptor::new("traffic_links_antwerp", None, OffsetRule::enabled()),
        DatasetDescriptor::new("road-network-calculation-result-pilsen", Some("edge_id"), OffsetRule::default())
            .with_alias("pilsen"),
        DatasetDescriptor::new("road-network-calculation-result-athens", Some("edge_id"), OffsetRule::default())
            .with_alias("athens"),
    ]
}

/// Lookup over the configured dataset descriptors.
#[derive(Debug, Clone)]
pub struct DatasetTable {
    entries: Vec<DatasetDescriptor>,
}

impl Default for DatasetTable {
    fn default() -> Self {
        Self::new(default_dataset_table())
    }
}

impl DatasetTable {
    pub fn new(entries: Vec<DatasetDescriptor>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[DatasetDescriptor] {
        &self.entries
    }

    /// Resolves the descriptor for a layer name.
    ///
    /// Order: exact dataset name, exact alias, then the longest name or
    /// alias contained in the layer name. Unknown layers get a generic
    /// descriptor (identifier inferred, no offset).
    pub fn resolve(&self, layer_name: &str) -> DatasetDescriptor {
        let dataset = LayerRole::strip_suffix(layer_name).to_ascii_lowercase();

        if let Some(found) = self.entries.iter().find(|d| d.name.eq_ignore_ascii_case(&dataset)) {
            return found.clone();
        }
        if let Some(found) = self
            .entries
            .iter()
            .find(|d| d.aliases.iter().any(|a| a.eq_ignore_ascii_case(&dataset)))
        {
            return found.clone();
        }

        let mut best: Option<(usize, &DatasetDescriptor)> = None;
        for descriptor in &self.entries {
            for name in descriptor.names() {
                let name = name.to_ascii_lowercase();
                if dataset.contains(&name) && best.map_or(true, |(len, _)| name.len() > len) {
                    best = Some((name.len(), descriptor));
                }
            }
        }
        best.map(|(_, d)| d.clone())
            .unwrap_or_else(|| DatasetDescriptor::generic(&dataset))
    }
}
