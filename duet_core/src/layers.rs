//! Layer definitions and the active-layer registry.
//!
//! Simulation results surface as layers tagged `simresults.<class>`:
//! tiled raster layers for TNO/VITO air and noise maps, and the vector tile
//! triad (`_reference`, `_result`, `_delta`) for network results.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Category prefix of every simulation result layer.
pub const SIMRESULTS_PREFIX: &str = "simresults.";

/// Layers whose names contain this are never switched off by the policy.
pub const ROAD_CLOSURES_MARKER: &str = "roadClosures";

/// Role of a layer within its triad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerRole {
    Reference,
    Result,
    Delta,
}

impl LayerRole {
    pub const ALL: [LayerRole; 3] = [LayerRole::Reference, LayerRole::Result, LayerRole::Delta];

    /// Name suffix, e.g. `_reference`.
    pub fn suffix(&self) -> &'static str {
        match self {
            LayerRole::Reference => "_reference",
            LayerRole::Result => "_result",
            LayerRole::Delta => "_delta",
        }
    }

    /// Appends the role suffix to a base name.
    pub fn layer_name(&self, base: &str) -> String {
        format!("{base}{}", self.suffix())
    }

    /// The role encoded in a layer name, if any.
    pub fn of_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| name.ends_with(role.suffix()))
    }

    /// Strips a trailing role suffix.
    pub fn strip_suffix(name: &str) -> &str {
        Self::ALL
            .iter()
            .find_map(|role| name.strip_suffix(role.suffix()))
            .unwrap_or(name)
    }
}

/// Tile matrix layout of a raster layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TilingSchema {
    Mercator,
    Geographic,
}

/// Geographic extent `[min_lon, min_lat, max_lon, max_lat]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent(pub [f64; 4]);

impl Extent {
    /// Europe-wide default used when the session has no region extent.
    pub const EUROPE: Extent = Extent([
        -16.551070887660167,
        33.71204131312285,
        37.151568857997155,
        58.620157267889056,
    ]);
}

impl Default for Extent {
    fn default() -> Self {
        Self::EUROPE
    }
}

/// A WMTS-like raster layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterLayerSpec {
    /// URL template with `{TileMatrix}/{TileCol}/{TileRow}` placeholders
    pub url: String,
    pub tiling: TilingSchema,
    pub extent: Extent,
    pub opacity: f64,
    pub max_level: u8,
    pub tile_size: [u32; 2],
}

impl RasterLayerSpec {
    pub const DEFAULT_OPACITY: f64 = 0.5;
    pub const DEFAULT_MAX_LEVEL: u8 = 19;
    pub const DEFAULT_TILE_SIZE: [u32; 2] = [256, 256];

    /// Builds a raster spec from an `{z}/{x}/{y}` URL.
    pub fn new(url: &str, tiling: TilingSchema, extent: Extent) -> Self {
        Self {
            url: to_wmts_template(url),
            tiling,
            extent,
            opacity: Self::DEFAULT_OPACITY,
            max_level: Self::DEFAULT_MAX_LEVEL,
            tile_size: Self::DEFAULT_TILE_SIZE,
        }
    }
}

/// Rewrites `{z}/{x}/{y}` into the WMTS placeholders.
pub fn to_wmts_template(url: &str) -> String {
    url.replace("{z}/{x}/{y}", "{TileMatrix}/{TileCol}/{TileRow}")
}

/// A vector tile layer over a static GeoJSON geometry source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorLayerSpec {
    pub geometry_url: String,
    pub min_level: u8,
    pub max_level: u8,
}

impl VectorLayerSpec {
    pub const DEFAULT_MIN_LEVEL: u8 = 13;
    pub const DEFAULT_MAX_LEVEL: u8 = 21;

    pub fn new(geometry_url: &str) -> Self {
        Self {
            geometry_url: geometry_url.to_string(),
            min_level: Self::DEFAULT_MIN_LEVEL,
            max_level: Self::DEFAULT_MAX_LEVEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LayerKind {
    Raster(RasterLayerSpec),
    VectorTile(VectorLayerSpec),
}

/// A layer handed to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDefinition {
    pub name: String,
    pub title: String,

    /// Content category, e.g. `simresults.traffic`
    pub duet_type: String,

    pub role: Option<LayerRole>,

    /// Attribution (`TNO`, `VITO`, `DUET`)
    pub provider: String,

    /// Scenario that produced the layer
    pub scenario_id: String,

    pub kind: LayerKind,
}

impl LayerDefinition {
    /// True for layers created from simulation results.
    pub fn is_simulation_result(&self) -> bool {
        self.duet_type.starts_with(SIMRESULTS_PREFIX)
    }

    /// True if the name marks a delta layer.
    pub fn is_delta(&self) -> bool {
        self.name.contains(LayerRole::Delta.suffix())
    }

    /// Whether the activation policy switches this layer on.
    pub fn should_be_active(&self) -> bool {
        !(self.is_simulation_result() && !self.is_delta() && !self.name.contains(ROAD_CLOSURES_MARKER))
    }
}

/// Builds the `simresults.<class>` category.
pub fn simresults_type(class: &str) -> String {
    format!("{SIMRESULTS_PREFIX}{class}")
}

// ============================================================================
// REGISTRY
// ============================================================================

/// The active-layer registry of the rendering side.
pub trait LayerRegistry: Send + Sync {
    /// Adds a layer. Adding an existing name replaces its definition.
    fn add(&self, layer: LayerDefinition) -> CoreResult<()>;

    fn activate(&self, name: &str) -> CoreResult<()>;

    fn deactivate(&self, name: &str) -> CoreResult<()>;

    fn remove(&self, name: &str) -> CoreResult<LayerDefinition>;

    fn get(&self, name: &str) -> Option<LayerDefinition>;

    fn is_active(&self, name: &str) -> bool;

    /// All layer names in sorted order.
    fn names(&self) -> Vec<String>;
}

/// Switches delta and non-simulation layers on and other simulation
/// layers off.
pub fn apply_activation_policy(registry: &dyn LayerRegistry) -> CoreResult<()> {
    for name in registry.names() {
        let Some(layer) = registry.get(&name) else {
            continue;
        };
        if layer.should_be_active() {
            registry.activate(&name)?;
        } else {
            registry.deactivate(&name)?;
        }
    }
    Ok(())
}

#[derive(Debug)]
struct RegisteredLayer {
    definition: LayerDefinition,
    active: bool,
}

/// Registry kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryLayerRegistry {
    layers: Mutex<BTreeMap<String, RegisteredLayer>>,
}

impl InMemoryLayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn layers(&self) -> MutexGuard<'_, BTreeMap<String, RegisteredLayer>> {
        self.layers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_active(&self, name: &str, active: bool) -> CoreResult<()> {
        let mut layers = self.layers();
        let layer = layers
            .get_mut(name)
            .ok_or_else(|| CoreError::layer(format!("unknown layer {name}")))?;
        if layer.active != active {
            layer.active = active;
            debug!(layer = name, active, "layer activation changed");
        }
        Ok(())
    }

    /// Names of the currently active layers.
    pub fn active_names(&self) -> Vec<String> {
        self.layers()
            .iter()
            .filter(|(_, l)| l.active)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

impl LayerRegistry for InMemoryLayerRegistry {
    fn add(&self, layer: LayerDefinition) -> CoreResult<()> {
        info!(layer = %layer.name, duet_type = %layer.duet_type, "layer added");
        self.layers().insert(
            layer.name.clone(),
            RegisteredLayer {
                definition: layer,
                active: false,
            },
        );
        Ok(())
    }

    fn activate(&self, name: &str) -> CoreResult<()> {
        self.set_active(name, true)
    }

    fn deactivate(&self, name: &str) -> CoreResult<()> {
        self.set_active(name, false)
    }

    fn remove(&self, name: &str) -> CoreResult<LayerDefinition> {
        self.layers()
            .remove(name)
            .map(|l| l.definition)
            .ok_or_else(|| CoreError::layer(format!("unknown layer {name}")))
    }

    fn get(&self, name: &str) -> Option<LayerDefinition> {
        self.layers().get(name).map(|l| l.definition.clone())
    }

    fn is_active(&self, name: &str) -> bool {
        self.layers().get(name).map(|l| l.active).unwrap_or(false)
    }

    fn names(&self) -> Vec<String> {
        self.layers().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector_layer(name: &str, duet_type: &str) -> LayerDefinition {
        LayerDefinition {
            name: name.to_string(),
            title: name.to_string(),
            duet_type: duet_type.to_string(),
            role: LayerRole::of_name(name),
            provider: "DUET".to_string(),
            scenario_id: "s1".to_string(),
            kind: LayerKind::VectorTile(VectorLayerSpec::new("https://geo.example/net.json")),
        }
    }

    #[test]
    fn test_role_suffixes() {
        assert_eq!(LayerRole::Result.layer_name("net"), "net_result");
        assert_eq!(LayerRole::of_name("net_delta"), Some(LayerRole::Delta));
        assert_eq!(LayerRole::of_name("net"), None);
        assert_eq!(LayerRole::strip_suffix("net_reference"), "net");
        assert_eq!(LayerRole::strip_suffix("net"), "net");
    }

    #[test]
    fn test_wmts_template() {
        assert_eq!(
            to_wmts_template("https://tiles.example/air/{z}/{x}/{y}.png"),
            "https://tiles.example/air/{TileMatrix}/{TileCol}/{TileRow}.png"
        );
        let spec = RasterLayerSpec::new("https://t/{z}/{x}/{y}", TilingSchema::Mercator, Extent::default());
        assert_eq!(spec.opacity, 0.5);
        assert_eq!(spec.max_level, 19);
        assert_eq!(spec.tile_size, [256, 256]);
        assert_eq!(spec.extent, Extent::EUROPE);
    }

    #[test]
    fn test_activation_policy() {
        let registry = InMemoryLayerRegistry::new();
        registry.add(vector_layer("net_reference", "simresults.traffic")).unwrap();
        registry.add(vector_layer("net_result", "simresults.traffic")).unwrap();
        registry.add(vector_layer("net_delta", "simresults.traffic")).unwrap();
        registry.add(vector_layer("roadClosures_s1", "simresults.traffic")).unwrap();
        registry.add(vector_layer("buildings", "basemap")).unwrap();
        registry.activate("net_result").unwrap();

        apply_activation_policy(&registry).unwrap();

        assert_eq!(
            registry.active_names(),
            vec!["buildings", "net_delta", "roadClosures_s1"]
        );
    }

    #[test]
    fn test_unknown_layer_errors() {
        let registry = InMemoryLayerRegistry::new();
        assert!(registry.activate("missing").is_err());
        assert!(registry.remove("missing").is_err());
        assert!(!registry.is_active("missing"));
    }
}
