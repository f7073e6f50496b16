//! Feature Enrichment & Tile Invalidation.
//!
//! A [`TilePipeline`] is installed as the tile-load listener of one vector
//! layer. Every loaded tile goes through three steps:
//!
//! ```text
//!   tile loaded ──► enrich features ──► offset lines ──► redraw 0/0/0
//!                   (result: replace,    (if dataset      (once per
//!                    delta: merge)        enables it)      batch)
//! ```
//!
//! Enrichment is idempotent: a tile that is loaded again, or processed
//! twice, ends up with the same properties.

use crate::datasets::DatasetDescriptor;
use crate::delta::{compute_delta, to_properties};
use crate::offset::OffsetCorrector;
use crate::properties::{normalize_in_place, FeatureKey, PropertyMap};
use crate::tiles::{Tile, TileCoord, TileLoadListener, TileSource};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Identifier keys that are never picked as the record identifier.
const NODE_ID_KEYS: [&str; 2] = ["to_node_id", "from_node_id"];

// ============================================================================
// RESULT HASHMAP
// ============================================================================

/// Feature key → result record. Built once per payload, read-only after.
#[derive(Debug, Clone, Default)]
pub struct ResultHashmap {
    id_attribute: String,
    records: HashMap<FeatureKey, PropertyMap>,
}

impl ResultHashmap {
    /// Builds the hashmap from the payload's result records.
    ///
    /// The record identifier attribute comes from the dataset descriptor if
    /// configured, otherwise it is the first key of the first record that
    /// contains `id` (case-insensitive), ignoring node references. Records
    /// are normalized and get `id` set to their key. Records without an
    /// identifier are skipped.
    pub fn build(records: Vec<PropertyMap>, dataset: &DatasetDescriptor) -> Self {
        let id_attribute = dataset
            .id_attribute
            .clone()
            .or_else(|| infer_id_attribute(records.first()))
            .unwrap_or_else(|| dataset.id_attribute_or_default().to_string());

        let mut map = HashMap::with_capacity(records.len());
        let mut skipped = 0usize;
        for mut record in records {
            let Some(key) = FeatureKey::from_properties(&record, &id_attribute) else {
                skipped += 1;
                continue;
            };
            let identifier = record.get(&id_attribute).cloned().unwrap_or(Value::Null);
            record.insert("id".to_string(), identifier);
            normalize_in_place(&mut record);
            map.insert(key, record);
        }
        if skipped > 0 {
            debug!(skipped, id_attribute = %id_attribute, "result records without identifier");
        }
        Self {
            id_attribute,
            records: map,
        }
    }

    /// Attribute the records were keyed by.
    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    pub fn get(&self, key: &FeatureKey) -> Option<&PropertyMap> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn infer_id_attribute(first: Option<&PropertyMap>) -> Option<String> {
    first?
        .keys()
        .find(|key| {
            let lower = key.to_ascii_lowercase();
            lower.contains("id") && !NODE_ID_KEYS.iter().any(|n| lower.contains(n))
        })
        .cloned()
}

// ============================================================================
// TILE PIPELINE
// ============================================================================

/// How a layer's features take on result data.
#[derive(Debug, Clone)]
pub enum EnrichmentMode {
    /// Reference layer: properties untouched
    None,
    /// Result layer: properties become the result record
    Replace(Arc<ResultHashmap>),
    /// Delta layer: delta against the current properties merged on top
    Delta(Arc<ResultHashmap>),
}

/// Counters of one pipeline, for diagnostics and tests.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub tiles: AtomicU64,
    pub enriched: AtomicU64,
    pub unmatched: AtomicU64,
    pub offset_failures: AtomicU64,
}

/// Tile-load listener of one vector layer.
pub struct TilePipeline {
    layer_name: String,
    mode: EnrichmentMode,

    /// Attribute features are looked up by
    id_attribute: String,

    offset: Option<OffsetCorrector>,
    stats: PipelineStats,
}

impl TilePipeline {
    /// Creates the pipeline for a layer of the given dataset.
    pub fn new(layer_name: impl Into<String>, mode: EnrichmentMode, dataset: &DatasetDescriptor) -> Self {
        let id_attribute = dataset.id_attribute_or_default().to_string();
        let offset = dataset
            .offset
            .enabled
            .then(|| OffsetCorrector::new(dataset.offset.clone(), id_attribute.clone()));
        Self {
            layer_name: layer_name.into(),
            mode,
            id_attribute,
            offset,
            stats: PipelineStats::default(),
        }
    }

    /// True if the pipeline would change anything.
    pub fn is_needed(&self) -> bool {
        !matches!(self.mode, EnrichmentMode::None) || self.offset.is_some()
    }

    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Enriches and offsets one tile in place. Returns whether anything
    /// in the tile was touched.
    pub fn process(&self, tile: &mut Tile) -> bool {
        self.stats.tiles.fetch_add(1, Ordering::Relaxed);
        let mut touched = false;

        match &self.mode {
            EnrichmentMode::None => {}
            EnrichmentMode::Replace(hashmap) => {
                for feature in tile.features.iter_mut() {
                    let Some(record) = self.lookup(hashmap, &feature.properties) else {
                        continue;
                    };
                    let identifier = feature.properties.get(&self.id_attribute).cloned();
                    feature.properties = record.clone();
                    if let Some(identifier) = identifier {
                        feature.properties.insert(self.id_attribute.clone(), identifier);
                    }
                    touched = true;
                }
            }
            EnrichmentMode::Delta(hashmap) => {
                for feature in tile.features.iter_mut() {
                    let Some(record) = self.lookup(hashmap, &feature.properties) else {
                        continue;
                    };
                    let delta = compute_delta(&feature.properties, record);
                    feature.properties.extend(to_properties(&delta));
                    touched = true;
                }
            }
        }

        if let Some(corrector) = &self.offset {
            let report = corrector.apply(&mut tile.features);
            self.stats.offset_failures.fetch_add(report.failed as u64, Ordering::Relaxed);
            touched |= report.offset > 0;
        }
        touched
    }

    fn lookup<'a>(&self, hashmap: &'a ResultHashmap, properties: &PropertyMap) -> Option<&'a PropertyMap> {
        let found = FeatureKey::from_properties(properties, &self.id_attribute).and_then(|key| hashmap.get(&key));
        if found.is_some() {
            self.stats.enriched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
        }
        found
    }
}

impl TileLoadListener for TilePipeline {
    fn on_tile_loaded(&self, tile: &mut Tile, source: &dyn TileSource) {
        let touched = self.process(tile);
        trace!(layer = %self.layer_name, tile = %tile.coord, touched, "tile processed");
        source.redraw(&[TileCoord::ROOT]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::{DatasetTable, OffsetRule};
    use crate::tiles::{MemoryTileSource, TileFeature};
    use geo::line_string;
    use serde_json::json;

    fn map(value: Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    fn flanders() -> DatasetDescriptor {
        DatasetTable::default().resolve("road-network-calculation-result-flanders_result")
    }

    fn tile(features: Vec<PropertyMap>) -> Tile {
        Tile::new(
            TileCoord::new(14, 8392, 5467),
            features
                .into_iter()
                .map(|p| TileFeature::new(line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)], p))
                .collect(),
        )
    }

    #[test]
    fn test_hashmap_infers_identifier() {
        let records = vec![
            map(json!({"to_node_id": 1, "from_node_id": 2, "edge_id": 10, "LAEQ": 55})),
            map(json!({"to_node_id": 2, "from_node_id": 3, "edge_id": 11.0, "LAEQ": 56})),
        ];
        let hashmap = ResultHashmap::build(records, &DatasetDescriptor::generic("x"));

        assert_eq!(hashmap.id_attribute(), "edge_id");
        let record = hashmap.get(&FeatureKey::from("11")).unwrap();
        assert_eq!(record["noise"], json!(56));
        assert_eq!(record["id"], json!(11.0));
        assert!(!record.contains_key("LAEQ"));
    }

    #[test]
    fn test_hashmap_uses_configured_identifier() {
        let records = vec![map(json!({"id": 1, "link_id": 500, "flow": 3}))];
        let hashmap = ResultHashmap::build(records, &flanders());
        assert_eq!(hashmap.id_attribute(), "link_id");
        assert!(hashmap.get(&FeatureKey::from("500")).is_some());
    }

    #[test]
    fn test_replace_keeps_identifier_and_is_idempotent() {
        let hashmap = Arc::new(ResultHashmap::build(
            vec![map(json!({"link_id": 7, "flow": 42}))],
            &flanders(),
        ));
        let pipeline = TilePipeline::new("flanders_result", EnrichmentMode::Replace(hashmap), &flanders());

        let mut t = tile(vec![
            map(json!({"link_id": 7, "flow": 1, "name": "Ring"})),
            map(json!({"link_id": 8, "flow": 2})),
        ]);
        pipeline.process(&mut t);
        let first = t.features.iter().map(|f| f.properties.clone()).collect::<Vec<_>>();

        assert_eq!(first[0]["flow"], json!(42));
        assert_eq!(first[0]["link_id"], json!(7));
        assert!(!first[0].contains_key("name"));
        assert_eq!(first[1]["flow"], json!(2));

        pipeline.process(&mut t);
        let second = t.features.iter().map(|f| f.properties.clone()).collect::<Vec<_>>();
        assert_eq!(first, second);
    }

    #[test]
    fn test_delta_merges_on_top_and_is_idempotent() {
        let hashmap = Arc::new(ResultHashmap::build(
            vec![map(json!({"link_id": 7, "traffic": [12, 14]}))],
            &flanders(),
        ));
        let pipeline = TilePipeline::new("flanders_delta", EnrichmentMode::Delta(hashmap), &flanders());

        let mut t = tile(vec![map(json!({"link_id": 7, "flow": [10, 10, 10], "name": "Ring"}))]);
        pipeline.process(&mut t);
        let props = t.features[0].properties.clone();
        assert_eq!(props["flow_delta"], json!([2.0, 4.0]));
        assert_eq!(props["flow"], json!([10, 10, 10]));
        assert_eq!(props["name"], json!("Ring"));

        pipeline.process(&mut t);
        assert_eq!(t.features[0].properties, props);
    }

    #[test]
    fn test_listener_redraws_root_once_per_batch() {
        let dataset = flanders();
        let hashmap = Arc::new(ResultHashmap::build(
            vec![map(json!({"link_id": 1, "flow": 5})), map(json!({"link_id": 2, "flow": 6}))],
            &dataset,
        ));
        let pipeline = Arc::new(TilePipeline::new("flanders_result", EnrichmentMode::Replace(hashmap), &dataset));
        let source = MemoryTileSource::new("flanders_result");
        source.add_listener(pipeline.clone());

        let loaded = source.load_tile(tile(vec![
            map(json!({"link_id": 1})),
            map(json!({"link_id": 2})),
            map(json!({"link_id": 3})),
        ]));

        assert_eq!(source.redraw_requests(), vec![vec![TileCoord::ROOT]]);
        assert!(loaded.features.iter().all(|f| f.offset_applied));
        assert_eq!(pipeline.stats().enriched.load(Ordering::Relaxed), 2);
        assert_eq!(pipeline.stats().unmatched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reference_pipeline_only_offsets() {
        let dataset = DatasetDescriptor::new("gent_road_network", None, OffsetRule::enabled());
        let pipeline = TilePipeline::new("gent_road_network_reference", EnrichmentMode::None, &dataset);
        assert!(pipeline.is_needed());

        let mut t = tile(vec![map(json!({"id": 1, "flow": 1}))]);
        let before = t.features[0].properties.clone();
        assert!(pipeline.process(&mut t));
        assert_eq!(t.features[0].properties, before);
        assert!(t.features[0].offset_applied);

        let plain = TilePipeline::new("x_reference", EnrichmentMode::None, &DatasetDescriptor::generic("x"));
        assert!(!plain.is_needed());
    }
}
