//! The result-sync session.
//!
//! One explicit object owns everything a running viewer session needs:
//! configuration, dataset table, pending scenarios, the layer registry,
//! the tile source factory, notifications and per-scenario bookkeeping.
//!
//! Scenario lifecycle:
//!
//! ```text
//!   request_scenario ──► Pending ──claim──► Matched ──layers built──► Enriching
//!                          ▲                   │                          │
//!                          └──── failure ──────┘      remove_scenario_layers
//!                                                                         ▼
//!                                                                      (gone)
//! ```

use crate::config::DuetConfig;
use crate::datasets::DatasetTable;
use crate::enrichment::{EnrichmentMode, ResultHashmap, TilePipeline};
use crate::error::{CoreError, CoreResult};
use crate::layers::{
    apply_activation_policy, simresults_type, Extent, LayerDefinition, LayerKind, LayerRegistry, LayerRole,
    VectorLayerSpec,
};
use crate::notify::Notifications;
use crate::payload::{raster_layers, request_scenario_id, RasterProvider, ResultClass, VectorResult};
use crate::pending::PendingScenarios;
use crate::subscription::RequestPublisher;
use crate::tiles::{ListenerId, TileSource, TileSourceFactory};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Where a scenario is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioPhase {
    /// Requested, no result yet
    Pending,
    /// Result accepted, layers being built
    Matched,
    /// Layers live, tiles enriched as they load
    Enriching,
}

/// A tile listener installed for a scenario.
struct InstalledListener {
    source: Arc<dyn TileSource>,
    id: ListenerId,
}

/// Bookkeeping of a matched scenario.
struct ActiveResult {
    phase: ScenarioPhase,
    class: ResultClass,
    layers: Vec<String>,
    listeners: Vec<InstalledListener>,
}

/// Summary of a matched scenario, for callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioSummary {
    pub scenario_id: String,
    pub phase: ScenarioPhase,
    pub class: ResultClass,
    pub layers: Vec<String>,
}

/// A running result-sync session.
pub struct Session {
    config: DuetConfig,
    datasets: DatasetTable,
    pending: PendingScenarios,
    registry: Arc<dyn LayerRegistry>,
    tiles: Arc<dyn TileSourceFactory>,
    notifications: Arc<Notifications>,
    extent: Mutex<Extent>,
    results: Mutex<BTreeMap<String, ActiveResult>>,
}

impl Session {
    /// Creates a session over the given registry and tile source factory.
    pub fn new(config: DuetConfig, registry: Arc<dyn LayerRegistry>, tiles: Arc<dyn TileSourceFactory>) -> Self {
        let datasets = DatasetTable::new(config.datasets.clone());
        Self {
            config,
            datasets,
            pending: PendingScenarios::new(),
            registry,
            tiles,
            notifications: Arc::new(Notifications::new()),
            extent: Mutex::new(Extent::default()),
            results: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &DuetConfig {
        &self.config
    }

    pub fn datasets(&self) -> &DatasetTable {
        &self.datasets
    }

    pub fn pending(&self) -> &PendingScenarios {
        &self.pending
    }

    pub fn registry(&self) -> &Arc<dyn LayerRegistry> {
        &self.registry
    }

    pub fn notifications(&self) -> &Arc<Notifications> {
        &self.notifications
    }

    /// Extent raster layers are clipped to.
    pub fn region_extent(&self) -> Extent {
        *self.extent.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_region_extent(&self, extent: Extent) {
        *self.extent.lock().unwrap_or_else(|e| e.into_inner()) = extent;
    }

    fn results(&self) -> MutexGuard<'_, BTreeMap<String, ActiveResult>> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Scenario bookkeeping
    // ------------------------------------------------------------------------

    /// Registers a scenario id whose result is awaited.
    pub fn register_scenario(&self, scenario_id: &str) -> bool {
        let added = self.pending.insert(scenario_id);
        if added {
            info!(scenario = scenario_id, "awaiting simulation result");
        }
        added
    }

    /// Publishes a scenario request and registers its id once the publish
    /// succeeded.
    ///
    /// # Returns
    /// The scenario id: the request's `scenarioid`, or `payload.scenarioid`
    /// for gateway envelopes `{payload, clientID, topic}`.
    pub async fn request_scenario(
        &self,
        publisher: &dyn RequestPublisher,
        destination: &str,
        payload: &Value,
    ) -> CoreResult<String> {
        let id = request_scenario_id(payload)
            .ok_or_else(|| CoreError::malformed("request has no scenarioid", payload.to_string()))?;
        if let Err(e) = publisher.publish(destination, &payload.to_string()).await {
            self.notifications
                .error("session", format!("Scenario {id} could not be requested: {e}"));
            return Err(e);
        }
        self.register_scenario(&id);
        Ok(id)
    }

    /// Current phase of a scenario; `None` if unknown or removed.
    pub fn phase(&self, scenario_id: &str) -> Option<ScenarioPhase> {
        if let Some(result) = self.results().get(scenario_id) {
            return Some(result.phase);
        }
        self.pending.contains(scenario_id).then_some(ScenarioPhase::Pending)
    }

    /// Matched scenarios in id order.
    pub fn active_scenarios(&self) -> Vec<ScenarioSummary> {
        self.results()
            .iter()
            .map(|(id, r)| ScenarioSummary {
                scenario_id: id.clone(),
                phase: r.phase,
                class: r.class,
                layers: r.layers.clone(),
            })
            .collect()
    }

    /// Records that a claimed result is being handled.
    pub(crate) fn mark_matched(&self, scenario_id: &str, class: ResultClass) {
        self.results().insert(
            scenario_id.to_string(),
            ActiveResult {
                phase: ScenarioPhase::Matched,
                class,
                layers: Vec::new(),
                listeners: Vec::new(),
            },
        );
        debug!(scenario = scenario_id, %class, "scenario matched");
    }

    fn mark_enriching(&self, scenario_id: &str) {
        if let Some(result) = self.results().get_mut(scenario_id) {
            result.phase = ScenarioPhase::Enriching;
        }
    }

    fn track_layer(&self, scenario_id: &str, layer: &str, listener: Option<InstalledListener>) {
        if let Some(result) = self.results().get_mut(scenario_id) {
            result.layers.push(layer.to_string());
            result.listeners.extend(listener);
        }
    }

    /// Undoes a failed handling: layers built so far are removed and the
    /// scenario goes back to plain pending.
    pub(crate) fn rollback(&self, scenario_id: &str) {
        if let Err(e) = self.remove_scenario_layers(scenario_id) {
            warn!(scenario = scenario_id, error = %e, "rollback incomplete");
        }
    }

    // ------------------------------------------------------------------------
    // Layer construction
    // ------------------------------------------------------------------------

    fn add_layer(&self, scenario_id: &str, layer: LayerDefinition) -> CoreResult<String> {
        let name = layer.name.clone();
        self.registry.add(layer)?;
        self.registry.activate(&name)?;
        self.track_layer(scenario_id, &name, None);
        Ok(name)
    }

    /// Adds one raster layer per URL key.
    pub fn add_raster_result(
        &self,
        provider: RasterProvider,
        label: &str,
        scenario_id: &str,
        urls: &[(String, String)],
    ) -> CoreResult<Vec<String>> {
        if urls.is_empty() {
            return Err(CoreError::malformed(
                format!("{} result for {scenario_id} has no tile URLs", provider.attribution()),
                String::new(),
            ));
        }
        let mut names = Vec::new();
        for layer in raster_layers(provider, label, scenario_id, urls, self.region_extent()) {
            names.push(self.add_layer(scenario_id, layer)?);
        }
        Ok(names)
    }

    /// Builds the reference/result/delta triad for a vector result and
    /// installs the tile pipelines.
    ///
    /// Triad names come from the dataset, so a later scenario on the same
    /// dataset replaces the earlier one: its layers and listeners are removed
    /// first.
    pub async fn add_vector_result(&self, class: ResultClass, result: VectorResult) -> CoreResult<Vec<String>> {
        let base = result.base_name(class);
        let triad: Vec<String> = LayerRole::ALL.iter().map(|role| role.layer_name(&base)).collect();
        self.evict_layer_owners(&result.scenario_id, &triad)?;
        let geometry_url = self
            .config
            .reference_url_for(&base)
            .unwrap_or(&result.geometry_url)
            .to_string();
        let dataset = self.datasets.resolve(&base);
        let hashmap = Arc::new(ResultHashmap::build(result.records, &dataset));
        info!(
            scenario = %result.scenario_id,
            layer = %base,
            records = hashmap.len(),
            id_attribute = hashmap.id_attribute(),
            "building result layers"
        );
        self.notifications
            .info("session", format!("Results for {base} will be loaded, please be patient"));

        let spec = VectorLayerSpec::new(&geometry_url);
        let mut names = Vec::with_capacity(LayerRole::ALL.len());
        for role in LayerRole::ALL {
            let name = role.layer_name(&base);
            let role_label = format!("{role:?}").to_ascii_lowercase();
            self.registry.add(LayerDefinition {
                name: name.clone(),
                title: format!("{class} {role_label}"),
                duet_type: simresults_type(class.as_str()),
                role: Some(role),
                provider: "DUET".to_string(),
                scenario_id: result.scenario_id.clone(),
                kind: LayerKind::VectorTile(spec.clone()),
            })?;
            self.registry.activate(&name)?;

            let mode = match role {
                LayerRole::Reference => EnrichmentMode::None,
                LayerRole::Result => EnrichmentMode::Replace(Arc::clone(&hashmap)),
                LayerRole::Delta => EnrichmentMode::Delta(Arc::clone(&hashmap)),
            };
            let pipeline = TilePipeline::new(name.clone(), mode, &dataset);
            let listener = if pipeline.is_needed() {
                let source = self.tiles.open(&name, &spec)?;
                source.ready().await?;
                let id = source.add_listener(Arc::new(pipeline));
                Some(InstalledListener { source, id })
            } else {
                None
            };
            self.track_layer(&result.scenario_id, &name, listener);
            names.push(name);
        }
        Ok(names)
    }

    /// Switches delta layers on and other result layers off, then marks the
    /// scenario enriching.
    pub(crate) fn finish_result(&self, scenario_id: &str) -> CoreResult<()> {
        apply_activation_policy(self.registry.as_ref())?;
        self.mark_enriching(scenario_id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Removes every other scenario that owns one of `names`.
    fn evict_layer_owners(&self, scenario_id: &str, names: &[String]) -> CoreResult<()> {
        let owners: Vec<String> = self
            .results()
            .iter()
            .filter(|(id, r)| id.as_str() != scenario_id && r.layers.iter().any(|l| names.contains(l)))
            .map(|(id, _)| id.clone())
            .collect();
        for owner in owners {
            let removed = self.remove_scenario_layers(&owner)?;
            info!(replaced = %owner, by = scenario_id, removed, "scenario layers replaced");
            self.notifications.info(
                "session",
                format!("Results of scenario {owner} were replaced by scenario {scenario_id}"),
            );
        }
        Ok(())
    }

    /// Removes a scenario's layers and listeners. Returns how many layers
    /// were removed.
    pub fn remove_scenario_layers(&self, scenario_id: &str) -> CoreResult<usize> {
        let Some(result) = self.results().remove(scenario_id) else {
            return Ok(0);
        };
        for listener in &result.listeners {
            listener.source.remove_listener(listener.id);
        }
        let mut removed = 0;
        for name in &result.layers {
            if self.registry.get(name).is_some() {
                self.registry.remove(name)?;
                removed += 1;
            }
        }
        info!(scenario = scenario_id, removed, "scenario layers removed");
        Ok(removed)
    }

    /// Case or scenario reload: forgets pending ids and removes every
    /// simulation result layer.
    pub fn reset_for_reload(&self) -> CoreResult<()> {
        self.pending.clear();
        let ids: Vec<String> = self.results().keys().cloned().collect();
        for id in ids {
            self.remove_scenario_layers(&id)?;
        }
        for name in self.registry.names() {
            if self.registry.get(&name).is_some_and(|l| l.is_simulation_result()) {
                self.registry.remove(&name)?;
            }
        }
        Ok(())
    }
}
