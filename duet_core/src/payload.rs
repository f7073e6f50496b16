//! Result payload decoding and classification.
//!
//! ```text
//!   {"scenarioid": .., "pollutants": [..], "<pol>": {"*url*": ..}}  → VITO raster
//!   {"scenarioid": .., "tilesurl": .., "deltaurl": ..}             → TNO raster
//!   {"scenarioid": .., "data": {"metadata": .., "result": [..]}}   → vector
//! ```

use crate::error::{CoreError, CoreResult};
use crate::layers::{simresults_type, Extent, LayerDefinition, LayerKind, LayerRole, RasterLayerSpec, TilingSchema};
use crate::topics::TopicClass;
use serde_json::{Map, Value};

/// Scenario id field of every result message.
pub const SCENARIO_ID_KEY: &str = "scenarioid";

/// Status a vector result must report.
pub const STATUS_OK: &str = "ok";

/// Kind of simulation a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultClass {
    Traffic,
    Noise,
    Air,
}

impl ResultClass {
    /// From the topic descriptor when it names a simulation class, otherwise
    /// by substring of the topic (`noise`, `traffic`, default `air`).
    pub fn classify(descriptor_class: &TopicClass, topic: &str) -> Self {
        match descriptor_class {
            TopicClass::Traffic => ResultClass::Traffic,
            TopicClass::Noise => ResultClass::Noise,
            TopicClass::Air => ResultClass::Air,
            _ if topic.contains("noise") => ResultClass::Noise,
            _ if topic.contains("traffic") => ResultClass::Traffic,
            _ => ResultClass::Air,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultClass::Traffic => "traffic",
            ResultClass::Noise => "noise",
            ResultClass::Air => "air",
        }
    }
}

impl std::fmt::Display for ResultClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raster result provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterProvider {
    Tno,
    Vito,
}

impl RasterProvider {
    pub fn slug(&self) -> &'static str {
        match self {
            RasterProvider::Tno => "tno",
            RasterProvider::Vito => "vito",
        }
    }

    pub fn attribution(&self) -> &'static str {
        match self {
            RasterProvider::Tno => "TNO",
            RasterProvider::Vito => "VITO",
        }
    }

    pub fn tiling(&self) -> TilingSchema {
        match self {
            RasterProvider::Tno => TilingSchema::Mercator,
            RasterProvider::Vito => TilingSchema::Geographic,
        }
    }
}

/// URL keys of one raster result, in payload order.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterUrls {
    /// Class label used in names, e.g. `noise` or `air.pm2_5`
    pub label: String,
    pub urls: Vec<(String, String)>,
}

/// A decoded, classified result message.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultPayload {
    /// TNO single-class raster maps
    TnoRaster { scenario_id: String, urls: Vec<(String, String)> },

    /// VITO maps, one URL set per pollutant
    VitoRaster { scenario_id: String, pollutants: Vec<RasterUrls> },

    /// Per-feature network results
    Vector(VectorResult),
}

impl ResultPayload {
    pub fn scenario_id(&self) -> &str {
        match self {
            ResultPayload::TnoRaster { scenario_id, .. } | ResultPayload::VitoRaster { scenario_id, .. } => scenario_id,
            ResultPayload::Vector(v) => &v.scenario_id,
        }
    }
}

/// The vector branch of a result payload.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorResult {
    pub scenario_id: String,

    /// Dataset / model name the layers are named after
    pub name: Option<String>,

    /// Geometry source of the triad
    pub geometry_url: String,

    /// Per-feature result records
    pub records: Vec<Map<String, Value>>,
}

impl VectorResult {
    /// Base layer name: the model name with `.` replaced by `,`, or
    /// `<class>-result-<scenario>`.
    pub fn base_name(&self, class: ResultClass) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.replace('.', ","),
            _ => format!("{}-result-{}", class.as_str(), self.scenario_id),
        }
    }
}

/// Reads the scenario id; numbers are accepted and rendered as strings.
pub fn scenario_id(body: &Value) -> Option<String> {
    match body.get(SCENARIO_ID_KEY)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Scenario id of an outgoing request. Gateway envelopes carry it in
/// their inner `payload` object.
pub fn request_scenario_id(request: &Value) -> Option<String> {
    scenario_id(request).or_else(|| scenario_id(request.get("payload")?))
}

fn url_keys(object: &Map<String, Value>) -> Vec<(String, String)> {
    object
        .iter()
        .filter(|(key, _)| key.contains("url"))
        .filter_map(|(key, value)| value.as_str().map(|url| (key.clone(), url.to_string())))
        .collect()
}

/// Classifies a decoded body.
///
/// Checks run in order: `pollutants` list, URL-bearing keys, `data`.
pub fn classify(body: &Value, class: ResultClass) -> CoreResult<ResultPayload> {
    let object = body
        .as_object()
        .ok_or_else(|| CoreError::malformed("payload is not a JSON object", body.to_string()))?;
    let scenario_id = scenario_id(body)
        .ok_or_else(|| CoreError::malformed("payload has no scenarioid", body.to_string()))?;

    if let Some(pollutants) = object.get("pollutants").and_then(Value::as_array) {
        let mut sets = Vec::with_capacity(pollutants.len());
        for pollutant in pollutants {
            let name = pollutant
                .as_str()
                .ok_or_else(|| CoreError::malformed("pollutant name is not a string", body.to_string()))?;
            let urls = object
                .get(name)
                .and_then(Value::as_object)
                .map(url_keys)
                .unwrap_or_default();
            if urls.is_empty() {
                return Err(CoreError::malformed(
                    format!("pollutant {name} has no tile URLs"),
                    body.to_string(),
                ));
            }
            sets.push(RasterUrls {
                label: format!("{}.{}", class.as_str(), name.replace('.', "_")),
                urls,
            });
        }
        return Ok(ResultPayload::VitoRaster { scenario_id, pollutants: sets });
    }

    let urls = url_keys(object);
    if !urls.is_empty() {
        return Ok(ResultPayload::TnoRaster { scenario_id, urls });
    }

    if let Some(data) = object.get("data") {
        return vector_result(scenario_id, object, data, body).map(ResultPayload::Vector);
    }

    Err(CoreError::malformed(
        "payload has neither tile URLs nor a data object",
        body.to_string(),
    ))
}

fn vector_result(
    scenario_id: String,
    object: &Map<String, Value>,
    data: &Value,
    body: &Value,
) -> CoreResult<VectorResult> {
    let data = match data {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    };
    let data = data
        .as_object()
        .ok_or_else(|| CoreError::malformed("data is not an object", body.to_string()))?;

    let metadata = data
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or_else(|| CoreError::malformed("data has no metadata", body.to_string()))?;
    let status = metadata.get("status").and_then(Value::as_str).unwrap_or_default();
    if status != STATUS_OK {
        return Err(CoreError::malformed(format!("result status is `{status}`"), body.to_string()));
    }

    let geometry_url = ["road_network_geom_url", "receiver_geom_url"]
        .iter()
        .find_map(|key| metadata.get(*key).and_then(Value::as_str))
        .ok_or_else(|| CoreError::malformed("metadata has no geometry URL", body.to_string()))?
        .to_string();

    let records = data
        .get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::malformed("data has no result array", body.to_string()))?
        .iter()
        .filter_map(|r| r.as_object().cloned())
        .collect();

    Ok(VectorResult {
        scenario_id,
        name: object.get("name").and_then(Value::as_str).map(str::to_string),
        geometry_url,
        records,
    })
}

/// Role a raster URL key denotes: `delta`, `reference` or `tiles` (result).
pub fn raster_role(key: &str) -> Option<LayerRole> {
    if key.contains("delta") {
        Some(LayerRole::Delta)
    } else if key.contains("reference") {
        Some(LayerRole::Reference)
    } else if key.contains("tiles") {
        Some(LayerRole::Result)
    } else {
        None
    }
}

/// Builds one raster layer per URL key.
pub fn raster_layers(
    provider: RasterProvider,
    label: &str,
    scenario_id: &str,
    urls: &[(String, String)],
    extent: Extent,
) -> Vec<LayerDefinition> {
    urls.iter()
        .map(|(key, url)| {
            let role = raster_role(key);
            let base = format!("{label}-pollution-{}-{scenario_id}", provider.slug());
            let name = match role {
                Some(role) => role.layer_name(&base),
                None => base,
            };
            let title = match role {
                Some(LayerRole::Delta) => format!("{} {label} pollution delta", provider.attribution()),
                Some(LayerRole::Reference) => format!("{} {label} pollution reference", provider.attribution()),
                _ => format!("{} {label} pollution result", provider.attribution()),
            };
            LayerDefinition {
                name,
                title,
                duet_type: simresults_type(label),
                role,
                provider: provider.attribution().to_string(),
                scenario_id: scenario_id.to_string(),
                kind: LayerKind::Raster(RasterLayerSpec::new(url, provider.tiling(), extent)),
            }
        })
        .collect()
}
