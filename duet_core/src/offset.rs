//! Geometry Offset Corrector.
//!
//! Road networks often carry both directions of a street as coincident
//! lines. Each line is shifted sideways (to the right of its direction of
//! travel) so that both stay visible.
//!
//! ```text
//!   p0 ────────► p1 ────────► p2          original
//!   q0 ────────► q1 ────────► q2          offset by `distance`, segments
//!                                          joined where their offsets meet
//! ```

use crate::datasets::OffsetRule;
use crate::properties::FeatureKey;
use crate::tiles::TileFeature;
use geo::{Coord, Geometry, LineString};
use thiserror::Error;
use tracing::warn;

/// Lateral offset in the units of the tile projection.
pub const DEFAULT_OFFSET_DISTANCE: f64 = 2.0;

/// Per-feature offset failures. Logged, never fatal for a batch.
#[derive(Debug, Error, PartialEq)]
pub enum OffsetError {
    #[error("line has {0} coordinates, need at least 2")]
    TooFewCoordinates(usize),

    #[error("segment {index} has zero length")]
    DegenerateSegment { index: usize },

    #[error("offset produced a non-finite coordinate")]
    NonFinite,
}

/// Offsets a line string by `distance` to the right of its direction.
///
/// Consecutive offset segments are joined at the intersection of their
/// supporting lines; parallel neighbours are kept as they are. The output
/// has as many coordinates as the input.
pub fn offset_line(line: &LineString<f64>, distance: f64) -> Result<LineString<f64>, OffsetError> {
    let coords = &line.0;
    if coords.len() < 2 {
        return Err(OffsetError::TooFewCoordinates(coords.len()));
    }

    let mut segments = Vec::with_capacity(coords.len() - 1);
    for (index, pair) in coords.windows(2).enumerate() {
        segments.push(offset_segment(pair[0], pair[1], distance).ok_or(OffsetError::DegenerateSegment { index })?);
    }

    for i in 1..segments.len() {
        if let Some(joint) = intersect(segments[i - 1], segments[i]) {
            segments[i - 1].1 = joint;
            segments[i].0 = joint;
        }
    }

    let mut out: Vec<Coord<f64>> = segments.iter().map(|s| s.0).collect();
    if let Some(last) = segments.last() {
        out.push(last.1);
    }
    if out.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(OffsetError::NonFinite);
    }
    Ok(LineString::new(out))
}

type Segment = (Coord<f64>, Coord<f64>);

fn offset_segment(p1: Coord<f64>, p2: Coord<f64>, distance: f64) -> Option<Segment> {
    let length = (p1.x - p2.x).hypot(p1.y - p2.y);
    if length == 0.0 || !length.is_finite() {
        return None;
    }
    let dx = distance * (p2.y - p1.y) / length;
    let dy = distance * (p1.x - p2.x) / length;
    Some((
        Coord { x: p1.x + dx, y: p1.y + dy },
        Coord { x: p2.x + dx, y: p2.y + dy },
    ))
}

fn cross(a: Coord<f64>, b: Coord<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

/// Intersection of the lines through two segments, `None` when parallel.
fn intersect(a: Segment, b: Segment) -> Option<Coord<f64>> {
    let r = a.1 - a.0;
    let s = b.1 - b.0;
    let denom = cross(r, s);
    let scale = r.x.hypot(r.y) * s.x.hypot(s.y);
    if denom.abs() <= 1e-12 * scale {
        return None;
    }
    let t = cross(b.0 - a.0, s) / denom;
    Some(Coord {
        x: a.0.x + t * r.x,
        y: a.0.y + t * r.y,
    })
}

/// Outcome of one offset batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffsetReport {
    pub offset: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Applies a dataset's offset rule to tile features.
#[derive(Debug, Clone)]
pub struct OffsetCorrector {
    pub distance: f64,
    pub rule: OffsetRule,

    /// Attribute compared against the rule's exception id
    pub id_attribute: String,
}

impl OffsetCorrector {
    pub fn new(rule: OffsetRule, id_attribute: impl Into<String>) -> Self {
        Self {
            distance: DEFAULT_OFFSET_DISTANCE,
            rule,
            id_attribute: id_attribute.into(),
        }
    }

    /// Offsets every line feature not offset yet. Failures are logged per
    /// feature and the batch continues.
    pub fn apply(&self, features: &mut [TileFeature]) -> OffsetReport {
        let mut report = OffsetReport::default();
        for feature in features.iter_mut() {
            let line = match &feature.geometry {
                Geometry::LineString(line) if !feature.offset_applied && line.0.len() >= 2 => line,
                _ => {
                    report.skipped += 1;
                    continue;
                }
            };

            let mut working = line.clone();
            if self.drops_first(feature) && working.0.len() >= 3 {
                working.0.remove(0);
            }

            match offset_line(&working, self.distance) {
                Ok(shifted) => {
                    feature.geometry = Geometry::LineString(shifted);
                    feature.offset_applied = true;
                    report.offset += 1;
                }
                Err(e) => {
                    warn!(
                        feature = ?FeatureKey::from_properties(&feature.properties, &self.id_attribute),
                        error = %e,
                        "line offset failed"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn drops_first(&self, feature: &TileFeature) -> bool {
        match (&self.rule.drop_first_for, FeatureKey::from_properties(&feature.properties, &self.id_attribute)) {
            (Some(exception), Some(key)) => key.as_str() == exception,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertyMap;
    use approx::assert_relative_eq;
    use geo::{line_string, point};
    use serde_json::json;

    fn feature(id: i64, line: LineString<f64>) -> TileFeature {
        let mut props = PropertyMap::new();
        props.insert("link_id".into(), json!(id));
        TileFeature::new(line, props)
    }

    fn corrector() -> OffsetCorrector {
        OffsetCorrector::new(OffsetRule::with_default_exception(), "link_id")
    }

    #[test]
    fn test_single_segment_shifts_right() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)];
        let out = offset_line(&line, 2.0).unwrap();
        assert_eq!(out.0.len(), 2);
        assert_relative_eq!(out.0[0].x, 0.0);
        assert_relative_eq!(out.0[0].y, -2.0);
        assert_relative_eq!(out.0[1].x, 10.0);
        assert_relative_eq!(out.0[1].y, -2.0);
    }

    #[test]
    fn test_corner_is_joined_at_intersection() {
        // East then north: the right-hand offset corner sits at (12, -2)
        let line = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0)];
        let out = offset_line(&line, 2.0).unwrap();
        assert_eq!(out.0.len(), 3);
        assert_relative_eq!(out.0[1].x, 12.0, epsilon = 1e-9);
        assert_relative_eq!(out.0[1].y, -2.0, epsilon = 1e-9);
        assert_relative_eq!(out.0[2].x, 12.0, epsilon = 1e-9);
        assert_relative_eq!(out.0[2].y, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_collinear_segments_keep_count() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 5.0, y: 0.0), (x: 10.0, y: 0.0)];
        let out = offset_line(&line, 1.0).unwrap();
        assert_eq!(out.0.len(), 3);
        assert!(out.0.iter().all(|c| (c.y + 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_degenerate_segment_errors() {
        let line = line_string![(x: 1.0, y: 1.0), (x: 1.0, y: 1.0)];
        assert_eq!(offset_line(&line, 2.0), Err(OffsetError::DegenerateSegment { index: 0 }));
    }

    #[test]
    fn test_exception_id_drops_first_coordinate() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 20.0, y: 0.0)];
        let mut features = vec![feature(8344, line.clone()), feature(8345, line)];

        let report = corrector().apply(&mut features);
        assert_eq!(report.offset, 2);

        let Geometry::LineString(first) = &features[0].geometry else { panic!("not a line") };
        let Geometry::LineString(second) = &features[1].geometry else { panic!("not a line") };
        assert_eq!(first.0.len(), 2);
        assert_relative_eq!(first.0[0].x, 10.0);
        assert_eq!(second.0.len(), 3);
        assert_relative_eq!(second.0[0].x, 0.0);
    }

    #[test]
    fn test_exception_needs_three_coordinates() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)];
        let mut features = vec![feature(8344, line)];
        corrector().apply(&mut features);
        let Geometry::LineString(out) = &features[0].geometry else { panic!("not a line") };
        assert_eq!(out.0.len(), 2);
    }

    #[test]
    fn test_batch_continues_after_failure() {
        let mut features = vec![
            feature(1, line_string![(x: 0.0, y: 0.0), (x: 0.0, y: 0.0)]),
            TileFeature::new(point!(x: 1.0, y: 1.0), PropertyMap::new()),
            feature(2, line_string![(x: 0.0, y: 0.0), (x: 0.0, y: 5.0)]),
        ];
        let report = corrector().apply(&mut features);
        assert_eq!(report, OffsetReport { offset: 1, skipped: 1, failed: 1 });
        assert!(features[2].offset_applied);
        assert!(!features[0].offset_applied);
    }

    #[test]
    fn test_offset_is_applied_once() {
        let mut features = vec![feature(1, line_string![(x: 0.0, y: 0.0), (x: 4.0, y: 0.0)])];
        corrector().apply(&mut features);
        let once = features[0].geometry.clone();
        let report = corrector().apply(&mut features);
        assert_eq!(report.skipped, 1);
        assert_eq!(features[0].geometry, once);
    }
}
