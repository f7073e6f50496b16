//! The Delta Engine - per-attribute differences between a reference and a
//! result property record.
//!
//! ```text
//!   old (reference)          new (result)
//!   {flow: [10, 12, 9],      {flow: [11, 15],      ──►  {flow_delta: [1, 3],
//!    noise: 60,               noise: [58, 61],           noise_delta: [-2, 1]}
//!    link_id: 4}              link_id: 4}
//! ```
//!
//! Shapes are reconciled before diffing:
//! - scalar vs scalar: single-element delta
//! - scalar old vs array new: old is repeated to new's length
//! - array old vs scalar new: new is repeated to old's length
//! - arrays of different lengths: old is truncated to the first N values,
//!   or padded by repeating its last value
//!
//! Every delta is `new - old`. Values that do not coerce to numbers yield
//! NaN; the engine never fails.

use crate::properties::{is_identifier, normalize, PropertyMap, Shape};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// Suffix appended to every diffed attribute.
pub const DELTA_SUFFIX: &str = "_delta";

/// `<attr>_delta` → elementwise `new - old`. Scalars are single-element vectors.
pub type DeltaRecord = BTreeMap<String, Vec<f64>>;

/// Computes the delta record between two property sets.
///
/// # Arguments
/// * `old` - Reference properties
/// * `new` - Result properties
///
/// Both inputs are normalized (synonyms) on copies. Only attributes present
/// in both are diffed; if none are shared, every non-identifier attribute of
/// `new` is diffed against an implicit 0.
pub fn compute_delta(old: &PropertyMap, new: &PropertyMap) -> DeltaRecord {
    let old = normalize(old);
    let new = normalize(new);

    let shared: Vec<&String> = new
        .keys()
        .filter(|k| old.contains_key(k.as_str()) && !is_identifier(k))
        .collect();

    let mut record = DeltaRecord::new();
    if shared.is_empty() {
        for (name, value) in new.iter().filter(|(k, _)| !is_identifier(k)) {
            record.insert(delta_key(name), diff_shapes(&Shape::Scalar(0.0), &Shape::of(value)));
        }
    } else {
        for name in shared {
            let old_shape = Shape::of(&old[name.as_str()]);
            let new_shape = Shape::of(&new[name.as_str()]);
            record.insert(delta_key(name), diff_shapes(&old_shape, &new_shape));
        }
    }
    record
}

fn delta_key(name: &str) -> String {
    format!("{name}{DELTA_SUFFIX}")
}

/// Diffs two shaped values, reconciling their lengths first.
pub fn diff_shapes(old: &Shape, new: &Shape) -> Vec<f64> {
    match (old, new) {
        (Shape::Scalar(o), Shape::Scalar(n)) => vec![n - o],
        (Shape::Scalar(o), Shape::Array(n)) => n.iter().map(|v| v - o).collect(),
        (Shape::Array(o), Shape::Scalar(n)) if o.is_empty() => vec![*n],
        (Shape::Array(o), Shape::Scalar(n)) => o.iter().map(|v| n - v).collect(),
        (Shape::Array(o), Shape::Array(n)) => {
            let o = reconcile(o, n.len());
            n.iter().zip(o.iter()).map(|(n, o)| n - o).collect()
        }
    }
}

/// Brings `old` to length `len`: keeps the first `len` values, or pads by
/// repeating the last value (0 when `old` is empty).
pub fn reconcile(old: &[f64], len: usize) -> Vec<f64> {
    if old.len() >= len {
        return old[..len].to_vec();
    }
    let fill = old.last().copied().unwrap_or(0.0);
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(old);
    out.resize(len, fill);
    out
}

/// Converts a delta record into JSON properties; NaN becomes `null`.
pub fn to_properties(record: &DeltaRecord) -> PropertyMap {
    record
        .iter()
        .map(|(key, values)| {
            let array = values
                .iter()
                .map(|v| Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null))
                .collect();
            (key.clone(), Value::Array(array))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn map(value: Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_scalar_scalar() {
        let delta = compute_delta(&map(json!({"flow": 10})), &map(json!({"flow": 12.5})));
        assert_eq!(delta["flow_delta"], vec![2.5]);
    }

    #[test]
    fn test_scalar_old_array_new_broadcasts_old() {
        let delta = compute_delta(&map(json!({"flow": 4})), &map(json!({"flow": [5, 6, 3]})));
        assert_eq!(delta["flow_delta"], vec![1.0, 2.0, -1.0]);
    }

    #[test]
    fn test_array_old_scalar_new_broadcasts_new() {
        let delta = compute_delta(&map(json!({"flow": [1, 2, 3]})), &map(json!({"flow": 5})));
        assert_eq!(delta["flow_delta"], vec![4.0, 3.0, 2.0]);

        let delta = compute_delta(&map(json!({"flow": []})), &map(json!({"flow": 5})));
        assert_eq!(delta["flow_delta"], vec![5.0]);
    }

    #[test]
    fn test_longer_old_is_truncated_from_front() {
        let delta = compute_delta(
            &map(json!({"flow": [1, 2, 3, 4, 5]})),
            &map(json!({"flow": [10, 10, 10]})),
        );
        assert_eq!(delta["flow_delta"], vec![9.0, 8.0, 7.0]);
    }

    #[test]
    fn test_shorter_old_is_padded_with_last() {
        let delta = compute_delta(
            &map(json!({"flow": [1, 2]})),
            &map(json!({"flow": [3, 3, 3, 3, 3]})),
        );
        assert_eq!(delta["flow_delta"], vec![2.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_identifiers_are_never_diffed() {
        let delta = compute_delta(
            &map(json!({"link_id": 1, "flow": 1})),
            &map(json!({"link_id": 2, "flow": 3})),
        );
        assert_eq!(delta.len(), 1);
        assert!(delta.contains_key("flow_delta"));
    }

    #[test]
    fn test_no_shared_attributes_diffs_against_zero() {
        let delta = compute_delta(
            &map(json!({"name": "Main street", "link_id": 9})),
            &map(json!({"flow": [4, 5], "speed": 30, "edge_id": 9})),
        );
        assert_eq!(delta["flow_delta"], vec![4.0, 5.0]);
        assert_eq!(delta["speed_delta"], vec![30.0]);
        assert!(!delta.contains_key("edge_id_delta"));
    }

    #[test]
    fn test_synonyms_are_normalized_before_diffing() {
        let delta = compute_delta(&map(json!({"Traffic": 100})), &map(json!({"flow": 120})));
        assert_eq!(delta["flow_delta"], vec![20.0]);

        let delta = compute_delta(&map(json!({"noise": [60]})), &map(json!({"LAEQ": [63]})));
        assert_eq!(delta["noise_delta"], vec![3.0]);
    }

    #[test]
    fn test_non_numeric_propagates_nan() {
        let delta = compute_delta(&map(json!({"flow": "n/a"})), &map(json!({"flow": 3})));
        assert!(delta["flow_delta"][0].is_nan());

        let props = to_properties(&delta);
        assert_eq!(props["flow_delta"], json!([null]));
    }

    #[test]
    fn test_numeric_strings() {
        let delta = compute_delta(&map(json!({"flow": "1.5"})), &map(json!({"flow": ["2", ""]})));
        assert_relative_eq!(delta["flow_delta"][0], 0.5);
        assert_relative_eq!(delta["flow_delta"][1], -1.5);
    }

    #[test]
    fn test_reconcile() {
        assert_eq!(reconcile(&[1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
        assert_eq!(reconcile(&[1.0], 3), vec![1.0, 1.0, 1.0]);
        assert_eq!(reconcile(&[], 2), vec![0.0, 0.0]);
    }

    proptest! {
        #[test]
        fn prop_equal_length_is_elementwise(
            pairs in prop::collection::vec((-1e6f64..1e6, -1e6f64..1e6), 1..32)
        ) {
            let (old, new): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
            let delta = diff_shapes(&Shape::Array(old.clone()), &Shape::Array(new.clone()));
            prop_assert_eq!(delta.len(), new.len());
            for i in 0..new.len() {
                prop_assert_eq!(delta[i], new[i] - old[i]);
            }
        }

        #[test]
        fn prop_scalar_old_matches_new_length(
            old in -1e6f64..1e6,
            new in prop::collection::vec(-1e6f64..1e6, 0..32)
        ) {
            let delta = diff_shapes(&Shape::Scalar(old), &Shape::Array(new.clone()));
            prop_assert_eq!(delta.len(), new.len());
            for i in 0..new.len() {
                prop_assert_eq!(delta[i], new[i] - old);
            }
        }

        #[test]
        fn prop_array_delta_length_follows_new(
            old in prop::collection::vec(-1e6f64..1e6, 0..16),
            new in prop::collection::vec(-1e6f64..1e6, 0..16)
        ) {
            let delta = diff_shapes(&Shape::Array(old), &Shape::Array(new.clone()));
            prop_assert_eq!(delta.len(), new.len());
        }
    }
}
