//! Feature property bags.
//!
//! Simulation providers publish loosely typed JSON records: the same value
//! may arrive as a number, a numeric string or an array, and the same
//! quantity under several names. This module holds the normalization step
//! (synonym table), loose numeric coercion and feature-key rendering that
//! the delta engine and the enrichment pipeline build on.

use serde_json::{Map, Value};
use std::fmt;

/// A feature's property record.
pub type PropertyMap = Map<String, Value>;

/// Synonyms rewritten to their canonical name, applied in this order.
pub const SYNONYMS: [(&str, &str); 5] = [
    ("Traffic", "flow"),
    ("traffic", "flow"),
    ("laeq", "noise"),
    ("LAEQ", "noise"),
    ("leq", "noise"),
];

/// Returns a copy of `props` with every synonym renamed to its canonical key.
///
/// A synonym overwrites an already present canonical key.
pub fn normalize(props: &PropertyMap) -> PropertyMap {
    let mut out = props.clone();
    normalize_in_place(&mut out);
    out
}

/// In-place variant of [`normalize`].
pub fn normalize_in_place(props: &mut PropertyMap) {
    for (synonym, canonical) in SYNONYMS {
        if let Some(value) = props.remove(synonym) {
            props.insert(canonical.to_string(), value);
        }
    }
}

/// Identifier attributes are never diffed.
pub fn is_identifier(name: &str) -> bool {
    name.contains("id")
}

/// Loose numeric coercion.
///
/// Numbers pass through, numeric strings are parsed (blank is 0), booleans
/// become 1/0 and null becomes 0. Anything else is NaN.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Null => 0.0,
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// A value seen as either a scalar or an array of numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Scalar(f64),
    Array(Vec<f64>),
}

impl Shape {
    /// Coerces a JSON value; arrays are coerced element by element.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Array(items) => Shape::Array(items.iter().map(to_number).collect()),
            other => Shape::Scalar(to_number(other)),
        }
    }
}

/// A feature identifier normalized to a string.
///
/// Integral numbers render without a fractional part so that `8344` and
/// `8344.0` address the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureKey(String);

impl FeatureKey {
    /// Normalizes a JSON identifier; null, arrays and objects have no key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Some(Self(i.to_string()));
                }
                if let Some(u) = n.as_u64() {
                    return Some(Self(u.to_string()));
                }
                let f = n.as_f64()?;
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(Self(format!("{}", f as i64)))
                } else {
                    Some(Self(f.to_string()))
                }
            }
            Value::Bool(b) => Some(Self(b.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Reads the key from a property record.
    pub fn from_properties(props: &PropertyMap, attribute: &str) -> Option<Self> {
        props.get(attribute).and_then(Self::from_value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FeatureKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_normalize_synonyms() {
        let props = map(json!({"Traffic": 10, "laeq": [50, 52], "link_id": 3}));
        let normalized = normalize(&props);

        assert_eq!(normalized.get("flow"), Some(&json!(10)));
        assert_eq!(normalized.get("noise"), Some(&json!([50, 52])));
        assert!(!normalized.contains_key("Traffic"));
        assert!(!normalized.contains_key("laeq"));
        // Input untouched
        assert!(props.contains_key("Traffic"));
    }

    #[test]
    fn test_synonym_overwrites_canonical() {
        let props = map(json!({"flow": 1, "traffic": 2}));
        assert_eq!(normalize(&props).get("flow"), Some(&json!(2)));

        // Later table entries win
        let props = map(json!({"laeq": 1, "leq": 3}));
        assert_eq!(normalize(&props).get("noise"), Some(&json!(3)));
    }

    #[test]
    fn test_to_number_coercion() {
        assert_eq!(to_number(&json!(2.5)), 2.5);
        assert_eq!(to_number(&json!("7")), 7.0);
        assert_eq!(to_number(&json!("")), 0.0);
        assert_eq!(to_number(&json!(true)), 1.0);
        assert_eq!(to_number(&Value::Null), 0.0);
        assert!(to_number(&json!("abc")).is_nan());
        assert!(to_number(&json!({"a": 1})).is_nan());
    }

    #[test]
    fn test_identifier_check_is_case_sensitive() {
        assert!(is_identifier("link_id"));
        assert!(is_identifier("width"));
        assert!(!is_identifier("ID"));
        assert!(!is_identifier("flow"));
    }

    #[test]
    fn test_feature_key_normalization() {
        assert_eq!(FeatureKey::from_value(&json!(8344)), FeatureKey::from_value(&json!(8344.0)));
        assert_eq!(FeatureKey::from_value(&json!("8344")).unwrap().as_str(), "8344");
        assert_eq!(FeatureKey::from_value(&json!(1.5)).unwrap().as_str(), "1.5");
        assert_eq!(FeatureKey::from_value(&Value::Null), None);
    }
}
