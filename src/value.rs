//! The dynamic value type stored in the metadata tree.
//!
//! Values are normalized on every ingress: JSON and YAML documents become
//! `Value` variants up front, so reads never coerce. YAML mappings keyed by
//! anything other than a string are rejected with `BadEncoding`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::CoordError;

/// String-keyed mapping used for every interior node of the tree.
pub type Fields = BTreeMap<String, Value>;

/// A tree value: scalar, ordered list, or string-keyed mapping.
///
/// Variant order matters for deserialization: integers must be tried before
/// floats so `1` stays an integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(Fields),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<Fields> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Normalizes a parsed JSON document. JSON object keys are always
    /// strings, so the only adjustment is number classification: anything
    /// that fits `i64` stays an integer, the rest become floats.
    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Normalizes a parsed YAML document. YAML mappings may be keyed by
    /// arbitrary scalars; any non-string key fails with `BadEncoding`, as do
    /// YAML type tags.
    pub fn from_yaml(value: serde_yaml::Value) -> Result<Value, CoordError> {
        match value {
            serde_yaml::Value::Null => Ok(Value::Null),
            serde_yaml::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_yaml::Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Int(i)),
                None => Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            serde_yaml::Value::String(s) => Ok(Value::Str(s)),
            serde_yaml::Value::Sequence(items) => Ok(Value::List(
                items
                    .into_iter()
                    .map(Value::from_yaml)
                    .collect::<Result<_, _>>()?,
            )),
            serde_yaml::Value::Mapping(mapping) => {
                let mut fields = Fields::new();
                for (k, v) in mapping {
                    let key = match k {
                        serde_yaml::Value::String(s) => s,
                        other => {
                            return Err(CoordError::bad_encoding(format!(
                                "non-string mapping key: {:?}",
                                other
                            )))
                        }
                    };
                    fields.insert(key, Value::from_yaml(v)?);
                }
                Ok(Value::Map(fields))
            }
            serde_yaml::Value::Tagged(tagged) => Err(CoordError::bad_encoding(format!(
                "unsupported yaml tag: {}",
                tagged.tag
            ))),
        }
    }

    /// The plain JSON representation of this value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Value::Null => serde_yaml::Value::Null,
            Value::Bool(b) => serde_yaml::Value::Bool(*b),
            Value::Int(i) => serde_yaml::Value::Number((*i).into()),
            Value::Float(f) => serde_yaml::Value::Number((*f).into()),
            Value::Str(s) => serde_yaml::Value::String(s.clone()),
            Value::List(items) => {
                serde_yaml::Value::Sequence(items.iter().map(Value::to_yaml).collect())
            }
            Value::Map(fields) => {
                let mut mapping = serde_yaml::Mapping::new();
                for (k, v) in fields {
                    mapping.insert(serde_yaml::Value::String(k.clone()), v.to_yaml());
                }
                serde_yaml::Value::Mapping(mapping)
            }
        }
    }

    /// Parses and normalizes a JSON byte payload.
    pub fn parse_json(src: &[u8]) -> Result<Value, CoordError> {
        let parsed: serde_json::Value =
            serde_json::from_slice(src).map_err(CoordError::bad_encoding)?;
        Ok(Value::from_json(parsed))
    }

    /// Parses and normalizes a YAML byte payload.
    pub fn parse_yaml(src: &[u8]) -> Result<Value, CoordError> {
        let parsed: serde_yaml::Value =
            serde_yaml::from_slice(src).map_err(CoordError::bad_encoding)?;
        Value::from_yaml(parsed)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Value {
        Value::Map(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_numbers_classify_as_int_or_float() {
        let v = Value::parse_json(br#"{"a": 1, "b": 1.5, "c": -7}"#).unwrap();
        let m = v.as_map().unwrap();
        assert_eq!(m["a"], Value::Int(1));
        assert_eq!(m["b"], Value::Float(1.5));
        assert_eq!(m["c"], Value::Int(-7));
    }

    #[test]
    fn nested_structures_normalize_recursively() {
        let v = Value::parse_json(br#"{"a": {"b": ["x", true, null]}}"#).unwrap();
        let a = v.as_map().unwrap()["a"].as_map().unwrap();
        assert_eq!(
            a["b"],
            Value::List(vec![Value::Str("x".into()), Value::Bool(true), Value::Null])
        );
    }

    #[test]
    fn yaml_string_keys_accepted() {
        let v = Value::parse_yaml(b"a:\n  b: 1\n  c: two\n").unwrap();
        let a = v.as_map().unwrap()["a"].as_map().unwrap();
        assert_eq!(a["b"], Value::Int(1));
        assert_eq!(a["c"], Value::Str("two".into()));
    }

    #[test]
    fn yaml_non_string_key_is_bad_encoding() {
        let err = Value::parse_yaml(b"1: one\n").unwrap_err();
        assert!(matches!(err, CoordError::BadEncoding(_)));
    }

    #[test]
    fn malformed_json_is_bad_encoding() {
        let err = Value::parse_json(b"{not json").unwrap_err();
        assert!(matches!(err, CoordError::BadEncoding(_)));
    }

    #[test]
    fn json_roundtrip_preserves_value() {
        let v = Value::parse_json(br#"{"a": 1, "b": {"c": [1, 2.5, "x"]}}"#).unwrap();
        let bytes = serde_json::to_vec(&v.to_json()).unwrap();
        assert_eq!(Value::parse_json(&bytes).unwrap(), v);
    }

    #[test]
    fn yaml_roundtrip_preserves_value() {
        let v = Value::parse_yaml(b"a: 1\nb:\n  c:\n    - 1\n    - x\n").unwrap();
        let bytes = serde_yaml::to_string(&v.to_yaml()).unwrap();
        assert_eq!(Value::parse_yaml(bytes.as_bytes()).unwrap(), v);
    }

    #[test]
    fn serde_derive_matches_explicit_normalization() {
        // Command payloads embed Value directly; the derived impl must agree
        // with from_json for the variants that appear on the wire.
        let direct: Value = serde_json::from_str(r#"{"a": 1, "b": [true, "x"]}"#).unwrap();
        let explicit = Value::parse_json(br#"{"a": 1, "b": [true, "x"]}"#).unwrap();
        assert_eq!(direct, explicit);
    }
}
