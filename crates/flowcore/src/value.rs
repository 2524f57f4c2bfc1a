use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dynamic value type for node inputs/outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Json(j) => j.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Json(j) => j.as_bool(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(j) => Some(j),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Json(serde_json::Value::Null))
    }

    /// Short name of the variant, used in type mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Walk into nested objects/arrays following `path`.
    ///
    /// Numeric segments index into arrays. Returns `None` as soon as a
    /// segment cannot be followed.
    pub fn get_path(&self, path: &[String]) -> Option<Value> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self.clone());
        };
        match self {
            Value::Object(map) => map.get(head)?.get_path(rest),
            Value::Array(items) => {
                let idx: usize = head.parse().ok()?;
                items.get(idx)?.get_path(rest)
            }
            Value::Json(json) => {
                let mut current = json;
                for segment in path {
                    current = match current {
                        serde_json::Value::Object(map) => map.get(segment)?,
                        serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                        _ => return None,
                    };
                }
                Some(Value::from_json(current.clone()))
            }
            _ => None,
        }
    }

    /// Structural conversion from plain JSON.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => Value::Array(arr.into_iter().map(Value::from_json).collect()),
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }

    /// Plain JSON rendering with object keys in sorted order.
    ///
    /// Two equal values always render to byte-identical JSON, which is what
    /// cache keys are computed from.
    pub fn to_canonical_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
            Value::Json(j) => canonicalize(j),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_canonical_json).collect())
            }
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_canonical_json()))
                    .collect();
                serde_json::Value::Object(sorted.into_iter().collect())
            }
        }
    }
}

fn canonicalize(json: &serde_json::Value) -> serde_json::Value {
    match json {
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonicalize).collect()),
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<_, _> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        // Same rendering as `Value::Number`, so `1` and `1.0` compare equal.
        serde_json::Value::Number(n) => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        other => other.clone(),
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::Json(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn get_path_walks_objects_arrays_and_json() {
        let mut inner = HashMap::new();
        inner.insert("items".to_string(), Value::Array(vec![Value::from(1.0), Value::from(2.0)]));
        let value = Value::Object(inner);
        assert_eq!(value.get_path(&path(&["items", "1"])), Some(Value::Number(2.0)));
        assert_eq!(value.get_path(&path(&["missing"])), None);

        let json = Value::Json(serde_json::json!({"a": {"b": ["x", "y"]}}));
        assert_eq!(json.get_path(&path(&["a", "b", "0"])), Some(Value::from("x")));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let mut map = HashMap::new();
        map.insert("z".to_string(), Value::from(1.0));
        map.insert("a".to_string(), Value::from("first"));
        let rendered = serde_json::to_string(&Value::Object(map).to_canonical_json()).unwrap();
        assert_eq!(rendered, r#"{"a":"first","z":1.0}"#);
    }

    #[test]
    fn canonical_json_treats_integers_as_numbers() {
        let json = Value::Json(serde_json::json!({"n": 1, "items": [2]}));
        let native = Value::Object(HashMap::from([
            ("n".to_string(), Value::from(1.0)),
            ("items".to_string(), Value::Array(vec![Value::from(2.0)])),
        ]));
        assert_eq!(json.to_canonical_json(), native.to_canonical_json());
        assert_eq!(
            Value::Json(serde_json::json!(3)).to_canonical_json(),
            Value::Number(3.0).to_canonical_json()
        );
    }
}
