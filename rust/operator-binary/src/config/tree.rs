//! A small typed tree over JSON-ish data, independent of any reflection
//! machinery. The Configuration Merger addresses
//! fields in this tree by dot-delimited path rather than by struct field, so
//! it stays decoupled from the concrete `InstanceGroupSpec` shape.

use std::collections::BTreeMap;

/// A path is a sequence of map keys, read left to right from the root.
/// `"spec.configuration.instanceType"` becomes
/// `["spec", "configuration", "instanceType"]`.
pub fn parse_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_owned).collect()
}

/// The three shapes a nested field in an `InstanceGroup` spec can take.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(serde_json::Value),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn empty_map() -> Value {
        Value::Map(BTreeMap::new())
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Reads the field at `path`, returning `None` if any segment along the
    /// way is absent. This is the forward-compatibility seam: a boundary
    /// path that doesn't resolve to anything is simply not found, not an
    /// error.
    pub fn get(&self, path: &[String]) -> Option<&Value> {
        let mut current = self;
        for segment in path {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at `path`, creating intermediate maps as needed.
    /// Returns `false` (and leaves `self` untouched) if an intermediate
    /// segment is already a non-map value, since a path can't descend
    /// through a scalar or a list.
    pub fn set(&mut self, path: &[String], value: Value) -> bool {
        match path.split_first() {
            None => {
                *self = value;
                true
            }
            Some((head, rest)) => {
                if !matches!(self, Value::Map(_)) {
                    *self = Value::empty_map();
                }
                let Value::Map(map) = self else {
                    unreachable!()
                };
                let entry = map.entry(head.clone()).or_insert_with(Value::empty_map);
                entry.set(rest, value)
            }
        }
    }

    /// Removes the field at `path`, returning the previous value if any.
    pub fn remove(&mut self, path: &[String]) -> Option<Value> {
        match path.split_first() {
            None => None,
            Some((head, [])) => match self {
                Value::Map(map) => map.remove(head),
                _ => None,
            },
            Some((head, rest)) => match self {
                Value::Map(map) => map.get_mut(head)?.remove(rest),
                _ => None,
            },
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
            scalar => Value::Scalar(scalar),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Scalar(v) => v,
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn get_and_set_round_trip_through_nested_maps() {
        let mut tree: Value = json!({"spec": {"configuration": {"instanceType": "m5.large"}}}).into();
        let path = parse_path("spec.configuration.instanceType");
        assert_eq!(
            tree.get(&path),
            Some(&Value::Scalar(serde_json::Value::String(
                "m5.large".to_string()
            )))
        );

        tree.set(&path, Value::Scalar(json!("m5.xlarge")));
        assert_eq!(
            tree.get(&path),
            Some(&Value::Scalar(serde_json::Value::String(
                "m5.xlarge".to_string()
            )))
        );
    }

    #[test]
    fn set_creates_missing_intermediate_maps() {
        let mut tree = Value::empty_map();
        let path = parse_path("spec.configuration.instanceType");
        assert!(tree.set(&path, Value::Scalar(json!("m5.large"))));
        assert_eq!(
            tree.get(&path),
            Some(&Value::Scalar(serde_json::Value::String(
                "m5.large".to_string()
            )))
        );
    }

    #[test]
    fn get_on_unknown_path_returns_none_not_error() {
        let tree: Value = json!({"spec": {}}).into();
        let path = parse_path("spec.doesNotExist.andDeeper");
        assert_eq!(tree.get(&path), None);
    }
}
