//! The Configuration Merger: materializes the effective `InstanceGroup` spec
//! from the cluster-wide defaults document, its annotation-selected
//! conditionals, and the user's spec, per the three boundary modes.

use std::collections::BTreeMap;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use snafu::ResultExt;

use super::error::{MergeError, SelectorSnafu, UnmarshalSnafu};
use super::merge_schema::merge_key_for_suffix;
use super::selector::AnnotationSelector;
use super::tree::{parse_path, Value};

/// Raw shape of the `boundaries` key in the `instance-manager` ConfigMap.
#[derive(Debug, Deserialize)]
struct RawBoundaries {
    #[serde(default)]
    restricted: Vec<String>,
    #[serde(default)]
    shared: RawSharedBoundaries,
}

#[derive(Debug, Default, Deserialize)]
struct RawSharedBoundaries {
    #[serde(default)]
    replace: Vec<String>,
    #[serde(default)]
    merge: Vec<String>,
    #[serde(default)]
    #[serde(rename = "mergeOverride")]
    merge_override: Vec<String>,
}

/// Raw shape of one entry in the `conditionals` key.
#[derive(Debug, Deserialize)]
struct RawConditional {
    #[serde(rename = "annotationSelector")]
    annotation_selector: String,
    #[serde(default)]
    defaults: serde_yaml::Value,
}

/// Parsed, path-addressed boundary lists.
#[derive(Clone, Debug, Default)]
pub struct Boundaries {
    pub restricted: Vec<Vec<String>>,
    pub shared_replace: Vec<Vec<String>>,
    pub shared_merge: Vec<Vec<String>>,
    pub shared_merge_override: Vec<Vec<String>>,
}

impl Boundaries {
    fn parse(raw: RawBoundaries) -> Boundaries {
        let to_paths = |paths: Vec<String>| paths.iter().map(|p| parse_path(p)).collect();
        Boundaries {
            restricted: to_paths(raw.restricted),
            shared_replace: to_paths(raw.shared.replace),
            shared_merge: to_paths(raw.shared.merge),
            shared_merge_override: to_paths(raw.shared.merge_override),
        }
    }

    fn merge_mode_at(&self, path: &[String]) -> Option<MergeMode> {
        if self.shared_merge_override.iter().any(|p| p == path) {
            Some(MergeMode::MergeOverride)
        } else if self.shared_merge.iter().any(|p| p == path) {
            Some(MergeMode::Merge)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum MergeMode {
    Merge,
    MergeOverride,
}

/// One annotation-selected defaults overlay.
#[derive(Clone, Debug)]
pub struct Conditional {
    pub selector: AnnotationSelector,
    pub defaults: Value,
}

/// The cluster-wide `ProvisionerConfiguration` document: the base
/// defaults, the boundary-mode path lists, and the conditional overlays.
#[derive(Clone, Debug)]
pub struct ProvisionerConfiguration {
    pub defaults: Value,
    pub boundaries: Boundaries,
    pub conditionals: Vec<Conditional>,
}

impl ProvisionerConfiguration {
    /// Parses the three string keys of the `instance-manager` ConfigMap
    /// (the instance-manager ConfigMap's `resources` key).
    pub fn parse(
        defaults_yaml: &str,
        boundaries_yaml: &str,
        conditionals_yaml: &str,
    ) -> Result<ProvisionerConfiguration, MergeError> {
        let defaults: serde_yaml::Value =
            serde_yaml::from_str(defaults_yaml).context(UnmarshalSnafu { field: "defaults" })?;
        let raw_boundaries: RawBoundaries = serde_yaml::from_str(boundaries_yaml)
            .context(UnmarshalSnafu { field: "boundaries" })?;
        let raw_conditionals: Vec<RawConditional> = serde_yaml::from_str(conditionals_yaml)
            .context(UnmarshalSnafu {
                field: "conditionals",
            })?;

        let mut conditionals = Vec::with_capacity(raw_conditionals.len());
        for (index, raw) in raw_conditionals.into_iter().enumerate() {
            let selector = AnnotationSelector::parse(&raw.annotation_selector)
                .context(SelectorSnafu { index })?;
            conditionals.push(Conditional {
                selector,
                defaults: yaml_to_value(raw.defaults),
            });
        }

        Ok(ProvisionerConfiguration {
            defaults: yaml_to_value(defaults),
            boundaries: Boundaries::parse(raw_boundaries),
            conditionals,
        })
    }

    /// A stable digest over the raw document, used as `InstanceGroupStatus::config_hash`.
    pub fn digest(
        defaults_yaml: &str,
        boundaries_yaml: &str,
        conditionals_yaml: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(defaults_yaml.as_bytes());
        hasher.update([0u8]);
        hasher.update(boundaries_yaml.as_bytes());
        hasher.update([0u8]);
        hasher.update(conditionals_yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn yaml_to_value(yaml: serde_yaml::Value) -> Value {
    let json: serde_json::Value =
        serde_json::to_value(yaml).unwrap_or(serde_json::Value::Null);
    Value::from(json)
}

/// Folds every conditional whose selector matches `annotations` into the
/// base defaults, in declaration order, and returns the combined effective
/// defaults document.
pub fn effective_defaults(
    config: &ProvisionerConfiguration,
    annotations: &BTreeMap<String, String>,
) -> Value {
    let mut accumulated = config.defaults.clone();
    for conditional in &config.conditionals {
        if conditional.selector.matches(annotations) {
            accumulated = compose_into(
                &[],
                Some(&accumulated),
                Some(&conditional.defaults),
                &config.boundaries,
            )
            .unwrap_or(accumulated);
        }
    }
    accumulated
}

/// Applies the three boundary modes to produce the effective `InstanceGroup`
/// spec from `defaults` (the output of [`effective_defaults`]) and
/// `user_spec` (the InstanceGroup as submitted).
pub fn apply_boundaries(defaults: &Value, boundaries: &Boundaries, user_spec: &Value) -> Value {
    let mut result = user_spec.clone();

    for path in &boundaries.restricted {
        if let Some(default_value) = defaults.get(path) {
            result.set(path, default_value.clone());
        }
    }

    for path in &boundaries.shared_replace {
        if result.get(path).is_none() {
            if let Some(default_value) = defaults.get(path) {
                result.set(path, default_value.clone());
            }
        }
    }

    for path in &boundaries.shared_merge {
        merge_boundary_path(&mut result, defaults, path, false);
    }

    for path in &boundaries.shared_merge_override {
        merge_boundary_path(&mut result, defaults, path, false);
    }

    result
}

fn merge_boundary_path(result: &mut Value, defaults: &Value, path: &[String], default_wins: bool) {
    let default_value = defaults.get(path);
    let user_value = result.get(path).cloned();
    let merged = match (default_value, user_value) {
        (Some(default_value), Some(user_value)) => {
            Some(merge_at(path, default_value, &user_value, !default_wins))
        }
        (Some(default_value), None) => Some(default_value.clone()),
        (None, Some(user_value)) => Some(user_value),
        (None, None) => None,
    };
    if let Some(merged) = merged {
        result.set(path, merged);
    }
}

/// Composes `overlay` into `base`, recursing through maps. At a path listed
/// under `merge`/`mergeOverride` the two sides are deep-merged (base wins
/// for plain `merge`, overlay wins for `mergeOverride`); everywhere else the
/// overlay replaces the base wholesale where present.
fn compose_into(
    path: &[String],
    base: Option<&Value>,
    overlay: Option<&Value>,
    boundaries: &Boundaries,
) -> Option<Value> {
    match (base, overlay) {
        (None, None) => None,
        (Some(base), None) => Some(base.clone()),
        (None, Some(overlay)) => Some(overlay.clone()),
        (Some(base), Some(overlay)) => match boundaries.merge_mode_at(path) {
            Some(MergeMode::Merge) => Some(merge_at(path, base, overlay, false)),
            Some(MergeMode::MergeOverride) => Some(merge_at(path, base, overlay, true)),
            None => match (base, overlay) {
                (Value::Map(base_fields), Value::Map(overlay_fields)) => {
                    let mut keys: Vec<&String> =
                        base_fields.keys().chain(overlay_fields.keys()).collect();
                    keys.sort();
                    keys.dedup();

                    let mut result = BTreeMap::new();
                    for key in keys {
                        let mut child_path = path.to_vec();
                        child_path.push(key.clone());
                        if let Some(value) = compose_into(
                            &child_path,
                            base_fields.get(key),
                            overlay_fields.get(key),
                            boundaries,
                        ) {
                            result.insert(key.clone(), value);
                        }
                    }
                    Some(Value::Map(result))
                }
                (_, overlay) => Some(overlay.clone()),
            },
        },
    }
}

/// Deep-merges `base` and `overlay` at `path`. On scalar conflicts
/// `overlay_wins` decides the winner. Maps union their keys, recursing with
/// `overlay_wins` unchanged. Lists fall back to [`merge_key_for_suffix`]
/// for schema-aware item merging, or dedupe-by-equality otherwise.
fn merge_at(path: &[String], base: &Value, overlay: &Value, overlay_wins: bool) -> Value {
    match (base, overlay) {
        (Value::Map(base_fields), Value::Map(overlay_fields)) => {
            let mut keys: Vec<&String> =
                base_fields.keys().chain(overlay_fields.keys()).collect();
            keys.sort();
            keys.dedup();

            let mut result = BTreeMap::new();
            for key in keys {
                let mut child_path = path.to_vec();
                child_path.push(key.clone());
                let value = match (base_fields.get(key), overlay_fields.get(key)) {
                    (Some(b), Some(o)) => merge_at(&child_path, b, o, overlay_wins),
                    (Some(b), None) => b.clone(),
                    (None, Some(o)) => o.clone(),
                    (None, None) => unreachable!("key came from one of the two maps"),
                };
                result.insert(key.clone(), value);
            }
            Value::Map(result)
        }
        (Value::List(base_items), Value::List(overlay_items)) => {
            merge_lists(path, base_items, overlay_items, overlay_wins)
        }
        (base, overlay) => {
            if overlay_wins {
                overlay.clone()
            } else {
                base.clone()
            }
        }
    }
}

fn merge_lists(
    path: &[String],
    base_items: &[Value],
    overlay_items: &[Value],
    overlay_wins: bool,
) -> Value {
    let suffix = path.last().map(String::as_str).unwrap_or_default();
    match merge_key_for_suffix(suffix) {
        Some(key_field) => {
            let mut result = Vec::with_capacity(base_items.len());
            let mut matched_overlay_indices = Vec::new();

            for base_item in base_items {
                let base_key = item_key(base_item, key_field);
                match overlay_items
                    .iter()
                    .enumerate()
                    .find(|(_, item)| base_key.is_some() && item_key(item, key_field) == base_key)
                {
                    Some((index, overlay_item)) => {
                        matched_overlay_indices.push(index);
                        result.push(merge_at(path, base_item, overlay_item, overlay_wins));
                    }
                    None => result.push(base_item.clone()),
                }
            }

            for (index, overlay_item) in overlay_items.iter().enumerate() {
                if !matched_overlay_indices.contains(&index) {
                    result.push(overlay_item.clone());
                }
            }

            Value::List(result)
        }
        None => {
            let mut result = base_items.to_vec();
            for overlay_item in overlay_items {
                if !result.contains(overlay_item) {
                    result.push(overlay_item.clone());
                }
            }
            Value::List(result)
        }
    }
}

fn item_key(item: &Value, key_field: &str) -> Option<serde_json::Value> {
    match item {
        Value::Map(fields) => fields
            .get(key_field)
            .map(|v| serde_json::Value::from(v.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn boundaries_with(paths: &[(&str, &[&str])]) -> Boundaries {
        let mut boundaries = Boundaries::default();
        for (mode, list) in paths {
            let parsed: Vec<Vec<String>> = list.iter().map(|p| parse_path(p)).collect();
            match *mode {
                "restricted" => boundaries.restricted = parsed,
                "shared.replace" => boundaries.shared_replace = parsed,
                "shared.merge" => boundaries.shared_merge = parsed,
                "shared.mergeOverride" => boundaries.shared_merge_override = parsed,
                other => panic!("unknown mode {other}"),
            }
        }
        boundaries
    }

    #[test]
    fn restricted_path_always_takes_the_default() {
        let defaults: Value =
            json!({"spec": {"eks": {"configuration": {"instanceType": "m5.large"}}}}).into();
        let user: Value =
            json!({"spec": {"eks": {"configuration": {"instanceType": "m5.xlarge"}}}}).into();
        let boundaries =
            boundaries_with(&[("restricted", &["spec.eks.configuration.instanceType"])]);

        let effective = apply_boundaries(&defaults, &boundaries, &user);
        let path = parse_path("spec.eks.configuration.instanceType");
        assert_eq!(
            effective.get(&path),
            Some(&Value::Scalar(json!("m5.large")))
        );
    }

    #[test]
    fn shared_merge_unions_unlisted_lists_by_deep_equality() {
        let defaults: Value =
            json!({"spec": {"eks": {"configuration": {"securityGroups": ["sg-A"]}}}}).into();
        let user: Value =
            json!({"spec": {"eks": {"configuration": {"securityGroups": ["sg-B"]}}}}).into();
        let boundaries =
            boundaries_with(&[("shared.merge", &["spec.eks.configuration.securityGroups"])]);

        let effective = apply_boundaries(&defaults, &boundaries, &user);
        let path = parse_path("spec.eks.configuration.securityGroups");
        let merged = effective.get(&path).unwrap().as_list().unwrap();
        let values: Vec<&serde_json::Value> = merged
            .iter()
            .map(|v| match v {
                Value::Scalar(s) => s,
                _ => panic!("expected scalar list items"),
            })
            .collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&&json!("sg-A")));
        assert!(values.contains(&&json!("sg-B")));
    }

    #[test]
    fn shared_merge_override_favors_user_on_schema_key_collision() {
        let defaults: Value = json!({
            "spec": {"eks": {"configuration": {"tags": [
                {"key": "a", "value": 1},
                {"key": "b", "value": 2},
            ]}}}
        })
        .into();
        let user: Value = json!({
            "spec": {"eks": {"configuration": {"tags": [
                {"key": "a", "value": 9},
                {"key": "c", "value": 3},
            ]}}}
        })
        .into();
        let boundaries = boundaries_with(&[(
            "shared.mergeOverride",
            &["spec.eks.configuration.tags"],
        )]);

        let effective = apply_boundaries(&defaults, &boundaries, &user);
        let path = parse_path("spec.eks.configuration.tags");
        let tags: serde_json::Value = effective.get(&path).unwrap().clone().into();
        let tags = tags.as_array().unwrap();

        let value_for = |key: &str| {
            tags.iter()
                .find(|t| t["key"] == key)
                .and_then(|t| t["value"].as_i64())
        };
        // mergeOverride favors the user on conflict: key "a" takes value 9.
        assert_eq!(value_for("a"), Some(9));
        assert_eq!(value_for("b"), Some(2));
        assert_eq!(value_for("c"), Some(3));
    }

    #[test]
    fn conditional_composes_into_defaults_before_boundaries_apply() {
        let base_defaults: Value =
            json!({"spec": {"eks": {"configuration": {"instanceType": "m5.large"}}}}).into();
        let conditional_defaults: Value =
            json!({"spec": {"eks": {"configuration": {"instanceType": "m5.2xlarge"}}}}).into();
        let boundaries =
            boundaries_with(&[("restricted", &["spec.eks.configuration.instanceType"])]);

        let mut annotations = BTreeMap::new();
        annotations.insert("tier".to_string(), "gpu".to_string());

        let config = ProvisionerConfiguration {
            defaults: base_defaults,
            boundaries: boundaries.clone(),
            conditionals: vec![Conditional {
                selector: AnnotationSelector::parse("tier=gpu").unwrap(),
                defaults: conditional_defaults,
            }],
        };

        let defaults = effective_defaults(&config, &annotations);
        let user: Value = json!({"spec": {"eks": {"configuration": {"instanceType": "m5.xlarge"}}}}).into();
        let effective = apply_boundaries(&defaults, &boundaries, &user);

        let path = parse_path("spec.eks.configuration.instanceType");
        assert_eq!(
            effective.get(&path),
            Some(&Value::Scalar(json!("m5.2xlarge")))
        );
    }

    #[test]
    fn digest_is_stable_for_identical_input() {
        let a = ProvisionerConfiguration::digest("defaults: {}", "restricted: []", "[]");
        let b = ProvisionerConfiguration::digest("defaults: {}", "restricted: []", "[]");
        assert_eq!(a, b);
        let c = ProvisionerConfiguration::digest("defaults: {a: 1}", "restricted: []", "[]");
        assert_ne!(a, c);
    }
}
