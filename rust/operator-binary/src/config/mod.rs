//! The Configuration Merger: materializes the effective
//! `InstanceGroup` spec from the cluster-wide `instance-manager` ConfigMap
//! plus the user's spec, honoring boundary modes, annotation-selected
//! conditionals, and per-namespace exclusion.

mod error;
mod merge_schema;
mod merger;
mod selector;
mod tree;

use std::collections::BTreeMap;

pub use error::MergeError;
pub use merger::{Boundaries, Conditional, ProvisionerConfiguration};
pub use selector::{AnnotationSelector, SelectorError};
pub use tree::Value;

use instance_manager_crd::annotations::{is_truthy, CONFIG_EXCLUDED};

/// Outcome of running the merger against one `InstanceGroup`.
pub struct MergeOutcome {
    /// The effective spec, to be applied to the cloud deployer.
    pub effective_spec: Value,
    /// `InstanceGroupStatus::config_hash` for this reconcile, or the empty
    /// string when the namespace opted out of merging.
    pub config_hash: String,
}

/// Runs the full merge: skips entirely (clearing the hash) when the
/// namespace carries the exclusion annotation, otherwise folds matching
/// conditionals into the base defaults and applies the boundary modes
/// against `user_spec`.
pub fn merge(
    config: &ProvisionerConfiguration,
    raw_document: (&str, &str, &str),
    namespace_annotations: &BTreeMap<String, String>,
    instance_group_annotations: &BTreeMap<String, String>,
    user_spec: &Value,
) -> MergeOutcome {
    if is_truthy(namespace_annotations.get(CONFIG_EXCLUDED)) {
        return MergeOutcome {
            effective_spec: user_spec.clone(),
            config_hash: String::new(),
        };
    }

    let defaults = merger::effective_defaults(config, instance_group_annotations);
    let effective_spec = merger::apply_boundaries(&defaults, &config.boundaries, user_spec);
    let (defaults_yaml, boundaries_yaml, conditionals_yaml) = raw_document;
    let config_hash =
        ProvisionerConfiguration::digest(defaults_yaml, boundaries_yaml, conditionals_yaml);

    MergeOutcome {
        effective_spec,
        config_hash,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn namespace_exclusion_short_circuits_the_merge_and_clears_the_hash() {
        let config = ProvisionerConfiguration {
            defaults: json!({"spec": {"eks": {"configuration": {"instanceType": "m5.large"}}}})
                .into(),
            boundaries: Boundaries {
                restricted: vec![tree::parse_path("spec.eks.configuration.instanceType")],
                ..Boundaries::default()
            },
            conditionals: vec![],
        };
        let user_spec: Value =
            json!({"spec": {"eks": {"configuration": {"instanceType": "m5.xlarge"}}}}).into();

        let mut namespace_annotations = BTreeMap::new();
        namespace_annotations.insert(CONFIG_EXCLUDED.to_string(), "true".to_string());

        let outcome = merge(
            &config,
            ("defaults: {}", "restricted: []", "[]"),
            &namespace_annotations,
            &BTreeMap::new(),
            &user_spec,
        );

        assert_eq!(outcome.effective_spec, user_spec);
        assert_eq!(outcome.config_hash, "");
    }
}
