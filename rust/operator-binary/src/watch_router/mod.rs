//! The Watch Router: pure mapping functions from a raw watch event to the
//! set of `InstanceGroup` keys that should be nudged, plus the small bit of
//! cached state (namespace annotations) those mappings need. Wiring these
//! into an actual `kube::runtime::Controller` happens in `main.rs` via
//! `.watches(...)`; this module only holds the logic that decides, not the
//! watcher plumbing itself.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cloud::types::ScalingGroupDescription;
use crate::shared_context::NamespacedName;

/// Node role label the kubelet sets when joining; some AMIs/bootstrap
/// scripts only set the newer `node.kubernetes.io/role` form, which several
/// node-selector-based workloads don't recognize yet.
const NODE_ROLE_LABEL_LEGACY: &str = "kubernetes.io/role";
const NODE_ROLE_LABEL_CURRENT: &str = "node.kubernetes.io/role";

const SPOT_RECOMMENDATION_REASON: &str = "SpotRecommendationGiven";

/// Caches each namespace's last-observed annotations so the Namespace watch
/// can detect a change instead of re-enqueueing on every resync.
pub struct NamespaceCache {
    inner: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl NamespaceCache {
    pub fn new() -> NamespaceCache {
        NamespaceCache {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    /// Records `annotations` as the namespace's current state and reports
    /// whether it differs from what was cached before.
    pub fn observe(&self, namespace: &str, annotations: BTreeMap<String, String>) -> bool {
        let mut inner = self.inner.write().unwrap();
        let changed = inner.get(namespace) != Some(&annotations);
        inner.insert(namespace.to_string(), annotations);
        changed
    }
}

impl Default for NamespaceCache {
    fn default() -> NamespaceCache {
        NamespaceCache::new()
    }
}

/// ConfigMap watch: an `InstanceGroup` is stale if its persisted
/// `configHash` no longer matches the document's current digest.
pub fn config_hash_is_stale(persisted_hash: &str, current_digest: &str) -> bool {
    persisted_hash != current_digest
}

/// Node watch: returns the label patch to apply when a node carries the
/// current role label but not the legacy one workloads still select on.
/// `None` means no patch is needed.
pub fn node_role_label_patch(labels: &BTreeMap<String, String>) -> Option<(String, String)> {
    let role = labels.get(NODE_ROLE_LABEL_CURRENT)?;
    if labels.contains_key(NODE_ROLE_LABEL_LEGACY) {
        return None;
    }
    Some((NODE_ROLE_LABEL_LEGACY.to_string(), role.clone()))
}

/// Event watch filter: a spot-interruption recommendation, recent enough to
/// still be actionable.
pub fn is_actionable_spot_recommendation(
    reason: &str,
    last_seen: DateTime<Utc>,
    now: DateTime<Utc>,
    max_age: Duration,
) -> bool {
    if reason != SPOT_RECOMMENDATION_REASON {
        return false;
    }
    match (now - last_seen).to_std() {
        Ok(age) => age <= max_age,
        // A `last_seen` after `now` (clock skew) is treated as fresh.
        Err(_) => true,
    }
}

/// Event watch resolution: maps the scaling group name an event's
/// `involvedObject` names back to the `InstanceGroup` that owns it, via the
/// ownership tags every owned scaling group carries.
pub fn resolve_owning_instance_group(
    groups: &[ScalingGroupDescription],
    involved_object_name: &str,
) -> Option<NamespacedName> {
    let group = groups.iter().find(|g| g.name == involved_object_name)?;
    let namespace = group.tags.get("instancegroup-namespace")?;
    let name = group.tags.get("instancegroup-name")?;
    Some(NamespacedName::new(namespace.clone(), name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(namespace: &str, name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cluster".to_string(), "prod".to_string()),
            ("instancegroup-namespace".to_string(), namespace.to_string()),
            ("instancegroup-name".to_string(), name.to_string()),
        ])
    }

    #[test]
    fn namespace_cache_reports_no_change_on_identical_annotations() {
        let cache = NamespaceCache::new();
        let annotations = BTreeMap::from([("a".to_string(), "b".to_string())]);
        assert!(cache.observe("default", annotations.clone()));
        assert!(!cache.observe("default", annotations));
    }

    #[test]
    fn namespace_cache_reports_change_on_new_annotation() {
        let cache = NamespaceCache::new();
        cache.observe("default", BTreeMap::new());
        assert!(cache.observe(
            "default",
            BTreeMap::from([("instancemgr.k8s.io/config-excluded".to_string(), "true".to_string())])
        ));
    }

    #[test]
    fn node_role_label_patch_fills_in_the_legacy_label() {
        let labels = BTreeMap::from([(NODE_ROLE_LABEL_CURRENT.to_string(), "worker".to_string())]);
        assert_eq!(
            node_role_label_patch(&labels),
            Some((NODE_ROLE_LABEL_LEGACY.to_string(), "worker".to_string()))
        );
    }

    #[test]
    fn node_role_label_patch_is_noop_when_both_labels_present() {
        let labels = BTreeMap::from([
            (NODE_ROLE_LABEL_CURRENT.to_string(), "worker".to_string()),
            (NODE_ROLE_LABEL_LEGACY.to_string(), "worker".to_string()),
        ]);
        assert_eq!(node_role_label_patch(&labels), None);
    }

    #[test]
    fn spot_recommendation_filters_by_reason_and_age() {
        let now = Utc::now();
        assert!(is_actionable_spot_recommendation(
            SPOT_RECOMMENDATION_REASON,
            now - chrono::Duration::seconds(5),
            now,
            Duration::from_secs(60)
        ));
        assert!(!is_actionable_spot_recommendation(
            SPOT_RECOMMENDATION_REASON,
            now - chrono::Duration::seconds(120),
            now,
            Duration::from_secs(60)
        ));
        assert!(!is_actionable_spot_recommendation(
            "Other",
            now,
            now,
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn resolve_owning_instance_group_reads_ownership_tags() {
        let groups = vec![ScalingGroupDescription {
            name: "prod-default-workers".to_string(),
            min_size: 1,
            max_size: 5,
            desired_capacity: 2,
            launch_config_name: None,
            status: crate::cloud::types::ScalingGroupStatus::Finite,
            tags: tags("default", "workers"),
            suspended_processes: Vec::new(),
        }];
        assert_eq!(
            resolve_owning_instance_group(&groups, "prod-default-workers"),
            Some(NamespacedName::new("default", "workers"))
        );
        assert_eq!(resolve_owning_instance_group(&groups, "unrelated"), None);
    }
}
