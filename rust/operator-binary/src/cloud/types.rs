//! Data transfer shapes returned by the [`super::CloudAbstractionLayer`].
//!
//! These are deliberately thinner than the underlying SDK's response types:
//! only the fields Discovery and the provisioners actually branch on are
//! kept, so a test double can construct them without dragging in the SDK.

use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub struct ScalingGroupDescription {
    pub name: String,
    pub min_size: i32,
    pub max_size: i32,
    pub desired_capacity: i32,
    pub launch_config_name: Option<String>,
    pub status: ScalingGroupStatus,
    pub tags: BTreeMap<String, String>,
    pub suspended_processes: Vec<String>,
}

/// The scaling group's "observed condition", coarsened from whatever the
/// cloud SDK actually reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScalingGroupStatus {
    Ongoing,
    Finite,
    UpdateRecoverable,
    Unrecoverable,
    FiniteDeleted,
    UnrecoverableDelete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LaunchConfigDescription {
    pub name: String,
    pub instance_type: String,
    pub image_id: String,
    pub userdata_hash: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoleDescription {
    pub arn: String,
    pub name: String,
    pub controller_created: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstanceProfileDescription {
    pub arn: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManagedNodeGroupStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    DeleteFailed,
    CreateFailed,
    Degraded,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ManagedNodeGroupDescription {
    pub name: String,
    pub status: ManagedNodeGroupStatus,
    pub labels: BTreeMap<String, String>,
    pub instance_types: Vec<String>,
    pub scaling_min: i32,
    pub scaling_max: i32,
    pub scaling_desired: i32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FargateProfileStatus {
    Creating,
    Active,
    Deleting,
    CreateFailed,
    DeleteFailed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FargateProfileDescription {
    pub name: String,
    pub status: FargateProfileStatus,
    pub pod_execution_role_arn: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InstanceTypeSpec {
    pub vcpu: i32,
    pub memory_mib: i64,
}

/// A label diff against a managed node group's current label set (spec
/// "update rebuilds the label payload as a diff").
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelDiff {
    pub added: BTreeMap<String, String>,
    pub modified: BTreeMap<String, String>,
    pub removed: Vec<String>,
}

impl LabelDiff {
    pub fn compute(current: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> LabelDiff {
        let mut diff = LabelDiff::default();
        for (key, value) in desired {
            match current.get(key) {
                None => {
                    diff.added.insert(key.clone(), value.clone());
                }
                Some(current_value) if current_value != value => {
                    diff.modified.insert(key.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        for key in current.keys() {
            if !desired.contains_key(key) {
                diff.removed.push(key.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_diff_classifies_added_modified_and_removed() {
        let current = BTreeMap::from([
            ("role".to_string(), "worker".to_string()),
            ("zone".to_string(), "a".to_string()),
        ]);
        let desired = BTreeMap::from([
            ("role".to_string(), "gpu-worker".to_string()),
            ("team".to_string(), "ml".to_string()),
        ]);

        let diff = LabelDiff::compute(&current, &desired);
        assert_eq!(diff.added.get("team"), Some(&"ml".to_string()));
        assert_eq!(diff.modified.get("role"), Some(&"gpu-worker".to_string()));
        assert_eq!(diff.removed, vec!["zone".to_string()]);
    }

    #[test]
    fn label_diff_is_empty_when_sets_match() {
        let current = BTreeMap::from([("a".to_string(), "1".to_string())]);
        assert!(LabelDiff::compute(&current, &current).is_empty());
    }
}
