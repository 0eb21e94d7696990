use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use strum::{Display, EnumString};

use crate::condition::Condition;

pub const APP_NAME: &str = "instance-manager";

#[derive(Debug, Snafu)]
pub enum ValidationError {
    #[snafu(display("spec.min ({min}) must be <= spec.max ({max})"))]
    MinGreaterThanMax { min: i32, max: i32 },
    #[snafu(display("spec.min must be >= 0, got {min}"))]
    NegativeMin { min: i32 },
}

/// Which cloud provisioner backs this `InstanceGroup`.
///
/// The set is closed by design: adding a new provisioner is
/// a code change, not a plugin registration, because the reconcile driver's
/// state-transition matrix is specific to each one.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ProvisionerKind {
    SelfManaged,
    Managed,
    Fargate,
}

/// The node's identity lifecycle, mirrored onto `status.lifecycle` so peers
/// reading the `InstanceGroup` know whether its members are spot, on-demand,
/// or a mix without re-deriving it from the scaling group.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Lifecycle {
    #[default]
    Normal,
    Spot,
    Mixed,
}

/// The reconcile state machine's sum type.
///
/// Terminal (non-retryable) states are `Ready`, `Deleted`, `Err`, `Locked`;
/// every other state causes the driver to requeue at a fixed delay.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq,
    Serialize,
)]
pub enum ReconcileState {
    #[default]
    Init,
    InitCreate,
    InitUpdate,
    InitUpgrade,
    InitDelete,
    Modifying,
    Modified,
    Ready,
    Deleting,
    Deleted,
    Locked,
    Err,
}

impl ReconcileState {
    /// Terminal states never cause a requeue; every other state does.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReconcileState::Ready
                | ReconcileState::Deleted
                | ReconcileState::Err
                | ReconcileState::Locked
        )
    }
}

/// A cloud-provider tag, e.g. an EC2 tag or an IAM role tag.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// A Kubernetes taint to apply to nodes launched by this group.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

/// An EBS volume attached to self-managed instances.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub size: Quantity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_options: Option<String>,
}

/// One stage of userdata to render into the launch configuration/template.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataStage {
    pub name: String,
    pub stage: String,
    pub data: String,
}

/// An autoscaling group lifecycle hook.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleHookSpec {
    pub name: String,
    pub transition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<i64>,
}

/// Mixed-instances policy, letting a self-managed group draw from an
/// instance-type pool across on-demand and spot.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MixedInstancesPolicy {
    pub instance_pool: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_demand_base_capacity: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_demand_percentage_above_base_capacity: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_allocation_strategy: Option<String>,
}

/// Warm pool configuration for a self-managed scaling group.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_group_prepared_capacity: Option<i32>,
}

/// A Fargate profile selector: which namespace/labels get scheduled onto
/// this profile's pods.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FargateSelector {
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Provisioner-specific configuration.
///
/// This intentionally carries every field any of the three provisioners
/// might use, with everything optional: the Configuration Merger and the
/// CloudDeployer variants each only look at the subset relevant to their
/// provisioner. Unknown keys (`extra`) are accepted and round-tripped
/// without rejecting the object.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupConfiguration {
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,

    // self-managed-asg
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eks_role_arn: Option<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub user_data_stages: Vec<UserDataStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_arguments: Option<String>,
    #[serde(default)]
    pub lifecycle_hooks: Vec<LifecycleHookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixed_instances_policy: Option<MixedInstancesPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_pool: Option<WarmPoolConfig>,
    #[serde(default)]
    pub suspended_processes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot: Option<bool>,

    // managed node group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami_type: Option<String>,
    #[serde(default)]
    pub instance_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_role_arn: Option<String>,

    // fargate
    #[serde(default)]
    pub selectors: Vec<FargateSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_execution_role_arn: Option<String>,

    /// Unrecognized fields, kept verbatim so future controller versions (or
    /// the Configuration Merger's `restricted`/`shared` boundary paths) can
    /// still address them by path even if this struct doesn't have a named
    /// field for them yet.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// How node upgrades are executed for this `InstanceGroup`.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpgradeStrategy {
    RollingUpdate(RollingUpdateStrategy),
    Crd(CrdUpgradeStrategy),
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_healthy_percentage: Option<i32>,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConcurrencyPolicy {
    Forbid,
    Allow,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdUpgradeStrategy {
    pub strategy_type: String,
    /// `group/version` of the externally-defined upgrade custom resource,
    /// e.g. `upgrademgr.keikoproj.io/v1alpha1`. Needed to address it as a
    /// `kube::core::DynamicObject` since this controller never depends on
    /// its generated types.
    pub crd_api_version: String,
    pub crd_kind: String,
    pub rendered_spec: serde_json::Value,
    pub status_path: String,
    pub success_string: String,
    pub failure_string: String,
    #[serde(default = "default_concurrency_policy")]
    pub concurrency_policy: ConcurrencyPolicy,
}

fn default_concurrency_policy() -> ConcurrencyPolicy {
    ConcurrencyPolicy::Forbid
}

/// The `InstanceGroup` status subresource, controller-owned.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupStatus {
    #[serde(default)]
    pub current_state: ReconcileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_scaling_group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_launch_config_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_min: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_max: Option<i32>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Empty when the namespace carries the config-exclusion annotation.
    #[serde(default)]
    pub config_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_resource_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Default for InstanceGroupStatus {
    fn default() -> Self {
        InstanceGroupStatus {
            current_state: ReconcileState::Init,
            active_scaling_group_name: None,
            active_launch_config_name: None,
            nodes_arn: None,
            current_min: None,
            current_max: None,
            lifecycle: Lifecycle::Normal,
            config_hash: String::new(),
            strategy_resource_name: None,
            conditions: Vec::new(),
        }
    }
}

pub mod v1alpha1 {
    use super::*;

    /// An `InstanceGroup` declares a desired worker-node pool attached to a
    /// managed Kubernetes cluster. The controller reconciles it toward a
    /// cloud scaling group (self-managed ASG, managed node group, or
    /// Fargate profile) and wires node identity into the cluster's
    /// `aws-auth` ConfigMap.
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[kube(
        group = "instancemgr.k8s.io",
        version = "v1alpha1",
        kind = "InstanceGroup",
        shortname = "ig",
        namespaced,
        status = "InstanceGroupStatus"
    )]
    #[serde(rename_all = "camelCase")]
    pub struct InstanceGroupSpec {
        pub provisioner: ProvisionerKind,
        pub min: i32,
        pub max: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub strategy: Option<UpgradeStrategy>,
        #[serde(default)]
        pub configuration: InstanceGroupConfiguration,
    }

    impl InstanceGroupSpec {
        pub fn validate(&self) -> Result<(), ValidationError> {
            if self.min < 0 {
                return NegativeMinSnafu { min: self.min }.fail();
            }
            if self.min > self.max {
                return MinGreaterThanMaxSnafu {
                    min: self.min,
                    max: self.max,
                }
                .fail();
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::v1alpha1;

    #[rstest]
    #[case("self-managed")]
    #[case("managed")]
    #[case("fargate")]
    fn provisioner_kind_round_trips_through_yaml(#[case] provisioner: &str) {
        let input = format!(
            r#"
            apiVersion: instancemgr.k8s.io/v1alpha1
            kind: InstanceGroup
            metadata:
              name: workers
              namespace: default
            spec:
              provisioner: {provisioner}
              min: 1
              max: 3
              configuration:
                instanceType: m5.large
                someFutureField: hello
            "#
        );
        let ig: v1alpha1::InstanceGroup = serde_yaml::from_str(&input).expect("valid fixture");
        assert_eq!(ig.spec.provisioner.to_string(), provisioner);
        assert_eq!(
            ig.spec.configuration.extra.get("someFutureField"),
            Some(&serde_json::Value::String("hello".to_string()))
        );
        ig.spec.validate().expect("min <= max");
    }

    #[test]
    fn validate_rejects_min_greater_than_max() {
        let spec = v1alpha1::InstanceGroupSpec {
            provisioner: super::ProvisionerKind::SelfManaged,
            min: 5,
            max: 1,
            strategy: None,
            configuration: Default::default(),
        };
        assert!(spec.validate().is_err());
    }
}
