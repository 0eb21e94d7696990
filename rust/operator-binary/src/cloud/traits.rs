//! The Cloud Abstraction Layer: a thin, mockable interface exposing CRUD on
//! the five cloud constructs the provisioners drive.
//!
//! Each capability is its own trait so a provisioner only depends on the
//! slice it actually uses (`self-managed-asg` never touches
//! [`ManagedNodeGroups`] or [`FargateProfiles`], for instance), and so unit
//! tests can hand-roll a narrow mock instead of implementing the whole
//! surface.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::error::CloudError;
use super::types::{
    FargateProfileDescription, InstanceProfileDescription, InstanceTypeSpec, LabelDiff,
    LaunchConfigDescription, ManagedNodeGroupDescription, RoleDescription, ScalingGroupDescription,
};

/// Tags every owned scaling group and launch config carries (the
/// ownership invariant).
#[derive(Clone, Debug)]
pub struct OwnershipTags {
    pub cluster: String,
    pub instance_group_namespace: String,
    pub instance_group_name: String,
}

impl OwnershipTags {
    pub fn as_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cluster".to_string(), self.cluster.clone()),
            (
                "instancegroup-namespace".to_string(),
                self.instance_group_namespace.clone(),
            ),
            (
                "instancegroup-name".to_string(),
                self.instance_group_name.clone(),
            ),
        ])
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScalingGroupSpec {
    pub min_size: i32,
    pub max_size: i32,
    pub desired_capacity: i32,
    pub launch_config_name: String,
    pub subnets: Vec<String>,
    pub suspended_processes: Vec<String>,
    pub warm_pool_min_size: Option<i32>,
    pub warm_pool_max_prepared_capacity: Option<i32>,
}

#[async_trait]
pub trait ScalingGroups: Send + Sync {
    /// Lists every scaling group tagged with `tags.cluster` (used by
    /// Discovery to find this group and its peers).
    async fn list_by_ownership(
        &self,
        tags: &OwnershipTags,
    ) -> Result<Vec<ScalingGroupDescription>, CloudError>;

    async fn create(
        &self,
        name: &str,
        spec: &ScalingGroupSpec,
        tags: &OwnershipTags,
    ) -> Result<(), CloudError>;

    async fn update(&self, name: &str, spec: &ScalingGroupSpec) -> Result<(), CloudError>;

    async fn delete(&self, name: &str) -> Result<(), CloudError>;

    async fn suspend_processes(&self, name: &str, processes: &[String]) -> Result<(), CloudError>;

    async fn resume_processes(&self, name: &str, processes: &[String]) -> Result<(), CloudError>;
}

#[derive(Clone, Debug, Default)]
pub struct LaunchConfigSpec {
    pub instance_type: String,
    pub image_id: String,
    pub key_pair_name: Option<String>,
    pub security_groups: Vec<String>,
    pub userdata: String,
    pub instance_profile_arn: Option<String>,
}

#[async_trait]
pub trait LaunchConfigs: Send + Sync {
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<LaunchConfigDescription>, CloudError>;

    async fn create(&self, name: &str, spec: &LaunchConfigSpec) -> Result<(), CloudError>;

    async fn delete(&self, name: &str) -> Result<(), CloudError>;
}

#[async_trait]
pub trait IamRoles: Send + Sync {
    async fn get_role(&self, name: &str) -> Result<Option<RoleDescription>, CloudError>;

    async fn get_instance_profile(
        &self,
        name: &str,
    ) -> Result<Option<InstanceProfileDescription>, CloudError>;

    async fn create_role(
        &self,
        name: &str,
        assume_role_policy: &str,
        managed_policy_arns: &[String],
    ) -> Result<RoleDescription, CloudError>;

    async fn delete_role(&self, name: &str, managed_policy_arns: &[String])
        -> Result<(), CloudError>;

    /// Creates an instance profile named `name` and adds `role_name` to it.
    /// Self-managed launch configurations reference the profile, not the
    /// role, so a controller-created role is useless to EC2 until this runs.
    async fn create_instance_profile(
        &self,
        name: &str,
        role_name: &str,
    ) -> Result<InstanceProfileDescription, CloudError>;

    async fn delete_instance_profile(&self, name: &str, role_name: &str) -> Result<(), CloudError>;
}

#[derive(Clone, Debug, Default)]
pub struct ManagedNodeGroupSpec {
    pub instance_types: Vec<String>,
    pub ami_type: Option<String>,
    pub subnets: Vec<String>,
    pub node_role_arn: String,
    pub scaling_min: i32,
    pub scaling_max: i32,
    pub scaling_desired: i32,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait ManagedNodeGroups: Send + Sync {
    async fn describe(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<ManagedNodeGroupDescription>, CloudError>;

    async fn create(
        &self,
        cluster: &str,
        name: &str,
        spec: &ManagedNodeGroupSpec,
    ) -> Result<(), CloudError>;

    async fn update_config(
        &self,
        cluster: &str,
        name: &str,
        labels: &LabelDiff,
        scaling_min: i32,
        scaling_max: i32,
    ) -> Result<(), CloudError>;

    async fn delete(&self, cluster: &str, name: &str) -> Result<(), CloudError>;
}

#[derive(Clone, Debug, Default)]
pub struct FargateProfileSpec {
    pub pod_execution_role_arn: String,
    pub subnets: Vec<String>,
    pub selectors: Vec<(String, BTreeMap<String, String>)>,
}

#[async_trait]
pub trait FargateProfiles: Send + Sync {
    async fn describe(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<FargateProfileDescription>, CloudError>;

    async fn list_names(&self, cluster: &str) -> Result<Vec<String>, CloudError>;

    async fn create(
        &self,
        cluster: &str,
        name: &str,
        spec: &FargateProfileSpec,
    ) -> Result<(), CloudError>;

    async fn delete(&self, cluster: &str, name: &str) -> Result<(), CloudError>;
}

#[async_trait]
pub trait InstanceTypeCatalog: Send + Sync {
    async fn describe(&self, instance_type: &str) -> Result<Option<InstanceTypeSpec>, CloudError>;

    /// Every instance type in the given family (used to build a VSP
    /// [`crate::vsp::InstanceTypeRange`] when no explicit type list is
    /// configured).
    async fn describe_family(
        &self,
        family: &str,
    ) -> Result<Vec<(String, InstanceTypeSpec)>, CloudError>;
}

/// The full Cloud Abstraction Layer surface (the "Cloud Abstraction
/// Layer" component): a blanket trait over the six capability traits so the
/// rest of the controller can hold a single `Arc<dyn CloudAbstractionLayer>`.
pub trait CloudAbstractionLayer:
    ScalingGroups + LaunchConfigs + IamRoles + ManagedNodeGroups + FargateProfiles + InstanceTypeCatalog
{
}

impl<T> CloudAbstractionLayer for T where
    T: ScalingGroups
        + LaunchConfigs
        + IamRoles
        + ManagedNodeGroups
        + FargateProfiles
        + InstanceTypeCatalog
{
}
