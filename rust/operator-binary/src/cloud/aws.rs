//! The real [`CloudAbstractionLayer`] implementation, wiring the trait
//! surface to `aws-sdk-autoscaling`, `aws-sdk-ec2`, `aws-sdk-iam`, and
//! `aws-sdk-eks`.
//!
//! This stays at interface level (provider-specific field marshalling like
//! tag keys and userdata rendering is out of scope). It maps SDK shapes
//! onto [`super::types`] and back, and leaves anything provider-specific
//! but not load-bearing for the reconcile driver unimplemented behind a
//! `CloudError`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::error::CloudError;
use super::traits::{
    FargateProfileSpec, FargateProfiles, IamRoles, LaunchConfigSpec, LaunchConfigs,
    ManagedNodeGroupSpec, ManagedNodeGroups, OwnershipTags, ScalingGroupSpec, ScalingGroups,
};
use super::types::{
    FargateProfileDescription, FargateProfileStatus, InstanceProfileDescription, InstanceTypeSpec,
    LabelDiff, LaunchConfigDescription, ManagedNodeGroupDescription, ManagedNodeGroupStatus,
    RoleDescription, ScalingGroupDescription, ScalingGroupStatus,
};

pub struct AwsCloud {
    autoscaling: aws_sdk_autoscaling::Client,
    ec2: aws_sdk_ec2::Client,
    iam: aws_sdk_iam::Client,
    eks: aws_sdk_eks::Client,
}

impl AwsCloud {
    pub fn new(config: &aws_config::SdkConfig) -> AwsCloud {
        AwsCloud {
            autoscaling: aws_sdk_autoscaling::Client::new(config),
            ec2: aws_sdk_ec2::Client::new(config),
            iam: aws_sdk_iam::Client::new(config),
            eks: aws_sdk_eks::Client::new(config),
        }
    }
}

fn api_error(
    service: &'static str,
    operation: &'static str,
    resource: impl Into<String>,
    source: impl std::error::Error + Send + Sync + 'static,
) -> CloudError {
    CloudError::Api {
        service,
        operation,
        resource: resource.into(),
        source: Box::new(source),
    }
}

fn group_status(group: &aws_sdk_autoscaling::types::AutoScalingGroup) -> ScalingGroupStatus {
    let desired = group.desired_capacity().unwrap_or_default();
    let in_service = group
        .instances()
        .iter()
        .filter(|i| i.lifecycle_state().map(|s| s.as_str()) == Some("InService"))
        .count() as i32;
    if in_service < desired {
        ScalingGroupStatus::Ongoing
    } else {
        ScalingGroupStatus::Finite
    }
}

#[async_trait]
impl ScalingGroups for AwsCloud {
    async fn list_by_ownership(
        &self,
        tags: &OwnershipTags,
    ) -> Result<Vec<ScalingGroupDescription>, CloudError> {
        let response = self
            .autoscaling
            .describe_auto_scaling_groups()
            .send()
            .await
            .map_err(|e| api_error("autoscaling", "DescribeAutoScalingGroups", "*", e))?;

        let owned = response
            .auto_scaling_groups()
            .iter()
            .filter_map(|group| {
                let group_tags: BTreeMap<String, String> = group
                    .tags()
                    .iter()
                    .filter_map(|tag| Some((tag.key()?.to_string(), tag.value()?.to_string())))
                    .collect();
                // Filters on the cluster tag alone: a peer group shares
                // `cluster` but not `instancegroup-name`, and discovery needs
                // peers in the result set to tell self from peer by name.
                if group_tags.get("cluster") != Some(&tags.cluster) {
                    return None;
                }
                Some(ScalingGroupDescription {
                    name: group.auto_scaling_group_name().unwrap_or_default().to_string(),
                    min_size: group.min_size().unwrap_or_default(),
                    max_size: group.max_size().unwrap_or_default(),
                    desired_capacity: group.desired_capacity().unwrap_or_default(),
                    launch_config_name: group.launch_configuration_name().map(str::to_string),
                    status: group_status(group),
                    tags: group_tags,
                    suspended_processes: group
                        .suspended_processes()
                        .iter()
                        .filter_map(|p| p.process_name().map(str::to_string))
                        .collect(),
                })
            })
            .collect();
        Ok(owned)
    }

    async fn create(
        &self,
        name: &str,
        spec: &ScalingGroupSpec,
        tags: &OwnershipTags,
    ) -> Result<(), CloudError> {
        let mut request = self
            .autoscaling
            .create_auto_scaling_group()
            .auto_scaling_group_name(name)
            .launch_configuration_name(&spec.launch_config_name)
            .min_size(spec.min_size)
            .max_size(spec.max_size)
            .desired_capacity(spec.desired_capacity)
            .vpc_zone_identifier(spec.subnets.join(","));

        for (key, value) in tags.as_map() {
            request = request.tags(
                aws_sdk_autoscaling::types::Tag::builder()
                    .resource_id(name)
                    .resource_type("auto-scaling-group")
                    .key(key)
                    .value(value)
                    .propagate_at_launch(true)
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|e| api_error("autoscaling", "CreateAutoScalingGroup", name, e))?;
        Ok(())
    }

    async fn update(&self, name: &str, spec: &ScalingGroupSpec) -> Result<(), CloudError> {
        self.autoscaling
            .update_auto_scaling_group()
            .auto_scaling_group_name(name)
            .launch_configuration_name(&spec.launch_config_name)
            .min_size(spec.min_size)
            .max_size(spec.max_size)
            .desired_capacity(spec.desired_capacity)
            .send()
            .await
            .map_err(|e| api_error("autoscaling", "UpdateAutoScalingGroup", name, e))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), CloudError> {
        self.autoscaling
            .delete_auto_scaling_group()
            .auto_scaling_group_name(name)
            .force_delete(true)
            .send()
            .await
            .map_err(|e| api_error("autoscaling", "DeleteAutoScalingGroup", name, e))?;
        Ok(())
    }

    async fn suspend_processes(&self, name: &str, processes: &[String]) -> Result<(), CloudError> {
        self.autoscaling
            .suspend_processes()
            .auto_scaling_group_name(name)
            .set_scaling_processes(Some(processes.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("autoscaling", "SuspendProcesses", name, e))?;
        Ok(())
    }

    async fn resume_processes(&self, name: &str, processes: &[String]) -> Result<(), CloudError> {
        self.autoscaling
            .resume_processes()
            .auto_scaling_group_name(name)
            .set_scaling_processes(Some(processes.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("autoscaling", "ResumeProcesses", name, e))?;
        Ok(())
    }
}

/// Launch templates are the modern replacement for launch configurations;
/// this implementation targets EC2 launch templates, keyed by name the same
/// way `LaunchConfigDescription` addresses them.
#[async_trait]
impl LaunchConfigs for AwsCloud {
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<LaunchConfigDescription>, CloudError> {
        let response = self
            .ec2
            .describe_launch_templates()
            .send()
            .await
            .map_err(|e| api_error("ec2", "DescribeLaunchTemplates", "*", e))?;

        Ok(response
            .launch_templates()
            .iter()
            .filter_map(|template| template.launch_template_name())
            .filter(|name| name.starts_with(prefix))
            .map(|name| LaunchConfigDescription {
                name: name.to_string(),
                instance_type: String::new(),
                image_id: String::new(),
                userdata_hash: String::new(),
            })
            .collect())
    }

    async fn create(&self, name: &str, spec: &LaunchConfigSpec) -> Result<(), CloudError> {
        let userdata_hash = {
            let mut hasher = Sha256::new();
            hasher.update(spec.userdata.as_bytes());
            format!("{:x}", hasher.finalize())
        };
        tracing::debug!(launch_config = name, userdata_hash, "creating launch template");

        let mut launch_template_data = aws_sdk_ec2::types::RequestLaunchTemplateData::builder()
            .instance_type(spec.instance_type.as_str().into())
            .image_id(&spec.image_id)
            .user_data(&spec.userdata)
            .set_security_group_ids(Some(spec.security_groups.clone()));

        if let Some(profile_arn) = &spec.instance_profile_arn {
            launch_template_data = launch_template_data.iam_instance_profile(
                aws_sdk_ec2::types::LaunchTemplateIamInstanceProfileSpecificationRequest::builder()
                    .arn(profile_arn)
                    .build(),
            );
        }
        if let Some(key_pair) = &spec.key_pair_name {
            launch_template_data = launch_template_data.key_name(key_pair);
        }

        self.ec2
            .create_launch_template()
            .launch_template_name(name)
            .launch_template_data(launch_template_data.build())
            .send()
            .await
            .map_err(|e| api_error("ec2", "CreateLaunchTemplate", name, e))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), CloudError> {
        self.ec2
            .delete_launch_template()
            .launch_template_name(name)
            .send()
            .await
            .map_err(|e| api_error("ec2", "DeleteLaunchTemplate", name, e))?;
        Ok(())
    }
}

#[async_trait]
impl IamRoles for AwsCloud {
    async fn get_role(&self, name: &str) -> Result<Option<RoleDescription>, CloudError> {
        match self.iam.get_role().role_name(name).send().await {
            Ok(response) => Ok(response.role().map(|role| RoleDescription {
                arn: role.arn().to_string(),
                name: role.role_name().to_string(),
                controller_created: role
                    .tags()
                    .iter()
                    .any(|t| t.key() == "instancemgr.k8s.io/managed-by"),
            })),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_no_such_entity_exception()) => {
                Ok(None)
            }
            Err(e) => Err(api_error("iam", "GetRole", name, e)),
        }
    }

    async fn get_instance_profile(
        &self,
        name: &str,
    ) -> Result<Option<InstanceProfileDescription>, CloudError> {
        match self
            .iam
            .get_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
        {
            Ok(response) => Ok(response.instance_profile().map(|profile| {
                InstanceProfileDescription {
                    arn: profile.arn().to_string(),
                    name: profile.instance_profile_name().to_string(),
                }
            })),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_no_such_entity_exception()) => {
                Ok(None)
            }
            Err(e) => Err(api_error("iam", "GetInstanceProfile", name, e)),
        }
    }

    async fn create_role(
        &self,
        name: &str,
        assume_role_policy: &str,
        managed_policy_arns: &[String],
    ) -> Result<RoleDescription, CloudError> {
        let response = self
            .iam
            .create_role()
            .role_name(name)
            .assume_role_policy_document(assume_role_policy)
            .tags(
                aws_sdk_iam::types::Tag::builder()
                    .key("instancemgr.k8s.io/managed-by")
                    .value("instance-manager")
                    .build()
                    .map_err(|e| api_error("iam", "CreateRole", name, e))?,
            )
            .send()
            .await
            .map_err(|e| api_error("iam", "CreateRole", name, e))?;

        for policy_arn in managed_policy_arns {
            self.iam
                .attach_role_policy()
                .role_name(name)
                .policy_arn(policy_arn)
                .send()
                .await
                .map_err(|e| api_error("iam", "AttachRolePolicy", name, e))?;
        }

        let role = response
            .role()
            .ok_or_else(|| CloudError::Unrecoverable {
                service: "iam",
                operation: "CreateRole",
                resource: name.to_string(),
                detail: "response carried no role".to_string(),
            })?;
        Ok(RoleDescription {
            arn: role.arn().to_string(),
            name: role.role_name().to_string(),
            controller_created: true,
        })
    }

    async fn delete_role(
        &self,
        name: &str,
        managed_policy_arns: &[String],
    ) -> Result<(), CloudError> {
        for policy_arn in managed_policy_arns {
            self.iam
                .detach_role_policy()
                .role_name(name)
                .policy_arn(policy_arn)
                .send()
                .await
                .map_err(|e| api_error("iam", "DetachRolePolicy", name, e))?;
        }
        self.iam
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| api_error("iam", "DeleteRole", name, e))?;
        Ok(())
    }

    async fn create_instance_profile(
        &self,
        name: &str,
        role_name: &str,
    ) -> Result<InstanceProfileDescription, CloudError> {
        let response = self
            .iam
            .create_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(|e| api_error("iam", "CreateInstanceProfile", name, e))?;

        self.iam
            .add_role_to_instance_profile()
            .instance_profile_name(name)
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| api_error("iam", "AddRoleToInstanceProfile", name, e))?;

        let profile = response
            .instance_profile()
            .ok_or_else(|| CloudError::Unrecoverable {
                service: "iam",
                operation: "CreateInstanceProfile",
                resource: name.to_string(),
                detail: "response carried no instance profile".to_string(),
            })?;
        Ok(InstanceProfileDescription {
            arn: profile.arn().to_string(),
            name: profile.instance_profile_name().to_string(),
        })
    }

    async fn delete_instance_profile(&self, name: &str, role_name: &str) -> Result<(), CloudError> {
        self.iam
            .remove_role_from_instance_profile()
            .instance_profile_name(name)
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| api_error("iam", "RemoveRoleFromInstanceProfile", name, e))?;
        self.iam
            .delete_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(|e| api_error("iam", "DeleteInstanceProfile", name, e))?;
        Ok(())
    }
}

fn node_group_status(
    status: &aws_sdk_eks::types::NodegroupStatus,
) -> ManagedNodeGroupStatus {
    use aws_sdk_eks::types::NodegroupStatus::*;
    match status {
        Creating => ManagedNodeGroupStatus::Creating,
        Active => ManagedNodeGroupStatus::Active,
        Updating => ManagedNodeGroupStatus::Updating,
        Deleting => ManagedNodeGroupStatus::Deleting,
        DeleteFailed => ManagedNodeGroupStatus::DeleteFailed,
        CreateFailed => ManagedNodeGroupStatus::CreateFailed,
        Degraded => ManagedNodeGroupStatus::Degraded,
        _ => ManagedNodeGroupStatus::Degraded,
    }
}

#[async_trait]
impl ManagedNodeGroups for AwsCloud {
    async fn describe(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<ManagedNodeGroupDescription>, CloudError> {
        match self
            .eks
            .describe_nodegroup()
            .cluster_name(cluster)
            .nodegroup_name(name)
            .send()
            .await
        {
            Ok(response) => Ok(response.nodegroup().map(|ng| ManagedNodeGroupDescription {
                name: ng.nodegroup_name().unwrap_or_default().to_string(),
                status: ng
                    .status()
                    .map(node_group_status)
                    .unwrap_or(ManagedNodeGroupStatus::Degraded),
                labels: ng.labels().cloned().unwrap_or_default(),
                instance_types: ng.instance_types().to_vec(),
                scaling_min: ng
                    .scaling_config()
                    .and_then(|c| c.min_size())
                    .unwrap_or_default(),
                scaling_max: ng
                    .scaling_config()
                    .and_then(|c| c.max_size())
                    .unwrap_or_default(),
                scaling_desired: ng
                    .scaling_config()
                    .and_then(|c| c.desired_size())
                    .unwrap_or_default(),
            })),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_resource_not_found_exception()) => {
                Ok(None)
            }
            Err(e) => Err(api_error("eks", "DescribeNodegroup", name, e)),
        }
    }

    async fn create(
        &self,
        cluster: &str,
        name: &str,
        spec: &ManagedNodeGroupSpec,
    ) -> Result<(), CloudError> {
        self.eks
            .create_nodegroup()
            .cluster_name(cluster)
            .nodegroup_name(name)
            .node_role(&spec.node_role_arn)
            .set_subnets(Some(spec.subnets.clone()))
            .set_instance_types(Some(spec.instance_types.clone()))
            .set_labels(Some(spec.labels.clone()))
            .scaling_config(
                aws_sdk_eks::types::NodegroupScalingConfig::builder()
                    .min_size(spec.scaling_min)
                    .max_size(spec.scaling_max)
                    .desired_size(spec.scaling_desired)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| api_error("eks", "CreateNodegroup", name, e))?;
        Ok(())
    }

    async fn update_config(
        &self,
        cluster: &str,
        name: &str,
        labels: &LabelDiff,
        scaling_min: i32,
        scaling_max: i32,
    ) -> Result<(), CloudError> {
        let mut request = self
            .eks
            .update_nodegroup_config()
            .cluster_name(cluster)
            .nodegroup_name(name)
            .scaling_config(
                aws_sdk_eks::types::NodegroupScalingConfig::builder()
                    .min_size(scaling_min)
                    .max_size(scaling_max)
                    .build(),
            );

        if !labels.is_empty() {
            let mut label_update = aws_sdk_eks::types::UpdateLabelsPayload::builder();
            if !labels.added.is_empty() || !labels.modified.is_empty() {
                let mut add_or_update = labels.added.clone();
                add_or_update.extend(labels.modified.clone());
                label_update = label_update.set_add_or_update_labels(Some(add_or_update));
            }
            if !labels.removed.is_empty() {
                label_update = label_update.set_remove_labels(Some(labels.removed.clone()));
            }
            request = request.labels(label_update.build());
        }

        request
            .send()
            .await
            .map_err(|e| api_error("eks", "UpdateNodegroupConfig", name, e))?;
        Ok(())
    }

    async fn delete(&self, cluster: &str, name: &str) -> Result<(), CloudError> {
        self.eks
            .delete_nodegroup()
            .cluster_name(cluster)
            .nodegroup_name(name)
            .send()
            .await
            .map_err(|e| api_error("eks", "DeleteNodegroup", name, e))?;
        Ok(())
    }
}

fn fargate_status(
    status: &aws_sdk_eks::types::FargateProfileStatus,
) -> FargateProfileStatus {
    use aws_sdk_eks::types::FargateProfileStatus::*;
    match status {
        Creating => FargateProfileStatus::Creating,
        Active => FargateProfileStatus::Active,
        Deleting => FargateProfileStatus::Deleting,
        CreateFailed => FargateProfileStatus::CreateFailed,
        DeleteFailed => FargateProfileStatus::DeleteFailed,
        _ => FargateProfileStatus::CreateFailed,
    }
}

#[async_trait]
impl FargateProfiles for AwsCloud {
    async fn describe(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<FargateProfileDescription>, CloudError> {
        match self
            .eks
            .describe_fargate_profile()
            .cluster_name(cluster)
            .fargate_profile_name(name)
            .send()
            .await
        {
            Ok(response) => Ok(response.fargate_profile().map(|profile| {
                FargateProfileDescription {
                    name: profile.fargate_profile_name().unwrap_or_default().to_string(),
                    status: profile
                        .status()
                        .map(fargate_status)
                        .unwrap_or(FargateProfileStatus::CreateFailed),
                    pod_execution_role_arn: profile
                        .pod_execution_role_arn()
                        .unwrap_or_default()
                        .to_string(),
                }
            })),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_resource_not_found_exception()) => {
                Ok(None)
            }
            Err(e) => Err(api_error("eks", "DescribeFargateProfile", name, e)),
        }
    }

    async fn list_names(&self, cluster: &str) -> Result<Vec<String>, CloudError> {
        let response = self
            .eks
            .list_fargate_profiles()
            .cluster_name(cluster)
            .send()
            .await
            .map_err(|e| api_error("eks", "ListFargateProfiles", cluster, e))?;
        Ok(response.fargate_profile_names().to_vec())
    }

    async fn create(
        &self,
        cluster: &str,
        name: &str,
        spec: &FargateProfileSpec,
    ) -> Result<(), CloudError> {
        let mut request = self
            .eks
            .create_fargate_profile()
            .cluster_name(cluster)
            .fargate_profile_name(name)
            .pod_execution_role_arn(&spec.pod_execution_role_arn)
            .set_subnets(Some(spec.subnets.clone()));

        for (namespace, labels) in &spec.selectors {
            request = request.selectors(
                aws_sdk_eks::types::FargateProfileSelector::builder()
                    .namespace(namespace)
                    .set_labels(Some(labels.clone()))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|e| api_error("eks", "CreateFargateProfile", name, e))?;
        Ok(())
    }

    async fn delete(&self, cluster: &str, name: &str) -> Result<(), CloudError> {
        self.eks
            .delete_fargate_profile()
            .cluster_name(cluster)
            .fargate_profile_name(name)
            .send()
            .await
            .map_err(|e| api_error("eks", "DeleteFargateProfile", name, e))?;
        Ok(())
    }
}

#[async_trait]
impl super::traits::InstanceTypeCatalog for AwsCloud {
    async fn describe(&self, instance_type: &str) -> Result<Option<InstanceTypeSpec>, CloudError> {
        let response = self
            .ec2
            .describe_instance_types()
            .instance_types(instance_type.into())
            .send()
            .await
            .map_err(|e| api_error("ec2", "DescribeInstanceTypes", instance_type, e))?;
        Ok(response.instance_types().first().map(to_instance_type_spec))
    }

    async fn describe_family(
        &self,
        family: &str,
    ) -> Result<Vec<(String, InstanceTypeSpec)>, CloudError> {
        let response = self
            .ec2
            .describe_instance_types()
            .filters(
                aws_sdk_ec2::types::Filter::builder()
                    .name("instance-type")
                    .values(format!("{family}.*"))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| api_error("ec2", "DescribeInstanceTypes", family, e))?;

        Ok(response
            .instance_types()
            .iter()
            .filter_map(|info| {
                Some((info.instance_type()?.as_str().to_string(), to_instance_type_spec(info)))
            })
            .collect())
    }
}

fn to_instance_type_spec(info: &aws_sdk_ec2::types::InstanceTypeInfo) -> InstanceTypeSpec {
    InstanceTypeSpec {
        vcpu: info
            .v_cpu_info()
            .and_then(|v| v.default_v_cpus())
            .unwrap_or_default(),
        memory_mib: info
            .memory_info()
            .and_then(|m| m.size_in_mib())
            .unwrap_or_default(),
    }
}
