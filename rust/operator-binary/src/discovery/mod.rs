//! The Discovery Subsystem: per-provisioner, queries cloud +
//! cluster and assembles the per-reconcile [`DiscoveredState`] snapshot.

use std::sync::Arc;

use kube::core::DynamicObject;
use kube::runtime::events::Recorder;
use kube::Client;
use snafu::{ResultExt, Snafu};

use instance_manager_crd::instance_group::{ProvisionerKind, UpgradeStrategy};
use instance_manager_crd::v1alpha1::InstanceGroup;

use crate::cloud::types::{
    FargateProfileDescription, InstanceProfileDescription, LaunchConfigDescription,
    ManagedNodeGroupDescription, RoleDescription, ScalingGroupDescription,
};
use crate::cloud::{
    CloudAbstractionLayer, CloudError, FargateProfiles, ManagedNodeGroups, OwnershipTags,
};
use crate::upgrade::{self, UpgradeError};

#[derive(Debug, Snafu)]
pub enum DiscoveryError {
    #[snafu(display("cloud discovery failed"))]
    Cloud { source: CloudError },
    #[snafu(display("upgrade resource discovery failed"))]
    Upgrade { source: UpgradeError },
}

/// Per-reconcile snapshot of cloud + cluster state. Constructed at
/// the start of a reconcile and dropped at the end. Nothing here is persisted.
pub struct DiscoveredState {
    pub self_scaling_group: Option<ScalingGroupDescription>,
    pub self_launch_config: Option<LaunchConfigDescription>,
    pub role: Option<RoleDescription>,
    pub instance_profile: Option<InstanceProfileDescription>,
    pub managed_node_group: Option<ManagedNodeGroupDescription>,
    pub fargate_profile: Option<FargateProfileDescription>,
    pub peer_scaling_groups: Vec<ScalingGroupDescription>,
    pub owned_upgrade_resources: Vec<DynamicObject>,
    pub active_upgrade_resources: Vec<DynamicObject>,
    pub config_hash: String,
    pub publisher: Arc<Recorder>,
}

impl DiscoveredState {
    fn empty(publisher: Arc<Recorder>, config_hash: String) -> DiscoveredState {
        DiscoveredState {
            self_scaling_group: None,
            self_launch_config: None,
            role: None,
            instance_profile: None,
            managed_node_group: None,
            fargate_profile: None,
            peer_scaling_groups: Vec::new(),
            owned_upgrade_resources: Vec::new(),
            active_upgrade_resources: Vec::new(),
            config_hash,
            publisher,
        }
    }
}

pub struct Discoverer {
    pub cloud: Arc<dyn CloudAbstractionLayer>,
    pub kube_client: Client,
    pub cluster_name: String,
}

impl Discoverer {
    pub async fn discover(
        &self,
        instance_group: &InstanceGroup,
        publisher: Arc<Recorder>,
        config_hash: String,
    ) -> Result<DiscoveredState, DiscoveryError> {
        let mut state = DiscoveredState::empty(publisher, config_hash);

        match instance_group.spec.provisioner {
            ProvisionerKind::SelfManaged => self.discover_self_managed(instance_group, &mut state).await?,
            ProvisionerKind::Managed => self.discover_managed(instance_group, &mut state).await?,
            ProvisionerKind::Fargate => self.discover_fargate(instance_group, &mut state).await?,
        }

        if let Some(UpgradeStrategy::Crd(strategy)) = &instance_group.spec.strategy {
            if let Some(scope) = &state.self_scaling_group.as_ref().map(|g| g.name.clone()) {
                let namespace = instance_group
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_default();
                let (owned, active) =
                    upgrade::discover_upgrade_resources(&self.kube_client, &namespace, strategy, scope)
                        .await
                        .context(UpgradeSnafu)?;
                state.owned_upgrade_resources = owned;
                state.active_upgrade_resources = active;
            }
        }

        Ok(state)
    }

    async fn discover_self_managed(
        &self,
        instance_group: &InstanceGroup,
        state: &mut DiscoveredState,
    ) -> Result<(), DiscoveryError> {
        let tags = ownership_tags(&self.cluster_name, instance_group);
        let groups = self.cloud.list_by_ownership(&tags).await.context(CloudSnafu)?;

        let namespace = instance_group.metadata.namespace.clone().unwrap_or_default();
        let name = instance_group.metadata.name.clone().unwrap_or_default();
        let expected_name = scaling_group_name(&self.cluster_name, &namespace, &name);

        for group in groups {
            if group.name == expected_name {
                state.self_scaling_group = Some(group);
            } else {
                state.peer_scaling_groups.push(group);
            }
        }

        let launch_configs = self
            .cloud
            .list_by_prefix("instancemgr-")
            .await
            .context(CloudSnafu)?;
        state.self_launch_config = state
            .self_scaling_group
            .as_ref()
            .and_then(|g| g.launch_config_name.clone())
            .and_then(|name| launch_configs.into_iter().find(|lc| lc.name == name));

        let role_name = match &instance_group.spec.configuration.eks_role_arn {
            Some(role_arn) => Some(role_name_from_arn(role_arn).to_string()),
            // No role supplied: look for the one this controller would have
            // created, named after the scaling group it backs.
            None => Some(format!("instancemgr-{expected_name}")),
        };

        if let Some(role_name) = role_name {
            state.role = self.cloud.get_role(&role_name).await.context(CloudSnafu)?;
            if let Some(role) = &state.role {
                state.instance_profile = self
                    .cloud
                    .get_instance_profile(&role.name)
                    .await
                    .context(CloudSnafu)?;
            }
        }

        Ok(())
    }

    async fn discover_managed(
        &self,
        instance_group: &InstanceGroup,
        state: &mut DiscoveredState,
    ) -> Result<(), DiscoveryError> {
        let name = scaling_group_name(
            &self.cluster_name,
            &instance_group.metadata.namespace.clone().unwrap_or_default(),
            &instance_group.metadata.name.clone().unwrap_or_default(),
        );
        state.managed_node_group =
            ManagedNodeGroups::describe(self.cloud.as_ref(), &self.cluster_name, &name)
                .await
                .context(CloudSnafu)?;
        Ok(())
    }

    async fn discover_fargate(
        &self,
        instance_group: &InstanceGroup,
        state: &mut DiscoveredState,
    ) -> Result<(), DiscoveryError> {
        let name = scaling_group_name(
            &self.cluster_name,
            &instance_group.metadata.namespace.clone().unwrap_or_default(),
            &instance_group.metadata.name.clone().unwrap_or_default(),
        );
        state.fargate_profile =
            FargateProfiles::describe(self.cloud.as_ref(), &self.cluster_name, &name)
                .await
                .context(CloudSnafu)?;
        // Peer profile names enforce EKS's single-active-mutation-per-cluster
        // constraint; discovery only needs the count, so the provisioner's
        // retry loop re-lists when it actually mutates.
        let _peers = self.cloud.list_names(&self.cluster_name).await.context(CloudSnafu)?;
        Ok(())
    }
}

/// Derives the scaling-group/managed-node-group/fargate-profile name this
/// `InstanceGroup` owns:
/// `{cluster}-{ns}-{name}`.
pub fn scaling_group_name(cluster: &str, namespace: &str, name: &str) -> String {
    format!("{cluster}-{namespace}-{name}")
}

pub fn ownership_tags(cluster: &str, instance_group: &InstanceGroup) -> OwnershipTags {
    OwnershipTags {
        cluster: cluster.to_string(),
        instance_group_namespace: instance_group.metadata.namespace.clone().unwrap_or_default(),
        instance_group_name: instance_group.metadata.name.clone().unwrap_or_default(),
    }
}

fn role_name_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_group_name_matches_the_boundary_scenario_format() {
        assert_eq!(
            scaling_group_name("prod-cluster", "default", "workers"),
            "prod-cluster-default-workers"
        );
    }

    #[test]
    fn role_name_from_arn_strips_the_path() {
        assert_eq!(
            role_name_from_arn("arn:aws:iam::123456789012:role/instancemgr-workers"),
            "instancemgr-workers"
        );
    }
}
