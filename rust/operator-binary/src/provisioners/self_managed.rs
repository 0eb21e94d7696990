//! The self-managed-asg provisioner: a launch template fronting an
//! autoscaling group. Owns the most cloud surface of the three variants
//! (scaling group, launch config, and optionally an IAM role/instance
//! profile when the configuration doesn't supply `eksRoleArn`).

use async_trait::async_trait;
use snafu::ResultExt;

use instance_manager_crd::instance_group::ReconcileState;

use crate::auth_map::{self, AuthMapEntry, OsFamily};
use crate::cloud::{IamRoles, LaunchConfigSpec, LaunchConfigs, OwnershipTags, ScalingGroupSpec, ScalingGroups};
use crate::state_machine::{launch_config_fingerprint, CloudDeployer};
use crate::upgrade::{self, UpgradeOutcome};

use super::{AuthMapSnafu, CloudSnafu, ProvisionerContext, ProvisionerError, UpgradeSnafu};

const ROLE_PREFIX: &str = "instancemgr";

/// The default EC2 assume-role policy for worker nodes, used only when the
/// spec doesn't supply `eksRoleArn` and a role has to be created.
const ASSUME_ROLE_POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"Service":"ec2.amazonaws.com"},"Action":"sts:AssumeRole"}]}"#;

const DEFAULT_MANAGED_POLICIES: &[&str] = &[
    "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
    "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
];

pub struct SelfManagedDeployer {
    ctx: ProvisionerContext,
}

impl SelfManagedDeployer {
    pub fn new(ctx: ProvisionerContext) -> SelfManagedDeployer {
        SelfManagedDeployer { ctx }
    }

    fn ownership_tags(&self) -> OwnershipTags {
        crate::discovery::ownership_tags(&self.ctx.cluster_name, &self.ctx.instance_group)
    }

    fn launch_config_spec(&self) -> LaunchConfigSpec {
        let config = &self.ctx.instance_group.spec.configuration;
        let userdata = render_userdata(config);
        LaunchConfigSpec {
            instance_type: config.instance_type.clone().unwrap_or_default(),
            image_id: config.image_id.clone().unwrap_or_default(),
            key_pair_name: config.key_pair_name.clone(),
            security_groups: config.security_groups.clone(),
            userdata,
            instance_profile_arn: self
                .ctx
                .discovered
                .instance_profile
                .as_ref()
                .map(|p| p.arn.clone()),
        }
    }

    fn launch_config_name(&self) -> String {
        let fingerprint = launch_config_fingerprint(&self.ctx.instance_group.spec.configuration);
        format!("instancemgr-{}-{}", self.ctx.scaling_group_name, &fingerprint[..12])
    }

    fn scaling_group_spec(&self, launch_config_name: String) -> ScalingGroupSpec {
        let spec = &self.ctx.instance_group.spec;
        let config = &spec.configuration;
        ScalingGroupSpec {
            min_size: spec.min,
            max_size: spec.max,
            desired_capacity: spec.min,
            launch_config_name,
            subnets: config.subnets.clone(),
            suspended_processes: config.suspended_processes.clone(),
            warm_pool_min_size: config.warm_pool.as_ref().and_then(|w| w.min_size),
            warm_pool_max_prepared_capacity: config
                .warm_pool
                .as_ref()
                .and_then(|w| w.max_group_prepared_capacity),
        }
    }

    fn role_name(&self) -> String {
        format!("{ROLE_PREFIX}-{}", self.ctx.scaling_group_name)
    }

    /// Whether some other active scaling group in the cluster still backs
    /// onto `role_name`. True only when a peer's own controller-created
    /// role would derive to the same name, which the unique per-group
    /// naming scheme means never actually happens. A user-supplied
    /// `eksRoleArn` carries no such signal in a peer's scaling-group
    /// description, so shared roles are left untouched by `delete` entirely
    /// (see the `controller_created` gate at the call site).
    fn role_still_in_use_by_peers(&self, role_name: &str) -> bool {
        self.ctx
            .discovered
            .peer_scaling_groups
            .iter()
            .any(|peer| format!("{ROLE_PREFIX}-{}", peer.name) == role_name)
    }
}

/// Joins every configured userdata stage into the launch configuration's
/// bootstrap script. The actual bootstrap arguments (if any) run last, after
/// every stage, mirroring the order an operator would expect custom bits to
/// layer on top of.
fn render_userdata(config: &instance_manager_crd::InstanceGroupConfiguration) -> String {
    let mut script = String::new();
    for stage in &config.user_data_stages {
        script.push_str(&format!("# stage: {} ({})\n{}\n", stage.name, stage.stage, stage.data));
    }
    if let Some(bootstrap) = &config.bootstrap_arguments {
        script.push_str(bootstrap);
        script.push('\n');
    }
    script
}

#[async_trait]
impl CloudDeployer for SelfManagedDeployer {
    type Error = ProvisionerError;

    async fn create(&self) -> Result<(), ProvisionerError> {
        if self.ctx.instance_group.spec.configuration.eks_role_arn.is_none()
            && self.ctx.discovered.role.is_none()
        {
            IamRoles::create_role(
                self.ctx.cloud.as_ref(),
                &self.role_name(),
                ASSUME_ROLE_POLICY,
                &DEFAULT_MANAGED_POLICIES.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
            .await
            .context(CloudSnafu)?;
            IamRoles::create_instance_profile(self.ctx.cloud.as_ref(), &self.role_name(), &self.role_name())
                .await
                .context(CloudSnafu)?;
        }

        let launch_config_name = self.launch_config_name();
        LaunchConfigs::create(self.ctx.cloud.as_ref(), &launch_config_name, &self.launch_config_spec())
            .await
            .context(CloudSnafu)?;

        ScalingGroups::create(
            self.ctx.cloud.as_ref(),
            &self.ctx.scaling_group_name,
            &self.scaling_group_spec(launch_config_name),
            &self.ownership_tags(),
        )
        .await
        .context(CloudSnafu)
    }

    async fn update(&self) -> Result<(), ProvisionerError> {
        let launch_config_name = self.launch_config_name();
        let fingerprint_changed = self
            .ctx
            .discovered
            .self_launch_config
            .as_ref()
            .map(|lc| lc.name != launch_config_name)
            .unwrap_or(true);

        if fingerprint_changed {
            LaunchConfigs::create(self.ctx.cloud.as_ref(), &launch_config_name, &self.launch_config_spec())
                .await
                .context(CloudSnafu)?;
        }

        ScalingGroups::update(
            self.ctx.cloud.as_ref(),
            &self.ctx.scaling_group_name,
            &self.scaling_group_spec(launch_config_name),
        )
        .await
        .context(CloudSnafu)?;

        let desired: Vec<String> = self
            .ctx
            .instance_group
            .spec
            .configuration
            .suspended_processes
            .clone();
        let current: Vec<String> = self
            .ctx
            .discovered
            .self_scaling_group
            .as_ref()
            .map(|g| g.suspended_processes.clone())
            .unwrap_or_default();

        let to_suspend: Vec<String> = desired.iter().filter(|p| !current.contains(p)).cloned().collect();
        let to_resume: Vec<String> = current.iter().filter(|p| !desired.contains(p)).cloned().collect();

        if !to_suspend.is_empty() {
            ScalingGroups::suspend_processes(self.ctx.cloud.as_ref(), &self.ctx.scaling_group_name, &to_suspend)
                .await
                .context(CloudSnafu)?;
        }
        if !to_resume.is_empty() {
            ScalingGroups::resume_processes(self.ctx.cloud.as_ref(), &self.ctx.scaling_group_name, &to_resume)
                .await
                .context(CloudSnafu)?;
        }

        Ok(())
    }

    async fn delete(&self) -> Result<(), ProvisionerError> {
        ScalingGroups::delete(self.ctx.cloud.as_ref(), &self.ctx.scaling_group_name)
            .await
            .context(CloudSnafu)?;

        if let Some(role) = &self.ctx.discovered.role {
            if role.controller_created && !self.role_still_in_use_by_peers(&role.name) {
                auth_map::reconcile_auth_map(&self.ctx.kube_client, &[], &[role.arn.clone()])
                    .await
                    .context(AuthMapSnafu)?;
            }

            if role.controller_created {
                IamRoles::delete_instance_profile(self.ctx.cloud.as_ref(), &role.name, &role.name)
                    .await
                    .context(CloudSnafu)?;
                IamRoles::delete_role(
                    self.ctx.cloud.as_ref(),
                    &role.name,
                    &DEFAULT_MANAGED_POLICIES.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                )
                .await
                .context(CloudSnafu)?;
            }
        }

        if let Some(launch_config) = &self.ctx.discovered.self_launch_config {
            LaunchConfigs::delete(self.ctx.cloud.as_ref(), &launch_config.name)
                .await
                .context(CloudSnafu)?;
        }

        Ok(())
    }

    async fn upgrade_nodes(&self) -> Result<ReconcileState, ProvisionerError> {
        use instance_manager_crd::instance_group::UpgradeStrategy;

        match &self.ctx.instance_group.spec.strategy {
            Some(UpgradeStrategy::Crd(strategy)) => {
                let namespace = self
                    .ctx
                    .instance_group
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_default();
                let outcome = upgrade::reconcile(
                    &self.ctx.kube_client,
                    &namespace,
                    strategy,
                    &self.ctx.scaling_group_name,
                    &self.ctx.discovered.owned_upgrade_resources,
                    &self.ctx.discovered.active_upgrade_resources,
                )
                .await
                .context(UpgradeSnafu)?;

                Ok(match outcome {
                    UpgradeOutcome::Deferred | UpgradeOutcome::InProgress => ReconcileState::Modifying,
                    UpgradeOutcome::Succeeded => ReconcileState::Modified,
                })
            }
            // A plain rolling-update strategy (or none at all) has no
            // separate migration step here: the new launch configuration
            // `update` already wrote takes effect for instances the scaling
            // group replaces on its own.
            _ => Ok(ReconcileState::Modified),
        }
    }

    async fn bootstrap_nodes(&self) -> Result<(), ProvisionerError> {
        let Some(role_arn) = self
            .ctx
            .discovered
            .role
            .as_ref()
            .map(|r| r.arn.clone())
            .or_else(|| self.ctx.instance_group.spec.configuration.eks_role_arn.clone())
        else {
            return Ok(());
        };

        auth_map::reconcile_auth_map(
            &self.ctx.kube_client,
            &[AuthMapEntry {
                role_arn,
                os_family: OsFamily::Linux,
            }],
            &[],
        )
        .await
        .context(AuthMapSnafu)
    }

    fn is_ready(&self) -> bool {
        self.ctx
            .discovered
            .self_scaling_group
            .as_ref()
            .map(|g| matches!(g.status, crate::cloud::types::ScalingGroupStatus::Finite))
            .unwrap_or(false)
    }
}
