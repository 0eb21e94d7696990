//! The managed-node-group provisioner: EKS owns the underlying launch
//! template and instance lifecycle, so this variant's surface is small:
//! `create`/`update`/`delete` against the managed node group API, nothing
//! else.

use async_trait::async_trait;
use snafu::ResultExt;

use instance_manager_crd::instance_group::ReconcileState;

use crate::auth_map::{self, AuthMapEntry, OsFamily};
use crate::cloud::types::{LabelDiff, ManagedNodeGroupStatus};
use crate::cloud::{ManagedNodeGroupSpec, ManagedNodeGroups};
use crate::state_machine::CloudDeployer;

use super::{AuthMapSnafu, CloudSnafu, ProvisionerContext, ProvisionerError};

pub struct ManagedDeployer {
    ctx: ProvisionerContext,
}

impl ManagedDeployer {
    pub fn new(ctx: ProvisionerContext) -> ManagedDeployer {
        ManagedDeployer { ctx }
    }

    fn spec(&self) -> ManagedNodeGroupSpec {
        let spec = &self.ctx.instance_group.spec;
        let config = &spec.configuration;
        ManagedNodeGroupSpec {
            instance_types: config.instance_types.clone(),
            ami_type: config.ami_type.clone(),
            subnets: config.subnets.clone(),
            node_role_arn: config.node_role_arn.clone().unwrap_or_default(),
            scaling_min: spec.min,
            scaling_max: spec.max,
            scaling_desired: spec.min,
            labels: config.labels.clone(),
        }
    }
}

#[async_trait]
impl CloudDeployer for ManagedDeployer {
    type Error = ProvisionerError;

    async fn create(&self) -> Result<(), ProvisionerError> {
        ManagedNodeGroups::create(
            self.ctx.cloud.as_ref(),
            &self.ctx.cluster_name,
            &self.ctx.scaling_group_name,
            &self.spec(),
        )
        .await
        .context(CloudSnafu)
    }

    async fn update(&self) -> Result<(), ProvisionerError> {
        let current = self
            .ctx
            .discovered
            .managed_node_group
            .as_ref()
            .map(|g| g.labels.clone())
            .unwrap_or_default();
        let desired = &self.ctx.instance_group.spec.configuration.labels;
        let diff = LabelDiff::compute(&current, desired);

        ManagedNodeGroups::update_config(
            self.ctx.cloud.as_ref(),
            &self.ctx.cluster_name,
            &self.ctx.scaling_group_name,
            &diff,
            self.ctx.instance_group.spec.min,
            self.ctx.instance_group.spec.max,
        )
        .await
        .context(CloudSnafu)
    }

    async fn delete(&self) -> Result<(), ProvisionerError> {
        ManagedNodeGroups::delete(self.ctx.cloud.as_ref(), &self.ctx.cluster_name, &self.ctx.scaling_group_name)
            .await
            .context(CloudSnafu)?;

        // Discovery doesn't track peer managed node groups the way it does
        // peer self-managed scaling groups, so an empty peer list here is
        // the best available signal that no sibling still needs this role.
        if self.ctx.discovered.peer_scaling_groups.is_empty() {
            if let Some(role_arn) = self.ctx.instance_group.spec.configuration.node_role_arn.clone() {
                auth_map::reconcile_auth_map(&self.ctx.kube_client, &[], &[role_arn])
                    .await
                    .context(AuthMapSnafu)?;
            }
        }

        Ok(())
    }

    /// EKS performs the node replacement itself; there's no separate
    /// migration step here to drive.
    async fn upgrade_nodes(&self) -> Result<ReconcileState, ProvisionerError> {
        Ok(ReconcileState::Modified)
    }

    async fn bootstrap_nodes(&self) -> Result<(), ProvisionerError> {
        let Some(role_arn) = self.ctx.instance_group.spec.configuration.node_role_arn.clone() else {
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
            .managed_node_group
            .as_ref()
            .map(|g| g.status == ManagedNodeGroupStatus::Active)
            .unwrap_or(false)
    }
}
