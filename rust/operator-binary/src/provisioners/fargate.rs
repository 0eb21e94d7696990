//! The fargate provisioner. Serverless: no scaling group, no launch
//! configuration, no upgrade step. EKS serializes fargate profile mutations
//! per cluster, so `create` retries on a transient failure with the same
//! bounded-backoff shape the Auth-Map Bootstrapper uses.

use std::time::Duration;

use async_trait::async_trait;
use snafu::ResultExt;

use instance_manager_crd::instance_group::ReconcileState;

use crate::cloud::types::FargateProfileStatus;
use crate::cloud::{FargateProfileSpec, FargateProfiles, IamRoles};
use crate::state_machine::CloudDeployer;

use super::{CloudSnafu, ProvisionerContext, ProvisionerError};

const ROLE_PREFIX: &str = "instancemgr";
const CREATE_RETRY_ATTEMPTS: u32 = 5;
const CREATE_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// The fargate pod-execution assume-role policy, used only when the
/// provisioner configuration doesn't supply `podExecutionRoleArn`.
const ASSUME_ROLE_POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"Service":"eks-fargate-pods.amazonaws.com"},"Action":"sts:AssumeRole"}]}"#;

const DEFAULT_MANAGED_POLICIES: &[&str] =
    &["arn:aws:iam::aws:policy/AmazonEKSFargatePodExecutionRolePolicy"];

pub struct FargateDeployer {
    ctx: ProvisionerContext,
}

impl FargateDeployer {
    pub fn new(ctx: ProvisionerContext) -> FargateDeployer {
        FargateDeployer { ctx }
    }

    fn role_name(&self) -> String {
        format!("{ROLE_PREFIX}-{}", self.ctx.scaling_group_name)
    }

    fn spec(&self, pod_execution_role_arn: String) -> FargateProfileSpec {
        let config = &self.ctx.instance_group.spec.configuration;
        FargateProfileSpec {
            pod_execution_role_arn,
            subnets: config.subnets.clone(),
            selectors: config
                .selectors
                .iter()
                .map(|s| (s.namespace.clone(), s.labels.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl CloudDeployer for FargateDeployer {
    type Error = ProvisionerError;

    async fn create(&self) -> Result<(), ProvisionerError> {
        let pod_execution_role_arn = match &self.ctx.instance_group.spec.configuration.pod_execution_role_arn {
            Some(arn) => arn.clone(),
            None => {
                let role = IamRoles::create_role(
                    self.ctx.cloud.as_ref(),
                    &self.role_name(),
                    ASSUME_ROLE_POLICY,
                    &DEFAULT_MANAGED_POLICIES.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                )
                .await
                .context(CloudSnafu)?;
                role.arn
            }
        };

        let spec = self.spec(pod_execution_role_arn);
        let mut backoff = CREATE_RETRY_BACKOFF;
        for attempt in 1..=CREATE_RETRY_ATTEMPTS {
            match FargateProfiles::create(self.ctx.cloud.as_ref(), &self.ctx.cluster_name, &self.ctx.scaling_group_name, &spec).await {
                Ok(()) => return Ok(()),
                Err(source) if attempt < CREATE_RETRY_ATTEMPTS && !source.is_terminal() => {
                    tracing::debug!(attempt, "fargate profile create contended, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(source) => return Err(source).context(CloudSnafu),
            }
        }
        Ok(())
    }

    /// EKS has no in-place update for a fargate profile's selectors or
    /// role, and a profile carries no content fingerprint for the driver
    /// to detect drift against. A settled profile is left alone; changing
    /// selectors requires deleting and recreating the InstanceGroup.
    async fn update(&self) -> Result<(), ProvisionerError> {
        Ok(())
    }

    async fn delete(&self) -> Result<(), ProvisionerError> {
        FargateProfiles::delete(self.ctx.cloud.as_ref(), &self.ctx.cluster_name, &self.ctx.scaling_group_name)
            .await
            .context(CloudSnafu)?;

        if self.ctx.instance_group.spec.configuration.pod_execution_role_arn.is_none() {
            if let Some(role) = self
                .ctx
                .cloud
                .get_role(&self.role_name())
                .await
                .context(CloudSnafu)?
            {
                if role.controller_created {
                    IamRoles::delete_role(
                        self.ctx.cloud.as_ref(),
                        &role.name,
                        &DEFAULT_MANAGED_POLICIES.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                    )
                    .await
                    .context(CloudSnafu)?;
                }
            }
        }

        Ok(())
    }

    /// Fargate has no persistent nodes to roll; pods simply land on the
    /// current profile the next time they're scheduled.
    async fn upgrade_nodes(&self) -> Result<ReconcileState, ProvisionerError> {
        Ok(ReconcileState::Modified)
    }

    /// Fargate pods run under the pod execution role, which EKS never needs
    /// registered in `aws-auth`; there's nothing to bootstrap.
    async fn bootstrap_nodes(&self) -> Result<(), ProvisionerError> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ctx
            .discovered
            .fargate_profile
            .as_ref()
            .map(|p| p.status == FargateProfileStatus::Active)
            .unwrap_or(false)
    }
}
