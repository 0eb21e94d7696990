//! The three `CloudDeployer` variants, one per [`ProvisionerKind`]:
//! self-managed-asg, managed node group, and fargate. Each owns the
//! already-discovered state plus a handle to the Cloud Abstraction Layer and
//! builds its cloud calls from the effective spec; none of them derive or
//! hold a `ReconcileState` themselves, that's [`crate::state_machine::drive`]'s
//! job.

mod fargate;
mod managed;
mod self_managed;

use std::sync::Arc;

use snafu::Snafu;

use instance_manager_crd::v1alpha1::InstanceGroup;

use crate::cloud::{CloudAbstractionLayer, CloudError};
use crate::discovery::DiscoveredState;
use crate::state_machine::CloudDeployer;
use crate::upgrade::UpgradeError;

pub use fargate::FargateDeployer;
pub use managed::ManagedDeployer;
pub use self_managed::SelfManagedDeployer;

#[derive(Debug, Snafu)]
pub enum ProvisionerError {
    #[snafu(display("cloud API call failed"))]
    Cloud { source: CloudError },
    #[snafu(display("auth-map reconcile failed"))]
    AuthMap { source: crate::auth_map::AuthMapError },
    #[snafu(display("upgrade engine call failed"))]
    Upgrade { source: UpgradeError },
}

/// Everything a provisioner variant needs, gathered once per reconcile and
/// shared across the three implementations.
pub struct ProvisionerContext {
    pub cloud: Arc<dyn CloudAbstractionLayer>,
    pub kube_client: kube::Client,
    pub cluster_name: String,
    pub scaling_group_name: String,
    pub instance_group: Arc<InstanceGroup>,
    pub discovered: DiscoveredState,
}

/// Builds the `CloudDeployer` for this `InstanceGroup`'s
/// [`ProvisionerKind`](instance_manager_crd::instance_group::ProvisionerKind),
/// boxed to a single fixed error type so `controller::reconcile` can drive
/// any of the three through one call to
/// [`crate::state_machine::drive`].
pub fn build_deployer(
    ctx: ProvisionerContext,
) -> Box<dyn CloudDeployer<Error = ProvisionerError> + Send + Sync> {
    use instance_manager_crd::instance_group::ProvisionerKind;

    match ctx.instance_group.spec.provisioner {
        ProvisionerKind::SelfManaged => Box::new(SelfManagedDeployer::new(ctx)),
        ProvisionerKind::Managed => Box::new(ManagedDeployer::new(ctx)),
        ProvisionerKind::Fargate => Box::new(FargateDeployer::new(ctx)),
    }
}
