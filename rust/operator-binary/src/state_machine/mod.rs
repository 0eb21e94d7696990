//! The per-InstanceGroup state machine and reconcile driver: the core
//! finite-state machine over cloud + cluster state, driven by a generic
//! `CloudDeployer` contract implemented by the three provisioner variants.

use std::time::Duration;

use async_trait::async_trait;
use instance_manager_crd::annotations::{is_truthy, LOCK_UPGRADES};
use instance_manager_crd::instance_group::{ConcurrencyPolicy, InstanceGroupConfiguration, ReconcileState};
use kube::core::DynamicObject;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::cloud::types::{FargateProfileStatus, ManagedNodeGroupStatus, ScalingGroupStatus};
use crate::discovery::DiscoveredState;

/// The requeue interval for any non-terminal `ReconcileState`.
pub const REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// The coarsened "observed condition" the transition matrix is keyed on,
/// shared across all three provisioners. Each provisioner's native status
/// enum collapses onto this set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObservedCondition {
    Absent,
    Ongoing,
    Finite,
    UpdateRecoverable,
    Unrecoverable,
    FiniteDeleted,
    UnrecoverableDelete,
}

impl From<ScalingGroupStatus> for ObservedCondition {
    fn from(status: ScalingGroupStatus) -> ObservedCondition {
        match status {
            ScalingGroupStatus::Ongoing => ObservedCondition::Ongoing,
            ScalingGroupStatus::Finite => ObservedCondition::Finite,
            ScalingGroupStatus::UpdateRecoverable => ObservedCondition::UpdateRecoverable,
            ScalingGroupStatus::Unrecoverable => ObservedCondition::Unrecoverable,
            ScalingGroupStatus::FiniteDeleted => ObservedCondition::FiniteDeleted,
            ScalingGroupStatus::UnrecoverableDelete => ObservedCondition::UnrecoverableDelete,
        }
    }
}

/// Managed node groups have no distinct "update-recoverable" vs.
/// "unrecoverable" signal from the service; `Degraded` is the closest analog
/// to a recoverable drift state, so it maps there rather than to
/// `Unrecoverable`.
impl From<ManagedNodeGroupStatus> for ObservedCondition {
    fn from(status: ManagedNodeGroupStatus) -> ObservedCondition {
        match status {
            ManagedNodeGroupStatus::Creating => ObservedCondition::Ongoing,
            ManagedNodeGroupStatus::Active => ObservedCondition::Finite,
            ManagedNodeGroupStatus::Updating => ObservedCondition::Ongoing,
            ManagedNodeGroupStatus::Deleting => ObservedCondition::Ongoing,
            ManagedNodeGroupStatus::DeleteFailed => ObservedCondition::Unrecoverable,
            ManagedNodeGroupStatus::CreateFailed => ObservedCondition::Unrecoverable,
            ManagedNodeGroupStatus::Degraded => ObservedCondition::UpdateRecoverable,
        }
    }
}

impl From<FargateProfileStatus> for ObservedCondition {
    fn from(status: FargateProfileStatus) -> ObservedCondition {
        match status {
            FargateProfileStatus::Creating => ObservedCondition::Ongoing,
            FargateProfileStatus::Active => ObservedCondition::Finite,
            FargateProfileStatus::Deleting => ObservedCondition::Ongoing,
            FargateProfileStatus::CreateFailed => ObservedCondition::Unrecoverable,
            FargateProfileStatus::DeleteFailed => ObservedCondition::Unrecoverable,
        }
    }
}

/// The transition matrix. Pure and provisioner-agnostic: every provisioner
/// classifies its own cloud status down to an [`ObservedCondition`] first.
pub fn derive_state(observed: ObservedCondition, deleting: bool) -> ReconcileState {
    use ObservedCondition::*;
    use ReconcileState::*;

    match (deleting, observed) {
        (false, Absent) => InitCreate,
        (false, Ongoing) => Modifying,
        (false, Finite) | (false, UpdateRecoverable) => InitUpdate,
        (false, Unrecoverable) => Err,
        (true, Absent) => Deleted,
        (true, Ongoing) => Deleting,
        (true, Finite) | (true, UpdateRecoverable) | (true, Unrecoverable) => InitDelete,
        (true, FiniteDeleted) => Deleted,
        (true, UnrecoverableDelete) => Err,
        // Neither deletion-terminal condition can be observed on a group
        // that isn't being deleted; treat as absent rather than panic on a
        // cloud API surprise.
        (false, FiniteDeleted) | (false, UnrecoverableDelete) => InitCreate,
    }
}

/// `Locked()`: an explicit annotation always locks; otherwise, an active
/// owned upgrade resource locks only under a `forbid` concurrency policy.
pub fn is_locked(
    instance_group_annotations: &BTreeMap<String, String>,
    active_upgrade_resources: &[DynamicObject],
    concurrency_policy: Option<ConcurrencyPolicy>,
) -> bool {
    if is_truthy(instance_group_annotations.get(LOCK_UPGRADES)) {
        return true;
    }
    !active_upgrade_resources.is_empty() && concurrency_policy == Some(ConcurrencyPolicy::Forbid)
}

/// `IsUpgradeNeeded()`: compares the discovered launch configuration's
/// fingerprint against the one the effective spec would produce. Any
/// divergence is drift; min/max and label-only changes never reach this
/// check (the driver routes those through plain `Update`).
pub fn is_upgrade_needed(discovered: &DiscoveredState, effective_fingerprint: &str) -> bool {
    match &discovered.self_launch_config {
        Some(launch_config) => launch_config.userdata_hash != effective_fingerprint,
        None => false,
    }
}

/// The self-managed-asg launch configuration's content fingerprint: a
/// digest over every userdata stage plus the bootstrap arguments, in the
/// order they're rendered into the launch configuration's script. Shared
/// between the self-managed provisioner (to name the launch configuration)
/// and the reconcile driver (to decide whether drift needs an upgrade).
pub fn launch_config_fingerprint(config: &InstanceGroupConfiguration) -> String {
    let mut script = String::new();
    for stage in &config.user_data_stages {
        script.push_str(&format!("# stage: {} ({})\n{}\n", stage.name, stage.stage, stage.data));
    }
    if let Some(bootstrap) = &config.bootstrap_arguments {
        script.push_str(bootstrap);
        script.push('\n');
    }
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The generic CloudDeployer contract: one implementation per
/// provisioner, dispatched by [`ProvisionerKind`](instance_manager_crd::instance_group::ProvisionerKind).
#[async_trait]
pub trait CloudDeployer: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn create(&self) -> Result<(), Self::Error>;
    async fn update(&self) -> Result<(), Self::Error>;
    async fn delete(&self) -> Result<(), Self::Error>;
    async fn upgrade_nodes(&self) -> Result<ReconcileState, Self::Error>;
    async fn bootstrap_nodes(&self) -> Result<(), Self::Error>;
    fn is_ready(&self) -> bool;
}

/// Runs the driver algorithm against an already-discovered state and its
/// derived initial state. Each `CloudDeployer` call advances
/// `ReconcileState` exactly the way the textual algorithm prescribes; this
/// function contains no cloud or cluster I/O itself; it only sequences
/// calls through the trait object so it stays unit-testable with a
/// hand-rolled mock deployer.
///
/// `drift_detected` tells the `InitUpdate` branch whether the caller found
/// content drift (today: only the self-managed-asg launch configuration's
/// fingerprint) that needs a node replacement rather than a plain update.
/// A settled resource with no drift goes straight to `Modified`; a
/// settled resource with drift skips `update()` entirely and routes
/// through `InitUpgrade` instead.
pub async fn drive<D: CloudDeployer>(
    deployer: &D,
    initial_state: ReconcileState,
    locked: bool,
    drift_detected: bool,
) -> Result<ReconcileState, D::Error> {
    let mut state = initial_state;

    if state == ReconcileState::InitDelete {
        deployer.delete().await?;
        state = ReconcileState::Deleting;
    }

    if state == ReconcileState::InitCreate {
        deployer.create().await?;
        state = ReconcileState::Modifying;
    }

    if state == ReconcileState::InitUpdate {
        if drift_detected {
            state = ReconcileState::InitUpgrade;
        } else {
            deployer.update().await?;
            state = ReconcileState::Modified;
        }
    }

    if state == ReconcileState::InitUpgrade {
        if locked {
            state = ReconcileState::Locked;
        } else {
            state = deployer.upgrade_nodes().await?;
        }
    }

    if state == ReconcileState::Err {
        return Ok(state);
    }

    if deployer.is_ready() {
        deployer.bootstrap_nodes().await?;
        if state == ReconcileState::Modified {
            state = ReconcileState::Ready;
        }
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_matrix_matches_the_not_deleting_rows() {
        assert_eq!(
            derive_state(ObservedCondition::Absent, false),
            ReconcileState::InitCreate
        );
        assert_eq!(
            derive_state(ObservedCondition::Ongoing, false),
            ReconcileState::Modifying
        );
        assert_eq!(
            derive_state(ObservedCondition::Finite, false),
            ReconcileState::InitUpdate
        );
        assert_eq!(
            derive_state(ObservedCondition::UpdateRecoverable, false),
            ReconcileState::InitUpdate
        );
        assert_eq!(
            derive_state(ObservedCondition::Unrecoverable, false),
            ReconcileState::Err
        );
    }

    #[test]
    fn transition_matrix_matches_the_deleting_rows() {
        assert_eq!(
            derive_state(ObservedCondition::Absent, true),
            ReconcileState::Deleted
        );
        assert_eq!(
            derive_state(ObservedCondition::Ongoing, true),
            ReconcileState::Deleting
        );
        assert_eq!(
            derive_state(ObservedCondition::Finite, true),
            ReconcileState::InitDelete
        );
        assert_eq!(
            derive_state(ObservedCondition::UpdateRecoverable, true),
            ReconcileState::InitDelete
        );
        assert_eq!(
            derive_state(ObservedCondition::Unrecoverable, true),
            ReconcileState::InitDelete
        );
        assert_eq!(
            derive_state(ObservedCondition::FiniteDeleted, true),
            ReconcileState::Deleted
        );
        assert_eq!(
            derive_state(ObservedCondition::UnrecoverableDelete, true),
            ReconcileState::Err
        );
    }

    #[test]
    fn lock_annotation_locks_regardless_of_active_upgrades() {
        let mut annotations = BTreeMap::new();
        annotations.insert(LOCK_UPGRADES.to_string(), "true".to_string());
        assert!(is_locked(&annotations, &[], None));
    }

    #[test]
    fn forbid_policy_locks_only_when_an_upgrade_is_active() {
        let annotations = BTreeMap::new();
        assert!(!is_locked(&annotations, &[], Some(ConcurrencyPolicy::Forbid)));
    }

    struct MockDeployer {
        ready: bool,
    }

    #[derive(Debug)]
    struct MockError;
    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "mock error")
        }
    }
    impl std::error::Error for MockError {}

    #[async_trait]
    impl CloudDeployer for MockDeployer {
        type Error = MockError;

        async fn create(&self) -> Result<(), MockError> {
            Ok(())
        }
        async fn update(&self) -> Result<(), MockError> {
            Ok(())
        }
        async fn delete(&self) -> Result<(), MockError> {
            Ok(())
        }
        async fn upgrade_nodes(&self) -> Result<ReconcileState, MockError> {
            Ok(ReconcileState::Modifying)
        }
        async fn bootstrap_nodes(&self) -> Result<(), MockError> {
            Ok(())
        }
        fn is_ready(&self) -> bool {
            self.ready
        }
    }

    #[tokio::test]
    async fn drive_promotes_init_create_to_modifying() {
        let deployer = MockDeployer { ready: false };
        let state = drive(&deployer, ReconcileState::InitCreate, false, false)
            .await
            .unwrap();
        assert_eq!(state, ReconcileState::Modifying);
    }

    #[tokio::test]
    async fn drive_locks_init_upgrade_when_locked() {
        let deployer = MockDeployer { ready: false };
        let state = drive(&deployer, ReconcileState::InitUpgrade, true, false)
            .await
            .unwrap();
        assert_eq!(state, ReconcileState::Locked);
    }

    #[tokio::test]
    async fn drive_promotes_modified_to_ready_once_bootstrapped() {
        let deployer = MockDeployer { ready: true };
        let state = drive(&deployer, ReconcileState::Modified, false, false)
            .await
            .unwrap();
        assert_eq!(state, ReconcileState::Ready);
    }

    #[tokio::test]
    async fn drive_settles_init_update_straight_to_modified_without_drift() {
        let deployer = MockDeployer { ready: false };
        let state = drive(&deployer, ReconcileState::InitUpdate, false, false)
            .await
            .unwrap();
        assert_eq!(state, ReconcileState::Modified);
    }

    #[tokio::test]
    async fn drive_routes_init_update_through_init_upgrade_when_drifted() {
        let deployer = MockDeployer { ready: false };
        let state = drive(&deployer, ReconcileState::InitUpdate, false, true)
            .await
            .unwrap();
        assert_eq!(state, ReconcileState::Modifying);
    }
}
