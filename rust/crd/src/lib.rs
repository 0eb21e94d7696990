//! Custom resource definitions for the instance-manager controller.
//!
//! This crate only contains the wire-level shapes (`InstanceGroup`,
//! `VerticalScalingPolicy`, their spec/status types, and the small set of
//! shared enums the reconcile driver switches on). It has no dependency on
//! `kube::runtime` or any cloud SDK, so it can be reused by anything that
//! only needs to read or write these resources (CLI tools, other
//! controllers, tests).

pub mod annotations;
pub mod condition;
pub mod instance_group;
pub mod vertical_scaling_policy;

pub use condition::{Condition, ConditionStatus};
pub use instance_group::{
    v1alpha1, InstanceGroupConfiguration, InstanceGroupStatus, Lifecycle, ProvisionerKind,
    ReconcileState, UpgradeStrategy, APP_NAME,
};
pub use vertical_scaling_policy::{
    v1alpha1 as vsp_v1alpha1, Behavior, ScalingBehavior, ScalingPolicy, ScalingPolicyType,
    TargetStatus, VerticalScalingPolicyStatus,
};
