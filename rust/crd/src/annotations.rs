//! Well-known annotation keys recognized by the controller.

/// The API group / annotation vendor prefix.
pub const VENDOR: &str = "instancemgr.k8s.io";

/// Set on a `Namespace` to opt it out of the Configuration Merger entirely.
pub const CONFIG_EXCLUDED: &str = "instancemgr.k8s.io/config-excluded";

/// Set on an `InstanceGroup` to prevent new upgrade custom resources from
/// being submitted for it.
pub const LOCK_UPGRADES: &str = "instancemgr.k8s.io/lock-upgrades";

/// Set on an upgrade custom resource submitted by this controller, identifying
/// it as ours.
pub const MANAGED_BY: &str = "instancemgr.k8s.io/managed-by";

/// The value `managed-by` is stamped with.
pub const MANAGED_BY_VALUE: &str = "instance-manager";

/// Set on an upgrade custom resource, scoping it to the scaling group name it
/// was submitted for. At most one active upgrade per scope is allowed when
/// the upgrade strategy's concurrency policy is `forbid`.
pub const SCOPE: &str = "instancemgr.k8s.io/scope";

/// The finalizer this controller adds to every `InstanceGroup` it observes.
pub const FINALIZER: &str = "instancemgr.k8s.io/finalizer";

pub fn is_truthy(value: Option<&String>) -> bool {
    matches!(value.map(String::as_str), Some("true"))
}
