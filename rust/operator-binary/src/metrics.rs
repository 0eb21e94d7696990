//! Prometheus metrics exposed by the controller: reconcile
//! outcome counters, cloud-API throttle counts, the one-hot
//! `instance_group_status` gauge, and the per-group last-upgrade timestamp.
//!
//! Success and failure are tracked by two distinct counters rather than one
//! counter with a sign flag, so a caller can never increment the wrong one
//! by passing the wrong sign.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    static ref RECONCILE_SUCCESS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "instance_manager_reconcile_success_total",
            "Total successful reconciles per InstanceGroup",
        ),
        &["instancegroup"],
    )
    .unwrap();
    static ref RECONCILE_FAIL_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "instance_manager_reconcile_fail_total",
            "Total failed reconciles per InstanceGroup, by reason",
        ),
        &["instancegroup", "reason"],
    )
    .unwrap();
    static ref AWS_API_THROTTLE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "instance_manager_aws_api_throttle_total",
            "Total throttling responses observed from a cloud API call",
        ),
        &["service", "operation"],
    )
    .unwrap();
    static ref INSTANCE_GROUP_STATUS: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "instance_manager_instance_group_status",
            "1 for the InstanceGroup's current ReconcileState, 0 for every other value",
        ),
        &["instancegroup", "status"],
    )
    .unwrap();
    static ref INSTANCE_GROUP_LAST_UPGRADE_SECONDS: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "instance_manager_instance_group_last_upgrade_seconds",
            "Unix timestamp of the last node upgrade submitted for an InstanceGroup",
        ),
        &["instancegroup"],
    )
    .unwrap();
}

/// Registers every metric with [`REGISTRY`]. Idempotent only on first call;
/// call exactly once from `main`.
pub fn register() {
    REGISTRY
        .register(Box::new(RECONCILE_SUCCESS_TOTAL.clone()))
        .expect("reconcile_success_total registers once");
    REGISTRY
        .register(Box::new(RECONCILE_FAIL_TOTAL.clone()))
        .expect("reconcile_fail_total registers once");
    REGISTRY
        .register(Box::new(AWS_API_THROTTLE_TOTAL.clone()))
        .expect("aws_api_throttle_total registers once");
    REGISTRY
        .register(Box::new(INSTANCE_GROUP_STATUS.clone()))
        .expect("instance_group_status registers once");
    REGISTRY
        .register(Box::new(INSTANCE_GROUP_LAST_UPGRADE_SECONDS.clone()))
        .expect("instance_group_last_upgrade_seconds registers once");
}

pub fn inc_success(instancegroup: &str) {
    RECONCILE_SUCCESS_TOTAL.with_label_values(&[instancegroup]).inc();
}

pub fn inc_fail(instancegroup: &str, reason: &str) {
    RECONCILE_FAIL_TOTAL
        .with_label_values(&[instancegroup, reason])
        .inc();
}

pub fn inc_throttle(service: &str, operation: &str) {
    AWS_API_THROTTLE_TOTAL
        .with_label_values(&[service, operation])
        .inc();
}

/// Sets `status` to 1 and every other known `ReconcileState` value to 0 for
/// this InstanceGroup, maintaining the "exactly one label value is 1"
/// invariant.
pub fn set_status(instancegroup: &str, status: &str) {
    for candidate in [
        "Init",
        "InitCreate",
        "InitUpdate",
        "InitUpgrade",
        "InitDelete",
        "Modifying",
        "Modified",
        "Ready",
        "Deleting",
        "Deleted",
        "Locked",
        "Err",
    ] {
        let value = if candidate == status { 1 } else { 0 };
        INSTANCE_GROUP_STATUS
            .with_label_values(&[instancegroup, candidate])
            .set(value);
    }
}

pub fn set_last_upgrade(instancegroup: &str, unix_seconds: i64) {
    INSTANCE_GROUP_LAST_UPGRADE_SECONDS
        .with_label_values(&[instancegroup])
        .set(unix_seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_fail_are_distinct_counters() {
        register_once_for_test();
        inc_success("workers");
        inc_fail("workers", "CloudApi");
        assert_eq!(RECONCILE_SUCCESS_TOTAL.with_label_values(&["workers"]).get(), 1);
        assert_eq!(
            RECONCILE_FAIL_TOTAL
                .with_label_values(&["workers", "CloudApi"])
                .get(),
            1
        );
    }

    #[test]
    fn set_status_is_one_hot() {
        register_once_for_test();
        set_status("workers", "Ready");
        assert_eq!(INSTANCE_GROUP_STATUS.with_label_values(&["workers", "Ready"]).get(), 1);
        assert_eq!(INSTANCE_GROUP_STATUS.with_label_values(&["workers", "Err"]).get(), 0);
        set_status("workers", "Err");
        assert_eq!(INSTANCE_GROUP_STATUS.with_label_values(&["workers", "Ready"]).get(), 0);
        assert_eq!(INSTANCE_GROUP_STATUS.with_label_values(&["workers", "Err"]).get(), 1);
    }

    fn register_once_for_test() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(register);
    }
}
