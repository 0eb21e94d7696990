//! The Vertical Scaling Policy Loop: an independent background task
//! that samples cached node utilization against an instance-family catalog
//! and recommends instance-type promotions/demotions per target.
//!
//! Split the way `state_machine` is: pure computation here, unit-testable
//! without a cluster or cloud credentials; the orchestration loop in
//! [`run`] is the only part that touches `SharedContext` or a `Client`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use snafu::{ResultExt, Snafu};

use instance_manager_crd::condition::{self, Condition, ConditionStatus};
use instance_manager_crd::v1alpha1::InstanceGroup;
use instance_manager_crd::vertical_scaling_policy::{Behavior, ResourceBounds, ScalingPolicyType};
use instance_manager_crd::vsp_v1alpha1::VerticalScalingPolicy;
use instance_manager_crd::{TargetStatus, VerticalScalingPolicyStatus, APP_NAME};

use crate::cloud::types::InstanceTypeSpec;
use crate::cloud::{CloudAbstractionLayer, CloudError, InstanceTypeCatalog};
use crate::shared_context::{NamespacedName, SharedContext};

mod quantity;
pub use quantity::{parse_cpu_millis, parse_memory_bytes};

/// How often the loop samples the cached node list against every known
/// policy.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum VspError {
    #[snafu(display("failed to load the instance-type catalog"))]
    Catalog { source: CloudError },
    #[snafu(display("failed to persist VerticalScalingPolicy status"))]
    PatchStatus { source: kube::Error },
}

/// The background task driving the Vertical Scaling Policy Loop: on every
/// tick, samples each policy cached in `shared` against the current node
/// list and instance-type catalog, writes drifted targets into
/// `SharedContext.computedTypes`, and nudges a reconcile for each.
pub async fn run(client: Client, shared: Arc<SharedContext>, cloud: Arc<dyn CloudAbstractionLayer>) {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    loop {
        ticker.tick().await;
        for (key, policy) in shared.policies_snapshot() {
            if let Err(error) = tick_policy(&client, &shared, cloud.as_ref(), &key, &policy).await {
                tracing::warn!(%error, policy = %key.name, namespace = %key.namespace, "vertical scaling policy sampling failed");
            }
        }
    }
}

async fn tick_policy(
    client: &Client,
    shared: &SharedContext,
    cloud: &dyn CloudAbstractionLayer,
    key: &NamespacedName,
    policy: &VerticalScalingPolicy,
) -> Result<(), VspError> {
    let now = Time(Utc::now());
    let existing_targets = policy.status.as_ref().map(|s| s.targets.as_slice()).unwrap_or(&[]);
    let mut target_statuses = Vec::with_capacity(policy.spec.targets.len());

    for target in &policy.spec.targets {
        let existing = existing_targets
            .iter()
            .find(|t| t.namespace == target.namespace && t.name == target.name);

        let Some(status) = evaluate_one_target(client, shared, cloud, policy, target, existing, now.clone()).await?
        else {
            if let Some(existing) = existing {
                target_statuses.push(existing.clone());
            }
            continue;
        };
        target_statuses.push(status);
    }

    let policies: Api<VerticalScalingPolicy> = Api::namespaced(client.clone(), &key.namespace);
    let status = VerticalScalingPolicyStatus { targets: target_statuses };
    let patch = serde_json::json!({ "status": status });
    policies
        .patch_status(&key.name, &PatchParams::apply(APP_NAME), &Patch::Merge(patch))
        .await
        .context(PatchStatusSnafu)?;

    Ok(())
}

/// Evaluates one target, returning its new status, or `None` when the
/// target can't be evaluated this tick (InstanceGroup not found, no
/// instance type set yet, or its current type isn't in range). The caller
/// then keeps whatever status was last persisted for it.
async fn evaluate_one_target(
    client: &Client,
    shared: &SharedContext,
    cloud: &dyn CloudAbstractionLayer,
    policy: &VerticalScalingPolicy,
    target: &instance_manager_crd::vertical_scaling_policy::ScalingTarget,
    existing: Option<&TargetStatus>,
    now: Time,
) -> Result<Option<TargetStatus>, VspError> {
    let instance_groups: Api<InstanceGroup> = Api::namespaced(client.clone(), &target.namespace);
    let instance_group = match instance_groups.get(&target.name).await {
        Ok(instance_group) => instance_group,
        Err(error) => {
            tracing::warn!(%error, namespace = %target.namespace, name = %target.name, "target InstanceGroup not found");
            return Ok(None);
        }
    };

    let configuration = &instance_group.spec.configuration;
    let Some(current_type) = configuration.instance_type.clone() else {
        return Ok(None);
    };

    let family = policy
        .spec
        .instance_family
        .clone()
        .or_else(|| current_type.split('.').next().map(str::to_string));
    let Some(family) = family else {
        return Ok(None);
    };

    let catalog = InstanceTypeCatalog::describe_family(cloud, &family)
        .await
        .context(CatalogSnafu)?;
    let range = InstanceTypeRange::build(&catalog, &policy.spec.resources, policy.spec.instance_family.as_deref());
    let Some(current_index) = range.position_of(&current_type) else {
        return Ok(None);
    };

    let nodes = shared.nodes_snapshot();
    let aggregate = aggregate_nodes(&nodes, &configuration.labels);
    let conditions = existing.map(|t| t.conditions.clone()).unwrap_or_default();
    let last_resize = existing.and_then(|t| t.last_resize_time.as_ref()).map(|t| t.0);

    let evaluation = evaluate_target(
        &policy.spec.behavior,
        &range,
        current_index,
        &aggregate,
        Some(instance_group.spec.max),
        conditions,
        now.clone(),
        last_resize,
    );

    if evaluation.drifted {
        let namespaced = NamespacedName::new(target.namespace.clone(), target.name.clone());
        if let Some(desired) = &evaluation.desired_instance_type {
            shared.set_computed_type(namespaced.clone(), desired.clone());
        }
        shared.emit_event(namespaced);
    }

    let last_resize_time = if evaluation.drifted {
        Some(now)
    } else {
        existing.and_then(|t| t.last_resize_time.clone())
    };

    Ok(Some(TargetStatus {
        namespace: target.namespace.clone(),
        name: target.name.clone(),
        desired_instance_type: evaluation.desired_instance_type,
        conditions: evaluation.conditions,
        last_resize_time,
    }))
}

/// Instance types within a policy's CPU/memory bounds (and optional family),
/// ordered ascending by (vCPU, memory).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceTypeRange {
    entries: Vec<(String, InstanceTypeSpec)>,
}

impl InstanceTypeRange {
    pub fn build(
        catalog: &[(String, InstanceTypeSpec)],
        bounds: &ResourceBounds,
        family: Option<&str>,
    ) -> InstanceTypeRange {
        let min_cpu = parse_cpu_millis(&bounds.requests.cpu).unwrap_or(0);
        let max_cpu = parse_cpu_millis(&bounds.limits.cpu).unwrap_or(i64::MAX);
        let min_mem = parse_memory_bytes(&bounds.requests.memory).unwrap_or(0);
        let max_mem = parse_memory_bytes(&bounds.limits.memory).unwrap_or(i64::MAX);

        let mut entries: Vec<(String, InstanceTypeSpec)> = catalog
            .iter()
            .filter(|(name, spec)| {
                let cpu_millis = i64::from(spec.vcpu) * 1000;
                let mem_bytes = spec.memory_mib * 1024 * 1024;
                cpu_millis >= min_cpu
                    && cpu_millis <= max_cpu
                    && mem_bytes >= min_mem
                    && mem_bytes <= max_mem
                    && family.is_none_or_name_prefix(name)
            })
            .cloned()
            .collect();
        entries.sort_by_key(|(_, spec)| (spec.vcpu, spec.memory_mib));
        InstanceTypeRange { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position_of(&self, instance_type: &str) -> Option<usize> {
        self.entries.iter().position(|(name, _)| name == instance_type)
    }

    pub fn at(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(name, _)| name.as_str())
    }
}

trait FamilyFilter {
    fn is_none_or_name_prefix(&self, name: &str) -> bool;
}

impl FamilyFilter for Option<&str> {
    fn is_none_or_name_prefix(&self, name: &str) -> bool {
        match self {
            Some(family) => name.starts_with(family),
            None => true,
        }
    }
}

/// Aggregated CPU/memory capacity and allocatable across the nodes belonging
/// to one InstanceGroup.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeAggregate {
    pub node_count: i32,
    pub capacity_cpu_millis: i64,
    pub allocatable_cpu_millis: i64,
    pub capacity_memory_bytes: i64,
    pub allocatable_memory_bytes: i64,
}

/// Aggregates the subset of `nodes` carrying every key/value in `selector`.
/// An empty selector matches every node.
pub fn aggregate_nodes<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    selector: &BTreeMap<String, String>,
) -> NodeAggregate {
    let mut aggregate = NodeAggregate::default();

    for node in nodes {
        let labels = node.metadata.labels.clone().unwrap_or_default();
        if !selector.iter().all(|(key, value)| labels.get(key) == Some(value)) {
            continue;
        }

        aggregate.node_count += 1;
        let Some(status) = &node.status else { continue };

        if let Some(capacity) = &status.capacity {
            aggregate.capacity_cpu_millis += quantity_millis(capacity.get("cpu"));
            aggregate.capacity_memory_bytes += quantity_bytes(capacity.get("memory"));
        }
        if let Some(allocatable) = &status.allocatable {
            aggregate.allocatable_cpu_millis += quantity_millis(allocatable.get("cpu"));
            aggregate.allocatable_memory_bytes += quantity_bytes(allocatable.get("memory"));
        }
    }

    aggregate
}

fn quantity_millis(quantity: Option<&Quantity>) -> i64 {
    quantity.and_then(parse_cpu_millis).unwrap_or(0)
}

fn quantity_bytes(quantity: Option<&Quantity>) -> i64 {
    quantity.and_then(parse_memory_bytes).unwrap_or(0)
}

/// Samples the utilization a policy type compares against its threshold.
/// `NodesCountPct` needs the group's configured `max` and returns `None`
/// without it (or if it is zero); `CPUPct`/`MemPct` return `None` if the
/// aggregate carries no capacity at all (no nodes observed yet).
pub fn utilization_pct(
    policy_type: ScalingPolicyType,
    aggregate: &NodeAggregate,
    max_nodes: Option<i32>,
) -> Option<f64> {
    match policy_type {
        ScalingPolicyType::CpuPct => {
            if aggregate.capacity_cpu_millis == 0 {
                return None;
            }
            Some(
                100.0
                    * (1.0
                        - aggregate.allocatable_cpu_millis as f64 / aggregate.capacity_cpu_millis as f64),
            )
        }
        ScalingPolicyType::MemPct => {
            if aggregate.capacity_memory_bytes == 0 {
                return None;
            }
            Some(
                100.0
                    * (1.0
                        - aggregate.allocatable_memory_bytes as f64
                            / aggregate.capacity_memory_bytes as f64),
            )
        }
        ScalingPolicyType::NodesCountPct => {
            let max = max_nodes?;
            if max == 0 {
                return None;
            }
            Some(100.0 * f64::from(aggregate.node_count) / f64::from(max))
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    ScaleUp,
    ScaleDown,
}

impl Direction {
    fn condition_type(self, policy_type: ScalingPolicyType) -> String {
        let prefix = match self {
            Direction::ScaleUp => "ScaleUp",
            Direction::ScaleDown => "ScaleDown",
        };
        format!("{prefix}{policy_type}")
    }
}

/// The outcome of evaluating one target for one tick: the (possibly
/// unchanged) condition list to persist, and whether a promotion/demotion
/// fired.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    pub conditions: Vec<Condition>,
    pub desired_instance_type: Option<String>,
    pub drifted: bool,
}

/// Evaluates one target: updates the above/below
/// threshold condition for every policy in `behavior`, and promotes or
/// demotes `range[index]` when the held-duration and stabilization-window
/// invariants are satisfied.
///
/// `now` and `last_resize` are passed in rather than read from the clock so
/// this stays a pure function; the caller ([`run`]) supplies real time.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_target(
    behavior: &Behavior,
    range: &InstanceTypeRange,
    current_index: usize,
    aggregate: &NodeAggregate,
    max_nodes: Option<i32>,
    mut conditions: Vec<Condition>,
    now: Time,
    last_resize: Option<DateTime<Utc>>,
) -> Evaluation {
    let can_scale_up = current_index + 1 < range.len();
    let can_scale_down = current_index > 0;
    let stabilized = |window_seconds: i64| match last_resize {
        Some(last) => now.0.signed_duration_since(last).num_seconds() >= window_seconds,
        None => true,
    };

    let mut promote = false;
    if can_scale_up {
        for policy in &behavior.scale_up.policies {
            let Some(sample) = utilization_pct(policy.type_, aggregate, max_nodes) else {
                continue;
            };
            let above_threshold = sample > f64::from(policy.value);
            let condition_type = Direction::ScaleUp.condition_type(policy.type_);
            let held_for = update_condition(&mut conditions, &condition_type, above_threshold, now.clone());
            if above_threshold
                && held_for >= policy.period_seconds
                && stabilized(behavior.scale_up.stabilization_window_seconds)
            {
                promote = true;
            }
        }
    }

    let mut demote = false;
    if can_scale_down && !promote {
        let mut all_below = !behavior.scale_down.policies.is_empty();
        let mut held_long_enough = true;
        for policy in &behavior.scale_down.policies {
            let Some(sample) = utilization_pct(policy.type_, aggregate, max_nodes) else {
                all_below = false;
                continue;
            };
            let below_threshold = sample < f64::from(policy.value);
            let condition_type = Direction::ScaleDown.condition_type(policy.type_);
            let held_for = update_condition(&mut conditions, &condition_type, below_threshold, now.clone());

            all_below &= below_threshold;
            held_long_enough &= held_for >= policy.period_seconds;

            // Veto: would halving the sampled utilization cross a scale-up
            // threshold for the same resource?
            if let Some(scale_up_policy) = behavior
                .scale_up
                .policies
                .iter()
                .find(|p| p.type_ == policy.type_)
            {
                if sample / 2.0 > f64::from(scale_up_policy.value) {
                    all_below = false;
                }
            }
        }

        demote = all_below
            && held_long_enough
            && stabilized(behavior.scale_down.stabilization_window_seconds);
    }

    let desired_instance_type = if promote {
        range.at(current_index + 1).map(str::to_string)
    } else if demote {
        range.at(current_index - 1).map(str::to_string)
    } else {
        None
    };

    Evaluation {
        conditions,
        drifted: desired_instance_type.is_some(),
        desired_instance_type,
    }
}

/// Upserts the named condition to `status`, and returns how many seconds it
/// has held that status continuously (0 if it just flipped).
fn update_condition(conditions: &mut Vec<Condition>, type_: &str, status: bool, now: Time) -> i64 {
    let status = if status {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };

    let held_for = match condition::find(conditions, type_) {
        Some(existing) if existing.status == status => existing
            .last_transition_time
            .as_ref()
            .map(|t| now.0.signed_duration_since(t.0).num_seconds())
            .unwrap_or(0),
        _ => 0,
    };

    condition::upsert(conditions, Condition::new(type_, status), now);
    held_for
}

#[cfg(test)]
mod tests {
    use super::*;
    use instance_manager_crd::vertical_scaling_policy::{
        ResourceRange, ScalingBehavior, ScalingPolicy,
    };

    fn spec(vcpu: i32, memory_mib: i64) -> InstanceTypeSpec {
        InstanceTypeSpec { vcpu, memory_mib }
    }

    fn catalog() -> Vec<(String, InstanceTypeSpec)> {
        vec![
            ("m5.large".to_string(), spec(2, 8 * 1024)),
            ("m5.xlarge".to_string(), spec(4, 16 * 1024)),
            ("m5.2xlarge".to_string(), spec(8, 32 * 1024)),
        ]
    }

    fn bounds() -> ResourceBounds {
        ResourceBounds {
            requests: ResourceRange {
                cpu: Quantity("2".to_string()),
                memory: Quantity("4Gi".to_string()),
            },
            limits: ResourceRange {
                cpu: Quantity("8".to_string()),
                memory: Quantity("32Gi".to_string()),
            },
        }
    }

    #[test]
    fn range_is_sorted_ascending_and_filtered_to_bounds() {
        let range = InstanceTypeRange::build(&catalog(), &bounds(), None);
        assert_eq!(range.len(), 3);
        assert_eq!(range.at(0), Some("m5.large"));
        assert_eq!(range.at(2), Some("m5.2xlarge"));
    }

    #[test]
    fn family_filter_excludes_other_families() {
        let mut catalog = catalog();
        catalog.push(("c5.xlarge".to_string(), spec(4, 8 * 1024)));
        let range = InstanceTypeRange::build(&catalog, &bounds(), Some("m5"));
        assert_eq!(range.len(), 3);
        assert!(range.position_of("c5.xlarge").is_none());
    }

    fn policy(type_: ScalingPolicyType, value: i32, period_seconds: i64) -> ScalingPolicy {
        ScalingPolicy {
            type_,
            value,
            period_seconds,
        }
    }

    fn behavior(up: ScalingPolicy, down: ScalingPolicy) -> Behavior {
        Behavior {
            scale_up: ScalingBehavior {
                stabilization_window_seconds: 0,
                policies: vec![up],
            },
            scale_down: ScalingBehavior {
                stabilization_window_seconds: 0,
                policies: vec![down],
            },
        }
    }

    fn aggregate_with_cpu_pct(pct: f64) -> NodeAggregate {
        let capacity = 10_000;
        NodeAggregate {
            node_count: 1,
            capacity_cpu_millis: capacity,
            allocatable_cpu_millis: (capacity as f64 * (1.0 - pct / 100.0)) as i64,
            capacity_memory_bytes: 0,
            allocatable_memory_bytes: 0,
        }
    }

    fn now() -> Time {
        Time(Utc::now())
    }

    #[test]
    fn promotes_once_threshold_held_for_period_and_stabilization_elapsed() {
        let range = InstanceTypeRange::build(&catalog(), &bounds(), None);
        let behavior = behavior(
            policy(ScalingPolicyType::CpuPct, 80, 0),
            policy(ScalingPolicyType::CpuPct, 30, 0),
        );
        let aggregate = aggregate_with_cpu_pct(90.0);

        let evaluation = evaluate_target(
            &behavior,
            &range,
            range.position_of("m5.xlarge").unwrap(),
            &aggregate,
            None,
            Vec::new(),
            now(),
            None,
        );

        assert_eq!(evaluation.desired_instance_type.as_deref(), Some("m5.2xlarge"));
        assert!(evaluation.drifted);
    }

    #[test]
    fn below_threshold_period_not_yet_met_does_not_promote() {
        let range = InstanceTypeRange::build(&catalog(), &bounds(), None);
        let behavior = behavior(
            policy(ScalingPolicyType::CpuPct, 80, 300),
            policy(ScalingPolicyType::CpuPct, 30, 300),
        );
        let aggregate = aggregate_with_cpu_pct(90.0);

        let evaluation = evaluate_target(
            &behavior,
            &range,
            range.position_of("m5.xlarge").unwrap(),
            &aggregate,
            None,
            Vec::new(),
            now(),
            None,
        );

        assert_eq!(evaluation.desired_instance_type, None);
        let condition = condition::find(&evaluation.conditions, "ScaleUpCPUPct").unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
    }

    #[test]
    fn demotes_when_sustained_below_threshold_without_crossing_scale_up() {
        let range = InstanceTypeRange::build(&catalog(), &bounds(), None);
        let behavior = behavior(
            policy(ScalingPolicyType::CpuPct, 80, 0),
            policy(ScalingPolicyType::CpuPct, 30, 0),
        );
        let aggregate = aggregate_with_cpu_pct(10.0);

        let evaluation = evaluate_target(
            &behavior,
            &range,
            range.position_of("m5.xlarge").unwrap(),
            &aggregate,
            None,
            Vec::new(),
            now(),
            None,
        );

        assert_eq!(evaluation.desired_instance_type.as_deref(), Some("m5.large"));
    }

    #[test]
    fn demotion_is_vetoed_when_halving_utilization_would_cross_scale_up_threshold() {
        let range = InstanceTypeRange::build(&catalog(), &bounds(), None);
        // The scale-up condition is above-threshold but hasn't been held for
        // its 300s period, so it can't promote on its own yet -- but the
        // instant-halved utilization (85/2 = 42.5) already exceeds the
        // scale-up threshold (40), so demotion must be vetoed anyway.
        let behavior = behavior(
            policy(ScalingPolicyType::CpuPct, 40, 300),
            policy(ScalingPolicyType::CpuPct, 90, 0),
        );
        let aggregate = aggregate_with_cpu_pct(85.0);

        let evaluation = evaluate_target(
            &behavior,
            &range,
            range.position_of("m5.xlarge").unwrap(),
            &aggregate,
            None,
            Vec::new(),
            now(),
            None,
        );

        assert_eq!(evaluation.desired_instance_type, None);
    }

    #[test]
    fn nodes_count_pct_uses_configured_max() {
        let aggregate = NodeAggregate {
            node_count: 9,
            ..Default::default()
        };
        assert_eq!(
            utilization_pct(ScalingPolicyType::NodesCountPct, &aggregate, Some(10)),
            Some(90.0)
        );
        assert_eq!(
            utilization_pct(ScalingPolicyType::NodesCountPct, &aggregate, None),
            None
        );
    }

    #[test]
    fn heartbeat_updates_every_sample_but_transition_only_on_change() {
        let first = now();
        let mut conditions = Vec::new();
        update_condition(&mut conditions, "ScaleUpCPUPct", true, first.clone());
        let after_first = condition::find(&conditions, "ScaleUpCPUPct")
            .unwrap()
            .last_transition_time
            .clone();

        let second = Time(first.0 + chrono::Duration::seconds(5));
        update_condition(&mut conditions, "ScaleUpCPUPct", true, second.clone());
        let after_second = condition::find(&conditions, "ScaleUpCPUPct").unwrap();

        assert_eq!(after_second.last_transition_time, after_first);
        assert_eq!(after_second.last_heartbeat_time, Some(second));
    }
}
