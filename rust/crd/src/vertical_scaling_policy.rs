use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::condition::Condition;

/// CPU/memory bounds a target's instance type must fall within.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRange {
    pub cpu: Quantity,
    pub memory: Quantity,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBounds {
    pub requests: ResourceRange,
    pub limits: ResourceRange,
}

/// One `InstanceGroup` this policy drives instance-type recommendations for.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingTarget {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
pub enum ScalingPolicyType {
    NodesCountPct,
    #[serde(rename = "CPUPct")]
    #[strum(serialize = "CPUPct")]
    CpuPct,
    MemPct,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicy {
    #[serde(rename = "type")]
    pub type_: ScalingPolicyType,
    /// Percentage threshold (0-100) the sampled utilization is compared
    /// against.
    pub value: i32,
    pub period_seconds: i64,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingBehavior {
    #[serde(default)]
    pub stabilization_window_seconds: i64,
    #[serde(default)]
    pub policies: Vec<ScalingPolicy>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Behavior {
    pub scale_up: ScalingBehavior,
    pub scale_down: ScalingBehavior,
}

/// Per-target status: the last computed recommendation and
/// the condition history that decision was derived from.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_instance_type: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// When the last promotion/demotion fired for this target, anchoring the
    /// stabilization window independently of the per-policy condition clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resize_time: Option<Time>,
}

pub mod v1alpha1 {
    use super::*;

    /// A `VerticalScalingPolicy` drives automatic instance-type
    /// recommendations for a set of `InstanceGroup` targets, based on live
    /// node utilization sampled against an instance-family catalog.
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[kube(
        group = "instancemgr.k8s.io",
        version = "v1alpha1",
        kind = "VerticalScalingPolicy",
        shortname = "vsp",
        namespaced,
        status = "VerticalScalingPolicyStatus"
    )]
    #[serde(rename_all = "camelCase")]
    pub struct VerticalScalingPolicySpec {
        pub resources: ResourceBounds,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub instance_family: Option<String>,
        pub targets: Vec<ScalingTarget>,
        pub behavior: Behavior,
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerticalScalingPolicyStatus {
    #[serde(default)]
    pub targets: Vec<TargetStatus>,
}

#[cfg(test)]
mod tests {
    use super::v1alpha1;

    #[test]
    fn deserializes_a_policy_with_both_directions() {
        let input = r#"
        apiVersion: instancemgr.k8s.io/v1alpha1
        kind: VerticalScalingPolicy
        metadata:
          name: workers-vsp
          namespace: default
        spec:
          resources:
            requests:
              cpu: "2"
              memory: 4Gi
            limits:
              cpu: "8"
              memory: 32Gi
          targets:
            - namespace: default
              name: workers
          behavior:
            scaleUp:
              stabilizationWindowSeconds: 60
              policies:
                - type: CPUPct
                  value: 80
                  periodSeconds: 300
            scaleDown:
              stabilizationWindowSeconds: 600
              policies:
                - type: CPUPct
                  value: 30
                  periodSeconds: 900
        "#;
        let vsp: v1alpha1::VerticalScalingPolicy =
            serde_yaml::from_str(input).expect("valid fixture");
        assert_eq!(vsp.spec.targets.len(), 1);
        assert_eq!(
            vsp.spec.behavior.scale_up.policies[0].type_,
            super::ScalingPolicyType::CpuPct
        );
    }
}
