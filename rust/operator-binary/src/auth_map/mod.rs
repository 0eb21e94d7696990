//! The Auth-Map Bootstrapper: maintains `kube-system/aws-auth`'s `mapRoles`
//! entry so every managed node IAM role is an authorized cluster member,
//! with at-most-one entry per role ARN and safe concurrent updates from
//! every InstanceGroup's reconcile loop.
//!
//! This is the mapper-based design: optimistic
//! concurrency via get-then-replace, retried on conflict with bounded
//! exponential backoff, rather than the legacy hand-rolled YAML splicer.

use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const NAMESPACE: &str = "kube-system";
pub const NAME: &str = "aws-auth";
const MAP_ROLES_KEY: &str = "mapRoles";

/// Exponential backoff bounds for the optimistic-concurrency retry loop
/// 100ms initial, doubling, capped at 30s, at most 12 attempts.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 12;

#[derive(Debug, Snafu)]
pub enum AuthMapError {
    #[snafu(display("failed to read {namespace}/{name}"))]
    Get {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[snafu(display("{namespace}/{name} has no {key} key"))]
    MissingKey {
        namespace: String,
        name: String,
        key: &'static str,
    },
    #[snafu(display("failed to parse {key} as YAML"))]
    Parse {
        key: &'static str,
        source: serde_yaml::Error,
    },
    #[snafu(display("failed to serialize {key} as YAML"))]
    Serialize {
        key: &'static str,
        source: serde_yaml::Error,
    },
    #[snafu(display("failed to write {namespace}/{name} after {attempts} attempts"))]
    RetryBudgetExhausted {
        namespace: String,
        name: String,
        attempts: u32,
        source: kube::Error,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OsFamily {
    Linux,
    Windows,
}

/// One node IAM role this reconcile wants present (or absent) in `mapRoles`.
#[derive(Clone, Debug)]
pub struct AuthMapEntry {
    pub role_arn: String,
    pub os_family: OsFamily,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
struct MapRole {
    rolearn: String,
    username: String,
    groups: Vec<String>,
}

fn groups_for(os_family: OsFamily) -> Vec<String> {
    let mut groups = vec!["system:bootstrappers".to_string(), "system:nodes".to_string()];
    if os_family == OsFamily::Windows {
        groups.push("eks:kube-proxy-windows".to_string());
    }
    groups
}

fn desired_entry(entry: &AuthMapEntry) -> MapRole {
    MapRole {
        rolearn: entry.role_arn.clone(),
        username: "system:node:{{EC2PrivateDNSName}}".to_string(),
        groups: groups_for(entry.os_family),
    }
}

/// Applies the invariants to an already-parsed `mapRoles`
/// list: every `active` role present exactly once with the expected
/// username/groups, every `removed` role absent, everything else untouched.
/// Pure so it's unit-testable without a cluster.
fn apply(mut roles: Vec<MapRole>, active: &[AuthMapEntry], removed: &[String]) -> Vec<MapRole> {
    roles.retain(|role| !removed.contains(&role.rolearn));

    for entry in active {
        let desired = desired_entry(entry);
        match roles.iter_mut().find(|r| r.rolearn == entry.role_arn) {
            Some(existing) => *existing = desired,
            None => roles.push(desired),
        }
    }
    roles
}

/// Runs one `ReconcileAuthMap` call: reads the ConfigMap, applies `active`/
/// `removed`, and writes it back, retrying on a write conflict with bounded
/// exponential backoff.
pub async fn reconcile_auth_map(
    client: &Client,
    active: &[AuthMapEntry],
    removed: &[String],
) -> Result<(), AuthMapError> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), NAMESPACE);
    let mut backoff = INITIAL_BACKOFF;
    let mut last_conflict: Option<kube::Error> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        let mut config_map = api.get(NAME).await.context(GetSnafu {
            namespace: NAMESPACE.to_string(),
            name: NAME.to_string(),
        })?;

        let data = config_map.data.get_or_insert_with(Default::default);
        let current_roles: Vec<MapRole> = match data.get(MAP_ROLES_KEY) {
            Some(yaml) => serde_yaml::from_str(yaml).context(ParseSnafu { key: MAP_ROLES_KEY })?,
            None => Vec::new(),
        };

        let next_roles = apply(current_roles, active, removed);
        let next_yaml = serde_yaml::to_string(&next_roles).context(SerializeSnafu {
            key: MAP_ROLES_KEY,
        })?;
        data.insert(MAP_ROLES_KEY.to_string(), next_yaml);

        match api
            .replace(NAME, &PostParams::default(), &config_map)
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                tracing::debug!(
                    attempt,
                    resource_version = config_map.resource_version().unwrap_or_default(),
                    "aws-auth write conflict, retrying"
                );
                last_conflict = Some(kube::Error::Api(response));
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            Err(source) => {
                return Err(source).context(GetSnafu {
                    namespace: NAMESPACE.to_string(),
                    name: NAME.to_string(),
                })
            }
        }
    }

    Err(last_conflict.expect("loop ran at least once")).context(RetryBudgetExhaustedSnafu {
        namespace: NAMESPACE.to_string(),
        name: NAME.to_string(),
        attempts: MAX_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(arn: &str) -> AuthMapEntry {
        AuthMapEntry {
            role_arn: arn.to_string(),
            os_family: OsFamily::Linux,
        }
    }

    #[test]
    fn active_role_is_present_exactly_once_with_expected_shape() {
        let roles = apply(Vec::new(), &[entry("arn:aws:iam::1:role/workers")], &[]);
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].rolearn, "arn:aws:iam::1:role/workers");
        assert_eq!(roles[0].username, "system:node:{{EC2PrivateDNSName}}");
        assert_eq!(roles[0].groups, vec!["system:bootstrappers", "system:nodes"]);
    }

    #[test]
    fn windows_os_family_adds_kube_proxy_windows_group() {
        let entry = AuthMapEntry {
            role_arn: "arn:aws:iam::1:role/win".to_string(),
            os_family: OsFamily::Windows,
        };
        let roles = apply(Vec::new(), &[entry], &[]);
        assert!(roles[0].groups.contains(&"eks:kube-proxy-windows".to_string()));
    }

    #[test]
    fn removed_role_is_absent_and_others_are_preserved() {
        let existing = vec![
            MapRole {
                rolearn: "arn:aws:iam::1:role/a".to_string(),
                username: "system:node:{{EC2PrivateDNSName}}".to_string(),
                groups: vec!["system:bootstrappers".to_string(), "system:nodes".to_string()],
            },
            MapRole {
                rolearn: "arn:aws:iam::1:role/b".to_string(),
                username: "someone-elses-mapper".to_string(),
                groups: vec!["custom-group".to_string()],
            },
        ];
        let roles = apply(
            existing,
            &[],
            &["arn:aws:iam::1:role/a".to_string()],
        );
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].rolearn, "arn:aws:iam::1:role/b");
        assert_eq!(roles[0].username, "someone-elses-mapper");
    }

    #[test]
    fn re_applying_the_same_active_entry_is_idempotent() {
        let once = apply(Vec::new(), &[entry("arn:aws:iam::1:role/workers")], &[]);
        let twice = apply(once.clone(), &[entry("arn:aws:iam::1:role/workers")], &[]);
        assert_eq!(once, twice);
    }
}
