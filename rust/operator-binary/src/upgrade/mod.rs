//! The Upgrade Strategy Engine: submits and polls a user-chosen
//! upgrade custom resource, weak-referenced via the `{managed-by, scope}`
//! annotation pair rather than an owner reference, since the CRD itself is
//! defined outside this controller.

use std::collections::BTreeMap;

use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, Resource, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};

use instance_manager_crd::annotations::{MANAGED_BY, MANAGED_BY_VALUE, SCOPE};
use instance_manager_crd::instance_group::{ConcurrencyPolicy, CrdUpgradeStrategy};

#[derive(Debug, Snafu)]
pub enum UpgradeError {
    #[snafu(display("invalid crdApiVersion {api_version:?}"))]
    InvalidApiVersion { api_version: String },
    #[snafu(display("failed to list {kind} resources in {namespace}"))]
    List {
        kind: String,
        namespace: String,
        source: kube::Error,
    },
    #[snafu(display("failed to submit {kind}/{name}"))]
    Submit {
        kind: String,
        name: String,
        source: kube::Error,
    },
    #[snafu(display("{status_path} on {kind}/{name} reports failure: {failure_string}"))]
    RemoteFailure {
        kind: String,
        name: String,
        status_path: String,
        failure_string: String,
    },
}

/// Outcome of polling or submitting the upgrade resource, mapped directly
/// onto the subset of `ReconcileState` the driver cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpgradeOutcome {
    /// An active upgrade already exists and policy is `forbid`: no new
    /// submission, state becomes `Modifying`.
    Deferred,
    /// A new (or still in-flight) upgrade resource: state stays `Modifying`.
    InProgress,
    /// The upgrade resource reports success: state becomes `Modified`.
    Succeeded,
}

fn api_resource_for(strategy: &CrdUpgradeStrategy) -> Result<ApiResource, UpgradeError> {
    let (group, version) = strategy
        .crd_api_version
        .split_once('/')
        .context(InvalidApiVersionSnafu {
            api_version: strategy.crd_api_version.clone(),
        })?;
    let gvk = GroupVersionKind::gvk(group, version, &strategy.crd_kind);
    Ok(ApiResource::from_gvk(&gvk))
}

fn status_string(object: &DynamicObject, status_path: &str) -> Option<String> {
    let status = object.data.get("status")?;
    let mut current = status;
    for segment in status_path.split('.').skip(if status_path.starts_with("status.") {
        1
    } else {
        0
    }) {
        current = current.get(segment)?;
    }
    current.as_str().map(str::to_string)
}

fn is_active(object: &DynamicObject, strategy: &CrdUpgradeStrategy) -> bool {
    match status_string(object, &strategy.status_path) {
        Some(status) => status != strategy.success_string && status != strategy.failure_string,
        None => true,
    }
}

/// Lists every upgrade custom resource of `strategy.crd_kind` in `namespace`
/// annotated as managed-by this controller under `scope`, splitting it into
/// "owned" (this scope) and "active" (any of this kind still in flight in
/// this scope) sets for [`crate::discovery`].
pub async fn discover_upgrade_resources(
    client: &Client,
    namespace: &str,
    strategy: &CrdUpgradeStrategy,
    scope: &str,
) -> Result<(Vec<DynamicObject>, Vec<DynamicObject>), UpgradeError> {
    let api_resource = api_resource_for(strategy)?;
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &api_resource);

    let list = api
        .list(&ListParams::default())
        .await
        .context(ListSnafu {
            kind: strategy.crd_kind.clone(),
            namespace: namespace.to_string(),
        })?;

    let owned: Vec<DynamicObject> = list
        .items
        .into_iter()
        .filter(|object| {
            let annotations = object.meta().annotations.clone().unwrap_or_default();
            annotations.get(MANAGED_BY).map(String::as_str) == Some(MANAGED_BY_VALUE)
                && annotations.get(SCOPE).map(String::as_str) == Some(scope)
        })
        .collect();

    let active = owned
        .iter()
        .filter(|object| is_active(object, strategy))
        .cloned()
        .collect();

    Ok((owned, active))
}

/// Truncates `base-suffix` to 63 characters (Kubernetes name limit),
/// preferring the project's own prefix when truncation is required
/// when truncation is required.
pub fn resource_name(base: &str, launch_config_suffix: &str) -> String {
    let full = format!("{base}-{launch_config_suffix}");
    if full.len() <= 63 {
        return full;
    }
    let fallback = format!("instancemgr-{launch_config_suffix}");
    fallback.chars().take(63).collect()
}

/// Runs one reconcile step of the engine: decide whether to submit a new
/// upgrade resource, or poll an existing one, given the already-discovered
/// owned/active sets.
pub async fn reconcile(
    client: &Client,
    namespace: &str,
    strategy: &CrdUpgradeStrategy,
    scope: &str,
    owned: &[DynamicObject],
    active: &[DynamicObject],
) -> Result<UpgradeOutcome, UpgradeError> {
    if !active.is_empty() {
        if strategy.concurrency_policy == ConcurrencyPolicy::Forbid {
            return Ok(UpgradeOutcome::Deferred);
        }
    }

    if let Some(existing) = owned.iter().max_by_key(|o| o.name_any()) {
        return Ok(match status_string(existing, &strategy.status_path) {
            Some(status) if status == strategy.success_string => UpgradeOutcome::Succeeded,
            Some(status) if status == strategy.failure_string => {
                return RemoteFailureSnafu {
                    kind: strategy.crd_kind.clone(),
                    name: existing.name_any(),
                    status_path: strategy.status_path.clone(),
                    failure_string: strategy.failure_string.clone(),
                }
                .fail();
            }
            _ => UpgradeOutcome::InProgress,
        });
    }

    submit(client, namespace, strategy, scope).await?;
    Ok(UpgradeOutcome::InProgress)
}

async fn submit(
    client: &Client,
    namespace: &str,
    strategy: &CrdUpgradeStrategy,
    scope: &str,
) -> Result<(), UpgradeError> {
    let api_resource = api_resource_for(strategy)?;
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &api_resource);

    let name = resource_name(scope, &rand_like_suffix(scope));
    let mut annotations = BTreeMap::new();
    annotations.insert(MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    annotations.insert(SCOPE.to_string(), scope.to_string());

    let mut object = DynamicObject::new(&name, &api_resource).within(namespace);
    object.metadata.annotations = Some(annotations);
    object.data = strategy.rendered_spec.clone();

    api.create(&PostParams::default(), &object)
        .await
        .context(SubmitSnafu {
            kind: strategy.crd_kind.clone(),
            name,
        })?;
    Ok(())
}

/// A short, deterministic suffix derived from the scope name; the real
/// launch-config suffix (e.g. a timestamp or a launch-config hash) is
/// supplied by the caller when one already exists. This fallback keeps
/// `submit` callable standalone for the no-launch-config-yet case.
fn rand_like_suffix(scope: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    format!("{:x}", hasher.finalize())[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_name_truncates_with_instancemgr_prefix_on_overflow() {
        let base = "a".repeat(80);
        let name = resource_name(&base, "abcd1234");
        assert!(name.len() <= 63);
        assert!(name.starts_with("instancemgr-"));
    }

    #[test]
    fn resource_name_is_left_alone_when_short_enough() {
        let name = resource_name("workers-asg", "abcd1234");
        assert_eq!(name, "workers-asg-abcd1234");
    }
}
