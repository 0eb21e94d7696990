//! Drives one `InstanceGroup` through a single reconcile: load the
//! cluster-wide configuration, merge it with the user spec, discover cloud +
//! cluster state, run the state machine, and persist status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::Recorder;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};

use instance_manager_crd::annotations::FINALIZER;
use instance_manager_crd::condition::{self, Condition, ConditionStatus};
use instance_manager_crd::instance_group::ReconcileState;
use instance_manager_crd::v1alpha1::{InstanceGroup, InstanceGroupSpec};

use crate::cloud::CloudAbstractionLayer;
use crate::config::{self, ProvisionerConfiguration};
use crate::discovery::{self, Discoverer};
use crate::metrics;
use crate::provisioners::{self, ProvisionerContext};
use crate::shared_context::SharedContext;
use crate::state_machine::{self, ObservedCondition};

/// The configuration document this controller reads on every reconcile.
/// Its `resources.defaults`/`resources.boundaries`/`resources.conditionals`
/// keys feed the Configuration Merger.
pub const CONFIG_MAP_NAME: &str = "instance-manager";

/// How long after a non-terminal state we ask the runtime to requeue.
pub const REQUEUE_DELAY: Duration = state_machine::REQUEUE_DELAY;

pub struct Ctx {
    pub client: Client,
    pub cloud: Arc<dyn CloudAbstractionLayer>,
    pub cluster_name: String,
    pub operator_namespace: String,
    pub shared: Arc<SharedContext>,
    pub publisher: Arc<Recorder>,
}

#[derive(Debug, Snafu)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,
    #[snafu(display("failed to read the {CONFIG_MAP_NAME} ConfigMap"))]
    LoadConfig { source: kube::Error },
    #[snafu(display("{CONFIG_MAP_NAME} ConfigMap is missing key {key}"))]
    ConfigMapMissingKey { key: &'static str },
    #[snafu(display("failed to parse the cluster-wide configuration document"))]
    ParseConfig { source: config::MergeError },
    #[snafu(display("failed to serialize the effective spec"))]
    SerializeEffectiveSpec { source: serde_json::Error },
    #[snafu(display("cloud/cluster discovery failed"))]
    Discovery { source: discovery::DiscoveryError },
    #[snafu(display("the provisioner failed to drive the reconcile"))]
    Drive {
        source: provisioners::ProvisionerError,
    },
    #[snafu(display("failed to patch the InstanceGroup status"))]
    PatchStatus { source: kube::Error },
    #[snafu(display("failed to patch the InstanceGroup finalizer"))]
    PatchFinalizer { source: kube::Error },
}

pub async fn reconcile(instance_group: Arc<InstanceGroup>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let namespace = instance_group
        .namespace()
        .context(ObjectHasNoNamespaceSnafu)?;
    let name = instance_group.name_any();
    let key = format!("{namespace}/{name}");

    let deleting = instance_group.meta().deletion_timestamp.is_some();
    if deleting && !instance_group.finalizers().iter().any(|f| f == FINALIZER) {
        // Already cleaned up in a previous reconcile; nothing left to do.
        return Ok(Action::await_change());
    }
    if !deleting && !instance_group.finalizers().iter().any(|f| f == FINALIZER) {
        ensure_finalizer(&ctx.client, &namespace, &name).await?;
    }

    let result = run(&instance_group, &namespace, &ctx).await;

    match &result {
        Ok(state) => {
            metrics::inc_success(&key);
            metrics::set_status(&key, &state.to_string());
        }
        Err(error) => {
            metrics::inc_fail(&key, error_reason(error));
        }
    }

    let state = result?;

    if deleting && state == ReconcileState::Deleted {
        remove_finalizer(&ctx.client, &namespace, &name).await?;
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(REQUEUE_DELAY))
}

fn error_reason(error: &Error) -> &'static str {
    match error {
        Error::ObjectHasNoNamespace => "ObjectHasNoNamespace",
        Error::LoadConfig { .. } => "LoadConfig",
        Error::ConfigMapMissingKey { .. } => "ConfigMapMissingKey",
        Error::ParseConfig { .. } => "ParseConfig",
        Error::SerializeEffectiveSpec { .. } => "SerializeEffectiveSpec",
        Error::Discovery { .. } => "Discovery",
        Error::Drive { .. } => "Drive",
        Error::PatchStatus { .. } => "PatchStatus",
        Error::PatchFinalizer { .. } => "PatchFinalizer",
    }
}

async fn run(
    instance_group: &Arc<InstanceGroup>,
    namespace: &str,
    ctx: &Ctx,
) -> Result<ReconcileState, Error> {
    let deleting = instance_group.meta().deletion_timestamp.is_some();

    let namespace_annotations = namespace_annotations(&ctx.client, namespace).await?;
    let instance_group_annotations = instance_group.annotations().clone();

    let (provisioner_config, raw_document) = load_provisioner_config(&ctx.client, &ctx.operator_namespace).await?;

    let user_spec: config::Value = serde_json::to_value(&instance_group.spec)
        .context(SerializeEffectiveSpecSnafu)?
        .into();

    let outcome = config::merge(
        &provisioner_config,
        (raw_document.0.as_str(), raw_document.1.as_str(), raw_document.2.as_str()),
        &namespace_annotations,
        &instance_group_annotations,
        &user_spec,
    );

    let effective_spec_value: serde_json::Value = outcome.effective_spec.into();
    let effective_spec: InstanceGroupSpec =
        serde_json::from_value(effective_spec_value).context(SerializeEffectiveSpecSnafu)?;

    let scaling_group_name = discovery::scaling_group_name(&ctx.cluster_name, namespace, &instance_group.name_any());

    let discoverer = Discoverer {
        cloud: ctx.cloud.clone(),
        kube_client: ctx.client.clone(),
        cluster_name: ctx.cluster_name.clone(),
    };
    let discovered = discoverer
        .discover(instance_group, ctx.publisher.clone(), outcome.config_hash.clone())
        .await
        .context(DiscoverySnafu)?;

    let observed = observed_condition(instance_group, &discovered);
    let initial_state = if observed_is_absent(&discovered, instance_group) && !deleting {
        ReconcileState::InitCreate
    } else {
        state_machine::derive_state(observed, deleting)
    };

    let locked = state_machine::is_locked(
        &instance_group_annotations,
        &discovered.active_upgrade_resources,
        effective_spec.strategy.as_ref().and_then(|s| match s {
            instance_manager_crd::instance_group::UpgradeStrategy::Crd(strategy) => {
                Some(strategy.concurrency_policy)
            }
            _ => None,
        }),
    );

    let mut effective_spec = effective_spec;
    if let Some(instance_type) = ctx
        .shared
        .computed_type(&crate::shared_context::NamespacedName::new(namespace, instance_group.name_any()))
    {
        effective_spec.configuration.instance_type = Some(instance_type);
    }

    let drift_detected = {
        let fingerprint = state_machine::launch_config_fingerprint(&effective_spec.configuration);
        state_machine::is_upgrade_needed(&discovered, &fingerprint)
    };

    let mut effective_instance_group = (**instance_group).clone();
    effective_instance_group.spec = effective_spec;

    let provisioner_ctx = ProvisionerContext {
        cloud: ctx.cloud.clone(),
        kube_client: ctx.client.clone(),
        cluster_name: ctx.cluster_name.clone(),
        scaling_group_name,
        instance_group: Arc::new(effective_instance_group),
        discovered,
    };
    let deployer = provisioners::build_deployer(provisioner_ctx);

    let final_state = state_machine::drive(deployer.as_ref(), initial_state, locked, drift_detected)
        .await
        .context(DriveSnafu)?;

    persist_status(
        &ctx.client,
        namespace,
        &instance_group.name_any(),
        final_state,
        &outcome.config_hash,
    )
    .await?;

    Ok(final_state)
}

fn observed_condition(
    instance_group: &InstanceGroup,
    discovered: &discovery::DiscoveredState,
) -> ObservedCondition {
    use instance_manager_crd::instance_group::ProvisionerKind;
    match instance_group.spec.provisioner {
        ProvisionerKind::SelfManaged => discovered
            .self_scaling_group
            .as_ref()
            .map(|g| ObservedCondition::from(g.status))
            .unwrap_or(ObservedCondition::Absent),
        ProvisionerKind::Managed => discovered
            .managed_node_group
            .as_ref()
            .map(|g| ObservedCondition::from(g.status))
            .unwrap_or(ObservedCondition::Absent),
        ProvisionerKind::Fargate => discovered
            .fargate_profile
            .as_ref()
            .map(|p| ObservedCondition::from(p.status))
            .unwrap_or(ObservedCondition::Absent),
    }
}

fn observed_is_absent(discovered: &discovery::DiscoveredState, instance_group: &InstanceGroup) -> bool {
    use instance_manager_crd::instance_group::ProvisionerKind;
    match instance_group.spec.provisioner {
        ProvisionerKind::SelfManaged => discovered.self_scaling_group.is_none(),
        ProvisionerKind::Managed => discovered.managed_node_group.is_none(),
        ProvisionerKind::Fargate => discovered.fargate_profile.is_none(),
    }
}

async fn namespace_annotations(client: &Client, namespace: &str) -> Result<BTreeMap<String, String>, Error> {
    use k8s_openapi::api::core::v1::Namespace;
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = api.get(namespace).await.context(LoadConfigSnafu)?;
    Ok(ns.metadata.annotations.unwrap_or_default())
}

async fn load_provisioner_config(
    client: &Client,
    operator_namespace: &str,
) -> Result<(ProvisionerConfiguration, (String, String, String)), Error> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), operator_namespace);
    let config_map = api.get(CONFIG_MAP_NAME).await.context(LoadConfigSnafu)?;
    let data = config_map.data.unwrap_or_default();

    let defaults = data
        .get("defaults")
        .cloned()
        .context(ConfigMapMissingKeySnafu { key: "defaults" })?;
    let boundaries = data
        .get("boundaries")
        .cloned()
        .context(ConfigMapMissingKeySnafu { key: "boundaries" })?;
    let conditionals = data
        .get("conditionals")
        .cloned()
        .unwrap_or_else(|| "[]".to_string());

    let parsed = ProvisionerConfiguration::parse(&defaults, &boundaries, &conditionals)
        .context(ParseConfigSnafu)?;

    Ok((parsed, (defaults, boundaries, conditionals)))
}

async fn ensure_finalizer(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<InstanceGroup> = Api::namespaced(client.clone(), namespace);
    let patch = json!({ "metadata": { "finalizers": [FINALIZER] } });
    api.patch(
        name,
        &PatchParams::apply(instance_manager_crd::instance_group::APP_NAME),
        &Patch::Merge(patch),
    )
    .await
    .context(PatchFinalizerSnafu)?;
    Ok(())
}

async fn remove_finalizer(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<InstanceGroup> = Api::namespaced(client.clone(), namespace);
    let current = api.get(name).await.context(PatchFinalizerSnafu)?;
    let remaining: Vec<String> = current
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    let patch = json!({ "metadata": { "finalizers": remaining } });
    api.patch(
        name,
        &PatchParams::apply(instance_manager_crd::instance_group::APP_NAME),
        &Patch::Merge(patch),
    )
    .await
    .context(PatchFinalizerSnafu)?;
    Ok(())
}

async fn persist_status(
    client: &Client,
    namespace: &str,
    name: &str,
    state: ReconcileState,
    config_hash: &str,
) -> Result<(), Error> {
    let api: Api<InstanceGroup> = Api::namespaced(client.clone(), namespace);
    let current = api.get_status(name).await.context(PatchStatusSnafu)?;
    let mut status = current.status.unwrap_or_default();
    status.current_state = state;
    status.config_hash = config_hash.to_string();

    let condition_status = if state == ReconcileState::Err {
        ConditionStatus::False
    } else {
        ConditionStatus::True
    };
    let condition = Condition::new("Ready", condition_status).with_reason(state.to_string());
    let now = k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now());
    condition::upsert(&mut status.conditions, condition, now);

    let patch = json!({ "status": status });
    api.patch_status(
        name,
        &PatchParams::apply(instance_manager_crd::instance_group::APP_NAME),
        &Patch::Merge(patch),
    )
    .await
    .context(PatchStatusSnafu)?;
    Ok(())
}

pub fn error_policy(_instance_group: Arc<InstanceGroup>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    tracing::error!(%error, "reconcile failed");
    Action::requeue(Duration::from_secs(30))
}
