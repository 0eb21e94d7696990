//! The `instance-manager` controller binary: wires the reconcile pipeline
//! in [`controller`] to a `kube::runtime::Controller`, and spawns the two
//! independent background loops (Vertical Scaling Policy sampling, Node/Event
//! watch routing) that feed it through [`shared_context::SharedContext`].

mod auth_map;
mod cloud;
mod config;
mod controller;
mod discovery;
mod metrics;
mod provisioners;
mod shared_context;
mod state_machine;
mod upgrade;
mod vsp;
mod watch_router;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::stream::{poll_fn, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Node};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Client, CustomResourceExt, ResourceExt};

use instance_manager_crd::v1alpha1::InstanceGroup;

use crate::cloud::{AwsCloud, CloudAbstractionLayer};
use crate::config::ProvisionerConfiguration;
use crate::shared_context::{InstanceGroupEvent, NamespacedName, SharedContext};
use crate::watch_router::NamespaceCache;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

const CONTROLLER_NAME: &str = "instance-manager.instancemgr.k8s.io";

/// How recent a `SpotRecommendationGiven` event has to be to still matter.
const SPOT_RECOMMENDATION_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Parser)]
#[command(about, author, version)]
struct Opts {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the InstanceGroup CRD as YAML and exit.
    Crd,
    /// Run the controller.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Name of the EKS cluster this controller manages node pools for.
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: String,
    /// Namespace the `instance-manager` ConfigMap lives in.
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    operator_namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    match opts.cmd {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&InstanceGroup::crd())?);
        }
        Command::Run(args) => run(args).await?,
    }

    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(
        pkg_version = built_info::PKG_VERSION,
        git_version = built_info::GIT_VERSION,
        target = built_info::TARGET,
        built_time_utc = built_info::BUILT_TIME_UTC,
        rustc_version = built_info::RUSTC_VERSION,
        "starting {}",
        built_info::PKG_NAME,
    );

    metrics::register();

    let client = Client::try_default().await?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let cloud: Arc<dyn CloudAbstractionLayer> = Arc::new(AwsCloud::new(&aws_config));

    let (shared, events_rx) = SharedContext::new();
    let shared = Arc::new(shared);

    let publisher = Arc::new(Recorder::new(
        client.clone(),
        Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));

    tokio::spawn(vsp::run(client.clone(), shared.clone(), cloud.clone()));
    tokio::spawn(run_node_watch(client.clone(), shared.clone()));
    tokio::spawn(run_event_watch(
        client.clone(),
        shared.clone(),
        cloud.clone(),
        args.cluster_name.clone(),
    ));
    tokio::spawn(run_policy_cache(client.clone(), shared.clone()));

    let ctx = Arc::new(controller::Ctx {
        client: client.clone(),
        cloud,
        cluster_name: args.cluster_name,
        operator_namespace: args.operator_namespace.clone(),
        shared: shared.clone(),
        publisher,
    });

    let instance_groups: Api<InstanceGroup> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &args.operator_namespace);
    let namespaces: Api<Namespace> = Api::all(client.clone());

    let instance_group_controller = Controller::new(instance_groups, watcher::Config::default());
    let store = instance_group_controller.store();
    let namespace_store_handle = store.clone();
    let namespace_cache = Arc::new(NamespaceCache::new());

    instance_group_controller
        .shutdown_on_signal()
        .watches(config_maps, watcher::Config::default(), move |config_map| {
            let current_digest = (config_map.name_any() == controller::CONFIG_MAP_NAME)
                .then(|| config_map_digest(&config_map));
            store
                .state()
                .into_iter()
                .filter(move |instance_group| {
                    current_digest
                        .as_deref()
                        .map(|digest| {
                            let persisted = instance_group
                                .status
                                .as_ref()
                                .map(|s| s.config_hash.as_str())
                                .unwrap_or_default();
                            watch_router::config_hash_is_stale(persisted, digest)
                        })
                        .unwrap_or(false)
                })
                .map(|instance_group| ObjectRef::from_obj(&*instance_group))
        })
        .watches(namespaces, watcher::Config::default(), move |namespace| {
            let name = namespace.name_any();
            let changed = namespace_cache.observe(&name, namespace.annotations().clone());
            namespace_store_handle
                .state()
                .into_iter()
                .filter(move |instance_group| {
                    changed && instance_group.namespace().as_deref() == Some(name.as_str())
                })
                .map(|instance_group| ObjectRef::from_obj(&*instance_group))
        })
        .reconcile_on({
            let mut events_rx = events_rx;
            poll_fn(move |cx| events_rx.poll_recv(cx)).map(|event: InstanceGroupEvent| {
                ObjectRef::<InstanceGroup>::new(&event.target.name).within(&event.target.namespace)
            })
        })
        .run(controller::reconcile, controller::error_policy, ctx)
        .for_each_concurrent(16, |result| async move {
            match result {
                Ok((object_ref, _action)) => {
                    tracing::debug!(instancegroup = %object_ref.name, "reconciled");
                }
                Err(error) => {
                    tracing::error!(%error, "reconcile failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Caches every `VerticalScalingPolicy` into [`SharedContext`] so the VSP
/// loop always samples the latest spec without re-fetching it on every tick.
async fn run_policy_cache(client: Client, shared: Arc<SharedContext>) {
    use instance_manager_crd::vsp_v1alpha1::VerticalScalingPolicy;

    let policies: Api<VerticalScalingPolicy> = Api::all(client);
    let stream = watcher(policies, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(policy) | watcher::Event::InitApply(policy)) => {
                let key = NamespacedName::new(
                    policy.namespace().unwrap_or_default(),
                    policy.name_any(),
                );
                shared.upsert_policy(key, policy);
            }
            Ok(watcher::Event::Delete(policy)) => {
                let key = NamespacedName::new(
                    policy.namespace().unwrap_or_default(),
                    policy.name_any(),
                );
                shared.remove_policy(&key);
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "VerticalScalingPolicy watch error"),
        }
    }
}

/// Node watch: (a) keeps the shared node cache current for the VSP loop; (b)
/// backfills the legacy `kubernetes.io/role` label workloads still select
/// on. Emits no reconcile requests; it never touches an InstanceGroup.
async fn run_node_watch(client: Client, shared: Arc<SharedContext>) {
    let nodes: Api<Node> = Api::all(client);
    let stream = watcher(nodes.clone(), watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(node) | watcher::Event::InitApply(node)) => {
                let labels = node.metadata.labels.clone().unwrap_or_default();
                if let Some((key, value)) = watch_router::node_role_label_patch(&labels) {
                    let name = node.name_any();
                    let patch = serde_json::json!({ "metadata": { "labels": { key: value } } });
                    if let Err(error) = nodes
                        .patch(&name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(patch))
                        .await
                    {
                        tracing::warn!(%error, node = %name, "failed to backfill node role label");
                    }
                }
                shared.upsert_node(node);
            }
            Ok(watcher::Event::Delete(node)) => {
                if let Some(name) = node.metadata.name.as_deref() {
                    shared.remove_node(name);
                }
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "Node watch error"),
        }
    }
}

/// Event watch: filters for recent `SpotRecommendationGiven` events, resolves
/// the involved scaling group back to the `InstanceGroup` that owns it, and
/// nudges a reconcile through the generic event channel.
async fn run_event_watch(
    client: Client,
    shared: Arc<SharedContext>,
    cloud: Arc<dyn CloudAbstractionLayer>,
    cluster_name: String,
) {
    use crate::cloud::{OwnershipTags, ScalingGroups};

    let events: Api<Event> = Api::all(client);
    let stream = watcher(events, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(watcher::Event::Apply(event) | watcher::Event::InitApply(event)) => event,
            Ok(_) => continue,
            Err(error) => {
                tracing::warn!(%error, "Event watch error");
                continue;
            }
        };

        let Some(reason) = event.reason.as_deref() else { continue };
        let Some(last_seen) = event.last_timestamp.as_ref().map(|t| t.0) else { continue };
        if !watch_router::is_actionable_spot_recommendation(
            reason,
            last_seen,
            chrono::Utc::now(),
            SPOT_RECOMMENDATION_MAX_AGE,
        ) {
            continue;
        }
        let Some(involved_name) = event.involved_object.name.as_deref() else { continue };

        let tags = OwnershipTags {
            cluster: cluster_name.clone(),
            instance_group_namespace: String::new(),
            instance_group_name: String::new(),
        };
        let groups = match ScalingGroups::list_by_ownership(cloud.as_ref(), &tags).await {
            Ok(groups) => groups,
            Err(error) => {
                tracing::warn!(%error, "failed to list scaling groups for event resolution");
                continue;
            }
        };

        if let Some(target) = watch_router::resolve_owning_instance_group(&groups, involved_name) {
            shared.emit_event(target);
        }
    }
}

/// Digest over the `instance-manager` ConfigMap's three document keys,
/// mirroring [`controller::load_provisioner_config`]'s defaulting so the
/// watch and the reconcile that later re-reads the same document agree on
/// what changed.
fn config_map_digest(config_map: &ConfigMap) -> String {
    let data = config_map.data.clone().unwrap_or_default();
    let defaults = data.get("defaults").cloned().unwrap_or_default();
    let boundaries = data.get("boundaries").cloned().unwrap_or_default();
    let conditionals = data.get("conditionals").cloned().unwrap_or_else(|| "[]".to_string());
    ProvisionerConfiguration::digest(&defaults, &boundaries, &conditionals)
}
