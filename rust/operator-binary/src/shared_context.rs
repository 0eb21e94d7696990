//! The one piece of unavoidable shared mutable global state: the handoff
//! between the Vertical Scaling Policy loop and the reconcile driver.
//! Guarded by a single read-write mutex with three short critical sections
//! (upsert, remove, get), none ever held across an await point that does
//! cloud or cluster I/O.

use std::collections::BTreeMap;
use std::sync::RwLock;

use k8s_openapi::api::core::v1::Node;
use tokio::sync::mpsc;

use instance_manager_crd::vsp_v1alpha1::VerticalScalingPolicy;

/// A key identifying a namespaced resource without borrowing from it.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> NamespacedName {
        NamespacedName {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// A generic reconcile nudge, enqueued by the VSP loop or the Watch Router's
/// Event source and consumed by the Watch Router's generic channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceGroupEvent {
    pub target: NamespacedName,
}

struct Inner {
    nodes: BTreeMap<String, Node>,
    policies: BTreeMap<NamespacedName, VerticalScalingPolicy>,
    computed_types: BTreeMap<NamespacedName, String>,
}

/// Process-wide state shared between the reconcile driver and the VSP
/// background task. Cloned handles are cheap (an `Arc` internally); never
/// clone the lock itself.
pub struct SharedContext {
    inner: RwLock<Inner>,
    events_tx: mpsc::Sender<InstanceGroupEvent>,
}

/// Backpressure bound for the generic event channel: when full, the VSP loop
/// drops duplicate target notifications rather than blocking, since
/// reconciles are idempotent and a dropped nudge is recovered by the next
/// sampling tick.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

impl SharedContext {
    pub fn new() -> (SharedContext, mpsc::Receiver<InstanceGroupEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            SharedContext {
                inner: RwLock::new(Inner {
                    nodes: BTreeMap::new(),
                    policies: BTreeMap::new(),
                    computed_types: BTreeMap::new(),
                }),
                events_tx: tx,
            },
            rx,
        )
    }

    pub fn upsert_node(&self, node: Node) {
        if let Some(name) = node.metadata.name.clone() {
            self.inner.write().unwrap().nodes.insert(name, node);
        }
    }

    pub fn remove_node(&self, name: &str) {
        self.inner.write().unwrap().nodes.remove(name);
    }

    pub fn nodes_snapshot(&self) -> Vec<Node> {
        self.inner.read().unwrap().nodes.values().cloned().collect()
    }

    pub fn upsert_policy(&self, key: NamespacedName, policy: VerticalScalingPolicy) {
        self.inner.write().unwrap().policies.insert(key, policy);
    }

    pub fn remove_policy(&self, key: &NamespacedName) {
        self.inner.write().unwrap().policies.remove(key);
    }

    pub fn policies_snapshot(&self) -> Vec<(NamespacedName, VerticalScalingPolicy)> {
        self.inner
            .read()
            .unwrap()
            .policies
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn set_computed_type(&self, target: NamespacedName, instance_type: String) {
        self.inner
            .write()
            .unwrap()
            .computed_types
            .insert(target, instance_type);
    }

    pub fn computed_type(&self, target: &NamespacedName) -> Option<String> {
        self.inner.read().unwrap().computed_types.get(target).cloned()
    }

    /// Emits a generic reconcile nudge for `target`. Never blocks: a full
    /// channel silently drops the event (see [`EVENT_CHANNEL_CAPACITY`]).
    pub fn emit_event(&self, target: NamespacedName) {
        let _ = self.events_tx.try_send(InstanceGroupEvent { target });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computed_type_round_trips_through_the_lock() {
        let (ctx, _rx) = SharedContext::new();
        let target = NamespacedName::new("default", "workers");
        assert_eq!(ctx.computed_type(&target), None);
        ctx.set_computed_type(target.clone(), "m5.xlarge".to_string());
        assert_eq!(ctx.computed_type(&target), Some("m5.xlarge".to_string()));
    }

    #[test]
    fn emit_event_never_blocks_when_channel_is_full() {
        let (ctx, mut rx) = SharedContext::new();
        for _ in 0..EVENT_CHANNEL_CAPACITY + 8 {
            ctx.emit_event(NamespacedName::new("default", "workers"));
        }
        // Draining confirms the channel itself is intact and not poisoned.
        assert!(rx.try_recv().is_ok());
    }
}
