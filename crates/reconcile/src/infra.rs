//! Node and pod change detection. Events go out through the non-blocking
//! resource queue; a full queue drops the event.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use metrics::counter;
use rollwatch_core::{ResourceEvent, ResourceEventKind, ResourceMetadata, SourceMetadata};
use rollwatch_kubehub::{NodeObservation, NodeSnapshot, PodObservation, PodSnapshot, ResourceFilter, WatchChange};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Hand `event` to the resource queue without waiting.
pub fn offer(tx: &mpsc::Sender<ResourceEvent>, event: ResourceEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(ev)) => {
            warn!(resource = %ev.identity(), kind = ?ev.event_kind, "resource event queue full; dropping event");
            counter!("rollwatch_resource_events_dropped_total", "reason" => "full").increment(1);
            false
        }
        Err(TrySendError::Closed(ev)) => {
            debug!(resource = %ev.identity(), "resource event queue closed");
            counter!("rollwatch_resource_events_dropped_total", "reason" => "closed").increment(1);
            false
        }
    }
}

pub struct NodeReconciler {
    source: SourceMetadata,
    tx: mpsc::Sender<ResourceEvent>,
    /// Last observation per node name.
    known: FxHashMap<String, NodeObservation>,
}

impl NodeReconciler {
    pub fn new(source: SourceMetadata, tx: mpsc::Sender<ResourceEvent>) -> Self {
        Self { source, tx, known: FxHashMap::default() }
    }

    pub fn tracked(&self) -> usize { self.known.len() }

    pub fn handle(&mut self, change: WatchChange<Node>) {
        match change {
            WatchChange::Applied(node) => self.observe(&node),
            WatchChange::Deleted(node) => {
                let snap = NodeSnapshot(&node);
                self.deleted(snap.name(), snap.uid());
            }
            WatchChange::Resync(list) => {
                let listed: FxHashSet<String> = list.iter().map(|n| NodeSnapshot(n).name().to_string()).collect();
                let gone: Vec<String> = self.known.keys().filter(|n| !listed.contains(*n)).cloned().collect();
                for name in gone {
                    self.deleted(&name, "");
                }
                for node in &list {
                    self.observe(node);
                }
            }
        }
    }

    pub fn observe(&mut self, node: &Node) {
        let snap = NodeSnapshot(node);
        let current = snap.observation();
        let kind = match self.known.get(snap.name()) {
            None => ResourceEventKind::Created,
            Some(last) if *last != current => ResourceEventKind::StatusChange,
            Some(_) => return,
        };
        let event = ResourceEvent::node(&self.source, snap.name(), snap.uid(), snap.labels(), kind)
            .with_state(snap.state())
            .with_metadata(ResourceMetadata::Node(snap.metadata()));
        info!(
            node = snap.name(),
            kind = ?kind,
            ready = current.ready,
            unschedulable = current.unschedulable,
            pressure = current.pressure,
            "node changed"
        );
        offer(&self.tx, event);
        self.known.insert(snap.name().to_string(), current);
    }

    fn deleted(&mut self, name: &str, uid: &str) {
        info!(node = name, "node deleted");
        offer(&self.tx, ResourceEvent::node(&self.source, name, uid, Default::default(), ResourceEventKind::Deleted));
        self.known.remove(name);
    }
}

pub struct PodReconciler {
    source: SourceMetadata,
    tx: mpsc::Sender<ResourceEvent>,
    filter: Arc<ResourceFilter>,
    /// Last observation per `namespace/name`.
    known: FxHashMap<(String, String), PodObservation>,
}

impl PodReconciler {
    pub fn new(source: SourceMetadata, tx: mpsc::Sender<ResourceEvent>, filter: Arc<ResourceFilter>) -> Self {
        Self { source, tx, filter, known: FxHashMap::default() }
    }

    pub fn tracked(&self) -> usize { self.known.len() }

    fn admits(&self, snap: &PodSnapshot<'_>) -> bool {
        self.filter.should_watch_namespace(snap.namespace()) && self.filter.should_watch_resource(&snap.labels())
    }

    pub fn handle(&mut self, change: WatchChange<Pod>) {
        match change {
            WatchChange::Applied(pod) => self.observe(&pod),
            WatchChange::Deleted(pod) => {
                let snap = PodSnapshot(&pod);
                if self.known.contains_key(&key_of(&snap)) {
                    self.deleted(snap.namespace(), snap.name(), snap.uid());
                }
            }
            WatchChange::Resync(list) => {
                let listed: FxHashSet<(String, String)> = list.iter().map(|p| key_of(&PodSnapshot(p))).collect();
                let gone: Vec<(String, String)> = self.known.keys().filter(|k| !listed.contains(*k)).cloned().collect();
                for (ns, name) in gone {
                    self.deleted(&ns, &name, "");
                }
                for pod in &list {
                    self.observe(pod);
                }
            }
        }
    }

    pub fn observe(&mut self, pod: &Pod) {
        let snap = PodSnapshot(pod);
        if !self.admits(&snap) {
            return;
        }
        let key = key_of(&snap);
        let current = snap.observation();
        let kind = match self.known.get(&key) {
            None => ResourceEventKind::Created,
            Some(last) if *last != current => ResourceEventKind::StatusChange,
            Some(_) => return,
        };
        let event = ResourceEvent::pod(&self.source, snap.namespace(), snap.name(), snap.uid(), snap.labels(), kind)
            .with_state(snap.state())
            .with_metadata(ResourceMetadata::Pod(snap.metadata()));
        debug!(
            namespace = snap.namespace(),
            pod = snap.name(),
            kind = ?kind,
            phase = %current.phase,
            restarts = current.restart_count,
            "pod changed"
        );
        offer(&self.tx, event);
        self.known.insert(key, current);
    }

    fn deleted(&mut self, namespace: &str, name: &str, uid: &str) {
        debug!(namespace, pod = name, "pod deleted");
        let event = ResourceEvent::pod(&self.source, namespace, name, uid, Default::default(), ResourceEventKind::Deleted);
        offer(&self.tx, event);
        self.known.remove(&(namespace.to_string(), name.to_string()));
    }
}

fn key_of(snap: &PodSnapshot<'_>) -> (String, String) { (snap.namespace().to_string(), snap.name().to_string()) }
