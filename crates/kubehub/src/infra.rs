//! Node and pod adapters: stable identity, reported state, kind metadata,
//! and the small observation used to detect meaningful status changes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ContainerStatus as KubeContainerStatus, Node, Pod};
use rollwatch_core::{Condition, ContainerStatus, NodeMetadata, NodeTaint, PodMetadata, ResourceState};

/// Fields of a node whose change is worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeObservation {
    pub ready: bool,
    pub unschedulable: bool,
    pub pressure: bool,
    pub kubelet_version: String,
}

/// Fields of a pod whose change is worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub phase: String,
    pub ready: bool,
    pub node_name: String,
    pub restart_count: i32,
}

fn condition(type_: &str, status: &str, reason: Option<&String>, message: Option<&String>) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.cloned().unwrap_or_default(),
        message: message.cloned().unwrap_or_default(),
    }
}

#[derive(Debug, Clone)]
pub struct NodeSnapshot<'a>(pub &'a Node);

impl NodeSnapshot<'_> {
    pub fn name(&self) -> &str { self.0.metadata.name.as_deref().unwrap_or("") }
    pub fn uid(&self) -> &str { self.0.metadata.uid.as_deref().unwrap_or("") }
    pub fn labels(&self) -> BTreeMap<String, String> { self.0.metadata.labels.clone().unwrap_or_default() }

    fn condition_status(&self, type_: &str) -> Option<&str> {
        let conds = self.0.status.as_ref()?.conditions.as_ref()?;
        conds.iter().find(|c| c.type_ == type_).map(|c| c.status.as_str())
    }

    pub fn is_ready(&self) -> bool { self.condition_status("Ready") == Some("True") }

    pub fn has_pressure(&self) -> bool {
        ["MemoryPressure", "DiskPressure", "PIDPressure"].iter().any(|t| self.condition_status(t) == Some("True"))
    }

    pub fn is_unschedulable(&self) -> bool { self.0.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false) }

    pub fn observation(&self) -> NodeObservation {
        NodeObservation {
            ready: self.is_ready(),
            unschedulable: self.is_unschedulable(),
            pressure: self.has_pressure(),
            kubelet_version: self.0.status.as_ref().and_then(|s| s.node_info.as_ref()).map(|i| i.kubelet_version.clone()).unwrap_or_default(),
        }
    }

    pub fn state(&self) -> ResourceState {
        let status = self.0.status.as_ref();
        let conditions = status
            .and_then(|s| s.conditions.as_ref())
            .into_iter()
            .flatten()
            .map(|c| condition(&c.type_, &c.status, c.reason.as_ref(), c.message.as_ref()))
            .collect();
        ResourceState { phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(), conditions, ..Default::default() }
    }

    pub fn metadata(&self) -> NodeMetadata {
        let status = self.0.status.as_ref();
        let quantities = |m: Option<&BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>| {
            m.map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect()).unwrap_or_default()
        };
        let mut meta = NodeMetadata {
            capacity: quantities(status.and_then(|s| s.capacity.as_ref())),
            allocatable: quantities(status.and_then(|s| s.allocatable.as_ref())),
            taints: self
                .0
                .spec
                .as_ref()
                .and_then(|s| s.taints.as_ref())
                .into_iter()
                .flatten()
                .map(|t| NodeTaint { key: t.key.clone(), value: t.value.clone().unwrap_or_default(), effect: t.effect.clone() })
                .collect(),
            ..Default::default()
        };
        if let Some(info) = status.and_then(|s| s.node_info.as_ref()) {
            meta.kubelet_version = info.kubelet_version.clone();
            meta.container_runtime_version = info.container_runtime_version.clone();
            meta.os_image = info.os_image.clone();
            meta.architecture = info.architecture.clone();
        }
        meta
    }
}

#[derive(Debug, Clone)]
pub struct PodSnapshot<'a>(pub &'a Pod);

impl PodSnapshot<'_> {
    pub fn name(&self) -> &str { self.0.metadata.name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> &str { self.0.metadata.namespace.as_deref().unwrap_or("") }
    pub fn uid(&self) -> &str { self.0.metadata.uid.as_deref().unwrap_or("") }
    pub fn labels(&self) -> BTreeMap<String, String> { self.0.metadata.labels.clone().unwrap_or_default() }
    pub fn phase(&self) -> &str { self.0.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("") }
    pub fn node_name(&self) -> &str { self.0.spec.as_ref().and_then(|s| s.node_name.as_deref()).unwrap_or("") }

    pub fn is_ready(&self) -> bool {
        let conds = self.0.status.as_ref().and_then(|s| s.conditions.as_ref());
        conds.into_iter().flatten().find(|c| c.type_ == "Ready").is_some_and(|c| c.status == "True")
    }

    fn container_statuses(&self) -> &[KubeContainerStatus] {
        self.0.status.as_ref().and_then(|s| s.container_statuses.as_deref()).unwrap_or(&[])
    }

    /// Sum of restarts across regular containers.
    pub fn restart_count(&self) -> i32 { self.container_statuses().iter().map(|c| c.restart_count).sum() }

    pub fn observation(&self) -> PodObservation {
        PodObservation {
            phase: self.phase().to_string(),
            ready: self.is_ready(),
            node_name: self.node_name().to_string(),
            restart_count: self.restart_count(),
        }
    }

    pub fn state(&self) -> ResourceState {
        let conditions = self
            .0
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .into_iter()
            .flatten()
            .map(|c| condition(&c.type_, &c.status, c.reason.as_ref(), c.message.as_ref()))
            .collect();
        ResourceState { phase: self.phase().to_string(), conditions, ..Default::default() }
    }

    pub fn metadata(&self) -> PodMetadata {
        let status = self.0.status.as_ref();
        let mut meta = PodMetadata {
            node_name: self.node_name().to_string(),
            pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            start_time: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
            restart_count: self.restart_count(),
            containers: convert_statuses(self.container_statuses()),
            init_containers: convert_statuses(status.and_then(|s| s.init_container_statuses.as_deref()).unwrap_or(&[])),
            ..Default::default()
        };
        if let Some(owner) = self.0.metadata.owner_references.as_ref().and_then(|o| o.first()) {
            meta.owner_kind = owner.kind.clone();
            meta.owner_name = owner.name.clone();
            meta.owner_uid = owner.uid.clone();
        }
        meta
    }
}

fn convert_statuses(statuses: &[KubeContainerStatus]) -> Vec<ContainerStatus> {
    statuses
        .iter()
        .map(|cs| {
            let mut out = ContainerStatus {
                name: cs.name.clone(),
                image: cs.image.clone(),
                ready: cs.ready,
                restart_count: cs.restart_count,
                ..Default::default()
            };
            if let Some(state) = cs.state.as_ref() {
                if state.running.is_some() {
                    out.state = "running".into();
                } else if let Some(w) = state.waiting.as_ref() {
                    out.state = "waiting".into();
                    out.reason = w.reason.clone().unwrap_or_default();
                    out.message = w.message.clone().unwrap_or_default();
                } else if let Some(t) = state.terminated.as_ref() {
                    out.state = "terminated".into();
                    out.reason = t.reason.clone().unwrap_or_default();
                    out.message = t.message.clone().unwrap_or_default();
                }
            }
            out
        })
        .collect()
}
