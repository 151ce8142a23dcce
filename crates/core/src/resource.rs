//! Infrastructure resource events (nodes, pods). These travel through the
//! batching pipeline rather than the per-event queue.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SourceMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Workload,
    Node,
    Pod,
    Service,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Workload => "WORKLOAD",
            ResourceType::Node => "NODE",
            ResourceType::Pod => "POD",
            ResourceType::Service => "SERVICE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceEventKind {
    Created,
    Updated,
    Deleted,
    StatusChange,
}

impl ResourceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceEventKind::Created => "CREATED",
            ResourceEventKind::Updated => "UPDATED",
            ResourceEventKind::Deleted => "DELETED",
            ResourceEventKind::StatusChange => "STATUS_CHANGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTaint {
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    pub effect: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubelet_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_runtime_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<NodeTaint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    pub image: String,
    pub ready: bool,
    pub restart_count: i32,
    /// `running`, `waiting` or `terminated`.
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner_kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner_name: String,
    #[serde(default, rename = "ownerUID", skip_serializing_if = "String::is_empty")]
    pub owner_uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, rename = "podIP", skip_serializing_if = "String::is_empty")]
    pub pod_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub restart_count: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<ContainerStatus>,
}

/// Kind-specific detail, serialized as `{"node": {...}}` or `{"pod": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMetadata {
    Node(NodeMetadata),
    Pod(PodMetadata),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEvent {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub source: SourceMetadata,
    pub resource_type: ResourceType,
    pub resource: ResourceRef,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub event_kind: ResourceEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ResourceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResourceMetadata>,
}

impl ResourceEvent {
    pub fn new(
        source: &SourceMetadata,
        resource_type: ResourceType,
        resource: ResourceRef,
        labels: BTreeMap<String, String>,
        event_kind: ResourceEventKind,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            source: source.clone(),
            resource_type,
            resource,
            labels,
            event_kind,
            state: None,
            metadata: None,
        }
    }

    pub fn node(source: &SourceMetadata, name: &str, uid: &str, labels: BTreeMap<String, String>, kind: ResourceEventKind) -> Self {
        let r = ResourceRef { kind: "Node".into(), name: name.into(), namespace: String::new(), uid: uid.into() };
        Self::new(source, ResourceType::Node, r, labels, kind)
    }

    pub fn pod(
        source: &SourceMetadata,
        namespace: &str,
        name: &str,
        uid: &str,
        labels: BTreeMap<String, String>,
        kind: ResourceEventKind,
    ) -> Self {
        let r = ResourceRef { kind: "Pod".into(), name: name.into(), namespace: namespace.into(), uid: uid.into() };
        Self::new(source, ResourceType::Pod, r, labels, kind)
    }

    pub fn with_state(mut self, state: ResourceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_metadata(mut self, metadata: ResourceMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// `Kind/namespace/name` (or `Kind/name` for cluster-scoped resources), for logs.
    pub fn identity(&self) -> String {
        if self.resource.namespace.is_empty() {
            format!("{}/{}", self.resource.kind, self.resource.name)
        } else {
            format!("{}/{}/{}", self.resource.kind, self.resource.namespace, self.resource.name)
        }
    }
}
