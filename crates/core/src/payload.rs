use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::WorkloadUpdateEvent;

/// Identifies the emitting agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    pub cluster_id: String,
    pub agent_version: String,
}

impl SourceMetadata {
    pub fn new(cluster_id: impl Into<String>, agent_version: impl Into<String>) -> Self {
        Self { cluster_id: cluster_id.into(), agent_version: agent_version.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub current: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub previous: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    pub message: String,
}

/// External JSON shape of a [`WorkloadUpdateEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEventPayload {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub environment: String,
    pub source: SourceMetadata,
    pub workload: WorkloadRef,
    pub labels: BTreeMap<String, String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub revision: Revision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl AgentEventPayload {
    pub const KIND: &'static str = "DEPLOYMENT";

    /// Wrap an update with a fresh event id and the current time.
    pub fn from_update(update: &WorkloadUpdateEvent, source: &SourceMetadata, environment: &str) -> Self {
        Self::at(update, source, environment, Utc::now())
    }

    pub fn at(update: &WorkloadUpdateEvent, source: &SourceMetadata, environment: &str, now: DateTime<Utc>) -> Self {
        let mut labels = update.labels.clone();
        labels.insert("cluster_name".to_string(), source.cluster_id.clone());
        let error = update.status.as_ref().map(|s| ErrorDetail {
            code: s.reason.clone(),
            message: if s.message.is_empty() { s.reason.clone() } else { s.message.clone() },
        });
        Self {
            event_id: Uuid::new_v4().to_string(),
            occurred_at: now,
            environment: environment.to_string(),
            source: source.clone(),
            workload: WorkloadRef {
                kind: update.kind.wire_name().to_string(),
                name: update.name.clone(),
                namespace: update.namespace.clone(),
            },
            labels,
            kind: Self::KIND.to_string(),
            outcome: update.phase.outcome().map(str::to_string),
            revision: Revision { current: update.current_version.clone(), previous: update.previous_version.clone() },
            phase: update.phase.wire_phase().map(str::to_string),
            error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInventory {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_uids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_uids: Vec<String>,
}

/// Liveness message carrying the UIDs of every tracked node and pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHeartbeatPayload {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub source: SourceMetadata,
    pub message_type: String,
    pub inventory: ResourceInventory,
}

impl ClusterHeartbeatPayload {
    pub fn new(source: &SourceMetadata, inventory: ResourceInventory) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            source: source.clone(),
            message_type: "HEARTBEAT".to_string(),
            inventory,
        }
    }
}

/// Lists the UIDs of currently existing infrastructure resources.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn node_uids(&self) -> anyhow::Result<Vec<String>>;
    async fn pod_uids(&self) -> anyhow::Result<Vec<String>>;
}
