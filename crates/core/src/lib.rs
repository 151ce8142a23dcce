//! Rollwatch core types: workload identity, rollout phases and the events
//! the reconcilers hand to the publishing pipeline.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod payload;
mod resource;

pub use payload::{
    AgentEventPayload, ClusterHeartbeatPayload, ErrorDetail, Inventory, ResourceInventory, Revision, SourceMetadata,
    WorkloadRef,
};
pub use resource::{
    Condition, ContainerStatus, NodeMetadata, NodeTaint, PodMetadata, ResourceEvent, ResourceEventKind,
    ResourceMetadata, ResourceRef, ResourceState, ResourceType,
};

/// Label carrying the application version. Workloads without it are ignored.
pub const VERSION_LABEL: &str = "app.kubernetes.io/version";

/// The scalable workload kinds that are tracked for rollouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 3] = [WorkloadKind::Deployment, WorkloadKind::StatefulSet, WorkloadKind::DaemonSet];

    /// Kubernetes kind name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }

    /// Upper-case name used on the wire (`DEPLOYMENT`, ...).
    pub fn wire_name(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "DEPLOYMENT",
            WorkloadKind::StatefulSet => "STATEFULSET",
            WorkloadKind::DaemonSet => "DAEMONSET",
        }
    }

    /// Case-insensitive parse of a kind name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Stable identity of one workload: `(namespace, name, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
}

/// Kubernetes object name limit (DNS subdomain).
const RECORD_NAME_MAX: usize = 253;
const RECORD_HASH_BYTES: usize = 5;

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kind: WorkloadKind) -> Self {
        Self { namespace: namespace.into(), name: name.into(), kind }
    }

    /// Object name used for the durable rollout record of this workload.
    ///
    /// A readable `<namespace>-<name>-<kind>` prefix, cut to fit a DNS
    /// subdomain, plus a digest of the exact key so that distinct keys never
    /// share a name.
    pub fn record_name(&self) -> String {
        let mut digest = Sha256::new();
        for part in [self.namespace.as_str(), self.name.as_str(), self.kind.as_str()] {
            digest.update(part.as_bytes());
            digest.update([0u8]);
        }
        let hash = hex::encode(&digest.finalize()[..RECORD_HASH_BYTES]);

        let raw = format!("{}-{}-{}", self.namespace, self.name, self.kind.as_str());
        let mut prefix: String = raw
            .chars()
            .map(|c| c.to_ascii_lowercase())
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
            .take(RECORD_NAME_MAX - hash.len() - 1)
            .collect();
        while prefix.ends_with(|c: char| c == '-' || c == '.') {
            prefix.pop();
        }
        format!("{prefix}-{hash}")
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Rollout classification of a workload for one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RollingOut,
    Failed,
    Success,
    Progressing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::RollingOut => "rolling_out",
            Phase::Failed => "failed",
            Phase::Success => "success",
            Phase::Progressing => "progressing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rolling_out" => Some(Phase::RollingOut),
            "failed" => Some(Phase::Failed),
            "success" => Some(Phase::Success),
            "progressing" => Some(Phase::Progressing),
            _ => None,
        }
    }

    /// External deployment phase; `progressing` has no external counterpart.
    pub fn wire_phase(&self) -> Option<&'static str> {
        match self {
            Phase::RollingOut => Some("PROGRESSING"),
            Phase::Success => Some("COMPLETED"),
            Phase::Failed => Some("FAILED"),
            Phase::Progressing => None,
        }
    }

    /// Terminal outcome derived from the external phase.
    pub fn outcome(&self) -> Option<&'static str> {
        match self.wire_phase() {
            Some("COMPLETED") => Some("SUCCEEDED"),
            Some("FAILED") => Some("FAILED"),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// In-memory version bookkeeping for one workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionState {
    pub previous_version: String,
    pub current_version: String,
    pub last_updated: Option<DateTime<Utc>>,
    /// Set once when a rollout starts, cleared when the workload stops rolling out.
    pub rollout_started: Option<DateTime<Utc>>,
}

/// Reason attached to a failed rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetail {
    pub reason: String,
    pub message: String,
}

/// One detected version or phase transition. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadUpdateEvent {
    pub name: String,
    pub namespace: String,
    pub kind: WorkloadKind,
    pub previous_version: String,
    pub current_version: String,
    pub labels: BTreeMap<String, String>,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusDetail>,
}

impl WorkloadUpdateEvent {
    pub fn key(&self) -> WorkloadKey { WorkloadKey::new(&self.namespace, &self.name, self.kind) }
}

pub mod prelude {
    pub use super::{
        AgentEventPayload, Phase, ResourceEvent, ResourceEventKind, SourceMetadata, StatusDetail, VersionState,
        WorkloadKey, WorkloadKind, WorkloadUpdateEvent, VERSION_LABEL,
    };
}
