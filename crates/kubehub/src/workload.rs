//! Read-only views over the three tracked workload kinds.
//!
//! Each adapter maps its own status fields into [`WorkloadSnapshot`]; the
//! reconciler never looks at the concrete kind. Desired replica counts come
//! from `status.replicas` (Deployment), `spec.replicas` (StatefulSet) and
//! `status.desiredNumberScheduled` (DaemonSet).

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rollwatch_core::{StatusDetail, WorkloadKey, WorkloadKind, VERSION_LABEL};
use smallvec::SmallVec;

static NO_LABELS: BTreeMap<String, String> = BTreeMap::new();

/// Capability set shared by every workload kind.
pub trait WorkloadSnapshot: Send + Sync + Debug {
    fn key(&self) -> WorkloadKey;
    fn labels(&self) -> &BTreeMap<String, String>;

    /// Value of the version label, or `""` when absent.
    fn version(&self) -> &str { self.labels().get(VERSION_LABEL).map(String::as_str).unwrap_or("") }

    fn total_replicas(&self) -> i32;
    fn ready_replicas(&self) -> i32;
    fn updated_replicas(&self) -> i32;
    fn available_replicas(&self) -> i32;

    /// Updated or ready count is behind the desired count.
    fn is_rolling_out(&self) -> bool;

    /// Only true when the resource reports an explicit progress-deadline failure.
    fn has_failed(&self) -> bool;

    /// Reason behind [`has_failed`](Self::has_failed), when the kind exposes one.
    fn failure(&self) -> Option<StatusDetail> { None }

    /// Fields whose change can move the rollout phase; used to gate updates.
    fn rollout_digest(&self) -> RolloutDigest;
}

/// Everything the phase computation can observe about one object revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutDigest {
    pub generation: Option<i64>,
    pub observed_generation: Option<i64>,
    pub version: String,
    pub counters: SmallVec<[i32; 6]>,
    /// `(type, status, reason)`, sorted by type.
    pub conditions: SmallVec<[(String, String, String); 3]>,
}

fn digest(meta: &ObjectMeta, observed_generation: Option<i64>, counters: &[i32]) -> RolloutDigest {
    let version = meta.labels.as_ref().and_then(|l| l.get(VERSION_LABEL)).cloned().unwrap_or_default();
    RolloutDigest {
        generation: meta.generation,
        observed_generation,
        version,
        counters: SmallVec::from_slice(counters),
        conditions: SmallVec::new(),
    }
}

fn key_of(meta: &ObjectMeta, kind: WorkloadKind) -> WorkloadKey {
    WorkloadKey::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default(), kind)
}

fn labels_of(meta: &ObjectMeta) -> &BTreeMap<String, String> { meta.labels.as_ref().unwrap_or(&NO_LABELS) }

/// Typed workload objects that can be turned into a shared snapshot.
pub trait WorkloadObject:
    kube::Resource<DynamicType = ()> + Clone + Debug + serde::de::DeserializeOwned + Send + Sync + 'static
{
    const KIND: WorkloadKind;
    fn into_snapshot(self) -> Arc<dyn WorkloadSnapshot>;
}

impl WorkloadObject for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;
    fn into_snapshot(self) -> Arc<dyn WorkloadSnapshot> { Arc::new(DeploymentSnapshot(self)) }
}

impl WorkloadObject for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;
    fn into_snapshot(self) -> Arc<dyn WorkloadSnapshot> { Arc::new(StatefulSetSnapshot(self)) }
}

impl WorkloadObject for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;
    fn into_snapshot(self) -> Arc<dyn WorkloadSnapshot> { Arc::new(DaemonSetSnapshot(self)) }
}

// ---- Deployment ----

#[derive(Debug, Clone)]
pub struct DeploymentSnapshot(pub Deployment);

impl DeploymentSnapshot {
    fn status_field(&self, f: impl Fn(&k8s_openapi::api::apps::v1::DeploymentStatus) -> Option<i32>) -> i32 {
        self.0.status.as_ref().and_then(f).unwrap_or(0)
    }

    /// The `Progressing` condition when it signals a stalled rollout.
    fn failed_condition(&self) -> Option<&k8s_openapi::api::apps::v1::DeploymentCondition> {
        self.0
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .into_iter()
            .flatten()
            .filter(|c| c.type_ == "Progressing")
            .find(|c| c.status == "False" || c.reason.as_deref() == Some("ProgressDeadlineExceeded"))
    }
}

impl WorkloadSnapshot for DeploymentSnapshot {
    fn key(&self) -> WorkloadKey { key_of(&self.0.metadata, WorkloadKind::Deployment) }
    fn labels(&self) -> &BTreeMap<String, String> { labels_of(&self.0.metadata) }
    fn total_replicas(&self) -> i32 { self.status_field(|s| s.replicas) }
    fn ready_replicas(&self) -> i32 { self.status_field(|s| s.ready_replicas) }
    fn updated_replicas(&self) -> i32 { self.status_field(|s| s.updated_replicas) }
    fn available_replicas(&self) -> i32 { self.status_field(|s| s.available_replicas) }

    fn is_rolling_out(&self) -> bool {
        let total = self.total_replicas();
        self.updated_replicas() < total || self.ready_replicas() < total
    }

    fn has_failed(&self) -> bool { self.failed_condition().is_some() }

    fn failure(&self) -> Option<StatusDetail> {
        self.failed_condition().map(|c| StatusDetail {
            reason: c.reason.clone().unwrap_or_else(|| "ProgressDeadlineExceeded".to_string()),
            message: c.message.clone().unwrap_or_default(),
        })
    }

    fn rollout_digest(&self) -> RolloutDigest {
        let status = self.0.status.as_ref();
        let mut d = digest(
            &self.0.metadata,
            status.and_then(|s| s.observed_generation),
            &[self.total_replicas(), self.updated_replicas(), self.ready_replicas(), self.available_replicas()],
        );
        if let Some(conds) = status.and_then(|s| s.conditions.as_ref()) {
            d.conditions =
                conds.iter().map(|c| (c.type_.clone(), c.status.clone(), c.reason.clone().unwrap_or_default())).collect();
            d.conditions.sort();
        }
        d
    }
}

// ---- StatefulSet ----

#[derive(Debug, Clone)]
pub struct StatefulSetSnapshot(pub StatefulSet);

impl StatefulSetSnapshot {
    fn desired(&self) -> Option<i32> { self.0.spec.as_ref().and_then(|s| s.replicas) }
    fn status(&self) -> Option<&k8s_openapi::api::apps::v1::StatefulSetStatus> { self.0.status.as_ref() }
}

impl WorkloadSnapshot for StatefulSetSnapshot {
    fn key(&self) -> WorkloadKey { key_of(&self.0.metadata, WorkloadKind::StatefulSet) }
    fn labels(&self) -> &BTreeMap<String, String> { labels_of(&self.0.metadata) }
    fn total_replicas(&self) -> i32 { self.status().map(|s| s.replicas).unwrap_or(0) }
    fn ready_replicas(&self) -> i32 { self.status().and_then(|s| s.ready_replicas).unwrap_or(0) }
    fn updated_replicas(&self) -> i32 { self.status().and_then(|s| s.updated_replicas).unwrap_or(0) }
    fn available_replicas(&self) -> i32 { self.status().and_then(|s| s.available_replicas).unwrap_or(0) }

    fn is_rolling_out(&self) -> bool {
        // No declared replica count means nothing to converge towards.
        match self.desired() {
            Some(desired) => self.updated_replicas() < desired || self.ready_replicas() < desired,
            None => false,
        }
    }

    fn has_failed(&self) -> bool { false }

    fn rollout_digest(&self) -> RolloutDigest {
        let current = self.status().and_then(|s| s.current_replicas).unwrap_or(0);
        digest(
            &self.0.metadata,
            self.status().and_then(|s| s.observed_generation),
            &[self.total_replicas(), self.updated_replicas(), self.ready_replicas(), current, self.available_replicas()],
        )
    }
}

// ---- DaemonSet ----

#[derive(Debug, Clone)]
pub struct DaemonSetSnapshot(pub DaemonSet);

impl DaemonSetSnapshot {
    fn status(&self) -> Option<&k8s_openapi::api::apps::v1::DaemonSetStatus> { self.0.status.as_ref() }
}

impl WorkloadSnapshot for DaemonSetSnapshot {
    fn key(&self) -> WorkloadKey { key_of(&self.0.metadata, WorkloadKind::DaemonSet) }
    fn labels(&self) -> &BTreeMap<String, String> { labels_of(&self.0.metadata) }
    fn total_replicas(&self) -> i32 { self.status().map(|s| s.desired_number_scheduled).unwrap_or(0) }
    fn ready_replicas(&self) -> i32 { self.status().map(|s| s.number_ready).unwrap_or(0) }
    fn updated_replicas(&self) -> i32 { self.status().and_then(|s| s.updated_number_scheduled).unwrap_or(0) }
    fn available_replicas(&self) -> i32 { self.status().and_then(|s| s.number_available).unwrap_or(0) }

    fn is_rolling_out(&self) -> bool {
        let desired = self.total_replicas();
        self.updated_replicas() < desired || self.ready_replicas() < desired
    }

    fn has_failed(&self) -> bool { false }

    fn rollout_digest(&self) -> RolloutDigest {
        let s = self.status();
        digest(
            &self.0.metadata,
            s.and_then(|s| s.observed_generation),
            &[
                self.total_replicas(),
                s.map(|s| s.current_number_scheduled).unwrap_or(0),
                self.updated_replicas(),
                self.ready_replicas(),
                self.available_replicas(),
                s.and_then(|s| s.number_unavailable).unwrap_or(0),
            ],
        )
    }
}

/// Builders for test fixtures.
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DaemonSetStatus, DeploymentCondition, DeploymentStatus, StatefulSetSpec, StatefulSetStatus,
    };

    fn meta(ns: &str, name: &str, version: Option<&str>) -> ObjectMeta {
        let labels = version.map(|v| BTreeMap::from([(VERSION_LABEL.to_string(), v.to_string())]));
        ObjectMeta { namespace: Some(ns.into()), name: Some(name.into()), labels, generation: Some(1), ..Default::default() }
    }

    /// Deployment with `status.{replicas, readyReplicas, updatedReplicas}`.
    pub fn deployment(ns: &str, name: &str, version: Option<&str>, replicas: i32, ready: i32, updated: i32) -> Deployment {
        Deployment {
            metadata: meta(ns, name, version),
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                updated_replicas: Some(updated),
                available_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn with_progress_condition(mut d: Deployment, status: &str, reason: &str) -> Deployment {
        let cond = DeploymentCondition {
            type_: "Progressing".into(),
            status: status.into(),
            reason: Some(reason.into()),
            ..Default::default()
        };
        if let Some(s) = d.status.as_mut() {
            s.conditions.get_or_insert_with(Vec::new).push(cond);
        }
        d
    }

    pub fn statefulset(ns: &str, name: &str, version: Option<&str>, desired: Option<i32>, ready: i32, updated: i32) -> StatefulSet {
        StatefulSet {
            metadata: meta(ns, name, version),
            spec: Some(StatefulSetSpec { replicas: desired, ..Default::default() }),
            status: Some(StatefulSetStatus {
                replicas: desired.unwrap_or(0),
                ready_replicas: Some(ready),
                updated_replicas: Some(updated),
                ..Default::default()
            }),
        }
    }

    pub fn daemonset(ns: &str, name: &str, version: Option<&str>, desired: i32, ready: i32, updated: i32) -> DaemonSet {
        DaemonSet {
            metadata: meta(ns, name, version),
            status: Some(DaemonSetStatus {
                desired_number_scheduled: desired,
                number_ready: ready,
                updated_number_scheduled: Some(updated),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
