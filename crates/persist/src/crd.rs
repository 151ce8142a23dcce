//! Rollout records stored as `WorkloadRolloutState` custom resources in the
//! controller namespace, one object per workload.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    Client, CustomResource, CustomResourceExt, Resource,
};
use metrics::histogram;
use rollwatch_core::{Phase, WorkloadKey};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{PersistError, PersistedRolloutRecord, RolloutStore};

/// Server-side apply field manager for everything rollwatch writes.
pub const FIELD_MANAGER: &str = "rollwatch";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rollwatch.dev",
    version = "v1alpha1",
    kind = "WorkloadRolloutState",
    plural = "workloadrolloutstates",
    shortname = "wrs",
    namespaced,
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".spec.workloadName"}"#,
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.workloadKind"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.lastSentVersion"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".spec.lastSentPhase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRolloutStateSpec {
    pub workload_namespace: String,
    pub workload_name: String,
    pub workload_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub previous_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_sent_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_sent_phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl WorkloadRolloutStateSpec {
    pub fn from_record(key: &WorkloadKey, rec: &PersistedRolloutRecord) -> Self {
        Self {
            workload_namespace: key.namespace.clone(),
            workload_name: key.name.clone(),
            workload_kind: key.kind.as_str().to_string(),
            rollout_started: rec.rollout_started,
            version: rec.version.clone(),
            previous_version: rec.previous_version.clone(),
            last_sent_version: rec.last_sent_version.clone(),
            last_sent_phase: rec.last_sent_phase.map(|p| p.as_str().to_string()).unwrap_or_default(),
            last_sent_at: rec.last_sent_at,
        }
    }

    /// Whether this record was written for `key`.
    pub fn belongs_to(&self, key: &WorkloadKey) -> bool {
        self.workload_namespace == key.namespace && self.workload_name == key.name && self.workload_kind == key.kind.as_str()
    }

    pub fn to_record(&self) -> PersistedRolloutRecord {
        PersistedRolloutRecord {
            rollout_started: self.rollout_started,
            version: self.version.clone(),
            previous_version: self.previous_version.clone(),
            last_sent_version: self.last_sent_version.clone(),
            last_sent_phase: Phase::parse(&self.last_sent_phase),
            last_sent_at: self.last_sent_at,
        }
    }
}

/// Install or update the `WorkloadRolloutState` definition.
pub async fn ensure_crd(client: Client) -> Result<(), PersistError> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let crd = WorkloadRolloutState::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();
    crds.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&crd)).await?;
    info!(crd = %name, "rollout state definition applied");
    Ok(())
}

/// [`RolloutStore`] over namespaced `WorkloadRolloutState` objects.
#[derive(Clone)]
pub struct KubeRolloutStore {
    api: Api<WorkloadRolloutState>,
    namespace: String,
}

impl KubeRolloutStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), namespace: namespace.to_string() }
    }

    fn object(&self, key: &WorkloadKey, rec: &PersistedRolloutRecord) -> WorkloadRolloutState {
        let mut obj = WorkloadRolloutState::new(&key.record_name(), WorkloadRolloutStateSpec::from_record(key, rec));
        obj.metadata = ObjectMeta {
            name: Some(key.record_name()),
            namespace: Some(self.namespace.clone()),
            labels: Some(BTreeMap::from([("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string())])),
            ..Default::default()
        };
        obj
    }
}

#[async_trait]
impl RolloutStore for KubeRolloutStore {
    async fn get(&self, key: &WorkloadKey) -> Result<Option<PersistedRolloutRecord>, PersistError> {
        let started = Instant::now();
        let found = self.api.get_opt(&key.record_name()).await?;
        histogram!("rollwatch_persist_get_ms", "backend" => "kube").record(started.elapsed().as_secs_f64() * 1000.0);
        match found {
            Some(obj) if obj.spec.belongs_to(key) => Ok(Some(obj.spec.to_record())),
            Some(obj) => {
                warn!(
                    workload = %key,
                    record = %key.record_name(),
                    stored_namespace = %obj.spec.workload_namespace,
                    stored_name = %obj.spec.workload_name,
                    stored_kind = %obj.spec.workload_kind,
                    "rollout record belongs to another workload; ignoring it"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, key: &WorkloadKey, record: &PersistedRolloutRecord) -> Result<(), PersistError> {
        let started = Instant::now();
        let obj = self.object(key, record);
        let name = obj.meta().name.clone().unwrap_or_default();
        self.api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj)).await?;
        histogram!("rollwatch_persist_put_ms", "backend" => "kube").record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(record = %name, "rollout record applied");
        Ok(())
    }

    async fn delete(&self, key: &WorkloadKey) -> Result<(), PersistError> {
        match self.api.delete(&key.record_name(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
