//! Rollwatch persistence: the durable per-workload rollout record.
//!
//! The record is the only state that outlives the process. It carries the
//! rollout start time (for timeout enforcement across restarts) and the last
//! version/phase sent downstream (for restart deduplication).

#![forbid(unsafe_code)]

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollwatch_core::{Phase, WorkloadKey};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

mod crd;
mod sqlite;

pub use crd::{ensure_crd, KubeRolloutStore, WorkloadRolloutState, WorkloadRolloutStateSpec, FIELD_MANAGER};
pub use sqlite::SqliteRolloutStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRolloutRecord {
    pub rollout_started: Option<DateTime<Utc>>,
    /// Version the rollout timer belongs to.
    pub version: String,
    pub previous_version: String,
    pub last_sent_version: String,
    pub last_sent_phase: Option<Phase>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store task failed: {0}")]
    Task(String),
}

/// Keyed access to rollout records.
#[async_trait]
pub trait RolloutStore: Send + Sync {
    async fn get(&self, key: &WorkloadKey) -> Result<Option<PersistedRolloutRecord>, PersistError>;
    /// Create or replace the record for `key`.
    async fn upsert(&self, key: &WorkloadKey, record: &PersistedRolloutRecord) -> Result<(), PersistError>;
    /// Remove the record; a missing record is not an error.
    async fn delete(&self, key: &WorkloadKey) -> Result<(), PersistError>;
}

/// Process-local store. Records do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryRolloutStore {
    records: Mutex<FxHashMap<WorkloadKey, PersistedRolloutRecord>>,
}

impl MemoryRolloutStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.records.lock().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn peek(&self, key: &WorkloadKey) -> Option<PersistedRolloutRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }
}

#[async_trait]
impl RolloutStore for MemoryRolloutStore {
    async fn get(&self, key: &WorkloadKey) -> Result<Option<PersistedRolloutRecord>, PersistError> { Ok(self.peek(key)) }

    async fn upsert(&self, key: &WorkloadKey, record: &PersistedRolloutRecord) -> Result<(), PersistError> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).insert(key.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &WorkloadKey) -> Result<(), PersistError> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollwatch_core::WorkloadKind;

    #[tokio::test]
    async fn memory_store_roundtrip_and_idempotent_delete() {
        let store = MemoryRolloutStore::new();
        let key = WorkloadKey::new("ns", "api", WorkloadKind::Deployment);
        assert!(store.get(&key).await.unwrap().is_none());

        let rec = PersistedRolloutRecord {
            version: "1.0.0".into(),
            last_sent_version: "1.0.0".into(),
            last_sent_phase: Some(Phase::RollingOut),
            ..Default::default()
        };
        store.upsert(&key, &rec).await.unwrap();
        let mut updated = rec.clone();
        updated.last_sent_phase = Some(Phase::Success);
        store.upsert(&key, &updated).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(updated));
        assert_eq!(store.len(), 1);

        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.is_empty());
    }
}
