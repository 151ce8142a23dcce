//! List+watch wiring and the shared workload object cache.

use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Resource,
};
use metrics::counter;
use rollwatch_core::{WorkloadKey, WorkloadKind};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workload::{WorkloadObject, WorkloadSnapshot};

/// One observation from a watch stream.
#[derive(Debug)]
pub enum WatchChange<K> {
    Applied(K),
    Deleted(K),
    /// Full relist; anything not in the list is gone.
    Resync(Vec<K>),
}

/// Run list+watch for `api` until cancelled, handing every change to `handle`.
/// Stream errors are retried with the watcher's default backoff.
pub async fn watch_objects<K, H>(api: Api<K>, kind: &'static str, cancel: CancellationToken, mut handle: H) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    H: FnMut(WatchChange<K>) + Send,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind, "watcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(kind, "watcher stopped");
                return Ok(());
            }
            next = stream.next() => match next {
                Some(Ok(Event::Applied(o))) => handle(WatchChange::Applied(o)),
                Some(Ok(Event::Deleted(o))) => handle(WatchChange::Deleted(o)),
                Some(Ok(Event::Restarted(list))) => {
                    debug!(kind, count = list.len(), "watch restart");
                    handle(WatchChange::Resync(list));
                }
                Some(Err(e)) => {
                    counter!("rollwatch_watch_errors_total", "kind" => kind).increment(1);
                    warn!(kind, error = %e, "watch error; backing off");
                }
                None => {
                    warn!(kind, "watcher stream ended");
                    return Ok(());
                }
            }
        }
    }
}

/// Latest observed snapshot per workload, shared between watchers and workers.
#[derive(Clone, Default)]
pub struct SnapshotCache {
    inner: Arc<RwLock<FxHashMap<WorkloadKey, Arc<dyn WorkloadSnapshot>>>>,
}

impl SnapshotCache {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, key: &WorkloadKey) -> Option<Arc<dyn WorkloadSnapshot>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn len(&self) -> usize { self.inner.read().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Store `snap`; returns true when it is new or its rollout digest changed.
    pub fn apply(&self, snap: Arc<dyn WorkloadSnapshot>) -> bool {
        let key = snap.key();
        let digest = snap.rollout_digest();
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let changed = map.get(&key).map_or(true, |prev| prev.rollout_digest() != digest);
        map.insert(key, snap);
        changed
    }

    pub fn remove(&self, key: &WorkloadKey) -> bool {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).remove(key).is_some()
    }

    /// Replace every entry of `kind` with `snaps`. Returns the keys to
    /// reconcile: everything listed plus everything that disappeared.
    pub fn resync(&self, kind: WorkloadKind, snaps: impl IntoIterator<Item = Arc<dyn WorkloadSnapshot>>) -> Vec<WorkloadKey> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut gone: Vec<WorkloadKey> = map.keys().filter(|k| k.kind == kind).cloned().collect();
        let mut touched = Vec::new();
        for snap in snaps {
            let key = snap.key();
            map.insert(key.clone(), snap);
            touched.push(key);
        }
        gone.retain(|k| !touched.contains(k));
        for k in &gone {
            map.remove(k);
        }
        touched.extend(gone);
        touched
    }
}

/// Watch one workload kind, keeping `cache` current and enqueueing keys whose
/// rollout-relevant state changed.
pub async fn watch_workloads<K, F>(api: Api<K>, cache: SnapshotCache, cancel: CancellationToken, enqueue: F) -> Result<()>
where
    K: WorkloadObject,
    F: Fn(WorkloadKey) + Send + Sync,
{
    watch_objects(api, K::KIND.as_str(), cancel, |change| match change {
        WatchChange::Applied(o) => {
            let snap = o.into_snapshot();
            let key = snap.key();
            if cache.apply(snap) {
                enqueue(key);
            } else {
                counter!("rollwatch_watch_unchanged_total", "kind" => K::KIND.as_str()).increment(1);
            }
        }
        WatchChange::Deleted(o) => {
            let key = o.into_snapshot().key();
            cache.remove(&key);
            enqueue(key);
        }
        WatchChange::Resync(list) => {
            for key in cache.resync(K::KIND, list.into_iter().map(WorkloadObject::into_snapshot)) {
                enqueue(key);
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::fixtures::{daemonset, deployment};

    #[test]
    fn apply_reports_digest_changes_only() {
        let cache = SnapshotCache::new();
        assert!(cache.apply(deployment("ns", "api", Some("1"), 3, 1, 3).into_snapshot()));
        assert!(!cache.apply(deployment("ns", "api", Some("1"), 3, 1, 3).into_snapshot()));
        assert!(cache.apply(deployment("ns", "api", Some("1"), 3, 2, 3).into_snapshot()));
        let key = WorkloadKey::new("ns", "api", WorkloadKind::Deployment);
        assert_eq!(cache.get(&key).unwrap().ready_replicas(), 2);
        assert!(cache.remove(&key));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn resync_returns_listed_and_vanished_keys_of_one_kind() {
        let cache = SnapshotCache::new();
        cache.apply(deployment("ns", "a", Some("1"), 1, 1, 1).into_snapshot());
        cache.apply(deployment("ns", "b", Some("1"), 1, 1, 1).into_snapshot());
        cache.apply(daemonset("ns", "b", Some("1"), 1, 1, 1).into_snapshot());

        let keys = cache.resync(WorkloadKind::Deployment, vec![deployment("ns", "a", Some("2"), 1, 1, 1).into_snapshot()]);
        assert_eq!(
            keys,
            vec![WorkloadKey::new("ns", "a", WorkloadKind::Deployment), WorkloadKey::new("ns", "b", WorkloadKind::Deployment)]
        );
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&WorkloadKey::new("ns", "b", WorkloadKind::DaemonSet)).is_some());
        assert_eq!(cache.get(&WorkloadKey::new("ns", "a", WorkloadKind::Deployment)).unwrap().version(), "2");
    }
}
